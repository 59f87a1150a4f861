mod proxy_request_extractor;
mod validation_extractor;

pub use proxy_request_extractor::*;
pub use validation_extractor::*;
