pub mod health_dto;
pub mod proxy_dto;
pub mod stream_dto;

pub use proxy_dto::*;
pub use stream_dto::*;
