pub mod encoding_utils;
pub mod proxy_url_utils;
