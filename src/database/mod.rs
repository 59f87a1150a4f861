pub mod cache;
pub mod redis_connection;

pub use cache::*;
pub use redis_connection::*;
