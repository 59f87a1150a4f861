pub mod dispatch_services;
pub mod manifest_services;
pub mod proxy_services;
pub mod relay_services;
pub mod selector_services;
pub mod session_services;
pub mod upstream_services;

pub use dispatch_services::{ProxyDispatcher, ResourceKind};
pub use manifest_services::ManifestService;
pub use proxy_services::ProxyServices;
pub use relay_services::RelayService;
pub use selector_services::StreamSelector;
pub use session_services::{DynSessionCache, SessionCache};
pub use upstream_services::{ClientStrategy, UpstreamClientFactory};
