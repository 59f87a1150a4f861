use serde::Deserialize;

/// query string of /proxy and /playlist as it arrives
#[derive(Debug, Default, Deserialize)]
pub struct ProxyQuery {
    pub url: Option<String>,
    pub referer: Option<String>,
    pub origin: Option<String>,
}

/// decoded and checked version of [`ProxyQuery`], lives for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub target_url: String,
    pub referer: Option<String>,
    pub origin: Option<String>,
}

impl ProxyRequest {
    pub fn new(target_url: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
            referer: None,
            origin: None,
        }
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}
