use std::time::Duration;

use reqwest::header;
use tracing::{debug, warn};

use crate::server::error::UpstreamError;

use super::session_services::{DynSessionCache, render_cookie_header};

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const PLAIN_USER_AGENT: &str = concat!("stream-proxy/", env!("CARGO_PKG_VERSION"));

/// how a request to the origin is dressed up, tried in order until one gets through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStrategy {
    // looks like chrome as far as headers go, gets past most bot checks on cdns
    Browser,
    // bare http/1.1 client, some origins choke on the browser fingerprint
    Plain,
}

impl ClientStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Browser => "browser",
            Self::Plain => "plain",
        }
    }

    /// pooled client for this strategy, no cookie jar on purpose since the same client talks to
    /// every origin and cookies go out as an explicit header instead.
    ///
    /// `timeout` bounds the gap between two reads, not the whole exchange, so a long segment
    /// that keeps trickling is never cut off mid-body
    pub fn build_client(&self, timeout: Duration) -> reqwest::Result<reqwest::Client> {
        let builder = reqwest::Client::builder()
            .read_timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90));

        match self {
            Self::Browser => builder
                .user_agent(BROWSER_USER_AGENT)
                .http2_adaptive_window(true)
                .build(),
            Self::Plain => builder.user_agent(PLAIN_USER_AGENT).http1_only().build(),
        }
    }

    fn apply_headers(&self, request_builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Self::Browser => request_builder
                .header(header::ACCEPT, "*/*")
                .header(header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
                .header(
                    "Sec-CH-UA",
                    "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"120\", \"Google Chrome\";v=\"120\"",
                )
                .header("Sec-CH-UA-Mobile", "?0")
                .header("Sec-CH-UA-Platform", "\"Windows\"")
                .header("Sec-Fetch-Dest", "empty")
                .header("Sec-Fetch-Mode", "cors")
                .header("Sec-Fetch-Site", "cross-site")
                .header(header::PRAGMA, "no-cache")
                .header(header::CACHE_CONTROL, "no-cache"),
            Self::Plain => request_builder.header(header::ACCEPT, "*/*"),
        }
    }
}

/// everything one upstream fetch needs besides the client
#[derive(Debug, Clone, Default)]
pub struct UpstreamRequest {
    pub url: String,
    pub referer: Option<String>,
    pub origin: Option<String>,
    pub range: Option<String>,
    // none means identity, the body is handed through untouched
    pub accept_encoding: Option<String>,
    // total deadline for the exchange, only set when the body gets buffered
    pub deadline: Option<Duration>,
}

impl UpstreamRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn referer(mut self, referer: Option<&str>) -> Self {
        self.referer = referer.map(String::from);
        self
    }

    pub fn origin(mut self, origin: Option<&str>) -> Self {
        self.origin = origin.map(String::from);
        self
    }

    pub fn range(mut self, range: Option<&str>) -> Self {
        self.range = range.map(String::from);
        self
    }

    pub fn accept_encoding(mut self, accept_encoding: &str) -> Self {
        self.accept_encoding = Some(accept_encoding.to_string());
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// owns one pooled client per strategy and the session cache they pull cookies from
pub struct UpstreamClientFactory {
    sessions: DynSessionCache,
    strategies: Vec<(ClientStrategy, reqwest::Client)>,
    timeout: Duration,
}

impl UpstreamClientFactory {
    /// browser first, plain second
    pub fn new(sessions: DynSessionCache, timeout: Duration) -> reqwest::Result<Self> {
        Self::with_strategies(
            sessions,
            &[ClientStrategy::Browser, ClientStrategy::Plain],
            timeout,
        )
    }

    pub fn with_strategies(
        sessions: DynSessionCache,
        strategies: &[ClientStrategy],
        timeout: Duration,
    ) -> reqwest::Result<Self> {
        let strategies = strategies
            .iter()
            .map(|strategy| Ok((*strategy, strategy.build_client(timeout)?)))
            .collect::<reqwest::Result<Vec<_>>>()?;

        Ok(Self {
            sessions,
            strategies,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn strategies(&self) -> impl Iterator<Item = ClientStrategy> + '_ {
        self.strategies.iter().map(|(strategy, _)| *strategy)
    }

    /// first strategy that answers below 400 wins, the response is handed back with the body
    /// still unread so callers decide between buffering and streaming
    pub async fn fetch(&self, request: &UpstreamRequest) -> Result<reqwest::Response, UpstreamError> {
        let cookie_header = match request.referer.as_deref() {
            Some(referer) => render_cookie_header(&self.sessions.get_cookies(referer).await),
            None => None,
        };

        let mut last_error = UpstreamError::NoStrategy;

        for (strategy, client) in &self.strategies {
            let mut request_builder = strategy.apply_headers(client.get(&request.url));

            if let Some(referer) = &request.referer {
                request_builder = request_builder.header(header::REFERER, referer);
            }
            if let Some(origin) = &request.origin {
                request_builder = request_builder.header(header::ORIGIN, origin);
            }
            if let Some(range) = &request.range {
                request_builder = request_builder.header(header::RANGE, range);
            }
            if let Some(cookies) = &cookie_header {
                request_builder = request_builder.header(header::COOKIE, cookies);
            }
            request_builder = request_builder.header(
                header::ACCEPT_ENCODING,
                request.accept_encoding.as_deref().unwrap_or("identity"),
            );
            if let Some(deadline) = request.deadline {
                request_builder = request_builder.timeout(deadline);
            }

            match request_builder.send().await {
                Ok(response) if response.status().as_u16() < 400 => {
                    debug!(
                        "upstream {} answered {} via {} client",
                        request.url,
                        response.status(),
                        strategy.as_str()
                    );
                    return Ok(response);
                }
                Ok(response) => {
                    debug!(
                        "upstream {} answered {} via {} client",
                        request.url,
                        response.status(),
                        strategy.as_str()
                    );
                    last_error = UpstreamError::Status {
                        status: response.status(),
                        url: request.url.clone(),
                    };
                }
                Err(e) => {
                    debug!(
                        "upstream {} failed via {} client: {}",
                        request.url,
                        strategy.as_str(),
                        e
                    );
                    last_error = UpstreamError::from_reqwest(&request.url, &e);
                }
            }
        }

        warn!("all upstream strategies failed: {}", last_error);
        metrics::counter!("proxy_upstream_errors_total").increment(1);
        Err(last_error)
    }
}
