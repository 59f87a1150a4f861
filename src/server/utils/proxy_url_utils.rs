use base64::{Engine as _, engine::general_purpose::URL_SAFE};
use regex::RegexSet;
use tracing::{debug, error};
use url::Url;

use crate::server::dtos::{StreamDescriptor, StreamSet};
use crate::server::error::{AppResult, Error};
use crate::server::services::dispatch_services::ResourceKind;

/// scheme check only, schemes are case-insensitive so `HTTPS://` counts too
pub fn is_http_url(value: &str) -> bool {
    let prefix = value.get(..8).unwrap_or(value).to_ascii_lowercase();
    prefix.starts_with("http://") || prefix.starts_with("https://")
}

/// the `url` query param is either the target itself (already percent-decoded by the query
/// extractor) or url-safe base64 of it with the padding stripped
pub fn decode_url(url_param: &str) -> AppResult<String> {
    let url_param = url_param.trim();

    let decoded = if is_http_url(url_param) {
        url_param.to_string()
    } else {
        let mut padded = url_param.to_string();
        while !padded.len().is_multiple_of(4) {
            padded.push('=');
        }

        let bytes = URL_SAFE.decode(&padded).map_err(|e| {
            debug!("url param is neither a url nor base64: {}", e);
            Error::BadRequest("Invalid URL encoding".to_string())
        })?;

        String::from_utf8(bytes).map_err(|e| {
            error!("decoded url is not utf-8: {}", e);
            Error::BadRequest("Invalid URL encoding".to_string())
        })?
    };

    if !is_http_url(&decoded) || Url::parse(&decoded).is_err() {
        return Err(Error::BadRequest("Invalid URL format".to_string()));
    }

    Ok(decoded)
}

/// `{api_base}{path}?url=<enc>`
pub fn build_proxy_url(api_base: &str, path: &str, target_url: &str) -> String {
    format!(
        "{}{}?url={}",
        api_base.trim_end_matches('/'),
        path,
        urlencoding::encode(target_url)
    )
}

/// cdn hosts that refuse to serve a player directly (ip bound or referer checked)
#[derive(Debug, Clone)]
pub struct RestrictedCdnMatcher {
    patterns: RegexSet,
}

impl RestrictedCdnMatcher {
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = RegexSet::new(
            patterns
                .into_iter()
                .filter(|p| !AsRef::<str>::as_ref(p).trim().is_empty()),
        )?;
        Ok(Self { patterns })
    }

    pub fn empty() -> Self {
        Self {
            patterns: RegexSet::empty(),
        }
    }

    pub fn is_restricted(&self, url: &str) -> bool {
        self.patterns.is_match(url)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// restricted urls become proxy urls (playlists go through /playlist), everything else is
/// handed back as is
pub fn wrap_for_proxy(url: &str, api_base: &str, matcher: &RestrictedCdnMatcher) -> String {
    if !matcher.is_restricted(url) {
        return url.to_string();
    }

    let path = match ResourceKind::classify(url) {
        ResourceKind::Manifest => "/playlist",
        ResourceKind::Segment => "/proxy",
    };

    build_proxy_url(api_base, path, url)
}

#[derive(Debug, Clone)]
pub struct ProxyUrlWrapper {
    api_base: String,
    matcher: RestrictedCdnMatcher,
}

impl ProxyUrlWrapper {
    pub fn new(api_base: impl Into<String>, matcher: RestrictedCdnMatcher) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            matcher,
        }
    }

    pub fn wrap(&self, url: &str) -> String {
        wrap_for_proxy(url, &self.api_base, &self.matcher)
    }

    /// wraps every member and the default the same way so the default still names a member
    pub fn wrap_stream_set(&self, set: StreamSet) -> StreamSet {
        if self.matcher.is_empty() {
            return set;
        }

        let (streams, default) = set.into_parts();
        let default = default.map(|d| self.wrap(&d));
        let streams: Vec<StreamDescriptor> = streams
            .into_iter()
            .map(|s| {
                let wrapped = self.wrap(s.url());
                s.with_url(wrapped)
            })
            .collect();

        StreamSet::new(streams, default)
    }
}
