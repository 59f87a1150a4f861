use std::sync::Arc;

use reqwest::header;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::database::{DynResultCache, hashed_key};
use crate::server::error::{AppResult, UpstreamError};
use crate::server::utils::encoding_utils::decompress;
use crate::server::utils::proxy_url_utils::is_http_url;

use super::upstream_services::{UpstreamClientFactory, UpstreamRequest};

pub const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

const PLAYLIST_HEADER: &str = "#EXTM3U";
const BYTE_ORDER_MARK: char = '\u{feff}';

/// the manifest couldn't be rewritten, callers fall back to the body as it came
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestParseError {
    #[error("body doesn't start with #EXTM3U")]
    NotAPlaylist,

    #[error("manifest url `{0}` can't be used as a base for relative uris")]
    InvalidBase(String),
}

/// `{proxy_base_url}?url=..&referer=..&origin=..` with the empty parts left out
pub fn build_proxy_line(
    proxy_base_url: &str,
    target_url: &str,
    referer: Option<&str>,
    origin: Option<&str>,
) -> String {
    let separator = if proxy_base_url.contains('?') { '&' } else { '?' };
    let mut line = format!(
        "{}{}url={}",
        proxy_base_url,
        separator,
        urlencoding::encode(target_url)
    );

    if let Some(referer) = referer {
        line.push_str("&referer=");
        line.push_str(&urlencoding::encode(referer));
    }
    if let Some(origin) = origin {
        line.push_str("&origin=");
        line.push_str(&urlencoding::encode(origin));
    }

    line
}

/// key tags with a URI that isn't METHOD=NONE, those keys are fetched by the player directly
fn is_encrypted_key_line(line: &str) -> bool {
    (line.starts_with("#EXT-X-KEY:") || line.starts_with("#EXT-X-SESSION-KEY:"))
        && line.contains("URI=")
        && !line.contains("METHOD=NONE")
}

/// points every uri line of a playlist back at the proxy, tags and blank lines stay put
///
/// relative uris are joined against `manifest_url` the same way a browser would, so `../a.ts`
/// and `/abs/a.ts` both come out right
pub fn rewrite_manifest_body(
    body: &str,
    manifest_url: &str,
    proxy_base_url: &str,
    referer: Option<&str>,
    origin: Option<&str>,
) -> Result<String, ManifestParseError> {
    let body = body.trim_start_matches(BYTE_ORDER_MARK);
    if !body.trim_start().starts_with(PLAYLIST_HEADER) {
        return Err(ManifestParseError::NotAPlaylist);
    }

    let base = Url::parse(manifest_url)
        .map_err(|_| ManifestParseError::InvalidBase(manifest_url.to_string()))?;

    let mut warned_about_keys = false;

    let lines: Vec<String> = body
        .lines()
        .map(|line| {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                if !warned_about_keys && is_encrypted_key_line(trimmed) {
                    warned_about_keys = true;
                    warn!(
                        "manifest {} references encryption keys, key uris are left pointing at the origin",
                        manifest_url
                    );
                }
                return line.to_string();
            }

            let resolved = if is_http_url(trimmed) {
                trimmed.to_string()
            } else {
                match base.join(trimmed) {
                    Ok(resolved) => resolved.to_string(),
                    Err(e) => {
                        warn!("could not resolve {} against {}: {}", trimmed, manifest_url, e);
                        return line.to_string();
                    }
                }
            };

            build_proxy_line(proxy_base_url, &resolved, referer, origin)
        })
        .collect();

    Ok(lines.join("\n"))
}

/// fetches playlists through the upstream factory and rewrites them
pub struct ManifestService {
    upstream: Arc<UpstreamClientFactory>,
    cache: DynResultCache,
    cache_ttl_seconds: u64,
}

impl ManifestService {
    pub fn new(
        upstream: Arc<UpstreamClientFactory>,
        cache: DynResultCache,
        cache_ttl_seconds: u64,
    ) -> Self {
        Self {
            upstream,
            cache,
            cache_ttl_seconds,
        }
    }

    pub fn cache_key(manifest_url: &str, referer: Option<&str>) -> String {
        hashed_key("manifest", &[manifest_url, referer.unwrap_or_default()])
    }

    /// raw playlist text, from the result cache when a fresh copy is there
    pub async fn fetch_manifest(
        &self,
        manifest_url: &str,
        referer: Option<&str>,
        origin: Option<&str>,
    ) -> Result<String, UpstreamError> {
        let key = Self::cache_key(manifest_url, referer);

        if let Some(cached) = self.cache.get(&key).await {
            debug!("manifest cache HIT: {}", manifest_url);
            return Ok(cached);
        }

        let request = UpstreamRequest::new(manifest_url)
            .referer(referer)
            .origin(origin)
            .accept_encoding("gzip, zstd")
            .deadline(self.upstream.timeout());

        let response = self.upstream.fetch(&request).await?;

        let content_encoding = response
            .headers()
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let bytes = response
            .bytes()
            .await
            .map_err(|e| UpstreamError::from_reqwest(manifest_url, &e))?;

        let decompressed =
            decompress(content_encoding.as_deref(), &bytes).map_err(|e| UpstreamError::Transport {
                url: manifest_url.to_string(),
                message: format!("could not decompress {:?} body: {}", content_encoding, e),
            })?;

        debug!(
            "fetched manifest {} ({} bytes, {} decompressed)",
            manifest_url,
            bytes.len(),
            decompressed.len()
        );

        let text = String::from_utf8(decompressed).unwrap_or_else(|e| {
            warn!("manifest {} is not valid utf-8, decoding lossily", manifest_url);
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        });

        self.cache.set(&key, &text, self.cache_ttl_seconds).await;

        Ok(text)
    }

    pub async fn rewrite_manifest(
        &self,
        manifest_url: &str,
        proxy_base_url: &str,
        referer: Option<&str>,
        origin: Option<&str>,
    ) -> AppResult<String> {
        let raw = self.fetch_manifest(manifest_url, referer, origin).await?;

        match rewrite_manifest_body(&raw, manifest_url, proxy_base_url, referer, origin) {
            Ok(rewritten) => Ok(rewritten),
            Err(e) => {
                warn!("serving {} unmodified: {}", manifest_url, e);
                Ok(raw)
            }
        }
    }
}
