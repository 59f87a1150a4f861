use std::sync::Arc;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::{debug, error};

use crate::server::dtos::ProxyRequest;
use crate::server::error::{AppResult, Error};
use crate::server::utils::encoding_utils::ContentEncoding;

use super::manifest_services::{MANIFEST_CONTENT_TYPE, ManifestService};
use super::relay_services::{RelayService, RelayedResource};

const SEGMENT_CACHE_CONTROL: &str = "public, max-age=3600";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Manifest,
    Segment,
}

impl ResourceKind {
    /// anything mentioning m3u8 is a playlist, the rest is media bytes
    pub fn classify(url: &str) -> Self {
        if url.to_ascii_lowercase().contains("m3u8") {
            Self::Manifest
        } else {
            Self::Segment
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manifest => "manifest",
            Self::Segment => "segment",
        }
    }
}

/// routes a proxy request to the rewriter or the relay
pub struct ProxyDispatcher {
    manifests: Arc<ManifestService>,
    relay: Arc<RelayService>,
    proxy_base_url: String,
}

impl ProxyDispatcher {
    pub fn new(
        manifests: Arc<ManifestService>,
        relay: Arc<RelayService>,
        proxy_base_url: impl Into<String>,
    ) -> Self {
        Self {
            manifests,
            relay,
            proxy_base_url: proxy_base_url.into(),
        }
    }

    pub async fn handle(&self, request: &ProxyRequest, headers: &HeaderMap) -> AppResult<Response> {
        self.handle_as(ResourceKind::classify(&request.target_url), request, headers)
            .await
    }

    pub async fn handle_as(
        &self,
        kind: ResourceKind,
        request: &ProxyRequest,
        headers: &HeaderMap,
    ) -> AppResult<Response> {
        debug!("dispatching {} as {}", request.target_url, kind.as_str());
        metrics::counter!("proxy_requests_total", "kind" => kind.as_str()).increment(1);

        match kind {
            ResourceKind::Manifest => {
                let body = self
                    .manifests
                    .rewrite_manifest(
                        &request.target_url,
                        &self.proxy_base_url,
                        request.referer.as_deref(),
                        request.origin.as_deref(),
                    )
                    .await?;

                Self::build_manifest_response(&body, headers)
            }
            ResourceKind::Segment => {
                let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
                let resource = self
                    .relay
                    .relay(
                        &request.target_url,
                        request.referer.as_deref(),
                        request.origin.as_deref(),
                        range,
                    )
                    .await?;

                Self::build_segment_response(resource)
            }
        }
    }

    /// rewritten playlist, compressed when the client asks for it
    fn build_manifest_response(body: &str, headers: &HeaderMap) -> AppResult<Response> {
        let encoding = ContentEncoding::from_accept_encoding(
            headers
                .get(header::ACCEPT_ENCODING)
                .and_then(|v| v.to_str().ok()),
        );

        let mut response_headers = HeaderMap::new();
        response_headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(MANIFEST_CONTENT_TYPE),
        );
        response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        let response_body = encoding.compress(body.as_bytes()).map_err(|e| {
            error!("failed to compress manifest with {:?}: {}", encoding, e);
            Error::InternalServerErrorWithContext("failed to compress manifest".to_string())
        })?;

        if let Some(value) = encoding.as_header_value() {
            debug!(
                "compressed manifest with {} from {} to {} bytes",
                value,
                body.len(),
                response_body.len()
            );
            response_headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static(value));
        }

        // players stall on playlists without a length
        response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(response_body.len()));

        Ok((StatusCode::OK, response_headers, response_body).into_response())
    }

    fn build_segment_response(resource: RelayedResource) -> AppResult<Response> {
        let mut response_headers = HeaderMap::new();

        let content_type = HeaderValue::from_str(&resource.content_type).unwrap_or_else(|_| {
            HeaderValue::from_static(super::relay_services::DEFAULT_SEGMENT_CONTENT_TYPE)
        });
        response_headers.insert(header::CONTENT_TYPE, content_type);
        response_headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static(SEGMENT_CACHE_CONTROL),
        );
        response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

        if let Some(length) = resource.content_length {
            response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        }
        if let Some(range) = resource
            .content_range
            .as_deref()
            .and_then(|r| HeaderValue::from_str(r).ok())
        {
            response_headers.insert(header::CONTENT_RANGE, range);
        }

        Ok((
            resource.status,
            response_headers,
            Body::from_stream(resource.body),
        )
            .into_response())
    }
}
