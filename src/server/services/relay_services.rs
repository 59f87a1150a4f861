use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::http::StatusCode;
use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use reqwest::header;
use tracing::debug;

use crate::server::error::UpstreamError;

use super::upstream_services::{UpstreamClientFactory, UpstreamRequest};

/// what upstream didn't tell us, hls segments are mpeg-ts almost always
pub const DEFAULT_SEGMENT_CONTENT_TYPE: &str = "video/mp2t";

/// upstream body forwarded chunk by chunk, dropping it drops the reqwest response underneath which
/// cancels the fetch and hands the connection back
pub struct RelayStream {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    url: String,
    bytes_sent: u64,
    finished: bool,
}

impl RelayStream {
    pub fn new(url: impl Into<String>, inner: BoxStream<'static, reqwest::Result<Bytes>>) -> Self {
        Self {
            inner,
            url: url.into(),
            bytes_sent: 0,
            finished: false,
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }
}

impl Stream for RelayStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.bytes_sent += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.finished = true;
                debug!("upstream body for {} broke off: {}", self.url, e);
                Poll::Ready(Some(Err(std::io::Error::other(e))))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        // client went away mid segment, nothing to do besides letting the upstream go
        if !self.finished {
            debug!(
                "relay of {} cancelled after {} bytes",
                self.url, self.bytes_sent
            );
        }
    }
}

/// everything the dispatcher needs to answer a segment request, the body hasn't been read yet
pub struct RelayedResource {
    pub status: StatusCode,
    pub content_type: String,
    pub content_length: Option<u64>,
    pub content_range: Option<String>,
    pub body: RelayStream,
}

pub struct RelayService {
    upstream: Arc<UpstreamClientFactory>,
}

impl RelayService {
    pub fn new(upstream: Arc<UpstreamClientFactory>) -> Self {
        Self { upstream }
    }

    /// status >= 400 comes back as an error before a single byte is read
    pub async fn relay(
        &self,
        target_url: &str,
        referer: Option<&str>,
        origin: Option<&str>,
        range: Option<&str>,
    ) -> Result<RelayedResource, UpstreamError> {
        let request = UpstreamRequest::new(target_url)
            .referer(referer)
            .origin(origin)
            .range(range);

        let response = self.upstream.fetch(&request).await?;

        let headers = response.headers();
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(DEFAULT_SEGMENT_CONTENT_TYPE)
            .to_string();
        let content_range = headers
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let status = response.status();
        let content_length = response.content_length();

        debug!(
            "relaying {} ({}, {}, {:?} bytes)",
            target_url, status, content_type, content_length
        );

        Ok(RelayedResource {
            status,
            content_type,
            content_length,
            content_range,
            body: RelayStream::new(target_url, response.bytes_stream().boxed()),
        })
    }
}
