use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use tracing::debug;

use crate::server::dtos::{ProxyQuery, ProxyRequest};
use crate::server::error::Error;
use crate::server::utils::proxy_url_utils::decode_url;

/// decoded `url` / `referer` / `origin` query of /proxy and /playlist
pub struct ExtractProxyRequest(pub ProxyRequest);

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl<S> FromRequestParts<S> for ExtractProxyRequest
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(query): Query<ProxyQuery> = Query::from_request_parts(parts, state)
            .await
            .map_err(|e| Error::BadRequest(format!("Invalid query string: {}", e)))?;

        let url = non_empty(query.url)
            .ok_or_else(|| Error::BadRequest("Missing url parameter".to_string()))?;
        let target_url = decode_url(&url)?;

        let request = ProxyRequest {
            target_url,
            referer: non_empty(query.referer),
            origin: non_empty(query.origin),
        };
        debug!("proxy request: {:?}", request);

        Ok(Self(request))
    }
}
