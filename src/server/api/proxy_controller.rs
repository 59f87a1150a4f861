use axum::{
    Extension, Router,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};

use crate::server::{
    error::AppResult,
    extractors::ExtractProxyRequest,
    services::{ProxyServices, ResourceKind},
};

pub struct ProxyController;

impl ProxyController {
    pub fn app() -> Router {
        Router::new()
            .route("/proxy", get(Self::proxy_get).options(Self::proxy_options))
            .route(
                "/playlist",
                get(Self::playlist_get).options(Self::proxy_options),
            )
    }

    /// playlists are rewritten, everything else is relayed as bytes
    async fn proxy_get(
        Extension(services): Extension<ProxyServices>,
        ExtractProxyRequest(request): ExtractProxyRequest,
        headers: HeaderMap,
    ) -> AppResult<Response> {
        services.dispatcher.handle(&request, &headers).await
    }

    /// always a playlist, whatever the url looks like
    async fn playlist_get(
        Extension(services): Extension<ProxyServices>,
        ExtractProxyRequest(request): ExtractProxyRequest,
        headers: HeaderMap,
    ) -> AppResult<Response> {
        services
            .dispatcher
            .handle_as(ResourceKind::Manifest, &request, &headers)
            .await
    }

    async fn proxy_options() -> impl IntoResponse {
        StatusCode::NO_CONTENT
    }
}
