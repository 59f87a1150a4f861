pub mod api;
pub mod dtos;
pub mod error;
pub mod extractors;
pub mod services;
pub mod utils;

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::{
    Extension, Router, ServiceExt,
    extract::Request,
    http::{HeaderValue, Method},
    routing::get,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tower::Layer;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    normalize_path::NormalizePathLayer,
    trace::TraceLayer,
};
use tracing::{debug, error, info};

use crate::config::AppConfig;
use crate::database::RedisDatabase;

use api::{
    health_controller::health_endpoint, proxy_controller::ProxyController,
    streams_controller::StreamsController,
};
use services::{DynSessionCache, ProxyServices};

static START_TIME: OnceLock<Instant> = OnceLock::new();

pub fn get_uptime_seconds() -> u64 {
    START_TIME
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

pub fn get_app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub struct ProxyApplicationServer;

impl ProxyApplicationServer {
    /// all routes with their layers, /metrics only exists when a recorder handle is passed in
    pub fn router(services: ProxyServices, metrics: Option<PrometheusHandle>) -> Router {
        START_TIME.get_or_init(Instant::now);

        let cors = Self::cors_layer(&services.config.cors_origin);
        let max_concurrent_requests = services.config.max_concurrent_requests.max(1);

        let mut router = Router::new()
            .route("/health", get(health_endpoint))
            .merge(ProxyController::app())
            .merge(StreamsController::app());

        if let Some(handle) = metrics {
            router = router.route(
                "/metrics",
                get(move || std::future::ready(handle.render())),
            );
        }

        router
            .layer(Extension(services))
            .layer(ConcurrencyLimitLayer::new(max_concurrent_requests))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    // * or a comma separated list of origins
    fn cors_layer(cors_origin: &str) -> CorsLayer {
        let layer = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any);

        if cors_origin.trim() == "*" {
            return layer.allow_origin(Any);
        }

        let origins: Vec<HeaderValue> = cors_origin
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();

        layer.allow_origin(AllowOrigin::list(origins))
    }

    /// entries are replaced lazily on lookup, this only keeps dead origins from piling up
    fn spawn_session_purge(sessions: DynSessionCache, every: Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let purged = sessions.purge_expired();
                if purged > 0 {
                    debug!("purged {} expired session entries", purged);
                }
            }
        });
    }

    pub async fn serve(
        config: Arc<AppConfig>,
        redis_db: Option<RedisDatabase>,
    ) -> anyhow::Result<()> {
        START_TIME.get_or_init(Instant::now);

        let metrics = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install the prometheus recorder")?;

        let services = ProxyServices::new(config.clone(), redis_db)?;

        Self::spawn_session_purge(
            services.sessions.clone(),
            Duration::from_secs(config.session_ttl_secs.max(60)),
        );

        let router = Self::router(services, Some(metrics));
        // /proxy/ and /proxy have to hit the same route, this has to wrap the whole router
        let app = NormalizePathLayer::trim_trailing_slash().layer(router);

        let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind to {}", addr))?;

        info!(
            "routes initialized, listening on port {} (public base {})",
            config.port,
            config.api_base()
        );

        axum::serve(listener, ServiceExt::<Request>::into_make_service(app))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("error while running the proxy server")?;

        info!("proxy server shut down");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
