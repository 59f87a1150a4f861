use axum::Extension;
use axum::Json;
use chrono::Utc;
use tracing::error;

use crate::database::RedisDatabase;
use crate::server::dtos::health_dto::{
    HealthResponse, HealthStatus, RedisHealth, ServiceHealthDetails, SessionCacheHealth,
};
use crate::server::services::ProxyServices;
use crate::server::{get_app_version, get_uptime_seconds};

/// health endpoint, redis is only checked when one is configured. always answers 200 since
/// nothing it checks can take the proxy down, a dead redis only shows up as degraded
pub async fn health_endpoint(
    Extension(services): Extension<ProxyServices>,
) -> Json<HealthResponse> {
    let redis_health = match services.redis.as_deref() {
        Some(redis) => Some(check_redis_health(redis).await),
        None => None,
    };

    // losing redis only costs us the shared cache, the memory tier keeps serving
    let overall_status = match &redis_health {
        Some(health) if health.status == HealthStatus::Unhealthy => HealthStatus::Degraded,
        _ => HealthStatus::Healthy,
    };

    let response = HealthResponse {
        status: overall_status,
        timestamp: Utc::now(),
        uptime_seconds: get_uptime_seconds(),
        version: get_app_version().to_string(),
        environment: format!("{:?}", services.config.cargo_env).to_lowercase(),
        services: ServiceHealthDetails {
            redis: redis_health,
            session_cache: SessionCacheHealth {
                entries: services.sessions.len(),
            },
        },
    };

    Json(response)
}

async fn check_redis_health(redis: &RedisDatabase) -> RedisHealth {
    match redis.health_check().await {
        Ok(response_time) => RedisHealth {
            status: HealthStatus::Healthy,
            response_time_ms: response_time,
        },
        Err(e) => {
            error!("Redis health check failed: {}", e);
            RedisHealth {
                status: HealthStatus::Unhealthy,
                response_time_ms: 0.0,
            }
        }
    }
}
