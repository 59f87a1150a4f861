use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;

use tracing::{info, warn};

use stream_proxy::{AppConfig, Logger, ProxyApplicationServer, RedisDatabase};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let config = Arc::new(AppConfig::parse());

    // init logger and sentry, guards are kept alive to flush logs and maintain sentry connection
    let _guards = Logger::init(
        config.cargo_env,
        &config.log_dir,
        config.sentry_dsn.clone(),
    );

    info!("logger and env prepped...");

    // redis only backs the result cache, losing it just means the memory tier does the work
    let redis_db = match config.redis_url.as_deref() {
        Some(url) => {
            info!("connecting to redis...");
            match RedisDatabase::connect(url).await {
                Ok(db) => Some(db),
                Err(e) => {
                    warn!("redis unavailable ({:#}), using the in-memory cache only", e);
                    None
                }
            }
        }
        None => {
            info!("no REDIS_URL set, using the in-memory cache only");
            None
        }
    };

    ProxyApplicationServer::serve(config, redis_db)
        .await
        .context("proxy server failed to start")?;

    Ok(())
}
