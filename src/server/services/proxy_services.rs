use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use crate::{
    config::AppConfig,
    database::{DynResultCache, RedisDatabase, ResultCacheService},
    server::utils::proxy_url_utils::{ProxyUrlWrapper, RestrictedCdnMatcher},
};

use super::{
    dispatch_services::ProxyDispatcher,
    manifest_services::ManifestService,
    relay_services::RelayService,
    session_services::{DynSessionCache, SessionCache},
    upstream_services::UpstreamClientFactory,
};

/// everything a handler can reach, cloned into every request through the Extension layer
#[derive(Clone)]
pub struct ProxyServices {
    pub sessions: DynSessionCache,
    pub upstream: Arc<UpstreamClientFactory>,
    pub manifests: Arc<ManifestService>,
    pub relay: Arc<RelayService>,
    pub dispatcher: Arc<ProxyDispatcher>,
    pub wrapper: Arc<ProxyUrlWrapper>,
    pub cache: DynResultCache,
    pub redis: Option<Arc<RedisDatabase>>,
    pub config: Arc<AppConfig>,
}

impl ProxyServices {
    pub fn new(config: Arc<AppConfig>, redis_db: Option<RedisDatabase>) -> anyhow::Result<Self> {
        let redis = redis_db.map(Arc::new);
        let cache = Arc::new(ResultCacheService::new(
            redis.clone(),
            config.memory_cache_capacity,
        )) as DynResultCache;

        Self::with_cache(config, redis, cache)
    }

    /// same wiring with a caller supplied result cache, tests hand in a mock here
    pub fn with_cache(
        config: Arc<AppConfig>,
        redis: Option<Arc<RedisDatabase>>,
        cache: DynResultCache,
    ) -> anyhow::Result<Self> {
        info!("starting proxy services...");

        let upstream_timeout = Duration::from_secs(config.upstream_timeout_secs);

        let sessions = Arc::new(SessionCache::new(
            Duration::from_secs(config.session_ttl_secs),
            upstream_timeout,
        )) as DynSessionCache;

        let upstream = Arc::new(
            UpstreamClientFactory::new(sessions.clone(), upstream_timeout)
                .context("failed to build upstream http clients")?,
        );

        info!("upstream clients ok, starting remaining services...");

        let manifests = Arc::new(ManifestService::new(
            upstream.clone(),
            cache.clone(),
            config.manifest_cache_ttl_secs,
        ));
        let relay = Arc::new(RelayService::new(upstream.clone()));
        let dispatcher = Arc::new(ProxyDispatcher::new(
            manifests.clone(),
            relay.clone(),
            config.proxy_base_url(),
        ));

        let matcher = RestrictedCdnMatcher::new(&config.restricted_cdn_patterns)
            .context("RESTRICTED_CDN_PATTERNS contains an invalid regex")?;
        info!("{} restricted cdn patterns loaded", matcher.len());
        let wrapper = Arc::new(ProxyUrlWrapper::new(config.api_base(), matcher));

        Ok(Self {
            sessions,
            upstream,
            manifests,
            relay,
            dispatcher,
            wrapper,
            cache,
            redis,
            config,
        })
    }
}
