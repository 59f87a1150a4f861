use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use reqwest::cookie::{CookieStore, Jar};
use reqwest::header;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

/// 5 minutes, long enough to cover a playback session without hammering the origin page
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(300);

const SESSION_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// cookie name -> value, ordered so the rendered Cookie header is stable
pub type CookieMap = BTreeMap<String, String>;

pub type DynSessionCache = Arc<dyn SessionCacheTrait + Send + Sync>;

#[async_trait::async_trait]
pub trait SessionCacheTrait {
    /// cookies the origin hands out to a fresh visitor, empty when they couldn't be acquired
    async fn get_cookies(&self, origin: &str) -> CookieMap;

    /// entries held right now, stale ones included
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// drops stale entries, returns how many went
    fn purge_expired(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct SessionCacheEntry {
    pub origin: String,
    pub cookies: CookieMap,
    pub expires_at: Instant,
}

impl SessionCacheEntry {
    pub fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// the pre-fetch against the origin didn't work out, callers continue without cookies
#[derive(Debug, Error)]
pub enum SessionAcquisitionFailure {
    #[error("origin `{0}` is not a valid url")]
    InvalidOrigin(String),

    #[error("could not build the session client: {0}")]
    Client(String),

    #[error("request to the origin failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// short lived cookies per origin (the referer page), acquired by visiting the origin once
///
/// the entry map lock is never held across an await, a slow origin only ever blocks callers
/// asking for that same origin and even those only until the first fetch lands
pub struct SessionCache {
    entries: RwLock<HashMap<String, SessionCacheEntry>>,
    inflight: Mutex<HashMap<String, Arc<Notify>>>,
    ttl: Duration,
    fetch_timeout: Duration,
}

enum FetchRole {
    Leader(Arc<Notify>),
    Follower(Arc<Notify>),
}

/// removes the in-flight marker and wakes followers however the leader's fetch ends, a caller
/// that disconnects mid fetch drops its future and this still runs
struct InflightGuard<'a> {
    cache: &'a SessionCache,
    origin: &'a str,
    notify: Arc<Notify>,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut lock) = self.cache.inflight.lock() {
            lock.remove(self.origin);
        }
        self.notify.notify_waiters();
    }
}

impl SessionCache {
    pub fn new(ttl: Duration, fetch_timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            ttl,
            fetch_timeout,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn live_cookies(&self, origin: &str) -> Option<CookieMap> {
        let lock = self.entries.read().ok()?;
        lock.get(origin)
            .filter(|entry| entry.is_live(Instant::now()))
            .map(|entry| entry.cookies.clone())
    }

    fn store(&self, origin: &str, cookies: CookieMap) {
        let entry = SessionCacheEntry {
            origin: origin.to_string(),
            cookies,
            expires_at: Instant::now() + self.ttl,
        };

        match self.entries.write() {
            // whole entry replaced, last writer wins
            Ok(mut lock) => {
                lock.insert(origin.to_string(), entry);
            }
            Err(_) => error!("session cache lock poisoned, not storing {}", origin),
        }
    }

    fn claim(&self, origin: &str) -> FetchRole {
        let Ok(mut lock) = self.inflight.lock() else {
            // poisoned means a panic elsewhere, fetching without dedupe is still correct
            return FetchRole::Leader(Arc::new(Notify::new()));
        };

        match lock.get(origin) {
            Some(notify) => FetchRole::Follower(notify.clone()),
            None => {
                let notify = Arc::new(Notify::new());
                lock.insert(origin.to_string(), notify.clone());
                FetchRole::Leader(notify)
            }
        }
    }

    fn still_inflight(&self, origin: &str, notify: &Arc<Notify>) -> bool {
        self.inflight
            .lock()
            .map(|lock| {
                lock.get(origin)
                    .is_some_and(|current| Arc::ptr_eq(current, notify))
            })
            .unwrap_or(false)
    }

    async fn wait_for_leader(&self, origin: &str, notify: Arc<Notify>) -> CookieMap {
        let notified = notify.notified();
        tokio::pin!(notified);
        // registered before the check below, a leader finishing in between still wakes us
        notified.as_mut().enable();

        if self.still_inflight(origin, &notify) {
            debug!("waiting for in-flight session fetch: {}", origin);
            if tokio::time::timeout(self.fetch_timeout, notified)
                .await
                .is_err()
            {
                warn!("timed out waiting for in-flight session fetch: {}", origin);
            }
        }

        self.live_cookies(origin).unwrap_or_default()
    }

    async fn acquire(&self, origin: &str) -> Result<CookieMap, SessionAcquisitionFailure> {
        let origin_url =
            Url::parse(origin).map_err(|_| SessionAcquisitionFailure::InvalidOrigin(origin.to_string()))?;

        // fresh client with its own jar so cookies set along a redirect chain are kept, nothing
        // here is shared with the pooled upstream clients
        let jar = Arc::new(Jar::default());
        let client = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .user_agent(SESSION_USER_AGENT)
            .timeout(self.fetch_timeout)
            .build()
            .map_err(|e| SessionAcquisitionFailure::Client(e.to_string()))?;

        let response = client
            .get(origin_url.clone())
            .header(
                header::ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header(header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .send()
            .await?;

        // a 403 challenge page still hands out the cookies we're after so status isn't checked
        debug!(
            "session fetch for {} answered {}",
            origin,
            response.status()
        );

        let mut cookies = CookieMap::new();

        for url in [&origin_url, response.url()] {
            if let Some(value) = jar.cookies(url).and_then(|v| v.to_str().ok().map(String::from)) {
                merge_cookie_header(&mut cookies, &value);
            }
        }

        for set_cookie in response.headers().get_all(header::SET_COOKIE) {
            if let Some((name, value)) = set_cookie.to_str().ok().and_then(parse_set_cookie) {
                cookies.insert(name, value);
            }
        }

        Ok(cookies)
    }
}

#[async_trait::async_trait]
impl SessionCacheTrait for SessionCache {
    async fn get_cookies(&self, origin: &str) -> CookieMap {
        let origin = origin.trim();
        if origin.is_empty() {
            return CookieMap::new();
        }

        if let Some(cookies) = self.live_cookies(origin) {
            debug!("session cache HIT for {} ({} cookies)", origin, cookies.len());
            return cookies;
        }

        let notify = match self.claim(origin) {
            FetchRole::Follower(notify) => return self.wait_for_leader(origin, notify).await,
            FetchRole::Leader(notify) => notify,
        };

        let _guard = InflightGuard {
            cache: self,
            origin,
            notify,
        };

        match self.acquire(origin).await {
            Ok(cookies) => {
                info!(
                    "acquired {} session cookies for {} (TTL: {}s)",
                    cookies.len(),
                    origin,
                    self.ttl.as_secs()
                );
                metrics::counter!("session_fetches_total", "outcome" => "ok").increment(1);
                self.store(origin, cookies.clone());
                cookies
            }
            Err(e) => {
                // not stored, the next request tries again
                warn!("session acquisition for {} failed: {}", origin, e);
                metrics::counter!("session_fetches_total", "outcome" => "failed").increment(1);
                CookieMap::new()
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.read().map(|lock| lock.len()).unwrap_or(0)
    }

    fn purge_expired(&self) -> usize {
        let Ok(mut lock) = self.entries.write() else {
            return 0;
        };

        let now = Instant::now();
        let before = lock.len();
        lock.retain(|_, entry| entry.is_live(now));
        before - lock.len()
    }
}

/// Set-Cookie format: name=value; attr1; attr2... only the name=value part is kept
pub fn parse_set_cookie(set_cookie: &str) -> Option<(String, String)> {
    let pair = set_cookie.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

/// "a=1; b=2" as found in a Cookie header
fn merge_cookie_header(cookies: &mut CookieMap, header_value: &str) {
    for pair in header_value.split(';') {
        if let Some((name, value)) = pair.split_once('=') {
            let name = name.trim();
            if !name.is_empty() {
                cookies.insert(name.to_string(), value.trim().to_string());
            }
        }
    }
}

/// renders a Cookie header value, none when there's nothing to send
pub fn render_cookie_header(cookies: &CookieMap) -> Option<String> {
    if cookies.is_empty() {
        return None;
    }

    Some(
        cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; "),
    )
}
