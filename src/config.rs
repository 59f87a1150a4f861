#[derive(clap::ValueEnum, Clone, Debug, Copy, PartialEq)]
pub enum CargoEnv {
    Development,
    Production,
}

#[derive(clap::Parser, Clone, Debug)]
pub struct AppConfig {
    // production or development
    #[clap(long, env, value_enum, default_value = "development")]
    pub cargo_env: CargoEnv,

    // port that the app will bind to
    #[clap(long, env, default_value = "8000")]
    pub port: u16,

    // public base url of this service, rewritten manifests and wrapped stream urls point here so
    // it has to be reachable by the player (no trailing slash needed, it gets trimmed)
    #[clap(long, env, default_value = "http://localhost:8000")]
    pub api_base_url: String,

    // redis is optional, without it the result cache lives in memory only
    #[clap(long, env)]
    pub redis_url: Option<String>,

    // this should be either * for allowing everything, or a comma seperated list of domains like
    // example.com,something.com
    #[clap(long, env, default_value = "*")]
    pub cors_origin: String,

    // longest an upstream may go quiet mid-response, manifests also use it as a total deadline
    #[clap(long, env, default_value = "30")]
    pub upstream_timeout_secs: u64,

    // how long acquired origin cookies are reused before the origin is visited again
    #[clap(long, env, default_value = "300")]
    pub session_ttl_secs: u64,

    // live playlists change every few seconds so keep this short
    #[clap(long, env, default_value = "10")]
    pub manifest_cache_ttl_secs: u64,

    // max entries held by the in-memory result cache
    #[clap(long, env, default_value = "10000")]
    pub memory_cache_capacity: usize,

    // regexes for cdn hosts that refuse direct playback, urls matching any of them get wrapped
    // into /proxy or /playlist urls before being handed to a client. separated by ';' since
    // counted quantifiers like `\d{1,3}` carry commas
    #[clap(long, env, value_delimiter = ';')]
    pub restricted_cdn_patterns: Vec<String>,

    // caps concurrent in-flight requests across the whole router
    #[clap(long, env, default_value = "1024")]
    pub max_concurrent_requests: usize,

    // where the daily rolling log lands in production
    #[clap(long, env, default_value = "logs")]
    pub log_dir: String,

    // optional sentry integration
    #[clap(long, env)]
    pub sentry_dsn: Option<String>,
}

impl AppConfig {
    /// base url without the trailing slash so paths can be appended with format!
    pub fn api_base(&self) -> &str {
        self.api_base_url.trim_end_matches('/')
    }

    /// the url every rewritten manifest line points back to
    pub fn proxy_base_url(&self) -> String {
        format!("{}/proxy", self.api_base())
    }
}

impl Default for AppConfig {
    // mostly used by tests, the real values come from env
    fn default() -> Self {
        Self {
            cargo_env: CargoEnv::Development,
            port: 8000,
            api_base_url: "http://localhost:8000".to_string(),
            redis_url: None,
            cors_origin: "*".to_string(),
            upstream_timeout_secs: 30,
            session_ttl_secs: 300,
            manifest_cache_ttl_secs: 10,
            memory_cache_capacity: 10_000,
            restricted_cdn_patterns: Vec::new(),
            max_concurrent_requests: 1024,
            log_dir: "logs".to_string(),
            sentry_dsn: None,
        }
    }
}
