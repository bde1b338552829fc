use serde::Deserialize;

/// Main configuration structure for Ampelopsis
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub parse: ParseConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub instance: InstanceConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Database location and partitioning
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    pub path: String,

    /// Collection name; the directory segment of every persisted file
    pub schema: String,

    /// How long a statement waits on a locked database (milliseconds)
    #[serde(rename = "busy-timeout", default = "default_busy_timeout")]
    pub busy_timeout: u64,
}

/// File tiers: loose staging directory and archive volumes
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding `tmp/` and `data/`
    #[serde(default = "default_root")]
    pub root: String,

    /// Size in bytes after which a volume is sealed
    #[serde(rename = "volume-threshold", default = "default_volume_threshold")]
    pub volume_threshold: u64,

    /// Pause between compressor passes (seconds)
    #[serde(rename = "compress-backoff", default = "default_compress_backoff")]
    pub compress_backoff: u64,
}

/// Fetcher behavior
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadConfig {
    /// Maximum number of simultaneous transfers
    #[serde(rename = "max-num-conn", default = "default_max_num_conn")]
    pub max_num_conn: usize,

    #[serde(rename = "user-agent", default = "default_user_agent")]
    pub user_agent: String,

    /// Accepted content types; `text/html` is always accepted
    #[serde(rename = "mime-whitelist", default = "default_mime_whitelist")]
    pub mime_whitelist: Vec<String>,

    /// Completed transfers between two `parse_ready` notifications
    #[serde(
        rename = "notification-threshold",
        default = "default_notification_threshold"
    )]
    pub notification_threshold: usize,

    /// Connect timeout (seconds)
    #[serde(rename = "connect-timeout", default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Whole-transfer timeout (seconds)
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(rename = "max-redirects", default = "default_max_redirects")]
    pub max_redirects: usize,

    /// Upper bound on a Retry-After hold (seconds)
    #[serde(rename = "max-hold", default = "default_max_hold")]
    pub max_hold: u64,

    /// Priority strategy for newly discovered URLs
    #[serde(default)]
    pub preference: PreferenceKind,

    #[serde(rename = "proxy-host")]
    pub proxy_host: Option<String>,

    #[serde(rename = "proxy-port")]
    pub proxy_port: Option<u16>,
}

/// Priority strategy selector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferenceKind {
    #[default]
    Breadth,
    Novelty,
}

/// Parser behavior
#[derive(Debug, Clone, Deserialize)]
pub struct ParseConfig {
    /// Links matching this (case-insensitive) pattern are dropped
    #[serde(rename = "url-blacklist-rx", default = "default_blacklist_rx")]
    pub url_blacklist_rx: String,

    /// When set, only links matching this pattern are kept
    #[serde(rename = "url-whitelist-rx")]
    pub url_whitelist_rx: Option<String>,

    #[serde(rename = "max-url-length", default = "default_max_url_length")]
    pub max_url_length: usize,

    /// Documents after which the parser exits; 0 means unlimited
    #[serde(rename = "page-limit", default)]
    pub page_limit: usize,

    /// Parsed documents between two `download_ready` notifications
    #[serde(
        rename = "notification-threshold",
        default = "default_notification_threshold"
    )]
    pub notification_threshold: usize,

    #[serde(rename = "cache-high-mark", default = "default_cache_high_mark")]
    pub cache_high_mark: usize,

    #[serde(rename = "cache-low-mark", default = "default_cache_low_mark")]
    pub cache_low_mark: usize,

    #[serde(rename = "novelty-high-mark", default = "default_novelty_high_mark")]
    pub novelty_high_mark: usize,

    #[serde(rename = "novelty-low-mark", default = "default_novelty_low_mark")]
    pub novelty_low_mark: usize,
}

/// Circuit breaker over recent transfer outcomes
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Completed transfers between two checks
    #[serde(default = "default_health_interval")]
    pub interval: usize,

    /// Number of most recent outcomes sampled; defaults to `interval`
    pub tail: Option<usize>,

    /// Error percentage that aborts the process; <= 0 disables checks
    #[serde(default = "default_health_threshold")]
    pub threshold: i64,
}

/// Instance partitioning
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceConfig {
    /// Name of this deployment; unset in single-instance setups
    pub name: Option<String>,

    /// Compare registrable domains instead of exact host names
    #[serde(rename = "match-domain", default)]
    pub match_domain: bool,
}

/// Storage server and sync client
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Simultaneous document pulls of the sync worker
    #[serde(rename = "sync-max-num-conn", default = "default_sync_max_num_conn")]
    pub sync_max_num_conn: usize,

    /// Notification polling period (milliseconds)
    #[serde(rename = "poll-interval", default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Longest idle wait before a worker re-checks its queue (seconds)
    #[serde(rename = "idle-timeout", default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl HealthConfig {
    /// Sample size actually used by the monitor
    pub fn effective_tail(&self) -> usize {
        self.tail.unwrap_or(self.interval)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            volume_threshold: default_volume_threshold(),
            compress_backoff: default_compress_backoff(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_num_conn: default_max_num_conn(),
            user_agent: default_user_agent(),
            mime_whitelist: default_mime_whitelist(),
            notification_threshold: default_notification_threshold(),
            connect_timeout: default_connect_timeout(),
            timeout: default_timeout(),
            max_redirects: default_max_redirects(),
            max_hold: default_max_hold(),
            preference: PreferenceKind::default(),
            proxy_host: None,
            proxy_port: None,
        }
    }
}

impl Default for ParseConfig {
    fn default() -> Self {
        Self {
            url_blacklist_rx: default_blacklist_rx(),
            url_whitelist_rx: None,
            max_url_length: default_max_url_length(),
            page_limit: 0,
            notification_threshold: default_notification_threshold(),
            cache_high_mark: default_cache_high_mark(),
            cache_low_mark: default_cache_low_mark(),
            novelty_high_mark: default_novelty_high_mark(),
            novelty_low_mark: default_novelty_low_mark(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: default_health_interval(),
            tail: None,
            threshold: default_health_threshold(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            sync_max_num_conn: default_sync_max_num_conn(),
            poll_interval: default_poll_interval(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

fn default_busy_timeout() -> u64 {
    5000
}

fn default_root() -> String {
    ".".to_string()
}

fn default_volume_threshold() -> u64 {
    1024 * 1024 * 1024
}

fn default_compress_backoff() -> u64 {
    3600
}

fn default_max_num_conn() -> usize {
    10
}

fn default_user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

fn default_mime_whitelist() -> Vec<String> {
    vec!["text/html".to_string()]
}

fn default_notification_threshold() -> usize {
    1000
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_timeout() -> u64 {
    300
}

fn default_max_redirects() -> usize {
    5
}

fn default_max_hold() -> u64 {
    3600
}

fn default_blacklist_rx() -> String {
    "[.](?:jpe?g|pdf|png)$".to_string()
}

fn default_max_url_length() -> usize {
    512
}

fn default_cache_high_mark() -> usize {
    2000
}

fn default_cache_low_mark() -> usize {
    1000
}

fn default_novelty_high_mark() -> usize {
    100_000
}

fn default_novelty_low_mark() -> usize {
    50_000
}

fn default_health_interval() -> usize {
    100
}

fn default_health_threshold() -> i64 {
    80
}

fn default_server_port() -> u16 {
    8888
}

fn default_sync_max_num_conn() -> usize {
    4
}

fn default_poll_interval() -> u64 {
    500
}

fn default_idle_timeout() -> u64 {
    60
}
