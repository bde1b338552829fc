//! Ampelopsis: a crawl-and-archive engine
//!
//! This crate harvests web documents into a two-tier store (loose files that
//! are later packed into zip volumes), coordinating any number of fetcher,
//! parser, compressor and sync workers through one shared SQLite database.

pub mod config;
pub mod crawler;
pub mod policy;
pub mod storage;
pub mod sync;
pub mod url;
pub mod volume;

use thiserror::Error;

/// Main error type for Ampelopsis operations
#[derive(Debug, Error)]
pub enum AmpError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    StorageError(#[from] storage::StorageError),

    #[error("URL error: {0}")]
    UrlError(#[from] UrlError),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("HTML extraction error: {0}")]
    Html(#[from] lol_html::errors::RewritingError),

    #[error("Invalid regular expression: {0}")]
    Regex(#[from] regex::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A URL was found redirecting to two different canonical targets
    #[error("Redirect conflict: {from_id} -> {existing}, refusing {requested}")]
    DataIntegrity {
        from_id: i64,
        existing: i64,
        requested: i64,
    },

    /// The recent error rate reached the configured threshold
    #[error("Health check failed: {errors} errors in last {sampled} transfers")]
    HealthCheck { errors: usize, sampled: usize },

    /// A sync peer answered with an unexpected status
    #[error("Peer answered {status} for {url}")]
    Peer { url: String, status: u16 },

    #[error("Sync handshake failed: {0}")]
    Handshake(String),

    #[error("Unknown instance: {0}")]
    UnknownInstance(String),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl AmpError {
    /// Returns true for errors that must terminate the owning process
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DataIntegrity { .. }
                | Self::HealthCheck { .. }
                | Self::Handshake(_)
                | Self::UnknownInstance(_)
                | Self::Config(_)
        )
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing host in URL")]
    MissingHost,
}

/// Result type alias for Ampelopsis operations
pub type Result<T> = std::result::Result<T, AmpError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for URL operations
pub type UrlResult<T> = std::result::Result<T, UrlError>;

// Re-export commonly used types
pub use config::Config;
pub use storage::{SqliteStorage, Storage};
pub use url::normalize_url;
pub use volume::{Layout, VolumeHolder};
