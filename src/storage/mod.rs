//! Queue store: the single source of coordination truth
//!
//! This module handles all database operations, including:
//! - SQLite database initialization and schema management
//! - Destructive, exactly-once dequeue of download and parse work
//! - Host, instance, redirect and error bookkeeping
//! - Volume, content and locality records for the storage tiers
//! - Counter-based notifications that wake idle workers

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageError, StorageResult};

use crate::config::DatabaseConfig;
use crate::AmpError;

/// Opens the queue store described by the configuration
///
/// # Arguments
///
/// * `config` - The database section of the configuration
///
/// # Returns
///
/// * `Ok(SqliteStorage)` - Successfully opened storage
/// * `Err(AmpError)` - Failed to open the database
pub fn open_storage(config: &DatabaseConfig) -> Result<SqliteStorage, AmpError> {
    SqliteStorage::open(config)
}

/// Wakes parsers after fetched documents were enqueued
pub const PARSE_READY: &str = "parse_ready";

/// Wakes fetchers after new URLs were enqueued
pub const DOWNLOAD_READY: &str = "download_ready";

/// Name of a notification channel, scoped to an instance when there is one
pub fn channel_name(base: &str, instance_id: Option<i64>) -> String {
    match instance_id {
        Some(id) => format!("{}_{}", base, id),
        None => base.to_string(),
    }
}

/// A row of the `field` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlRecord {
    pub id: i64,
    pub url: String,
    pub checked_at: Option<String>,
    pub parsed_at: Option<String>,
}

/// A whitelisted host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub id: i64,
    pub hostname: String,
    pub instance_id: Option<i64>,
    /// Unix timestamp before which the host must not be dequeued
    pub hold_until: Option<i64>,
}

/// A claimed unit of fetch work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadQueueItem {
    pub url_id: i64,
    pub priority: i64,
    pub host_id: i64,
}

/// Where an archived document lives; members are named `{url_id}` and `{url_id}h`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRecord {
    pub url_id: i64,
    pub volume_id: i64,
    /// Whether the volume has been sealed
    pub sealed: bool,
}
