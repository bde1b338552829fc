//! Storage traits and error types
//!
//! This module defines the trait interface for queue store backends and
//! associated error types.

use crate::storage::{ContentRecord, DownloadQueueItem, HostRecord, UrlRecord};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("URL not found: {0}")]
    UrlNotFound(i64),

    #[error("Volume not found: {0}")]
    VolumeNotFound(i64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for queue store implementations
///
/// Every method is a single autocommit statement or a short sequence of
/// them; there are no multi-statement transactions, so a process may be
/// killed between any two calls and leave a state the next worker can
/// pick up.
pub trait Storage {
    // ===== URL Records =====

    /// Inserts a URL or finds the existing row
    ///
    /// # Arguments
    ///
    /// * `url` - The canonical URL
    ///
    /// # Returns
    ///
    /// The row id and whether the row was created by this call
    fn insert_url(&mut self, url: &str) -> StorageResult<(i64, bool)>;

    /// Looks up the id of a canonical URL
    fn get_url_id(&self, url: &str) -> StorageResult<Option<i64>>;

    /// Gets a URL record by id
    fn get_url(&self, url_id: i64) -> StorageResult<UrlRecord>;

    /// Sets `checked_at` to now
    fn mark_checked(&mut self, url_id: i64) -> StorageResult<()>;

    /// Returns true if the URL has been fetched at least once
    fn is_checked(&self, url_id: i64) -> StorageResult<bool>;

    /// Sets `parsed_at` to now
    fn mark_parsed(&mut self, url_id: i64) -> StorageResult<()>;

    // ===== Instances and Hosts =====

    /// Registers an instance name, returning its id
    fn insert_instance(&mut self, name: &str) -> StorageResult<i64>;

    /// Looks up an instance id by name
    fn get_instance_id(&self, name: &str) -> StorageResult<Option<i64>>;

    /// Looks up an instance name by id
    fn get_instance_name(&self, instance_id: i64) -> StorageResult<Option<String>>;

    /// Registers a host (or updates its owner), returning its id
    fn insert_host(&mut self, hostname: &str, instance_id: Option<i64>) -> StorageResult<i64>;

    /// Loads whitelisted hosts, optionally only those owned by one instance
    fn load_hosts(&self, instance_id: Option<i64>) -> StorageResult<Vec<HostRecord>>;

    /// Highest host id; the wrap point of the fairness cursor
    fn max_host_id(&self) -> StorageResult<i64>;

    /// Installs a backoff hold on a host until the given Unix timestamp
    fn set_host_hold(&mut self, host_id: i64, until: i64) -> StorageResult<()>;

    // ===== Download Queue =====

    /// Enqueues fetch work; returns false if the URL was already queued
    fn enqueue_download(&mut self, url_id: i64, priority: i64, host_id: i64)
        -> StorageResult<bool>;

    /// Claims and removes the next fetch item of the first eligible host
    ///
    /// # Arguments
    ///
    /// * `after_host` - Only hosts with an id strictly greater are considered
    /// * `now` - Current Unix timestamp; hosts held past it are skipped
    /// * `instance_id` - Restrict to hosts owned by this instance
    ///
    /// # Returns
    ///
    /// The claimed item, or `None` if no host past the cursor has work
    fn dequeue_download(
        &mut self,
        after_host: i64,
        now: i64,
        instance_id: Option<i64>,
    ) -> StorageResult<Option<DownloadQueueItem>>;

    /// Number of pending fetch items
    fn download_queue_len(&self) -> StorageResult<i64>;

    // ===== Parse Queue =====

    /// Enqueues a fetched document for link extraction
    fn enqueue_parse(&mut self, url_id: i64) -> StorageResult<bool>;

    /// Claims and removes the lowest queued URL id
    fn dequeue_parse(&mut self) -> StorageResult<Option<i64>>;

    /// Re-enqueues every checked but unparsed document, returning the count
    ///
    /// Redirect and alias sources are skipped; they have no document.
    fn enqueue_unparsed(&mut self) -> StorageResult<usize>;

    // ===== Redirects and Aliases =====

    /// Records `from_id -> to_id`, returning the target actually stored
    ///
    /// A returned target different from `to_id` means the source already
    /// redirects elsewhere.
    fn insert_redirect(&mut self, from_id: i64, to_id: i64) -> StorageResult<i64>;

    /// Gets the stored redirect target of a URL
    fn get_redirect(&self, from_id: i64) -> StorageResult<Option<i64>>;

    /// Records that `source_id` redirected onto the already fetched `target_id`
    ///
    /// The pair itself is unordered; returns false if it was already known.
    fn insert_alias(&mut self, source_id: i64, target_id: i64) -> StorageResult<bool>;

    // ===== Errors =====

    /// Appends a fetch failure
    fn record_download_error(
        &mut self,
        url_id: i64,
        code: Option<u16>,
        message: &str,
    ) -> StorageResult<()>;

    /// Records (or replaces) the parse failure of a URL
    fn record_parse_error(&mut self, url_id: i64, message: &str) -> StorageResult<()>;

    /// Returns true if any fetch of this URL failed
    fn has_download_error(&self, url_id: i64) -> StorageResult<bool>;

    /// Removes all fetch errors and clears `checked_at` of the affected URLs
    ///
    /// # Returns
    ///
    /// The records of the URLs that had failed
    fn take_failed_downloads(&mut self) -> StorageResult<Vec<UrlRecord>>;

    // ===== Volumes and Content =====

    /// Creates an open volume, returning its id
    fn create_volume(&mut self) -> StorageResult<i64>;

    /// Marks a volume as sealed
    fn seal_volume(&mut self, volume_id: i64) -> StorageResult<()>;

    /// Ids of volumes still being filled
    fn open_volumes(&self) -> StorageResult<Vec<i64>>;

    /// Returns true if the volume row exists
    fn volume_exists(&self, volume_id: i64) -> StorageResult<bool>;

    /// Records that an instance holds a volume
    fn insert_volume_locality(&mut self, volume_id: i64, instance_id: i64) -> StorageResult<()>;

    /// Instances holding a volume
    fn volume_instances(&self, volume_id: i64) -> StorageResult<Vec<i64>>;

    /// Removes one instance's claim on a volume
    fn delete_volume_locality(&mut self, volume_id: i64, instance_id: i64) -> StorageResult<()>;

    /// Deletes a volume's locality and directory rows
    fn delete_volume(&mut self, volume_id: i64) -> StorageResult<()>;

    /// Records that a document's bytes were packed into a volume
    fn insert_content(&mut self, url_id: i64, volume_id: i64) -> StorageResult<()>;

    /// Gets the archive location of a document
    fn get_content(&self, url_id: i64) -> StorageResult<Option<ContentRecord>>;

    /// Fetched, error-free, not yet archived documents held by this instance
    ///
    /// Redirect and alias sources are excluded since their bytes live under
    /// the target.
    fn archive_candidates(
        &self,
        after_id: i64,
        instance_id: Option<i64>,
        limit: usize,
    ) -> StorageResult<Vec<i64>>;

    // ===== Locality =====

    /// Records which instance holds a document
    fn set_locality(&mut self, url_id: i64, instance_id: i64) -> StorageResult<()>;

    /// Forgets which instance holds a document
    fn delete_locality(&mut self, url_id: i64) -> StorageResult<()>;

    /// Instance holding a document, if recorded
    fn get_locality(&self, url_id: i64) -> StorageResult<Option<i64>>;

    /// Fetched, error-free documents held by the given instance, in id order
    ///
    /// `None` selects documents without a locality row.
    fn documents_held_by(
        &self,
        instance_id: Option<i64>,
        after_id: i64,
        limit: usize,
    ) -> StorageResult<Vec<i64>>;

    // ===== Purge =====

    /// Schedules an archive member for removal by the next shrink pass
    fn doom_member(&mut self, volume_id: i64, url_id: i64) -> StorageResult<()>;

    /// Volumes with members waiting for a shrink
    fn doomed_volumes(&self) -> StorageResult<Vec<i64>>;

    /// URL ids waiting to be removed from a volume
    fn doomed_members(&self, volume_id: i64) -> StorageResult<Vec<i64>>;

    /// Forgets the shrink set of a volume
    fn clear_doomed(&mut self, volume_id: i64) -> StorageResult<()>;

    /// Deletes a URL and every row referencing it
    fn delete_url(&mut self, url_id: i64) -> StorageResult<()>;

    // ===== Notifications =====

    /// Publishes on a channel, returning the new sequence number
    fn notify(&mut self, channel: &str) -> StorageResult<i64>;

    /// Current sequence number of a channel (0 if never published)
    fn notification_seq(&self, channel: &str) -> StorageResult<i64>;
}
