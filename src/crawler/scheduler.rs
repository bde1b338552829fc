//! Host rotation for the fetcher
//!
//! This module handles:
//! - Round-robin fairness across whitelisted hosts
//! - Skipping hosts under an active backoff hold (in the dequeue query)
//! - Restricting work to the hosts of one instance

use crate::storage::{DownloadQueueItem, Storage, StorageResult};

/// Rotating host cursor
///
/// Every claim only considers hosts with an id strictly greater than the
/// host of the previous claim, so one host's backlog cannot starve the
/// others. When no host past the cursor has work, the cursor wraps to zero.
/// The position is not persisted; a restarted fetcher starts from zero.
#[derive(Debug, Clone)]
pub struct Scheduler {
    last_host: i64,
    instance_id: Option<i64>,
}

impl Scheduler {
    pub fn new(instance_id: Option<i64>) -> Self {
        Self {
            last_host: 0,
            instance_id,
        }
    }

    /// Claims the next fetch item
    ///
    /// # Arguments
    ///
    /// * `storage` - The queue store
    /// * `now` - Current Unix timestamp, compared against host holds
    ///
    /// # Returns
    ///
    /// The claimed item, or `None` if no eligible host has work
    pub fn next<S: Storage>(
        &mut self,
        storage: &mut S,
        now: i64,
    ) -> StorageResult<Option<DownloadQueueItem>> {
        if self.last_host > 0 && self.last_host >= storage.max_host_id()? {
            self.last_host = 0;
        }

        let mut item = storage.dequeue_download(self.last_host, now, self.instance_id)?;
        if item.is_none() && self.last_host > 0 {
            self.last_host = 0;
            item = storage.dequeue_download(0, now, self.instance_id)?;
        }

        if let Some(item) = &item {
            self.last_host = item.host_id;
        }
        Ok(item)
    }
}
