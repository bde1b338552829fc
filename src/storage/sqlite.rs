//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait.
//! SQLite has no row locks to skip, so every claim is a single
//! `DELETE ... RETURNING` statement; in WAL mode with a busy timeout,
//! concurrent writers are serialized and each row is returned to exactly
//! one caller.

use crate::config::DatabaseConfig;
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::storage::{ContentRecord, DownloadQueueItem, HostRecord, UrlRecord};
use crate::AmpError;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(AmpError)` - Failed to open database
    pub fn new(path: &Path) -> Result<Self, AmpError> {
        Self::with_busy_timeout(path, Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
    }

    /// Opens the database named by the configuration
    pub fn open(config: &DatabaseConfig) -> Result<Self, AmpError> {
        Self::with_busy_timeout(
            Path::new(&config.path),
            Duration::from_millis(config.busy_timeout),
        )
    }

    fn with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self, AmpError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;

        // Several worker processes share this file
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        // Initialize schema
        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database (for testing)
    #[cfg(test)]
    pub fn new_in_memory() -> Result<Self, AmpError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }

    fn collect_ids(&self, sql: &str, params: impl rusqlite::Params) -> StorageResult<Vec<i64>> {
        let mut stmt = self.conn.prepare(sql)?;
        let ids = stmt
            .query_map(params, |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }
}

impl Storage for SqliteStorage {
    // ===== URL Records =====

    fn insert_url(&mut self, url: &str) -> StorageResult<(i64, bool)> {
        let inserted: Option<i64> = self
            .conn
            .query_row(
                "INSERT INTO field (url) VALUES (?1) ON CONFLICT(url) DO NOTHING RETURNING id",
                params![url],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = inserted {
            return Ok((id, true));
        }

        let id = self
            .conn
            .query_row("SELECT id FROM field WHERE url = ?1", params![url], |row| {
                row.get(0)
            })?;
        Ok((id, false))
    }

    fn get_url_id(&self, url: &str) -> StorageResult<Option<i64>> {
        let id = self
            .conn
            .query_row("SELECT id FROM field WHERE url = ?1", params![url], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(id)
    }

    fn get_url(&self, url_id: i64) -> StorageResult<UrlRecord> {
        self.conn
            .query_row(
                "SELECT id, url, checked_at, parsed_at FROM field WHERE id = ?1",
                params![url_id],
                |row| {
                    Ok(UrlRecord {
                        id: row.get(0)?,
                        url: row.get(1)?,
                        checked_at: row.get(2)?,
                        parsed_at: row.get(3)?,
                    })
                },
            )
            .optional()?
            .ok_or(StorageError::UrlNotFound(url_id))
    }

    fn mark_checked(&mut self, url_id: i64) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE field SET checked_at = ?1 WHERE id = ?2",
            params![now, url_id],
        )?;
        Ok(())
    }

    fn is_checked(&self, url_id: i64) -> StorageResult<bool> {
        let checked: Option<bool> = self
            .conn
            .query_row(
                "SELECT checked_at IS NOT NULL FROM field WHERE id = ?1",
                params![url_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(checked.unwrap_or(false))
    }

    fn mark_parsed(&mut self, url_id: i64) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE field SET parsed_at = ?1 WHERE id = ?2",
            params![now, url_id],
        )?;
        Ok(())
    }

    // ===== Instances and Hosts =====

    fn insert_instance(&mut self, name: &str) -> StorageResult<i64> {
        let id = self.conn.query_row(
            "INSERT INTO instances (instance_name) VALUES (?1)
             ON CONFLICT(instance_name) DO UPDATE SET instance_name = excluded.instance_name
             RETURNING id",
            params![name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn get_instance_id(&self, name: &str) -> StorageResult<Option<i64>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM instances WHERE instance_name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn get_instance_name(&self, instance_id: i64) -> StorageResult<Option<String>> {
        let name = self
            .conn
            .query_row(
                "SELECT instance_name FROM instances WHERE id = ?1",
                params![instance_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name)
    }

    fn insert_host(&mut self, hostname: &str, instance_id: Option<i64>) -> StorageResult<i64> {
        let id = self.conn.query_row(
            "INSERT INTO hosts (hostname, instance_id) VALUES (?1, ?2)
             ON CONFLICT(hostname) DO UPDATE
                 SET instance_id = COALESCE(excluded.instance_id, hosts.instance_id)
             RETURNING id",
            params![hostname, instance_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn load_hosts(&self, instance_id: Option<i64>) -> StorageResult<Vec<HostRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, hostname, instance_id, hold_until FROM hosts
             WHERE ?1 IS NULL OR instance_id = ?1
             ORDER BY id",
        )?;

        let hosts = stmt
            .query_map(params![instance_id], |row| {
                Ok(HostRecord {
                    id: row.get(0)?,
                    hostname: row.get(1)?,
                    instance_id: row.get(2)?,
                    hold_until: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(hosts)
    }

    fn max_host_id(&self) -> StorageResult<i64> {
        let max = self
            .conn
            .query_row("SELECT COALESCE(MAX(id), 0) FROM hosts", [], |row| {
                row.get(0)
            })?;
        Ok(max)
    }

    fn set_host_hold(&mut self, host_id: i64, until: i64) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE hosts SET hold_until = MAX(COALESCE(hold_until, 0), ?1) WHERE id = ?2",
            params![until, host_id],
        )?;
        Ok(())
    }

    // ===== Download Queue =====

    fn enqueue_download(
        &mut self,
        url_id: i64,
        priority: i64,
        host_id: i64,
    ) -> StorageResult<bool> {
        let changed = self.conn.execute(
            "INSERT INTO download_queue (url_id, priority, host_id) VALUES (?1, ?2, ?3)
             ON CONFLICT(url_id) DO NOTHING",
            params![url_id, priority, host_id],
        )?;
        Ok(changed > 0)
    }

    fn dequeue_download(
        &mut self,
        after_host: i64,
        now: i64,
        instance_id: Option<i64>,
    ) -> StorageResult<Option<DownloadQueueItem>> {
        let item = self
            .conn
            .query_row(
                "DELETE FROM download_queue
                 WHERE url_id = (
                     SELECT q.url_id FROM download_queue q
                     JOIN hosts h ON h.id = q.host_id
                     WHERE q.host_id > ?1
                       AND (h.hold_until IS NULL OR h.hold_until <= ?2)
                       AND (?3 IS NULL OR h.instance_id = ?3)
                     ORDER BY q.host_id, q.priority, q.url_id
                     LIMIT 1
                 )
                 RETURNING url_id, priority, host_id",
                params![after_host, now, instance_id],
                |row| {
                    Ok(DownloadQueueItem {
                        url_id: row.get(0)?,
                        priority: row.get(1)?,
                        host_id: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(item)
    }

    fn download_queue_len(&self) -> StorageResult<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM download_queue", [], |row| row.get(0))?;
        Ok(count)
    }

    // ===== Parse Queue =====

    fn enqueue_parse(&mut self, url_id: i64) -> StorageResult<bool> {
        let changed = self.conn.execute(
            "INSERT INTO parse_queue (url_id) VALUES (?1) ON CONFLICT(url_id) DO NOTHING",
            params![url_id],
        )?;
        Ok(changed > 0)
    }

    fn dequeue_parse(&mut self) -> StorageResult<Option<i64>> {
        let id = self
            .conn
            .query_row(
                "DELETE FROM parse_queue
                 WHERE url_id = (SELECT MIN(url_id) FROM parse_queue)
                 RETURNING url_id",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn enqueue_unparsed(&mut self) -> StorageResult<usize> {
        let count = self.conn.execute(
            "INSERT INTO parse_queue (url_id)
             SELECT f.id FROM field f
             WHERE f.checked_at IS NOT NULL AND f.parsed_at IS NULL
               AND NOT EXISTS (SELECT 1 FROM redirect r WHERE r.from_id = f.id)
               AND NOT EXISTS (SELECT 1 FROM multiple m WHERE m.source_id = f.id)
               AND NOT EXISTS (SELECT 1 FROM download_error e WHERE e.url_id = f.id)
             ON CONFLICT(url_id) DO NOTHING",
            [],
        )?;
        Ok(count)
    }

    // ===== Redirects and Aliases =====

    fn insert_redirect(&mut self, from_id: i64, to_id: i64) -> StorageResult<i64> {
        // On conflict the no-op update makes RETURNING yield the stored target
        let stored = self.conn.query_row(
            "INSERT INTO redirect (from_id, to_id) VALUES (?1, ?2)
             ON CONFLICT(from_id) DO UPDATE SET to_id = redirect.to_id
             RETURNING to_id",
            params![from_id, to_id],
            |row| row.get(0),
        )?;
        Ok(stored)
    }

    fn get_redirect(&self, from_id: i64) -> StorageResult<Option<i64>> {
        let to = self
            .conn
            .query_row(
                "SELECT to_id FROM redirect WHERE from_id = ?1",
                params![from_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(to)
    }

    fn insert_alias(&mut self, source_id: i64, target_id: i64) -> StorageResult<bool> {
        if source_id == target_id {
            return Ok(false);
        }
        let (id1, id2) = if source_id < target_id {
            (source_id, target_id)
        } else {
            (target_id, source_id)
        };
        let changed = self.conn.execute(
            "INSERT INTO multiple (id1, id2, source_id) VALUES (?1, ?2, ?3)
             ON CONFLICT DO NOTHING",
            params![id1, id2, source_id],
        )?;
        Ok(changed > 0)
    }

    // ===== Errors =====

    fn record_download_error(
        &mut self,
        url_id: i64,
        code: Option<u16>,
        message: &str,
    ) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO download_error (url_id, error_code, error_message, failed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![url_id, code, message, now],
        )?;
        Ok(())
    }

    fn record_parse_error(&mut self, url_id: i64, message: &str) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO parse_error (url_id, error_message, failed_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(url_id) DO UPDATE
                 SET error_message = excluded.error_message, failed_at = excluded.failed_at",
            params![url_id, message, now],
        )?;
        Ok(())
    }

    fn has_download_error(&self, url_id: i64) -> StorageResult<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM download_error WHERE url_id = ?1)",
            params![url_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn take_failed_downloads(&mut self) -> StorageResult<Vec<UrlRecord>> {
        let mut ids = self.collect_ids("DELETE FROM download_error RETURNING url_id", [])?;
        ids.sort_unstable();
        ids.dedup();

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            self.conn.execute(
                "UPDATE field SET checked_at = NULL WHERE id = ?1",
                params![id],
            )?;
            records.push(self.get_url(id)?);
        }
        Ok(records)
    }

    // ===== Volumes and Content =====

    fn create_volume(&mut self) -> StorageResult<i64> {
        self.conn
            .execute("INSERT INTO directory (written_at) VALUES (NULL)", [])?;
        Ok(self.conn.last_insert_rowid())
    }

    fn seal_volume(&mut self, volume_id: i64) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE directory SET written_at = ?1 WHERE id = ?2",
            params![now, volume_id],
        )?;
        if changed == 0 {
            return Err(StorageError::VolumeNotFound(volume_id));
        }
        Ok(())
    }

    fn open_volumes(&self) -> StorageResult<Vec<i64>> {
        self.collect_ids(
            "SELECT id FROM directory WHERE written_at IS NULL ORDER BY id",
            [],
        )
    }

    fn volume_exists(&self, volume_id: i64) -> StorageResult<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM directory WHERE id = ?1)",
            params![volume_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn insert_volume_locality(&mut self, volume_id: i64, instance_id: i64) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO volume_loc (volume_id, instance_id) VALUES (?1, ?2)
             ON CONFLICT DO NOTHING",
            params![volume_id, instance_id],
        )?;
        Ok(())
    }

    fn volume_instances(&self, volume_id: i64) -> StorageResult<Vec<i64>> {
        self.collect_ids(
            "SELECT instance_id FROM volume_loc WHERE volume_id = ?1 ORDER BY instance_id",
            params![volume_id],
        )
    }

    fn delete_volume_locality(&mut self, volume_id: i64, instance_id: i64) -> StorageResult<()> {
        self.conn.execute(
            "DELETE FROM volume_loc WHERE volume_id = ?1 AND instance_id = ?2",
            params![volume_id, instance_id],
        )?;
        Ok(())
    }

    fn delete_volume(&mut self, volume_id: i64) -> StorageResult<()> {
        self.conn.execute(
            "DELETE FROM volume_loc WHERE volume_id = ?1",
            params![volume_id],
        )?;
        self.conn
            .execute("DELETE FROM content WHERE volume_id = ?1", params![volume_id])?;
        self.conn
            .execute("DELETE FROM directory WHERE id = ?1", params![volume_id])?;
        Ok(())
    }

    fn insert_content(&mut self, url_id: i64, volume_id: i64) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO content (url_id, volume_id) VALUES (?1, ?2)
             ON CONFLICT(url_id) DO UPDATE SET volume_id = excluded.volume_id",
            params![url_id, volume_id],
        )?;
        Ok(())
    }

    fn get_content(&self, url_id: i64) -> StorageResult<Option<ContentRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT c.url_id, c.volume_id, d.written_at IS NOT NULL
                 FROM content c JOIN directory d ON d.id = c.volume_id
                 WHERE c.url_id = ?1",
                params![url_id],
                |row| {
                    Ok(ContentRecord {
                        url_id: row.get(0)?,
                        volume_id: row.get(1)?,
                        sealed: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn archive_candidates(
        &self,
        after_id: i64,
        instance_id: Option<i64>,
        limit: usize,
    ) -> StorageResult<Vec<i64>> {
        self.collect_ids(
            "SELECT f.id FROM field f
             WHERE f.id > ?1 AND f.checked_at IS NOT NULL
               AND NOT EXISTS (SELECT 1 FROM content c WHERE c.url_id = f.id)
               AND NOT EXISTS (SELECT 1 FROM download_error e WHERE e.url_id = f.id)
               AND NOT EXISTS (SELECT 1 FROM redirect r WHERE r.from_id = f.id)
               AND NOT EXISTS (SELECT 1 FROM multiple m WHERE m.source_id = f.id)
               AND ((?2 IS NULL AND NOT EXISTS (SELECT 1 FROM locality l WHERE l.url_id = f.id))
                    OR EXISTS (SELECT 1 FROM locality l
                               WHERE l.url_id = f.id AND l.instance_id = ?2))
             ORDER BY f.id
             LIMIT ?3",
            params![after_id, instance_id, limit as i64],
        )
    }

    // ===== Locality =====

    fn set_locality(&mut self, url_id: i64, instance_id: i64) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO locality (url_id, instance_id) VALUES (?1, ?2)
             ON CONFLICT(url_id) DO UPDATE SET instance_id = excluded.instance_id",
            params![url_id, instance_id],
        )?;
        Ok(())
    }

    fn delete_locality(&mut self, url_id: i64) -> StorageResult<()> {
        self.conn
            .execute("DELETE FROM locality WHERE url_id = ?1", params![url_id])?;
        Ok(())
    }

    fn get_locality(&self, url_id: i64) -> StorageResult<Option<i64>> {
        let instance = self
            .conn
            .query_row(
                "SELECT instance_id FROM locality WHERE url_id = ?1",
                params![url_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(instance)
    }

    fn documents_held_by(
        &self,
        instance_id: Option<i64>,
        after_id: i64,
        limit: usize,
    ) -> StorageResult<Vec<i64>> {
        self.collect_ids(
            "SELECT f.id FROM field f
             LEFT JOIN locality l ON l.url_id = f.id
             WHERE f.id > ?1 AND f.checked_at IS NOT NULL
               AND NOT EXISTS (SELECT 1 FROM download_error e WHERE e.url_id = f.id)
               AND NOT EXISTS (SELECT 1 FROM redirect r WHERE r.from_id = f.id)
               AND NOT EXISTS (SELECT 1 FROM multiple m WHERE m.source_id = f.id)
               AND ((?2 IS NULL AND l.instance_id IS NULL) OR l.instance_id = ?2)
             ORDER BY f.id
             LIMIT ?3",
            params![after_id, instance_id, limit as i64],
        )
    }

    // ===== Purge =====

    fn doom_member(&mut self, volume_id: i64, url_id: i64) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO doomed (volume_id, url_id) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
            params![volume_id, url_id],
        )?;
        Ok(())
    }

    fn doomed_volumes(&self) -> StorageResult<Vec<i64>> {
        self.collect_ids(
            "SELECT DISTINCT volume_id FROM doomed ORDER BY volume_id",
            [],
        )
    }

    fn doomed_members(&self, volume_id: i64) -> StorageResult<Vec<i64>> {
        self.collect_ids(
            "SELECT url_id FROM doomed WHERE volume_id = ?1 ORDER BY url_id",
            params![volume_id],
        )
    }

    fn clear_doomed(&mut self, volume_id: i64) -> StorageResult<()> {
        self.conn
            .execute("DELETE FROM doomed WHERE volume_id = ?1", params![volume_id])?;
        Ok(())
    }

    fn delete_url(&mut self, url_id: i64) -> StorageResult<()> {
        // Referencing rows first; the field row goes last
        for sql in [
            "DELETE FROM locality WHERE url_id = ?1",
            "DELETE FROM redirect WHERE from_id = ?1 OR to_id = ?1",
            "DELETE FROM multiple WHERE id1 = ?1 OR id2 = ?1",
            "DELETE FROM parse_queue WHERE url_id = ?1",
            "DELETE FROM content WHERE url_id = ?1",
            "DELETE FROM download_error WHERE url_id = ?1",
            "DELETE FROM parse_error WHERE url_id = ?1",
            "DELETE FROM download_queue WHERE url_id = ?1",
            "DELETE FROM field WHERE id = ?1",
        ] {
            self.conn.execute(sql, params![url_id])?;
        }
        Ok(())
    }

    // ===== Notifications =====

    fn notify(&mut self, channel: &str) -> StorageResult<i64> {
        let seq = self.conn.query_row(
            "INSERT INTO notification (channel, seq) VALUES (?1, 1)
             ON CONFLICT(channel) DO UPDATE SET seq = notification.seq + 1
             RETURNING seq",
            params![channel],
            |row| row.get(0),
        )?;
        Ok(seq)
    }

    fn notification_seq(&self, channel: &str) -> StorageResult<i64> {
        let seq: Option<i64> = self
            .conn
            .query_row(
                "SELECT seq FROM notification WHERE channel = ?1",
                params![channel],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seq.unwrap_or(0))
    }
}
