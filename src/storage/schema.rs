//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the Ampelopsis queue store.

use rusqlite::Connection;

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Every URL ever seen
CREATE TABLE IF NOT EXISTS field (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL UNIQUE,
    checked_at TEXT,
    parsed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_field_unparsed ON field(checked_at, parsed_at);

-- Named deployment partitions
CREATE TABLE IF NOT EXISTS instances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    instance_name TEXT NOT NULL UNIQUE
);

-- Whitelisted hosts; id order drives the fairness rotation
CREATE TABLE IF NOT EXISTS hosts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    hostname TEXT NOT NULL UNIQUE,
    instance_id INTEGER REFERENCES instances(id),
    hold_until INTEGER
);

CREATE TABLE IF NOT EXISTS download_queue (
    url_id INTEGER PRIMARY KEY REFERENCES field(id),
    priority INTEGER NOT NULL,
    host_id INTEGER NOT NULL REFERENCES hosts(id)
);

CREATE INDEX IF NOT EXISTS idx_download_queue_host ON download_queue(host_id, priority, url_id);

CREATE TABLE IF NOT EXISTS parse_queue (
    url_id INTEGER PRIMARY KEY REFERENCES field(id)
);

-- One canonical target per source
CREATE TABLE IF NOT EXISTS redirect (
    from_id INTEGER PRIMARY KEY REFERENCES field(id),
    to_id INTEGER NOT NULL REFERENCES field(id)
);

CREATE INDEX IF NOT EXISTS idx_redirect_to ON redirect(to_id);

-- Unordered pairs of URLs known to denote the same resource; source_id is
-- the member that redirected and has nothing stored of its own
CREATE TABLE IF NOT EXISTS multiple (
    id1 INTEGER NOT NULL REFERENCES field(id),
    id2 INTEGER NOT NULL REFERENCES field(id),
    source_id INTEGER NOT NULL REFERENCES field(id),
    PRIMARY KEY (id1, id2),
    CHECK (id1 < id2),
    CHECK (source_id IN (id1, id2))
);

CREATE INDEX IF NOT EXISTS idx_multiple_source ON multiple(source_id);

CREATE TABLE IF NOT EXISTS download_error (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url_id INTEGER NOT NULL REFERENCES field(id),
    error_code INTEGER,
    error_message TEXT NOT NULL,
    failed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_download_error_url ON download_error(url_id);

CREATE TABLE IF NOT EXISTS parse_error (
    url_id INTEGER PRIMARY KEY REFERENCES field(id),
    error_message TEXT NOT NULL,
    failed_at TEXT NOT NULL
);

-- Archive volumes; written_at stays NULL while the volume is being filled
CREATE TABLE IF NOT EXISTS directory (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    written_at TEXT
);

CREATE TABLE IF NOT EXISTS volume_loc (
    volume_id INTEGER NOT NULL REFERENCES directory(id),
    instance_id INTEGER NOT NULL REFERENCES instances(id),
    PRIMARY KEY (volume_id, instance_id)
);

CREATE TABLE IF NOT EXISTS content (
    url_id INTEGER PRIMARY KEY REFERENCES field(id),
    volume_id INTEGER NOT NULL REFERENCES directory(id)
);

CREATE INDEX IF NOT EXISTS idx_content_volume ON content(volume_id);

CREATE TABLE IF NOT EXISTS locality (
    url_id INTEGER PRIMARY KEY REFERENCES field(id),
    instance_id INTEGER NOT NULL REFERENCES instances(id)
);

CREATE INDEX IF NOT EXISTS idx_locality_instance ON locality(instance_id);

-- Archive members waiting for the next shrink pass
CREATE TABLE IF NOT EXISTS doomed (
    volume_id INTEGER NOT NULL,
    url_id INTEGER NOT NULL,
    PRIMARY KEY (volume_id, url_id)
);

-- Cross-process wakeup counters
CREATE TABLE IF NOT EXISTS notification (
    channel TEXT PRIMARY KEY,
    seq INTEGER NOT NULL
);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
