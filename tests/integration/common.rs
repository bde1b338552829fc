use ampelopsis::config::Config;
use ampelopsis::storage::SqliteStorage;
use std::path::Path;
use tempfile::TempDir;

pub const SCHEMA: &str = "test";

/// A scratch database and storage root
pub struct Workspace {
    pub dir: TempDir,
    pub config: Config,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = dir.path().join("store");
        let config = config_for(&dir.path().join("queue.db"), &root);
        Self { dir, config }
    }

    /// Opens another connection to the workspace database
    pub fn storage(&self) -> SqliteStorage {
        SqliteStorage::new(Path::new(&self.config.database.path)).expect("Failed to open database")
    }
}

pub fn config_for(db_path: &Path, root: &Path) -> Config {
    toml::from_str(&format!(
        r#"
[database]
path = "{}"
schema = "{}"

[storage]
root = "{}"

[download]
max-num-conn = 4
timeout = 10

[health]
threshold = 0

[server]
poll-interval = 10
idle-timeout = 1
"#,
        db_path.display(),
        SCHEMA,
        root.display()
    ))
    .expect("Failed to build test config")
}

pub fn html(body: &str) -> wiremock::ResponseTemplate {
    wiremock::ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), "text/html")
}
