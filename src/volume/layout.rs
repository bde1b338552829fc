use crate::config::Config;
use std::path::{Path, PathBuf};

/// Number of fan-out directories of the loose tier
const FANOUT: i64 = 1000;

/// Which file of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Part {
    /// Response body
    Body,
    /// Raw response header block
    Headers,
}

/// Persisted file layout of one collection
///
/// Loose files live at `<root>/tmp/<schema>/<id mod 1000>/<id>[h]`,
/// volumes at `<root>/data/<schema>/<volume_id>.zip`.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
    schema: String,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>, schema: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            schema: schema.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.storage.root, &config.database.schema)
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Loose file of a document
    pub fn loose_path(&self, url_id: i64, part: Part) -> PathBuf {
        self.root
            .join("tmp")
            .join(&self.schema)
            .join(url_id.rem_euclid(FANOUT).to_string())
            .join(member_name(url_id, part))
    }

    /// Directory holding all volumes of the collection
    pub fn volume_dir(&self) -> PathBuf {
        self.root.join("data").join(&self.schema)
    }

    pub fn volume_path(&self, volume_id: i64) -> PathBuf {
        self.volume_dir().join(format!("{}.zip", volume_id))
    }
}

/// File (and archive member) name of a document part
pub fn member_name(url_id: i64, part: Part) -> String {
    match part {
        Part::Body => url_id.to_string(),
        Part::Headers => format!("{}h", url_id),
    }
}

/// Inverse of [`member_name`]
pub fn parse_member_name(name: &str) -> Option<(i64, Part)> {
    let (digits, part) = match name.strip_suffix('h') {
        Some(digits) => (digits, Part::Headers),
        None => (name, Part::Body),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(|id| (id, part))
}
