use crate::storage::Storage;
use crate::volume::layout::{member_name, Layout, Part};
use crate::AmpError;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Candidates fetched from the queue store per query
const CANDIDATE_BATCH: usize = 256;

/// Summary of one packed volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeStats {
    pub volume_id: i64,
    pub documents: usize,
    pub bytes: u64,
}

/// Packs loose files into size-bounded volumes
pub struct Compressor<'a, S: Storage> {
    storage: &'a mut S,
    layout: &'a Layout,
    threshold: u64,
    instance_id: Option<i64>,
}

impl<'a, S: Storage> Compressor<'a, S> {
    /// Creates a compressor
    ///
    /// # Arguments
    ///
    /// * `storage` - The queue store
    /// * `layout` - File layout of the collection
    /// * `threshold` - Volume size in bytes after which a volume is sealed
    /// * `instance_id` - Only documents held by this instance are packed
    pub fn new(
        storage: &'a mut S,
        layout: &'a Layout,
        threshold: u64,
        instance_id: Option<i64>,
    ) -> Self {
        Self {
            storage,
            layout,
            threshold,
            instance_id,
        }
    }

    /// Packs volumes until no candidates remain
    ///
    /// Does nothing while another volume is still open, since that means a
    /// concurrent compressor is working (or one died and needs an operator).
    pub fn compress_all(&mut self) -> Result<Vec<VolumeStats>, AmpError> {
        let open = self.storage.open_volumes()?;
        if let Some(volume_id) = open.first() {
            tracing::warn!("Volume {} is still open, skipping compression", volume_id);
            return Ok(Vec::new());
        }

        let mut volumes = Vec::new();
        while let Some(stats) = self.compress_volume()? {
            tracing::info!(
                "Sealed volume {} with {} documents ({} bytes)",
                stats.volume_id,
                stats.documents,
                stats.bytes
            );
            volumes.push(stats);
        }
        Ok(volumes)
    }

    /// Fills and seals one volume
    ///
    /// # Returns
    ///
    /// * `Ok(Some(VolumeStats))` - A volume was written
    /// * `Ok(None)` - There was nothing to pack
    pub fn compress_volume(&mut self) -> Result<Option<VolumeStats>, AmpError> {
        let mut batch = self
            .storage
            .archive_candidates(0, self.instance_id, CANDIDATE_BATCH)?;
        if batch.is_empty() {
            return Ok(None);
        }

        let volume_id = self.storage.create_volume()?;
        fs::create_dir_all(self.layout.volume_dir())?;
        let path = self.layout.volume_path(volume_id);
        let mut writer = ZipWriter::new(File::create(&path)?);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        let mut members = Vec::new();
        let mut size = 0;
        'fill: while !batch.is_empty() {
            let mut last = 0;
            for url_id in batch {
                last = url_id;
                let headers = self.layout.loose_path(url_id, Part::Headers);
                if !headers.exists() {
                    // A store that died before its header write
                    tracing::debug!("No loose files for URL {}", url_id);
                    continue;
                }

                add_member(&mut writer, &headers, member_name(url_id, Part::Headers), options)?;
                let body = self.layout.loose_path(url_id, Part::Body);
                if body.exists() {
                    add_member(&mut writer, &body, member_name(url_id, Part::Body), options)?;
                }
                members.push(url_id);

                size = fs::metadata(&path)?.len();
                if size >= self.threshold {
                    break 'fill;
                }
            }
            batch = self
                .storage
                .archive_candidates(last, self.instance_id, CANDIDATE_BATCH)?;
        }

        writer.finish()?;

        if members.is_empty() {
            fs::remove_file(&path)?;
            self.storage.delete_volume(volume_id)?;
            return Ok(None);
        }

        self.finish_volume(volume_id, &members)?;

        Ok(Some(VolumeStats {
            volume_id,
            documents: members.len(),
            bytes: fs::metadata(&path).map(|m| m.len()).unwrap_or(size),
        }))
    }

    /// Records the members, seals the volume and drops the loose copies
    fn finish_volume(&mut self, volume_id: i64, members: &[i64]) -> Result<(), AmpError> {
        if let Some(instance_id) = self.instance_id {
            self.storage.insert_volume_locality(volume_id, instance_id)?;
        }
        for &url_id in members {
            self.storage.insert_content(url_id, volume_id)?;
        }
        self.storage.seal_volume(volume_id)?;

        for &url_id in members {
            // The volume's locality now speaks for its members
            if self.instance_id.is_some() {
                self.storage.delete_locality(url_id)?;
            }
            for part in [Part::Headers, Part::Body] {
                remove_if_exists(&self.layout.loose_path(url_id, part))?;
            }
        }
        Ok(())
    }
}

fn add_member(
    writer: &mut ZipWriter<File>,
    source: &Path,
    name: String,
    options: SimpleFileOptions,
) -> Result<(), AmpError> {
    writer.start_file(name, options)?;
    let mut file = File::open(source)?;
    io::copy(&mut file, writer)?;
    Ok(())
}

pub(crate) fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use crate::volume::VolumeHolder;

    fn fetched(storage: &mut SqliteStorage, layout: &Layout, path: &str, body: &[u8]) -> i64 {
        let (id, _) = storage
            .insert_url(&format!("http://example.com/{}", path))
            .unwrap();
        for (part, bytes) in [
            (Part::Headers, &b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n"[..]),
            (Part::Body, body),
        ] {
            let file = layout.loose_path(id, part);
            fs::create_dir_all(file.parent().unwrap()).unwrap();
            fs::write(file, bytes).unwrap();
        }
        storage.mark_checked(id).unwrap();
        id
    }

    #[test]
    fn test_archive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path(), "test");
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let a = fetched(&mut storage, &layout, "a", b"<p>first</p>");
        let b = fetched(&mut storage, &layout, "b", b"<p>second</p>");

        let volumes = Compressor::new(&mut storage, &layout, 1 << 30, None)
            .compress_all()
            .unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].documents, 2);

        for id in [a, b] {
            assert!(!layout.loose_path(id, Part::Body).exists());
            assert!(!layout.loose_path(id, Part::Headers).exists());
            assert_eq!(
                storage.get_content(id).unwrap().unwrap().volume_id,
                volumes[0].volume_id
            );
        }

        let mut holder = VolumeHolder::new(layout.clone());
        assert_eq!(
            holder.read(&storage, a, Part::Body).unwrap().unwrap(),
            b"<p>first</p>"
        );
        assert_eq!(
            holder.read(&storage, b, Part::Body).unwrap().unwrap(),
            b"<p>second</p>"
        );
    }

    #[test]
    fn test_threshold_splits_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path(), "test");
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        for i in 0..3 {
            fetched(&mut storage, &layout, &format!("p{}", i), &[b'x'; 64]);
        }

        // Any member crosses a one-byte threshold
        let volumes = Compressor::new(&mut storage, &layout, 1, None)
            .compress_all()
            .unwrap();
        assert_eq!(volumes.len(), 3);
        assert!(volumes.iter().all(|v| v.documents == 1));
    }

    #[test]
    fn test_open_volume_blocks_pass() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path(), "test");
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        fetched(&mut storage, &layout, "a", b"body");
        storage.create_volume().unwrap();

        let volumes = Compressor::new(&mut storage, &layout, 1 << 30, None)
            .compress_all()
            .unwrap();
        assert!(volumes.is_empty());
    }

    #[test]
    fn test_documents_without_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path(), "test");
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let (ghost, _) = storage.insert_url("http://example.com/ghost").unwrap();
        storage.mark_checked(ghost).unwrap();

        let volumes = Compressor::new(&mut storage, &layout, 1 << 30, None)
            .compress_all()
            .unwrap();
        assert!(volumes.is_empty());
        assert!(storage.open_volumes().unwrap().is_empty());
        assert!(storage.get_content(ghost).unwrap().is_none());
    }

    #[test]
    fn test_alias_sources_never_open_a_volume() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path(), "test");
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let target = fetched(&mut storage, &layout, "", b"home");
        let first = Compressor::new(&mut storage, &layout, 1 << 30, None)
            .compress_all()
            .unwrap();
        assert_eq!(first.len(), 1);

        for path in ["index.html", "home"] {
            let (source, _) = storage
                .insert_url(&format!("http://example.com/{}", path))
                .unwrap();
            storage.mark_checked(source).unwrap();
            storage.insert_alias(source, target).unwrap();
        }
        assert!(storage.archive_candidates(0, None, 10).unwrap().is_empty());

        let volumes = Compressor::new(&mut storage, &layout, 1 << 30, None)
            .compress_all()
            .unwrap();
        assert!(volumes.is_empty());
        assert!(!layout.volume_path(first[0].volume_id + 1).exists());

        // Volume ids are never reused, so a skipped id would show here
        fetched(&mut storage, &layout, "next", b"next");
        let next = Compressor::new(&mut storage, &layout, 1 << 30, None)
            .compress_all()
            .unwrap();
        assert_eq!(next[0].volume_id, first[0].volume_id + 1);
    }

    #[test]
    fn test_instance_volume_locality() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path(), "test");
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let alpha = storage.insert_instance("alpha").unwrap();
        let a = fetched(&mut storage, &layout, "a", b"body");
        storage.set_locality(a, alpha).unwrap();

        let volumes = Compressor::new(&mut storage, &layout, 1 << 30, Some(alpha))
            .compress_all()
            .unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(
            storage.volume_instances(volumes[0].volume_id).unwrap(),
            vec![alpha]
        );
        assert_eq!(storage.get_locality(a).unwrap(), None);
    }
}
