use crate::storage::{Storage, StorageError};
use crate::volume::compress::remove_if_exists;
use crate::volume::layout::{parse_member_name, Layout, Part};
use crate::AmpError;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use zip::{ZipArchive, ZipWriter};

/// Counts of one purge call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    /// Documents whose loose files were removed immediately
    pub loose: usize,
    /// Documents left in a volume until the next shrink
    pub archived: usize,
    /// Ids that were not in the store
    pub unknown: usize,
}

/// Result of rewriting one volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShrinkOutcome {
    /// The volume was rewritten with the surviving members
    Rewritten { kept: usize, removed: usize },
    /// No member survived, so the volume is gone
    Deleted,
    /// The volume file did not exist
    Missing,
}

/// Deletes documents and every row that references them
///
/// Loose files are removed right away. Archived documents are recorded in
/// the shrink set of their volume; the archive itself is only rewritten by
/// [`shrink_volume`].
pub fn purge_urls<S: Storage>(
    storage: &mut S,
    layout: &Layout,
    url_ids: &[i64],
) -> Result<PurgeStats, AmpError> {
    let mut stats = PurgeStats::default();

    for &url_id in url_ids {
        match storage.get_url(url_id) {
            Ok(_) => {}
            Err(StorageError::UrlNotFound(_)) => {
                tracing::warn!("Cannot purge unknown URL {}", url_id);
                stats.unknown += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        }

        match storage.get_content(url_id)? {
            Some(content) => {
                storage.doom_member(content.volume_id, url_id)?;
                stats.archived += 1;
            }
            None => {
                for part in [Part::Headers, Part::Body] {
                    remove_if_exists(&layout.loose_path(url_id, part))?;
                }
                stats.loose += 1;
            }
        }

        storage.delete_url(url_id)?;
        tracing::debug!("Purged URL {}", url_id);
    }

    Ok(stats)
}

/// Shrinks every volume with doomed members
pub fn shrink_pending<S: Storage>(
    storage: &mut S,
    layout: &Layout,
) -> Result<Vec<(i64, ShrinkOutcome)>, AmpError> {
    let mut outcomes = Vec::new();
    for volume_id in storage.doomed_volumes()? {
        let outcome = shrink_volume(storage, layout, volume_id)?;
        tracing::info!("Shrank volume {}: {:?}", volume_id, outcome);
        outcomes.push((volume_id, outcome));
    }
    Ok(outcomes)
}

/// Rewrites a volume without its doomed members
///
/// Surviving members are copied raw (without recompression) into a
/// temporary file that replaces the volume by rename, so a reader sees
/// either the old or the new archive and never a partial one.
pub fn shrink_volume<S: Storage>(
    storage: &mut S,
    layout: &Layout,
    volume_id: i64,
) -> Result<ShrinkOutcome, AmpError> {
    let doomed: HashSet<i64> = storage.doomed_members(volume_id)?.into_iter().collect();
    let path = layout.volume_path(volume_id);

    let source = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::warn!("Volume file {} is missing", path.display());
            storage.clear_doomed(volume_id)?;
            return Ok(ShrinkOutcome::Missing);
        }
        Err(e) => return Err(e.into()),
    };
    let mut archive = ZipArchive::new(source)?;

    let tmp_path = path.with_extension("zip.tmp");
    let mut writer = ZipWriter::new(File::create(&tmp_path)?);
    let mut kept = HashSet::new();
    let mut removed = HashSet::new();

    for index in 0..archive.len() {
        let member = archive.by_index_raw(index)?;
        let url_id = parse_member_name(member.name()).map(|(id, _)| id);
        match url_id {
            Some(id) if doomed.contains(&id) => {
                removed.insert(id);
            }
            _ => {
                if let Some(id) = url_id {
                    kept.insert(id);
                }
                writer.raw_copy_file(member)?;
            }
        }
    }
    writer.finish()?;
    drop(archive);

    let outcome = if kept.is_empty() {
        fs::remove_file(&tmp_path)?;
        fs::remove_file(&path)?;
        storage.delete_volume(volume_id)?;
        ShrinkOutcome::Deleted
    } else {
        fs::rename(&tmp_path, &path)?;
        ShrinkOutcome::Rewritten {
            kept: kept.len(),
            removed: removed.len(),
        }
    };

    storage.clear_doomed(volume_id)?;
    Ok(outcome)
}
