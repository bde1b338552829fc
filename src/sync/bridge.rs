use crate::storage::Storage;
use crate::volume::{Layout, Part};
use crate::AmpError;
use std::fs;
use std::io;

/// Which instance holds the bytes of a document
pub struct StorageBridge<'a, S: Storage> {
    storage: &'a S,
    instance_id: Option<i64>,
}

impl<'a, S: Storage> StorageBridge<'a, S> {
    pub fn new(storage: &'a S, instance_id: Option<i64>) -> Self {
        Self {
            storage,
            instance_id,
        }
    }

    /// Returns true if this instance can serve the document
    ///
    /// The document must have been fetched without error. An archived
    /// document is local when its volume is; a loose one when its locality
    /// names this instance (or is absent, without a configured instance).
    pub fn has_local_data(&self, url_id: i64) -> Result<bool, AmpError> {
        if !self.storage.is_checked(url_id)? || self.storage.has_download_error(url_id)? {
            return Ok(false);
        }

        if let Some(content) = self.storage.get_content(url_id)? {
            return VolumeBridge::new(self.storage, self.instance_id)
                .has_local_volume(content.volume_id);
        }

        Ok(self.storage.get_locality(url_id)? == self.instance_id)
    }

    /// Returns true if a different, registered instance holds the document
    ///
    /// Without a configured instance ownership cannot be compared, so the
    /// answer is always false.
    pub fn has_remote_instance(&self, url_id: i64) -> Result<bool, AmpError> {
        let own = match self.instance_id {
            Some(own) => own,
            None => return Ok(false),
        };

        match self.storage.get_locality(url_id)? {
            Some(owner) if owner != own => {
                Ok(self.storage.get_instance_name(owner)?.is_some())
            }
            _ => Ok(false),
        }
    }
}

/// Removes one loose file of a document; a missing file is not an error
pub fn delete_storage(layout: &Layout, url_id: i64, part: Part) -> Result<bool, AmpError> {
    match fs::remove_file(layout.loose_path(url_id, part)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Which instances hold a volume
pub struct VolumeBridge<'a, S: Storage> {
    storage: &'a S,
    instance_id: Option<i64>,
}

impl<'a, S: Storage> VolumeBridge<'a, S> {
    pub fn new(storage: &'a S, instance_id: Option<i64>) -> Self {
        Self {
            storage,
            instance_id,
        }
    }

    /// Returns true if the volume is sealed and held by this instance
    pub fn has_local_volume(&self, volume_id: i64) -> Result<bool, AmpError> {
        if self.storage.open_volumes()?.contains(&volume_id)
            || !self.storage.volume_exists(volume_id)?
        {
            return Ok(false);
        }

        let holders = self.storage.volume_instances(volume_id)?;
        Ok(match self.instance_id {
            Some(own) => holders.contains(&own),
            None => holders.is_empty(),
        })
    }

    /// Returns true if only other instances are recorded as holding the volume
    pub fn has_remote_instance(&self, volume_id: i64) -> Result<bool, AmpError> {
        let own = match self.instance_id {
            Some(own) => own,
            None => return Ok(false),
        };

        let holders = self.storage.volume_instances(volume_id)?;
        Ok(!holders.is_empty() && !holders.contains(&own))
    }
}
