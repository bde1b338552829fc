use crate::storage::Storage;
use crate::volume::layout::{member_name, Layout, Part};
use crate::AmpError;
use std::fs::File;
use std::io::{self, BufReader, Read};
use zip::ZipArchive;

const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Uniform reader over both storage tiers
///
/// A sealed volume member is preferred; when the document is not archived,
/// the volume is unreadable or the member is missing, the loose file is
/// used. The most recently used volume stays open, so reading consecutive
/// documents of one volume does not reopen the archive.
pub struct VolumeHolder {
    layout: Layout,
    current: Option<(i64, ZipArchive<File>)>,
}

impl VolumeHolder {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            current: None,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Opens one part of a document
    ///
    /// # Returns
    ///
    /// * `Ok(Some(reader))` - The document part exists in one of the tiers
    /// * `Ok(None)` - Neither tier has it
    /// * `Err(AmpError)` - The loose file exists but could not be opened
    pub fn open<S: Storage>(
        &mut self,
        storage: &S,
        url_id: i64,
        part: Part,
    ) -> Result<Option<Box<dyn Read + '_>>, AmpError> {
        if let Some(index) = self.locate_member(storage, url_id, part)? {
            if let Some((_, archive)) = self.current.as_mut() {
                return Ok(Some(Box::new(archive.by_index(index)?)));
            }
        }

        match File::open(self.layout.loose_path(url_id, part)) {
            Ok(file) => Ok(Some(Box::new(BufReader::new(file)))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads one part of a document into memory
    pub fn read<S: Storage>(
        &mut self,
        storage: &S,
        url_id: i64,
        part: Part,
    ) -> Result<Option<Vec<u8>>, AmpError> {
        match self.open(storage, url_id, part)? {
            Some(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf)?;
                Ok(Some(buf))
            }
            None => Ok(None),
        }
    }

    /// Content type recorded in a document's headers
    pub fn content_type<S: Storage>(
        &mut self,
        storage: &S,
        url_id: i64,
    ) -> Result<Option<String>, AmpError> {
        Ok(self
            .read(storage, url_id, Part::Headers)?
            .map(|headers| sniff_content_type(&headers)))
    }

    /// Closes the cached volume
    pub fn release(&mut self) {
        self.current = None;
    }

    fn locate_member<S: Storage>(
        &mut self,
        storage: &S,
        url_id: i64,
        part: Part,
    ) -> Result<Option<usize>, AmpError> {
        let volume_id = match storage.get_content(url_id)? {
            Some(content) if content.sealed => content.volume_id,
            _ => return Ok(None),
        };

        let cached = matches!(&self.current, Some((id, _)) if *id == volume_id);
        if !cached {
            self.current = None;
            let path = self.layout.volume_path(volume_id);
            let archive = match File::open(&path)
                .map_err(AmpError::from)
                .and_then(|file| ZipArchive::new(file).map_err(AmpError::from))
            {
                Ok(archive) => archive,
                Err(e) => {
                    tracing::warn!("Cannot open volume {}: {}", path.display(), e);
                    return Ok(None);
                }
            };
            self.current = Some((volume_id, archive));
        }

        let name = member_name(url_id, part);
        Ok(self
            .current
            .as_ref()
            .and_then(|(_, archive)| archive.index_for_name(&name)))
    }
}

/// Extracts the Content-Type from a raw header block
///
/// The last occurrence wins; documents without one are `text/plain`.
pub fn sniff_content_type(headers: &[u8]) -> String {
    String::from_utf8_lossy(headers)
        .lines()
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-type")
                .then(|| value.trim().to_string())
        })
        .filter(|value| !value.is_empty())
        .last()
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
}
