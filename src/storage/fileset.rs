//! The physical files of one partition (one stage position, or the whole
//! dataset when positions are not split).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::data::coords::{CHANNEL, TIME, Z};
use crate::data::{
    Comments, Coordinate, DisplaySettings, Image, ImageRecord, ImageTags, PixelType,
    SummaryMetadata,
};
use crate::error::StorageError;
use crate::format::tiff::ByteOrder;
use crate::io::FileHandlePool;
use crate::ome::{FileRef, OmeMetadataBuilder};

use super::metadata_file::MetadataTextFile;
use super::reader::TiffPageReader;
use super::writer::{TiffPageWriter, WriterLimits};
use super::{read_lock, write_lock};

/// Extension of every dataset file.
pub const FILE_EXTENSION: &str = ".ome.tif";

/// Base file name of a partition, without extension.
///
/// `<prefix>_stack` (or `stack`), followed by `_<position name>` or
/// `_Pos<n>` when positions are split into separate files.
pub fn base_name(
    prefix: &str,
    split_by_position: bool,
    position: u32,
    position_name: Option<&str>,
) -> String {
    let mut base = if prefix.is_empty() {
        "stack".to_string()
    } else {
        format!("{}_stack", sanitize(prefix))
    };
    if split_by_position {
        match position_name.filter(|n| !n.is_empty()) {
            Some(name) => {
                base.push('_');
                base.push_str(&sanitize(name));
            }
            None => base.push_str(&format!("_Pos{position}")),
        }
    }
    base
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// =============================================================================
// ReaderSet
// =============================================================================

/// Readers of all physical files of one partition, in file order.
///
/// Shared between the engine's committed index and the background writer,
/// which appends a reader whenever it opens a new file.
#[derive(Clone, Default)]
pub struct ReaderSet {
    readers: Arc<RwLock<Vec<Arc<TiffPageReader>>>>,
}

impl ReaderSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set holding a single reader.
    pub fn single(reader: Arc<TiffPageReader>) -> Self {
        let set = Self::new();
        set.push(reader);
        set
    }

    pub(crate) fn push(&self, reader: Arc<TiffPageReader>) {
        write_lock(&self.readers).push(reader);
    }

    /// Snapshot of the readers.
    pub fn readers(&self) -> Vec<Arc<TiffPageReader>> {
        read_lock(&self.readers).clone()
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        read_lock(&self.readers).len()
    }

    /// Whether no file has been opened yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any file of the partition indexes `coords`.
    pub fn contains(&self, coords: &Coordinate) -> bool {
        read_lock(&self.readers).iter().any(|r| r.contains(coords))
    }

    /// Read `coords` from the most recent file that indexes it.
    pub async fn read_image(&self, coords: &Coordinate) -> Result<Option<Image>, StorageError> {
        let reader = self
            .readers()
            .into_iter()
            .rev()
            .find(|r| r.contains(coords));
        match reader {
            Some(reader) => reader.read_image(coords).await,
            None => Ok(None),
        }
    }
}

// =============================================================================
// Acquisition order
// =============================================================================

/// Tracks whether planes arrive in the expected acquisition order and which
/// (channel, slice) pairs the latest frame holds.
#[derive(Debug, Clone)]
struct OrderTracker {
    channels: u32,
    slices: u32,
    slices_first: bool,
    expected: (u32, u32, u32),
    in_order: bool,
    last_frame: u32,
    frame_planes: BTreeSet<(u32, u32)>,
}

impl OrderTracker {
    fn new(summary: &SummaryMetadata) -> Self {
        Self {
            channels: summary.channels(),
            slices: summary.slices(),
            slices_first: summary.slices_first,
            expected: (0, 0, 0),
            in_order: true,
            last_frame: 0,
            frame_planes: BTreeSet::new(),
        }
    }

    /// Plane expected after `(c, z, t)`.
    fn successor(&self, c: u32, z: u32, t: u32) -> (u32, u32, u32) {
        if self.slices_first {
            if z + 1 < self.slices {
                (c, z + 1, t)
            } else if c + 1 < self.channels {
                (c + 1, 0, t)
            } else {
                (0, 0, t + 1)
            }
        } else if c + 1 < self.channels {
            (c + 1, z, t)
        } else if z + 1 < self.slices {
            (0, z + 1, t)
        } else {
            (0, 0, t + 1)
        }
    }

    fn observe(&mut self, c: u32, z: u32, t: u32) {
        if (c, z, t) != self.expected {
            self.in_order = false;
        }
        self.expected = self.successor(c, z, t);

        if t > self.last_frame {
            self.last_frame = t;
            self.frame_planes.clear();
        }
        if t == self.last_frame {
            self.frame_planes.insert((c, z));
        }
    }

    /// (channel, slice) pairs absent from the latest frame.
    fn missing_in_last_frame(&self) -> Vec<(u32, u32)> {
        if self.frame_planes.is_empty() {
            return Vec::new();
        }
        let mut missing = Vec::new();
        for c in 0..self.channels {
            for z in 0..self.slices {
                if !self.frame_planes.contains(&(c, z)) {
                    missing.push((c, z));
                }
            }
        }
        missing
    }
}

// =============================================================================
// FileSet
// =============================================================================

/// Settings shared by every FileSet of a dataset.
#[derive(Debug, Clone, Copy)]
pub struct FileSetSettings {
    pub limits: WriterLimits,
    pub byte_order: ByteOrder,
    pub split_by_position: bool,
    pub separate_metadata_file: bool,
}

/// Where a partition's files find the full OME-XML document.
#[derive(Debug, Clone, Copy)]
pub enum Trailer<'a> {
    /// This partition's current file holds the given document
    Full(&'a str),
    /// Another file (or the sidecar) holds it
    Pointer { file_name: &'a str, uuid: &'a str },
}

/// Writers and readers of one partition.
pub struct FileSet {
    directory: PathBuf,
    base_name: String,
    position: u32,
    summary: Arc<SummaryMetadata>,
    settings: FileSetSettings,
    pool: FileHandlePool,
    current: TiffPageWriter,
    previous: Vec<TiffPageWriter>,
    readers: ReaderSet,
    metadata_file: Option<MetadataTextFile>,
    comments: Comments,
    order: OrderTracker,
    /// Coordinate and shape of the latest image, used for blank padding
    last_image: Option<(Coordinate, u32, u32, PixelType)>,
    closed: bool,
    #[cfg(test)]
    fail_next_close: bool,
}

impl FileSet {
    /// Open the first file of a partition.
    ///
    /// `readers` receives a reader for every file this set creates.
    pub fn create(
        directory: &Path,
        base_name: String,
        position: u32,
        summary: Arc<SummaryMetadata>,
        settings: FileSetSettings,
        pool: FileHandlePool,
        readers: ReaderSet,
    ) -> Result<Self, StorageError> {
        let filename = format!("{base_name}{FILE_EXTENSION}");
        let current = TiffPageWriter::create(
            directory,
            &filename,
            &summary,
            settings.limits,
            settings.byte_order,
            pool.clone(),
        )?;
        readers.push(current.reader());

        let metadata_file = if settings.separate_metadata_file {
            Some(MetadataTextFile::create(directory, &base_name, &summary)?)
        } else {
            None
        };

        info!(file = %filename, position, "opened partition");
        Ok(Self {
            directory: directory.to_path_buf(),
            base_name,
            position,
            order: OrderTracker::new(&summary),
            comments: Comments {
                summary: summary.comments.clone(),
                ..Default::default()
            },
            summary,
            settings,
            pool,
            current,
            previous: Vec::new(),
            readers,
            metadata_file,
            last_image: None,
            closed: false,
            #[cfg(test)]
            fail_next_close: false,
        })
    }

    /// Base file name of this partition.
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// Stage position of this partition.
    pub fn position(&self) -> u32 {
        self.position
    }

    /// Readers of this partition's files.
    pub fn readers(&self) -> &ReaderSet {
        &self.readers
    }

    /// Names of all files, oldest first.
    pub fn files(&self) -> Vec<String> {
        self.previous
            .iter()
            .chain(std::iter::once(&self.current))
            .map(|w| w.filename().to_string())
            .collect()
    }

    /// Name and UUID of the file currently being written.
    pub fn current_file(&self) -> (&str, &str) {
        (self.current.filename(), self.current.uuid())
    }

    /// Whether images so far arrived in the expected acquisition order.
    pub fn in_expected_order(&self) -> bool {
        self.order.in_order
    }

    fn roll_over(&mut self) -> Result<(), StorageError> {
        let filename = format!(
            "{}_{}{FILE_EXTENSION}",
            self.base_name,
            self.previous.len() + 1
        );
        // The current file is finalized only once its successor exists, so a
        // failed rollover leaves it writable and the next write retries.
        let next = TiffPageWriter::create(
            &self.directory,
            &filename,
            &self.summary,
            self.settings.limits,
            self.settings.byte_order,
            self.pool.clone(),
        )?;
        if let Err(e) = self.current.finish_writing(Some(&filename)) {
            if let Err(remove) = std::fs::remove_file(next.path()) {
                warn!(file = %filename, error = %remove, "failed to remove unused continuation file");
            }
            return Err(e);
        }

        self.readers.push(next.reader());
        let full = std::mem::replace(&mut self.current, next);
        info!(
            from = %full.filename(),
            to = %filename,
            images = full.ifd_count(),
            "file size limit reached, continuing in a new file"
        );
        self.previous.push(full);
        Ok(())
    }

    fn ensure_space(&mut self, block_len: u64, coords: &Coordinate) -> Result<(), StorageError> {
        if !self.current.has_space_for(block_len, coords) && self.current.ifd_count() > 0 {
            self.roll_over()?;
        }
        Ok(())
    }

    /// Append `image`, rolling over to a new file when the current one is
    /// full. Returns the reader of the file that now holds the image.
    pub fn write_image(
        &mut self,
        image: &Image,
        ome: &mut OmeMetadataBuilder,
    ) -> Result<Arc<TiffPageReader>, StorageError> {
        if self.closed {
            return Err(StorageError::Configuration(format!(
                "partition {} is closed",
                self.base_name
            )));
        }

        let coords = image.coords();
        coords.validate()?;
        if !self.current.accepts_axes(coords) {
            debug!(partition = %self.base_name, coords = %coords, "axis limit reached");
            self.roll_over()?;
        }

        let block_len = self.current.block_len(image)?;
        self.ensure_space(block_len, coords)?;

        let ifd = self.current.write_image(image)?;
        ome.add_image(
            image,
            FileRef {
                file_name: self.current.filename(),
                uuid: self.current.uuid(),
                ifd,
            },
        );
        let reader = self.current.reader();

        if let Some(text) = &mut self.metadata_file {
            text.append(image)?;
        }
        if let Some(comment) = &image.tags().comment {
            self.comments.add_image_comment(coords, comment);
        }

        self.order.observe(coords.channel(), coords.z(), coords.time());
        self.last_image = Some((
            coords.clone(),
            image.width(),
            image.height(),
            image.pixel_type(),
        ));
        Ok(reader)
    }

    /// Make the next `close` fail before writing anything.
    #[cfg(test)]
    pub(crate) fn fail_next_close(&mut self) {
        self.fail_next_close = true;
    }

    /// Pad an incomplete final frame with blank planes, then terminate the
    /// IFD chain and write the index map. Returns the number of blank planes.
    ///
    /// Padding only happens when every image arrived in the expected order,
    /// positions are split and time is not the fastest axis.
    pub fn finish_aborted_acq_if_needed(
        &mut self,
        ome: &mut OmeMetadataBuilder,
    ) -> Result<usize, StorageError> {
        let pad = self.order.in_order
            && self.settings.split_by_position
            && !self.summary.time_first;
        let padded = if pad { self.pad_final_frame(ome)? } else { 0 };
        self.current.finish_writing(None)?;
        Ok(padded)
    }

    fn pad_final_frame(&mut self, ome: &mut OmeMetadataBuilder) -> Result<usize, StorageError> {
        let Some((coords, width, height, pixel_type)) = self.last_image.clone() else {
            return Ok(0);
        };
        let frame = self.order.last_frame;
        let missing = self.order.missing_in_last_frame();

        for &(c, z) in &missing {
            let record = ImageRecord {
                coords: coords.with(CHANNEL, c).with(Z, z).with(TIME, frame),
                tags: ImageTags::default(),
                blank: true,
            };
            let len = self
                .current
                .blank_block_len(width, height, pixel_type, &record)?;
            self.ensure_space(len, &record.coords)?;

            let ifd = self
                .current
                .write_blank_image(width, height, pixel_type, &record)?;
            ome.add_blank_plane(
                self.position,
                c,
                z,
                frame,
                FileRef {
                    file_name: self.current.filename(),
                    uuid: self.current.uuid(),
                    ifd,
                },
            );
        }

        if !missing.is_empty() {
            info!(
                partition = %self.base_name,
                frame,
                blanks = missing.len(),
                "padded incomplete final frame"
            );
        }
        Ok(missing.len())
    }

    /// Spare trailer bytes in the current file.
    pub fn trailer_capacity(&self) -> u64 {
        self.current.trailer_capacity()
    }

    /// Whether the current file can hold a document of `len` bytes.
    pub fn has_space_for_full_omexml(&self, len: usize) -> bool {
        self.current.has_space_for_full_omexml(len)
    }

    /// Write trailers, display settings and comments to every file and close
    /// them. Only the current file receives a full document; all others get a
    /// pointer to the holder.
    pub fn close(
        &mut self,
        trailer: Trailer<'_>,
        display: &DisplaySettings,
    ) -> Result<(), StorageError> {
        if self.closed {
            return Ok(());
        }

        let (holder_name, holder_uuid) = match trailer {
            Trailer::Full(_) => (
                self.current.filename().to_string(),
                self.current.uuid().to_string(),
            ),
            Trailer::Pointer { file_name, uuid } => (file_name.to_string(), uuid.to_string()),
        };

        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_close) {
            return Err(StorageError::Configuration(format!(
                "{} could not be closed",
                self.current.filename()
            )));
        }

        // Current file first: if it cannot take the document, the earlier
        // files are still open and can be pointed elsewhere.
        let doc = match trailer {
            Trailer::Full(xml) => xml.to_string(),
            Trailer::Pointer { .. } => {
                OmeMetadataBuilder::pointer_document(self.current.uuid(), &holder_name, &holder_uuid)
            }
        };
        self.current.close(&doc, display, &self.comments)?;

        for writer in &mut self.previous {
            let doc = OmeMetadataBuilder::pointer_document(writer.uuid(), &holder_name, &holder_uuid);
            writer.close(&doc, display, &self.comments)?;
        }

        if let Some(text) = &mut self.metadata_file {
            text.close()?;
        }
        self.closed = true;
        debug!(partition = %self.base_name, files = self.previous.len() + 1, "partition closed");
        Ok(())
    }
}
