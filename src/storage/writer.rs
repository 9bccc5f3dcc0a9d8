//! Append-only writer for one physical dataset file.
//!
//! All methods perform blocking I/O and are only called from the background
//! writer thread. Readers of the same file go through their own handles from
//! the [`FileHandlePool`]; data is visible to them as soon as `write_all`
//! returns.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;
use uuid::Uuid;

use crate::data::{
    Comments, Coordinate, DisplaySettings, Image, ImageRecord, PixelType, SummaryMetadata,
};
use crate::error::{IoError, StorageError};
use crate::format::layout::{
    encode_block, padded_len, slot_value_position, DatasetHeader, IndexMap, COMMENTS_HEADER,
    COMMENTS_SLOT, DISPLAY_SETTINGS_HEADER, DISPLAY_SETTINGS_SLOT, INDEX_MAP_SLOT,
    MAX_INDEX_AXES,
};
use crate::format::tiff::{
    ByteOrder, Compression, EncodedIfd, IfdBuilder, TiffTag, RESOLUTION_UNIT_CENTIMETER,
};
use crate::io::FileHandlePool;

use super::reader::TiffPageReader;

/// Payload bytes reserved for the display settings block, so it can be
/// rewritten in place after acquisition.
pub const DISPLAY_SETTINGS_RESERVE: usize = 16 * 1024;

/// Bytes kept free for the display settings and comments blocks when
/// computing trailer capacity.
const CLOSING_ALLOWANCE: u64 = DISPLAY_SETTINGS_RESERVE as u64 + 64 * 1024;

/// Extra bytes assumed for the continuation file name in index map estimates.
const CONTINUATION_ALLOWANCE: usize = 16;

/// Size limits applied to one physical file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterLimits {
    /// Largest allowed file size (never above `u32::MAX`)
    pub max_file_size: u64,
    /// Bytes kept free for the OME-XML trailer
    pub metadata_reserve: u64,
}

/// Writes images to one classic TIFF file.
pub struct TiffPageWriter {
    path: PathBuf,
    filename: String,
    uuid: String,
    file: File,
    byte_order: ByteOrder,
    limits: WriterLimits,
    pixel_size_um: Option<f64>,
    /// Offset where the next block is appended
    position: u64,
    ifd_count: u32,
    /// Position of the next-IFD field of the last written IFD
    last_next_field: Option<u64>,
    /// Position of the ImageDescription entry in the first IFD
    description_entry: Option<u64>,
    index: IndexMap,
    axes: BTreeSet<String>,
    index_written: bool,
    closed: bool,
    reader: Arc<TiffPageReader>,
}

impl TiffPageWriter {
    /// Create `directory/filename` and write its header and summary.
    pub fn create(
        directory: &Path,
        filename: &str,
        summary: &SummaryMetadata,
        limits: WriterLimits,
        byte_order: ByteOrder,
        pool: FileHandlePool,
    ) -> Result<Self, StorageError> {
        let path = directory.join(filename);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| IoError::from_std(path.display(), e))?;

        let summary_json = serde_json::to_vec(summary)?;
        let header = DatasetHeader::new(byte_order, summary_json.len() as u32);

        let mut head = header.encode();
        head.extend_from_slice(&summary_json);
        head.resize(header.first_ifd_offset as usize, 0);

        let reader = Arc::new(TiffPageReader::for_writer(
            path.clone(),
            pool,
            byte_order,
            header.first_ifd_offset,
            summary.clone(),
        ));

        let mut writer = Self {
            path,
            filename: filename.to_string(),
            uuid: format!("urn:uuid:{}", Uuid::new_v4()),
            file,
            byte_order,
            limits,
            pixel_size_um: summary.pixel_size_um,
            position: 0,
            ifd_count: 0,
            last_next_field: None,
            description_entry: None,
            index: IndexMap::new(),
            axes: BTreeSet::new(),
            index_written: false,
            closed: false,
            reader,
        };
        writer.write_at(0, &head)?;
        writer.position = header.first_ifd_offset;

        debug!(file = %writer.filename, uuid = %writer.uuid, "created dataset file");
        Ok(writer)
    }

    /// File name (without directory).
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// `urn:uuid:` identifier used in OME TiffData references.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Full path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of IFDs written, including blank planes.
    pub fn ifd_count(&self) -> u32 {
        self.ifd_count
    }

    /// Current end of file.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reader sharing this file's index.
    pub fn reader(&self) -> Arc<TiffPageReader> {
        self.reader.clone()
    }

    // -------------------------------------------------------------------------
    // Images
    // -------------------------------------------------------------------------

    fn encode_plane(
        &self,
        width: u32,
        height: u32,
        pixel_type: PixelType,
        pixels: Bytes,
        record: &ImageRecord,
    ) -> Result<IfdBuilder, StorageError> {
        let metadata = serde_json::to_string(record)?;
        let samples = pixel_type.samples_per_pixel() as usize;

        let mut builder = IfdBuilder::new(self.byte_order);
        builder
            .strip(pixels, height)
            .long(TiffTag::ImageWidth, width)
            .long(TiffTag::ImageLength, height)
            .shorts(
                TiffTag::BitsPerSample,
                &vec![pixel_type.bits_per_sample(); samples],
            )
            .short(TiffTag::Compression, Compression::None as u16)
            .short(TiffTag::PhotometricInterpretation, pixel_type.photometric())
            .short(TiffTag::SamplesPerPixel, pixel_type.samples_per_pixel())
            .shorts(
                TiffTag::SampleFormat,
                &vec![pixel_type.sample_format(); samples],
            );

        if let Some(size) = self.pixel_size_um.filter(|s| *s > 0.0) {
            // Pixels per centimeter
            let per_cm = (10_000.0 / size).round().clamp(1.0, u32::MAX as f64) as u32;
            builder
                .rational(TiffTag::XResolution, per_cm, 1)
                .rational(TiffTag::YResolution, per_cm, 1)
                .short(TiffTag::ResolutionUnit, RESOLUTION_UNIT_CENTIMETER);
        }

        if self.ifd_count == 0 {
            builder.reserved_ascii(TiffTag::ImageDescription);
        }
        builder.ascii(TiffTag::ImageMetadata, &metadata);
        Ok(builder)
    }

    fn pending_index_len(&self, extra_axes: &[String], extra_entries: usize) -> u64 {
        if self.index_written {
            return 0;
        }
        let mut axes = self.axes.clone();
        axes.extend(extra_axes.iter().cloned());
        let axes: Vec<String> = axes.into_iter().collect();
        IndexMap::encoded_len_for(
            self.index.len() + extra_entries,
            &axes,
            self.filename.len() + CONTINUATION_ALLOWANCE,
        )
    }

    /// Whether a block of `block_len` bytes at `coords` fits under the limit,
    /// leaving room for the index map and the metadata reserve.
    pub fn has_space_for(&self, block_len: u64, coords: &Coordinate) -> bool {
        let axes: Vec<String> = coords.axes().map(str::to_string).collect();
        let end = self.position
            + block_len
            + self.pending_index_len(&axes, 1)
            + self.limits.metadata_reserve;
        end <= self.limits.max_file_size
    }

    /// Whether the index map can still encode `coords`: the file's axis set
    /// including its axes stays within [`MAX_INDEX_AXES`].
    pub fn accepts_axes(&self, coords: &Coordinate) -> bool {
        let new_axes = coords.axes().filter(|a| !self.axes.contains(*a)).count();
        self.axes.len() + new_axes <= MAX_INDEX_AXES
    }

    /// Encoded length of the block `image` would occupy.
    pub fn block_len(&self, image: &Image) -> Result<u64, StorageError> {
        let builder = self.encode_plane(
            image.width(),
            image.height(),
            image.pixel_type(),
            image.pixels().clone(),
            &image.record(),
        )?;
        Ok(builder.encoded_len())
    }

    fn append(&mut self, builder: IfdBuilder) -> Result<EncodedIfd, StorageError> {
        if self.index_written {
            return Err(StorageError::Configuration(format!(
                "{} is already finalized",
                self.filename
            )));
        }

        let encoded = builder.build(self.position, true)?;
        let mut offset = encoded.offset();
        for piece in encoded.pieces() {
            self.write_at(offset, piece)?;
            offset += piece.len() as u64;
        }

        if self.ifd_count == 0 {
            self.description_entry = encoded.entry_position(TiffTag::ImageDescription);
        }
        self.last_next_field = Some(encoded.next_field_position());
        self.position += encoded.len();
        self.ifd_count += 1;
        Ok(encoded)
    }

    /// Append `image`. Returns its IFD index in this file.
    pub fn write_image(&mut self, image: &Image) -> Result<u32, StorageError> {
        if !self.accepts_axes(image.coords()) {
            return Err(StorageError::InvalidCoordinate(format!(
                "{} would exceed {MAX_INDEX_AXES} distinct axes in {}",
                image.coords(),
                self.filename
            )));
        }
        let builder = self.encode_plane(
            image.width(),
            image.height(),
            image.pixel_type(),
            image.pixels().clone(),
            &image.record(),
        )?;
        let ifd_index = self.ifd_count;
        let encoded = self.append(builder)?;

        let coords = image.coords().clone();
        self.axes.extend(coords.axes().map(str::to_string));
        self.index.push(coords.clone(), encoded.offset() as u32);
        self.reader.insert_index(coords, encoded.offset());
        Ok(ifd_index)
    }

    /// Append an all-zero plane that is not indexed. Returns its IFD index.
    pub fn write_blank_image(
        &mut self,
        width: u32,
        height: u32,
        pixel_type: PixelType,
        record: &ImageRecord,
    ) -> Result<u32, StorageError> {
        let len = width as usize * height as usize * pixel_type.bytes_per_pixel();
        let builder = self.encode_plane(width, height, pixel_type, Bytes::from(vec![0u8; len]), record)?;
        let ifd_index = self.ifd_count;
        self.append(builder)?;
        Ok(ifd_index)
    }

    /// Blank plane block length, for space checks.
    pub fn blank_block_len(
        &self,
        width: u32,
        height: u32,
        pixel_type: PixelType,
        record: &ImageRecord,
    ) -> Result<u64, StorageError> {
        let len = width as usize * height as usize * pixel_type.bytes_per_pixel();
        let builder = self.encode_plane(width, height, pixel_type, Bytes::from(vec![0u8; len]), record)?;
        Ok(builder.encoded_len())
    }

    // -------------------------------------------------------------------------
    // Finalization
    // -------------------------------------------------------------------------

    /// Terminate the IFD chain and write the index map.
    ///
    /// `continuation` names the file that continues this one after rollover.
    pub fn finish_writing(&mut self, continuation: Option<&str>) -> Result<(), StorageError> {
        if self.index_written {
            return Ok(());
        }

        // The chain stays open until the map is on disk; a failure before
        // that leaves the file appendable.
        let mut index = self.index.clone();
        index.continuation = continuation.map(str::to_string);
        let block = index.encode(self.byte_order)?;
        let offset = self.position;
        self.ensure_fits(offset + block.len() as u64)?;
        self.write_at(offset, &block)?;
        self.patch_u32(slot_value_position(INDEX_MAP_SLOT), offset as u32)?;
        if let Some(field) = self.last_next_field {
            self.patch_u32(field, 0)?;
        }

        self.index = index;
        self.position += block.len() as u64;
        self.index_written = true;

        self.reader.set_continuation(self.index.continuation.clone());
        debug!(
            file = %self.filename,
            images = self.index.len(),
            continuation = ?continuation,
            "index map written"
        );
        Ok(())
    }

    /// Bytes available for an OME-XML trailer under the file size limit.
    pub fn trailer_capacity(&self) -> u64 {
        let used = self.position + self.pending_index_len(&[], 0) + CLOSING_ALLOWANCE;
        self.limits.max_file_size.saturating_sub(used)
    }

    /// Whether an OME-XML document of `len` bytes fits in the trailer.
    pub fn has_space_for_full_omexml(&self, len: usize) -> bool {
        // Document plus NUL terminator, padded
        padded_len(len as u64 + 1) <= self.trailer_capacity()
    }

    /// Write the trailer, display settings and comments, then sync.
    pub fn close(
        &mut self,
        trailer: &str,
        display: &DisplaySettings,
        comments: &Comments,
    ) -> Result<(), StorageError> {
        if self.closed {
            return Ok(());
        }
        self.finish_writing(None)?;

        if let Some(entry) = self.description_entry {
            let mut text = Vec::with_capacity(trailer.len() + 1);
            text.extend_from_slice(trailer.as_bytes());
            text.push(0);
            let offset = self.position;
            self.ensure_fits(offset + text.len() as u64)?;
            self.write_at(offset, &text)?;
            if text.len() % 2 == 1 {
                self.write_at(offset + text.len() as u64, &[0])?;
            }
            self.patch_u32(entry + 4, text.len() as u32)?;
            self.patch_u32(entry + 8, offset as u32)?;
            self.position += padded_len(text.len() as u64);
        }

        let display_json = serde_json::to_vec(display)?;
        let block = encode_block(
            self.byte_order,
            DISPLAY_SETTINGS_HEADER,
            &display_json,
            DISPLAY_SETTINGS_RESERVE,
        );
        self.append_block(&block, DISPLAY_SETTINGS_SLOT)?;

        let comments_json = serde_json::to_vec(comments)?;
        let block = encode_block(self.byte_order, COMMENTS_HEADER, &comments_json, 0);
        self.append_block(&block, COMMENTS_SLOT)?;

        self.file
            .sync_all()
            .map_err(|e| IoError::from_std(self.path.display(), e))?;
        self.closed = true;

        self.reader.set_display_settings(Some(display.clone()));
        self.reader.set_comments(Some(comments.clone()));
        debug!(file = %self.filename, size = self.position, "closed dataset file");
        Ok(())
    }

    fn append_block(&mut self, block: &[u8], slot: u64) -> Result<(), StorageError> {
        let offset = self.position;
        self.ensure_fits(offset + block.len() as u64)?;
        self.write_at(offset, block)?;
        self.patch_u32(slot_value_position(slot), offset as u32)?;
        self.position += block.len() as u64;
        Ok(())
    }

    fn ensure_fits(&self, end: u64) -> Result<(), StorageError> {
        if end > u32::MAX as u64 {
            return Err(StorageError::Configuration(format!(
                "{} would exceed the 4 GiB classic TIFF limit",
                self.filename
            )));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Raw I/O
    // -------------------------------------------------------------------------

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(data))
            .map_err(|e| IoError::from_std(self.path.display(), e).into())
    }

    fn patch_u32(&mut self, offset: u64, value: u32) -> Result<(), StorageError> {
        let bytes = self.byte_order.u32_bytes(value);
        self.write_at(offset, &bytes)
    }
}
