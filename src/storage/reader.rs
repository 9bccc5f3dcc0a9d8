//! Random-access reader for one physical dataset file.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::data::{Comments, Coordinate, DisplaySettings, Image, ImageRecord, PixelType, SummaryMetadata};
use crate::error::{IoError, StorageError, TiffError};
use crate::format::layout::{
    encode_block, padded_len, read_block, trim_nul, DatasetHeader, IndexMap,
    COMMENTS_HEADER, DISPLAY_SETTINGS_HEADER, DISPLAY_SETTINGS_OFFSET_HEADER,
    DISPLAY_SETTINGS_SLOT, FILE_HEADER_SIZE, INDEX_MAP_HEADER, BLOCK_HEADER_SIZE,
};
use crate::format::tiff::{ByteOrder, Compression, Ifd, TiffTag, ValueReader, SAMPLE_FORMAT_UINT};
use crate::io::{FileHandlePool, FileRangeReader, RangeReader};

use super::recovery::{persist_index, OpenOptions, RepairPolicy, RepairReport};
use super::writer::DISPLAY_SETTINGS_RESERVE;
use super::{read_lock, write_lock};

/// Reads images from one dataset file by coordinate.
///
/// The index is shared with the file's writer while the file is being
/// written, so images become readable as soon as their block is on disk.
pub struct TiffPageReader {
    path: PathBuf,
    filename: String,
    source: Arc<dyn RangeReader>,
    byte_order: ByteOrder,
    first_ifd_offset: u64,
    summary: SummaryMetadata,
    index: RwLock<HashMap<Coordinate, u64>>,
    display_settings: RwLock<Option<DisplaySettings>>,
    comments: RwLock<Option<Comments>>,
    continuation: RwLock<Option<String>>,
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl TiffPageReader {
    /// Reader for a file that is still being written.
    pub(crate) fn for_writer(
        path: PathBuf,
        pool: FileHandlePool,
        byte_order: ByteOrder,
        first_ifd_offset: u64,
        summary: SummaryMetadata,
    ) -> Self {
        let source: Arc<dyn RangeReader> = Arc::new(FileRangeReader::new(path.clone(), pool));
        Self {
            filename: file_name_of(&path),
            path,
            source,
            byte_order,
            first_ifd_offset,
            summary,
            index: RwLock::new(HashMap::new()),
            display_settings: RwLock::new(None),
            comments: RwLock::new(None),
            continuation: RwLock::new(None),
        }
    }

    /// Open a file on disk.
    ///
    /// A missing or inconsistent index map is repaired according to
    /// `options.repair`; the returned report describes any repair.
    pub async fn open(
        path: impl Into<PathBuf>,
        pool: FileHandlePool,
        options: &OpenOptions,
    ) -> Result<(Self, Option<RepairReport>), StorageError> {
        let path = path.into();
        let source: Arc<dyn RangeReader> = Arc::new(FileRangeReader::new(path.clone(), pool));
        Self::open_source(path, source, options).await
    }

    /// Open a dataset file through an arbitrary range reader.
    ///
    /// `path` is used for naming and, with [`RepairPolicy::Rewrite`], for
    /// persisting a rebuilt index map.
    pub async fn open_source(
        path: PathBuf,
        source: Arc<dyn RangeReader>,
        options: &OpenOptions,
    ) -> Result<(Self, Option<RepairReport>), StorageError> {
        let size = source.size();
        if size < FILE_HEADER_SIZE as u64 {
            return Err(TiffError::FileTooSmall {
                required: FILE_HEADER_SIZE as u64,
                actual: size,
            }
            .into());
        }

        let head = source.read_exact_at(0, FILE_HEADER_SIZE).await?;
        let header = DatasetHeader::parse(&head, size)?;
        let bo = header.byte_order;

        let summary_bytes = source
            .read_exact_at(FILE_HEADER_SIZE as u64, header.summary_len as usize)
            .await?;
        let summary: SummaryMetadata = serde_json::from_slice(&summary_bytes).map_err(|e| {
            StorageError::SchemaInconsistency(format!("{}: summary metadata: {e}", path.display()))
        })?;

        let mut report = None;
        let map = match load_index(source.as_ref(), &header).await {
            Ok(map) => map,
            Err(reason) => {
                let (map, repair) = repair(&path, source.as_ref(), &header, options, reason).await?;
                report = Some(repair);
                map
            }
        };

        let display_settings = if header.display_settings_offset != 0 {
            load_json_block::<DisplaySettings>(source.as_ref(), header.display_settings_offset, DISPLAY_SETTINGS_HEADER, bo)
                .await
                .map_err(|e| warn!(file = %path.display(), error = %e, "unreadable display settings"))
                .ok()
        } else {
            None
        };
        let comments = if header.comments_offset != 0 {
            load_json_block::<Comments>(source.as_ref(), header.comments_offset, COMMENTS_HEADER, bo)
                .await
                .map_err(|e| warn!(file = %path.display(), error = %e, "unreadable comments"))
                .ok()
        } else {
            None
        };

        debug!(file = %path.display(), images = map.len(), "opened dataset file");

        let IndexMap {
            entries,
            continuation,
        } = map;
        let index = entries
            .into_iter()
            .map(|(coords, offset)| (coords, offset as u64))
            .collect();

        let reader = Self {
            filename: file_name_of(&path),
            path,
            source,
            byte_order: bo,
            first_ifd_offset: header.first_ifd_offset,
            summary,
            index: RwLock::new(index),
            display_settings: RwLock::new(display_settings),
            comments: RwLock::new(comments),
            continuation: RwLock::new(continuation),
        };
        Ok((reader, report))
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Full path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name (without directory).
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Byte order of the file.
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// Summary metadata stored in the header.
    pub fn summary_metadata(&self) -> &SummaryMetadata {
        &self.summary
    }

    /// Display settings block, if written.
    pub fn display_settings(&self) -> Option<DisplaySettings> {
        read_lock(&self.display_settings).clone()
    }

    /// Comments block, if written.
    pub fn comments(&self) -> Option<Comments> {
        read_lock(&self.comments).clone()
    }

    /// File continuing this one after rollover.
    pub fn continuation(&self) -> Option<String> {
        read_lock(&self.continuation).clone()
    }

    /// Whether `coords` is indexed in this file.
    pub fn contains(&self, coords: &Coordinate) -> bool {
        read_lock(&self.index).contains_key(coords)
    }

    /// Indexed coordinates, sorted.
    pub fn index_keys(&self) -> Vec<Coordinate> {
        let mut keys: Vec<Coordinate> = read_lock(&self.index).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of indexed images.
    pub fn len(&self) -> usize {
        read_lock(&self.index).len()
    }

    /// Whether no image is indexed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn insert_index(&self, coords: Coordinate, offset: u64) {
        write_lock(&self.index).insert(coords, offset);
    }

    pub(crate) fn set_continuation(&self, continuation: Option<String>) {
        *write_lock(&self.continuation) = continuation;
    }

    pub(crate) fn set_display_settings(&self, settings: Option<DisplaySettings>) {
        *write_lock(&self.display_settings) = settings;
    }

    pub(crate) fn set_comments(&self, comments: Option<Comments>) {
        *write_lock(&self.comments) = comments;
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Read the image stored for `coords`. `Ok(None)` if it is not indexed.
    pub async fn read_image(&self, coords: &Coordinate) -> Result<Option<Image>, StorageError> {
        let offset = read_lock(&self.index).get(coords).copied();
        let Some(offset) = offset else {
            return Ok(None);
        };
        let image = read_plane(self.source.as_ref(), self.byte_order, offset).await?;
        Ok(Some(image))
    }

    /// The document stored in the first IFD's ImageDescription, if written.
    pub async fn ome_document(&self) -> Result<Option<String>, StorageError> {
        if self.first_ifd_offset >= self.source.size() {
            return Ok(None);
        }
        let ifd = Ifd::read(self.source.as_ref(), self.first_ifd_offset, self.byte_order).await?;
        let Some(entry) = ifd.get(TiffTag::ImageDescription) else {
            return Ok(None);
        };
        if entry.count == 0 {
            return Ok(None);
        }
        let text = ValueReader::new(self.source.as_ref(), self.byte_order)
            .read_string(entry)
            .await?;
        Ok(Some(text))
    }

    /// Replace the display settings block on disk.
    ///
    /// Rewritten in place when the new settings fit the reserved region,
    /// otherwise appended with the header slot repointed.
    pub async fn rewrite_display_settings(
        &self,
        settings: &DisplaySettings,
    ) -> Result<(), StorageError> {
        let payload = serde_json::to_vec(settings)?;
        let path = self.path.clone();
        let bo = self.byte_order;

        let in_place = tokio::task::spawn_blocking(move || rewrite_display_block(&path, bo, &payload))
            .await
            .map_err(|e| IoError::Io {
                path: self.path.display().to_string(),
                message: format!("rewrite task failed: {e}"),
            })??;

        debug!(file = %self.filename, in_place, "display settings rewritten");
        self.set_display_settings(Some(settings.clone()));
        Ok(())
    }
}

// =============================================================================
// Plane decoding
// =============================================================================

/// Decode the per-image metadata record of an IFD.
pub(crate) async fn read_record(
    values: &ValueReader<'_>,
    ifd: &Ifd,
) -> Result<ImageRecord, StorageError> {
    let text = values.read_string(ifd.require(TiffTag::ImageMetadata)?).await?;
    Ok(serde_json::from_str(&text)?)
}

/// Decode the plane whose IFD is at `offset`.
pub(crate) async fn read_plane(
    source: &dyn RangeReader,
    byte_order: ByteOrder,
    offset: u64,
) -> Result<Image, StorageError> {
    let ifd = Ifd::read(source, offset, byte_order).await?;
    let values = ValueReader::new(source, byte_order);

    let width = values.read_u32(ifd.require(TiffTag::ImageWidth)?).await?;
    let height = values.read_u32(ifd.require(TiffTag::ImageLength)?).await?;

    if let Some(entry) = ifd.get(TiffTag::Compression) {
        let raw = values.read_u32(entry).await? as u16;
        let supported = Compression::from_u16(raw).map(Compression::is_supported);
        if supported != Some(true) {
            let name = Compression::from_u16(raw)
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| raw.to_string());
            return Err(TiffError::UnsupportedCompression(name).into());
        }
    }

    let bits = values
        .read_u16_array(ifd.require(TiffTag::BitsPerSample)?)
        .await?
        .first()
        .copied()
        .unwrap_or(8);
    let samples = match ifd.get(TiffTag::SamplesPerPixel) {
        Some(entry) => values.read_u32(entry).await? as u16,
        None => 1,
    };
    let sample_format = match ifd.get(TiffTag::SampleFormat) {
        Some(entry) => values
            .read_u16_array(entry)
            .await?
            .first()
            .copied()
            .unwrap_or(SAMPLE_FORMAT_UINT),
        None => SAMPLE_FORMAT_UINT,
    };
    let pixel_type = PixelType::from_tiff(bits, samples, sample_format)?;

    let strip_offset = values.read_u32(ifd.require(TiffTag::StripOffsets)?).await?;
    let strip_len = values.read_u32(ifd.require(TiffTag::StripByteCounts)?).await?;
    let pixels = source
        .read_exact_at(strip_offset as u64, strip_len as usize)
        .await?;

    let record = read_record(&values, &ifd).await?;
    Image::new(record.coords, width, height, pixel_type, pixels, record.tags)
}

// =============================================================================
// Index loading and repair
// =============================================================================

async fn load_index(source: &dyn RangeReader, header: &DatasetHeader) -> Result<IndexMap, String> {
    let payload = read_block(
        source,
        header.index_map_offset,
        INDEX_MAP_HEADER,
        header.byte_order,
    )
    .await?;
    let map = IndexMap::decode(&payload, header.byte_order)?;

    let size = source.size();
    for (coords, offset) in &map.entries {
        let offset = *offset as u64;
        if offset < header.first_ifd_offset || offset >= size {
            return Err(format!(
                "entry {coords} points at {offset}, outside the image area"
            ));
        }
    }
    Ok(map)
}

async fn repair(
    path: &Path,
    source: &dyn RangeReader,
    header: &DatasetHeader,
    options: &OpenOptions,
    reason: String,
) -> Result<(IndexMap, RepairReport), StorageError> {
    if options.repair == RepairPolicy::Never {
        return Err(StorageError::MetadataCorruption {
            path: path.display().to_string(),
            reason,
        });
    }

    warn!(file = %path.display(), %reason, "index map unusable, rebuilding");
    let recovered = options
        .recovery
        .rebuild(source, header.byte_order, header.first_ifd_offset)
        .await?;

    let mut rewritten = false;
    if options.repair == RepairPolicy::Rewrite {
        let confirmed = options.confirm.as_ref().map(|f| f(path)).unwrap_or(true);
        if confirmed {
            let path = path.to_path_buf();
            let header = *header;
            let persisted = recovered.clone();
            tokio::task::spawn_blocking(move || persist_index(&path, &header, &persisted))
                .await
                .map_err(|e| IoError::Io {
                    path: source.identifier().to_string(),
                    message: format!("repair task failed: {e}"),
                })??;
            rewritten = true;
        } else {
            info!(file = %path.display(), "repair not confirmed, index kept in memory only");
        }
    }

    let report = RepairReport {
        path: path.to_path_buf(),
        recovered_images: recovered.map.len(),
        rewritten,
        reason,
    };
    info!(
        file = %path.display(),
        images = report.recovered_images,
        rewritten,
        "index map rebuilt"
    );
    Ok((recovered.map, report))
}

async fn load_json_block<T: serde::de::DeserializeOwned>(
    source: &dyn RangeReader,
    offset: u64,
    magic: u32,
    byte_order: ByteOrder,
) -> Result<T, String> {
    let payload = read_block(source, offset, magic, byte_order).await?;
    serde_json::from_slice(trim_nul(&payload)).map_err(|e| e.to_string())
}

/// Rewrite the display settings block of the file at `path`.
///
/// Returns whether the block was updated in place.
fn rewrite_display_block(path: &Path, bo: ByteOrder, payload: &[u8]) -> Result<bool, StorageError> {
    let io = |e: std::io::Error| IoError::from_std(path.display(), e);
    let mut file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(io)?;

    let mut slot = [0u8; 8];
    file.seek(SeekFrom::Start(DISPLAY_SETTINGS_SLOT))
        .and_then(|_| file.read_exact(&mut slot))
        .map_err(io)?;
    let offset = if bo.read_u32(&slot[0..4]) == DISPLAY_SETTINGS_OFFSET_HEADER {
        bo.read_u32(&slot[4..8]) as u64
    } else {
        0
    };

    if offset != 0 {
        let mut block_header = [0u8; BLOCK_HEADER_SIZE];
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(&mut block_header))
            .map_err(io)?;
        let capacity = bo.read_u32(&block_header[4..8]) as usize;
        if bo.read_u32(&block_header[0..4]) == DISPLAY_SETTINGS_HEADER && payload.len() <= capacity {
            let mut region = payload.to_vec();
            region.resize(capacity, 0);
            file.seek(SeekFrom::Start(offset + BLOCK_HEADER_SIZE as u64))
                .and_then(|_| file.write_all(&region))
                .and_then(|_| file.sync_all())
                .map_err(io)?;
            return Ok(true);
        }
    }

    let mut end = file.seek(SeekFrom::End(0)).map_err(io)?;
    let block = encode_block(bo, DISPLAY_SETTINGS_HEADER, payload, DISPLAY_SETTINGS_RESERVE);
    let start = padded_len(end);
    if start + block.len() as u64 > u32::MAX as u64 {
        return Err(StorageError::Configuration(format!(
            "{}: no room for new display settings",
            path.display()
        )));
    }
    if start != end {
        file.write_all(&[0]).map_err(io)?;
        end = start;
    }

    let mut slot = Vec::with_capacity(8);
    bo.write_u32(&mut slot, DISPLAY_SETTINGS_OFFSET_HEADER);
    bo.write_u32(&mut slot, end as u32);
    file.write_all(&block)
        .and_then(|_| file.seek(SeekFrom::Start(DISPLAY_SETTINGS_SLOT)))
        .and_then(|_| file.write_all(&slot))
        .and_then(|_| file.sync_all())
        .map_err(io)?;
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ChannelDisplay, ImageTags};
    use crate::storage::writer::{TiffPageWriter, WriterLimits};

    fn write_file(dir: &Path, images: u32) -> (PathBuf, TiffPageWriter) {
        let summary = SummaryMetadata {
            prefix: "demo".into(),
            ..Default::default()
        };
        let mut writer = TiffPageWriter::create(
            dir,
            "demo.ome.tif",
            &summary,
            WriterLimits {
                max_file_size: u32::MAX as u64,
                metadata_reserve: 0,
            },
            ByteOrder::LittleEndian,
            FileHandlePool::new(4),
        )
        .unwrap();
        for c in 0..images {
            let image = Image::new(
                Coordinate::builder().channel(c).build(),
                2,
                2,
                PixelType::Gray16,
                vec![c as u8; 8],
                ImageTags {
                    exposure_ms: Some(c as f64),
                    ..Default::default()
                },
            )
            .unwrap();
            writer.write_image(&image).unwrap();
        }
        (writer.path().to_path_buf(), writer)
    }

    fn strict() -> OpenOptions {
        OpenOptions::default().with_repair(RepairPolicy::Never)
    }

    #[tokio::test]
    async fn test_open_finished_file() {
        let dir = tempfile::tempdir().unwrap();
        let (path, mut writer) = write_file(dir.path(), 3);
        let display = DisplaySettings::default();
        writer.close("<OME/>", &display, &Comments::default()).unwrap();

        let (reader, report) = TiffPageReader::open(&path, FileHandlePool::new(2), &strict())
            .await
            .unwrap();
        assert!(report.is_none());
        assert_eq!(reader.len(), 3);
        assert_eq!(reader.summary_metadata().prefix, "demo");
        assert_eq!(reader.display_settings(), Some(display));
        assert_eq!(reader.filename(), "demo.ome.tif");

        let coords = Coordinate::builder().channel(2).build();
        let image = reader.read_image(&coords).await.unwrap().unwrap();
        assert_eq!(image.pixel_type(), PixelType::Gray16);
        assert_eq!(image.tags().exposure_ms, Some(2.0));
        assert_eq!(image.coords(), &coords);

        let missing = Coordinate::builder().channel(9).build();
        assert!(reader.read_image(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_index_with_never_policy() {
        let dir = tempfile::tempdir().unwrap();
        let (path, writer) = write_file(dir.path(), 2);
        drop(writer);

        let result = TiffPageReader::open(&path, FileHandlePool::new(2), &strict()).await;
        assert!(matches!(result, Err(StorageError::MetadataCorruption { .. })));
    }

    #[tokio::test]
    async fn test_missing_index_rebuilt_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let (path, writer) = write_file(dir.path(), 2);
        drop(writer);
        let size_before = fs::metadata(&path).unwrap().len();

        let (reader, report) = TiffPageReader::open(&path, FileHandlePool::new(2), &OpenOptions::default())
            .await
            .unwrap();
        let report = report.unwrap();
        assert_eq!(report.recovered_images, 2);
        assert!(!report.rewritten);
        assert_eq!(reader.len(), 2);
        assert_eq!(fs::metadata(&path).unwrap().len(), size_before);
    }

    #[tokio::test]
    async fn test_rewrite_display_settings_in_place_and_appended() {
        let dir = tempfile::tempdir().unwrap();
        let (path, mut writer) = write_file(dir.path(), 1);
        writer
            .close("<OME/>", &DisplaySettings::default(), &Comments::default())
            .unwrap();
        let (reader, _) = TiffPageReader::open(&path, FileHandlePool::new(2), &strict())
            .await
            .unwrap();

        let small = DisplaySettings {
            channels: vec![ChannelDisplay {
                name: "GFP".into(),
                color: 0x00FF00,
                min: 10,
                max: 500,
            }],
        };
        let size = fs::metadata(&path).unwrap().len();
        reader.rewrite_display_settings(&small).await.unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), size);

        let huge = DisplaySettings {
            channels: (0..400)
                .map(|i| ChannelDisplay {
                    name: format!("channel with a long descriptive name {i}"),
                    color: i,
                    min: 0,
                    max: 65535,
                })
                .collect(),
        };
        reader.rewrite_display_settings(&huge).await.unwrap();
        assert!(fs::metadata(&path).unwrap().len() > size);

        let (reopened, _) = TiffPageReader::open(&path, FileHandlePool::new(2), &strict())
            .await
            .unwrap();
        assert_eq!(reopened.display_settings(), Some(huge));
    }
}
