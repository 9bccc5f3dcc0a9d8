//! Index map recovery for files whose writer never finished.
//!
//! A file written up to a crash has a valid header and a chain of complete
//! IFD blocks, but its index map slot is still 0 (or points at garbage). The
//! default [`IfdChainScan`] walks the IFD chain from the first IFD, decoding
//! each plane's metadata record, and stops at the first block that is
//! incomplete or inconsistent.

use std::fmt;
use std::fs::OpenOptions as FsOpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::{IoError, StorageError};
use crate::format::layout::{
    padded_len, slot_value_position, DatasetHeader, IndexMap, COMMENTS_SLOT,
    DISPLAY_SETTINGS_SLOT, INDEX_MAP_SLOT,
};
use crate::format::tiff::{ByteOrder, Ifd, TiffTag, ValueReader};
use crate::io::{FileHandlePool, RangeReader, DEFAULT_OPEN_FILE_LIMIT};

use super::reader::read_record;

/// What to do when a file's index map is missing or inconsistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RepairPolicy {
    /// Fail to open the file
    Never,
    /// Rebuild the index for this session only
    #[default]
    InMemory,
    /// Rebuild the index and write it back to the file
    Rewrite,
}

/// Index rebuilt from the IFD chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveredIndex {
    /// Recovered entries in chain order
    pub map: IndexMap,
    /// End of the last complete block
    pub valid_end: u64,
    /// Next-IFD field of the last complete IFD
    pub last_next_field: Option<u64>,
}

/// Strategy used to rebuild an index map.
#[async_trait]
pub trait IndexRecovery: Send + Sync {
    /// Rebuild the index of the file behind `source`.
    async fn rebuild(
        &self,
        source: &dyn RangeReader,
        byte_order: ByteOrder,
        first_ifd_offset: u64,
    ) -> Result<RecoveredIndex, StorageError>;
}

/// Walks the IFD chain and reads each plane's metadata record.
///
/// Blank padding planes are skipped. The scan stops at the first IFD that
/// cannot be decoded, whose values extend past the end of the file, or whose
/// next pointer does not move forward.
#[derive(Debug, Clone, Copy, Default)]
pub struct IfdChainScan;

#[async_trait]
impl IndexRecovery for IfdChainScan {
    async fn rebuild(
        &self,
        source: &dyn RangeReader,
        byte_order: ByteOrder,
        first_ifd_offset: u64,
    ) -> Result<RecoveredIndex, StorageError> {
        let size = source.size();
        let values = ValueReader::new(source, byte_order);
        let mut recovered = RecoveredIndex {
            valid_end: first_ifd_offset.min(size),
            ..Default::default()
        };

        let mut offset = first_ifd_offset;
        let mut previous = 0u64;
        while offset != 0 && offset > previous {
            let ifd = match Ifd::read(source, offset, byte_order).await {
                Ok(ifd) => ifd,
                Err(e) => {
                    debug!(offset, error = %e, "IFD chain ends");
                    break;
                }
            };

            let Some(end) = block_end(&values, &ifd, offset).await else {
                break;
            };
            if end > size {
                debug!(offset, end, size, "block truncated");
                break;
            }

            let record = match read_record(&values, &ifd).await {
                Ok(record) => record,
                Err(e) => {
                    debug!(offset, error = %e, "unreadable image record");
                    break;
                }
            };
            if !record.blank {
                recovered.map.push(record.coords, offset as u32);
            }

            recovered.valid_end = end;
            recovered.last_next_field = Some(ifd.next_offset_position(offset));
            previous = offset;
            offset = ifd.next_ifd_offset;
        }

        Ok(recovered)
    }
}

/// End of the block made of the IFD at `offset` and its values.
///
/// ImageDescription is ignored: in a closed file it points at the trailer.
async fn block_end(values: &ValueReader<'_>, ifd: &Ifd, offset: u64) -> Option<u64> {
    let bo = values.byte_order();
    let mut end = offset + Ifd::calculate_size(ifd.entries.len()) as u64;

    for entry in &ifd.entries {
        if entry.is_inline || entry.tag_id == TiffTag::ImageDescription.as_u16() {
            continue;
        }
        let len = entry.value_byte_size()?;
        end = end.max(entry.value_offset(bo) + padded_len(len));
    }

    let strip_offset = values.read_u32(ifd.get(TiffTag::StripOffsets)?).await.ok()?;
    let strip_len = values.read_u32(ifd.get(TiffTag::StripByteCounts)?).await.ok()?;
    Some(end.max(strip_offset as u64 + padded_len(strip_len as u64)))
}

/// Write a recovered index map back to the file at `path`.
///
/// Terminates the IFD chain, drops everything after the last complete block,
/// appends the index map and repoints the header. Trailing blocks that were
/// cut off are unlinked from the header.
pub fn persist_index(
    path: &Path,
    header: &DatasetHeader,
    recovered: &RecoveredIndex,
) -> Result<(), StorageError> {
    let io = |e: std::io::Error| IoError::from_std(path.display(), e);
    let bo = header.byte_order;
    let mut file = FsOpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(io)?;

    let patch = |file: &mut std::fs::File, at: u64, value: u32| {
        file.seek(SeekFrom::Start(at))
            .and_then(|_| file.write_all(&bo.u32_bytes(value)))
    };

    if let Some(field) = recovered.last_next_field {
        patch(&mut file, field, 0).map_err(io)?;
    }

    let start = padded_len(recovered.valid_end);
    file.set_len(start).map_err(io)?;

    let block = recovered.map.encode(bo)?;
    file.seek(SeekFrom::Start(start))
        .and_then(|_| file.write_all(&block))
        .map_err(io)?;
    patch(&mut file, slot_value_position(INDEX_MAP_SLOT), start as u32).map_err(io)?;

    if header.display_settings_offset >= start {
        patch(&mut file, slot_value_position(DISPLAY_SETTINGS_SLOT), 0).map_err(io)?;
    }
    if header.comments_offset >= start {
        patch(&mut file, slot_value_position(COMMENTS_SLOT), 0).map_err(io)?;
    }

    file.sync_all().map_err(io)?;
    debug!(file = %path.display(), entries = recovered.map.len(), "index map persisted");
    Ok(())
}

/// Asks whether a rebuilt index may be written back to the given file.
pub type ConfirmRepair = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// Options for opening existing dataset files.
#[derive(Clone)]
pub struct OpenOptions {
    /// Repair policy for unusable index maps
    pub repair: RepairPolicy,
    /// Strategy used to rebuild an index map
    pub recovery: Arc<dyn IndexRecovery>,
    /// Confirmation asked before a rebuilt index is written back; `None`
    /// means always allowed
    pub confirm: Option<ConfirmRepair>,
    /// Open read handles shared by all files of the dataset
    pub open_file_limit: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            repair: RepairPolicy::default(),
            recovery: Arc::new(IfdChainScan),
            confirm: None,
            open_file_limit: DEFAULT_OPEN_FILE_LIMIT,
        }
    }
}

impl fmt::Debug for OpenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenOptions")
            .field("repair", &self.repair)
            .field("confirm", &self.confirm.is_some())
            .field("open_file_limit", &self.open_file_limit)
            .finish_non_exhaustive()
    }
}

impl OpenOptions {
    /// Set the repair policy.
    pub fn with_repair(mut self, repair: RepairPolicy) -> Self {
        self.repair = repair;
        self
    }

    /// Use a custom recovery strategy.
    pub fn with_recovery(mut self, recovery: Arc<dyn IndexRecovery>) -> Self {
        self.recovery = recovery;
        self
    }

    /// Ask `confirm` before persisting a rebuilt index.
    pub fn with_confirmation(mut self, confirm: impl Fn(&Path) -> bool + Send + Sync + 'static) -> Self {
        self.confirm = Some(Arc::new(confirm));
        self
    }

    /// Set the open handle limit.
    pub fn with_open_file_limit(mut self, limit: usize) -> Self {
        self.open_file_limit = limit;
        self
    }

    pub(crate) fn handle_pool(&self) -> FileHandlePool {
        FileHandlePool::new(self.open_file_limit)
    }
}

/// Outcome of repairing one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub path: PathBuf,
    pub recovered_images: usize,
    /// Whether the rebuilt index was written back
    pub rewritten: bool,
    /// Why the stored index could not be used
    pub reason: String,
}
