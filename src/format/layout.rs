//! Dataset file layout on top of classic TIFF.
//!
//! Every physical file starts with a fixed 40-byte header:
//!
//! ```text
//! 0   TIFF header (byte order, 42, first IFD offset)
//! 8   INDEX_MAP_OFFSET_HEADER       index map offset
//! 16  DISPLAY_SETTINGS_OFFSET_HEADER display settings offset
//! 24  COMMENTS_OFFSET_HEADER        comments offset
//! 32  SUMMARY_HEADER                summary JSON length
//! 40  summary JSON, padded to even length
//! ```
//!
//! Offsets of 0 mean "not written yet". Trailing blocks share one framing:
//! a u32 magic, a u32 payload length, then the payload.
//!
//! # Index map payload
//!
//! ```text
//! u32 entry count
//! u16 axis count, then per axis: u16 name length + UTF-8 name
//! per entry: u32 presence mask, u32 per axis, u32 IFD offset
//! u16 continuation name length + UTF-8 name of the next file (may be empty)
//! ```

use std::collections::BTreeSet;

use bytes::Bytes;

use crate::data::Coordinate;
use crate::error::{StorageError, TiffError};
use crate::format::tiff::{ByteOrder, TiffHeader, TIFF_HEADER_SIZE};
use crate::io::RangeReader;

// =============================================================================
// Constants
// =============================================================================

/// Size of the fixed dataset header.
pub const FILE_HEADER_SIZE: usize = 40;

/// Marks the index map offset slot ("IXOF").
pub const INDEX_MAP_OFFSET_HEADER: u32 = 0x4958_4F46;
/// Marks the display settings offset slot ("DSOF").
pub const DISPLAY_SETTINGS_OFFSET_HEADER: u32 = 0x4453_4F46;
/// Marks the comments offset slot ("CMOF").
pub const COMMENTS_OFFSET_HEADER: u32 = 0x434D_4F46;
/// Marks the summary slot ("SUMM").
pub const SUMMARY_HEADER: u32 = 0x5355_4D4D;

/// Index map block magic ("IXMP").
pub const INDEX_MAP_HEADER: u32 = 0x4958_4D50;
/// Display settings block magic ("DSET").
pub const DISPLAY_SETTINGS_HEADER: u32 = 0x4453_4554;
/// Comments block magic ("CMNT").
pub const COMMENTS_HEADER: u32 = 0x434D_4E54;

/// Position of the index map slot.
pub const INDEX_MAP_SLOT: u64 = 8;
/// Position of the display settings slot.
pub const DISPLAY_SETTINGS_SLOT: u64 = 16;
/// Position of the comments slot.
pub const COMMENTS_SLOT: u64 = 24;
/// Position of the summary slot.
pub const SUMMARY_SLOT: u64 = 32;

/// Size of the magic + length framing of a trailing block.
pub const BLOCK_HEADER_SIZE: usize = 8;

/// Most distinct axes an index map can describe (one presence bit per axis).
pub const MAX_INDEX_AXES: usize = 32;

/// Round a length up to an even number of bytes.
#[inline]
pub fn padded_len(len: u64) -> u64 {
    len + len % 2
}

/// Position of the u32 offset inside a header slot.
#[inline]
pub const fn slot_value_position(slot: u64) -> u64 {
    slot + 4
}

// =============================================================================
// DatasetHeader
// =============================================================================

/// The decoded 40-byte dataset header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetHeader {
    pub byte_order: ByteOrder,
    pub first_ifd_offset: u64,
    pub index_map_offset: u64,
    pub display_settings_offset: u64,
    pub comments_offset: u64,
    pub summary_len: u32,
}

impl DatasetHeader {
    /// Header for a new file whose summary JSON is `summary_len` bytes.
    ///
    /// The first IFD starts right after the padded summary.
    pub fn new(byte_order: ByteOrder, summary_len: u32) -> Self {
        Self {
            byte_order,
            first_ifd_offset: FILE_HEADER_SIZE as u64 + padded_len(summary_len as u64),
            index_map_offset: 0,
            display_settings_offset: 0,
            comments_offset: 0,
            summary_len,
        }
    }

    /// Encode into the 40-byte on-disk form.
    pub fn encode(&self) -> Vec<u8> {
        let bo = self.byte_order;
        let mut buf = Vec::with_capacity(FILE_HEADER_SIZE);
        buf.extend_from_slice(
            &TiffHeader {
                byte_order: bo,
                first_ifd_offset: self.first_ifd_offset,
            }
            .encode(),
        );
        for (magic, value) in [
            (INDEX_MAP_OFFSET_HEADER, self.index_map_offset as u32),
            (DISPLAY_SETTINGS_OFFSET_HEADER, self.display_settings_offset as u32),
            (COMMENTS_OFFSET_HEADER, self.comments_offset as u32),
            (SUMMARY_HEADER, self.summary_len),
        ] {
            bo.write_u32(&mut buf, magic);
            bo.write_u32(&mut buf, value);
        }
        buf
    }

    /// Parse the dataset header.
    ///
    /// A slot whose magic is wrong reads as offset 0. A missing summary magic
    /// means the file was not written by this crate.
    pub fn parse(bytes: &[u8], file_size: u64) -> Result<Self, TiffError> {
        // A dataset with no images has its first IFD offset at end of file
        let tiff = TiffHeader::parse(bytes, file_size.saturating_add(1))?;
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(TiffError::FileTooSmall {
                required: FILE_HEADER_SIZE as u64,
                actual: bytes.len() as u64,
            });
        }

        let bo = tiff.byte_order;
        let slot = |pos: u64, magic: u32| -> Option<u32> {
            let pos = pos as usize;
            (bo.read_u32(&bytes[pos..pos + 4]) == magic).then(|| bo.read_u32(&bytes[pos + 4..pos + 8]))
        };

        let summary_len = slot(SUMMARY_SLOT, SUMMARY_HEADER)
            .ok_or_else(|| TiffError::NotADataset("missing summary header".to_string()))?;

        Ok(Self {
            byte_order: bo,
            first_ifd_offset: tiff.first_ifd_offset,
            index_map_offset: slot(INDEX_MAP_SLOT, INDEX_MAP_OFFSET_HEADER).unwrap_or(0) as u64,
            display_settings_offset: slot(DISPLAY_SETTINGS_SLOT, DISPLAY_SETTINGS_OFFSET_HEADER)
                .unwrap_or(0) as u64,
            comments_offset: slot(COMMENTS_SLOT, COMMENTS_OFFSET_HEADER).unwrap_or(0) as u64,
            summary_len,
        })
    }
}

// =============================================================================
// Block framing
// =============================================================================

/// Frame `payload` as a block, padding the payload to at least `capacity`
/// bytes with NULs so it can later be rewritten in place.
pub fn encode_block(byte_order: ByteOrder, magic: u32, payload: &[u8], capacity: usize) -> Vec<u8> {
    let len = padded_len(payload.len().max(capacity) as u64) as usize;
    let mut buf = Vec::with_capacity(BLOCK_HEADER_SIZE + len);
    byte_order.write_u32(&mut buf, magic);
    byte_order.write_u32(&mut buf, len as u32);
    buf.extend_from_slice(payload);
    buf.resize(BLOCK_HEADER_SIZE + len, 0);
    buf
}

/// Read the payload of the block at `offset`, checking its magic.
///
/// Returns the payload length declared in the block header alongside the
/// payload bytes.
pub async fn read_block(
    reader: &dyn RangeReader,
    offset: u64,
    magic: u32,
    byte_order: ByteOrder,
) -> Result<Bytes, String> {
    if offset == 0 {
        return Err("block was never written".to_string());
    }
    let size = reader.size();
    if offset + BLOCK_HEADER_SIZE as u64 > size {
        return Err(format!("block offset {offset} beyond end of file ({size} bytes)"));
    }

    let header = reader
        .read_exact_at(offset, BLOCK_HEADER_SIZE)
        .await
        .map_err(|e| e.to_string())?;
    let found = byte_order.read_u32(&header[0..4]);
    if found != magic {
        return Err(format!(
            "bad block magic at {offset}: expected 0x{magic:08X}, found 0x{found:08X}"
        ));
    }

    let len = byte_order.read_u32(&header[4..8]) as u64;
    let start = offset + BLOCK_HEADER_SIZE as u64;
    if start + len > size {
        return Err(format!("block at {offset} is truncated"));
    }
    reader
        .read_exact_at(start, len as usize)
        .await
        .map_err(|e| e.to_string())
}

/// Strip trailing NUL padding from a block payload.
pub fn trim_nul(payload: &[u8]) -> &[u8] {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    &payload[..end]
}

// =============================================================================
// IndexMap
// =============================================================================

/// Coordinate → IFD offset table of one physical file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexMap {
    /// Entries in write order
    pub entries: Vec<(Coordinate, u32)>,
    /// File name of the file that continues this one after rollover
    pub continuation: Option<String>,
}

impl IndexMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    pub fn push(&mut self, coords: Coordinate, offset: u32) {
        self.entries.push((coords, offset));
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorted union of the axes used by all entries.
    pub fn axes(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self
            .entries
            .iter()
            .flat_map(|(c, _)| c.axes())
            .collect();
        set.into_iter().map(str::to_string).collect()
    }

    /// Encoded block length for `entries` entries over `axes`.
    pub fn encoded_len_for<S: AsRef<str>>(entries: usize, axes: &[S], continuation: usize) -> u64 {
        let axis_table: u64 = axes.iter().map(|a| 2 + a.as_ref().len() as u64).sum();
        let entry_len = 4 + 4 * axes.len() as u64 + 4;
        let payload = 4 + 2 + axis_table + entries as u64 * entry_len + 2 + continuation as u64;
        BLOCK_HEADER_SIZE as u64 + padded_len(payload)
    }

    /// Encoded block length of this map.
    pub fn encoded_len(&self) -> u64 {
        let continuation = self.continuation.as_ref().map(String::len).unwrap_or(0);
        Self::encoded_len_for(self.entries.len(), &self.axes(), continuation)
    }

    /// Encode as a framed block.
    pub fn encode(&self, byte_order: ByteOrder) -> Result<Vec<u8>, StorageError> {
        let axes = self.axes();
        if axes.len() > MAX_INDEX_AXES {
            return Err(StorageError::InvalidCoordinate(format!(
                "{} distinct axes in one file, at most {MAX_INDEX_AXES} are supported",
                axes.len()
            )));
        }

        if let Some(axis) = axes.iter().find(|a| a.len() > u16::MAX as usize) {
            return Err(StorageError::InvalidCoordinate(format!(
                "axis name of {} bytes exceeds {} bytes",
                axis.len(),
                u16::MAX
            )));
        }
        let continuation = self.continuation.as_deref().unwrap_or("");
        if continuation.len() > u16::MAX as usize {
            return Err(StorageError::Configuration(format!(
                "continuation file name of {} bytes is too long",
                continuation.len()
            )));
        }

        let bo = byte_order;
        let mut payload = Vec::new();
        bo.write_u32(&mut payload, self.entries.len() as u32);
        bo.write_u16(&mut payload, axes.len() as u16);
        for axis in &axes {
            bo.write_u16(&mut payload, axis.len() as u16);
            payload.extend_from_slice(axis.as_bytes());
        }
        for (coords, offset) in &self.entries {
            let mut mask = 0u32;
            let mut values = Vec::with_capacity(axes.len());
            for (bit, axis) in axes.iter().enumerate() {
                match coords.get(axis) {
                    Some(v) => {
                        mask |= 1 << bit;
                        values.push(v);
                    }
                    None => values.push(0),
                }
            }
            bo.write_u32(&mut payload, mask);
            for v in values {
                bo.write_u32(&mut payload, v);
            }
            bo.write_u32(&mut payload, *offset);
        }
        bo.write_u16(&mut payload, continuation.len() as u16);
        payload.extend_from_slice(continuation.as_bytes());

        Ok(encode_block(bo, INDEX_MAP_HEADER, &payload, 0))
    }

    /// Decode an index map payload (without the block framing).
    pub fn decode(payload: &[u8], byte_order: ByteOrder) -> Result<Self, String> {
        let mut cursor = Cursor {
            bytes: payload,
            pos: 0,
            byte_order,
        };

        let count = cursor.u32()? as usize;
        let axis_count = cursor.u16()? as usize;
        if axis_count > MAX_INDEX_AXES {
            return Err(format!("{axis_count} axes exceeds the maximum of {MAX_INDEX_AXES}"));
        }
        let mut axes = Vec::with_capacity(axis_count);
        for _ in 0..axis_count {
            axes.push(cursor.string()?);
        }

        let entry_len = 8 + 4 * axis_count;
        if count.saturating_mul(entry_len) > payload.len() {
            return Err(format!("entry count {count} does not fit in the block"));
        }

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let mask = cursor.u32()?;
            let mut builder = Coordinate::builder();
            for (bit, axis) in axes.iter().enumerate() {
                let value = cursor.u32()?;
                if mask & (1 << bit) != 0 {
                    builder = builder.axis(axis.clone(), value);
                }
            }
            let offset = cursor.u32()?;
            entries.push((builder.build(), offset));
        }

        let continuation = cursor.string()?;
        Ok(IndexMap {
            entries,
            continuation: (!continuation.is_empty()).then_some(continuation),
        })
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    byte_order: ByteOrder,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        let end = self.pos + n;
        if end > self.bytes.len() {
            return Err(format!("unexpected end of index map at byte {}", self.pos));
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, String> {
        let bo = self.byte_order;
        self.take(2).map(|b| bo.read_u16(b))
    }

    fn u32(&mut self) -> Result<u32, String> {
        let bo = self.byte_order;
        self.take(4).map(|b| bo.read_u32(b))
    }

    fn string(&mut self) -> Result<String, String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| "axis name is not UTF-8".to_string())
    }
}
