//! TIFF header and IFD parsing.
//!
//! Dataset files are classic TIFF (32-bit offsets). BigTIFF is rejected with
//! `InvalidVersion`, since the writer never produces it.
//!
//! # TIFF Header Structure
//!
//! ```text
//! Bytes 0-1: Byte order (0x4949 = little-endian "II", 0x4D4D = big-endian "MM")
//! Bytes 2-3: Version (42 = 0x002A)
//! Bytes 4-7: Offset to first IFD (4 bytes)
//! ```
//!
//! # IFD Structure
//!
//! ```text
//! 2 bytes          entry count N
//! N * 12 bytes     entries: tag (2), field type (2), count (4), value/offset (4)
//! 4 bytes          offset of the next IFD (0 terminates the chain)
//! ```

use crate::error::TiffError;
use crate::io::{
    read_u16_be, read_u16_le, read_u32_be, read_u32_le, write_u16_be, write_u16_le, write_u32_be,
    write_u32_le, RangeReader,
};

use super::tags::{FieldType, TiffTag};

// =============================================================================
// Constants
// =============================================================================

/// Magic bytes indicating little-endian byte order ("II" for Intel)
const BYTE_ORDER_LITTLE_ENDIAN: u16 = 0x4949;

/// Magic bytes indicating big-endian byte order ("MM" for Motorola)
const BYTE_ORDER_BIG_ENDIAN: u16 = 0x4D4D;

/// Version number for classic TIFF
const VERSION_TIFF: u16 = 42;

/// Size of classic TIFF header in bytes
pub const TIFF_HEADER_SIZE: usize = 8;

/// Size of one IFD entry in bytes
pub const IFD_ENTRY_SIZE: usize = 12;

/// Upper bound on entries accepted when parsing an IFD
const MAX_IFD_ENTRIES: usize = 1024;

// =============================================================================
// ByteOrder
// =============================================================================

/// Byte order (endianness) of a TIFF file.
///
/// TIFF files declare their byte order in the first two bytes of the header.
/// All multi-byte values in the file must be read and written respecting this
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Little-endian ("II" = Intel)
    #[default]
    LittleEndian,
    /// Big-endian ("MM" = Motorola)
    BigEndian,
}

impl ByteOrder {
    /// Read a u16 from a byte slice using this byte order.
    #[inline]
    pub fn read_u16(self, bytes: &[u8]) -> u16 {
        match self {
            ByteOrder::LittleEndian => read_u16_le(bytes),
            ByteOrder::BigEndian => read_u16_be(bytes),
        }
    }

    /// Read a u32 from a byte slice using this byte order.
    #[inline]
    pub fn read_u32(self, bytes: &[u8]) -> u32 {
        match self {
            ByteOrder::LittleEndian => read_u32_le(bytes),
            ByteOrder::BigEndian => read_u32_be(bytes),
        }
    }

    /// Append a u16 to `buf` using this byte order.
    #[inline]
    pub fn write_u16(self, buf: &mut Vec<u8>, value: u16) {
        match self {
            ByteOrder::LittleEndian => write_u16_le(buf, value),
            ByteOrder::BigEndian => write_u16_be(buf, value),
        }
    }

    /// Append a u32 to `buf` using this byte order.
    #[inline]
    pub fn write_u32(self, buf: &mut Vec<u8>, value: u32) {
        match self {
            ByteOrder::LittleEndian => write_u32_le(buf, value),
            ByteOrder::BigEndian => write_u32_be(buf, value),
        }
    }

    /// Encode a single u32 in this byte order.
    #[inline]
    pub fn u32_bytes(self, value: u32) -> [u8; 4] {
        match self {
            ByteOrder::LittleEndian => value.to_le_bytes(),
            ByteOrder::BigEndian => value.to_be_bytes(),
        }
    }

    /// The two magic bytes at the start of a file in this byte order.
    pub const fn magic(self) -> [u8; 2] {
        match self {
            ByteOrder::LittleEndian => [0x49, 0x49],
            ByteOrder::BigEndian => [0x4D, 0x4D],
        }
    }
}

// =============================================================================
// TiffHeader
// =============================================================================

/// Parsed TIFF file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiffHeader {
    /// Byte order for all multi-byte values in the file
    pub byte_order: ByteOrder,

    /// Offset to the first IFD in the file
    pub first_ifd_offset: u64,
}

impl TiffHeader {
    /// Parse a TIFF header from raw bytes.
    ///
    /// # Arguments
    /// * `bytes` - Raw header bytes (at least 8)
    /// * `file_size` - Total file size (used to validate IFD offset)
    ///
    /// # Errors
    /// - `InvalidMagic` if byte order bytes are not II or MM
    /// - `InvalidVersion` if version is not 42
    /// - `FileTooSmall` if there aren't enough bytes for the header
    /// - `InvalidIfdOffset` if the first IFD offset is outside the file
    pub fn parse(bytes: &[u8], file_size: u64) -> Result<Self, TiffError> {
        if bytes.len() < TIFF_HEADER_SIZE {
            return Err(TiffError::FileTooSmall {
                required: TIFF_HEADER_SIZE as u64,
                actual: bytes.len() as u64,
            });
        }

        // Checked as raw bytes, independent of byte order
        let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
        let byte_order = match magic {
            BYTE_ORDER_LITTLE_ENDIAN => ByteOrder::LittleEndian,
            BYTE_ORDER_BIG_ENDIAN => ByteOrder::BigEndian,
            _ => return Err(TiffError::InvalidMagic(magic)),
        };

        let version = byte_order.read_u16(&bytes[2..4]);
        if version != VERSION_TIFF {
            return Err(TiffError::InvalidVersion(version));
        }

        let first_ifd_offset = byte_order.read_u32(&bytes[4..8]) as u64;
        if first_ifd_offset >= file_size {
            return Err(TiffError::InvalidIfdOffset(first_ifd_offset));
        }

        Ok(TiffHeader {
            byte_order,
            first_ifd_offset,
        })
    }

    /// Encode this header into its 8-byte on-disk form.
    pub fn encode(&self) -> [u8; TIFF_HEADER_SIZE] {
        let mut buf = Vec::with_capacity(TIFF_HEADER_SIZE);
        buf.extend_from_slice(&self.byte_order.magic());
        self.byte_order.write_u16(&mut buf, VERSION_TIFF);
        self.byte_order
            .write_u32(&mut buf, self.first_ifd_offset as u32);

        let mut out = [0u8; TIFF_HEADER_SIZE];
        out.copy_from_slice(&buf);
        out
    }
}

// =============================================================================
// IfdEntry
// =============================================================================

/// A single raw IFD entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfdEntry {
    /// Numeric tag ID
    pub tag_id: u16,

    /// Decoded field type, `None` for types the parser does not know
    pub field_type: Option<FieldType>,

    /// Raw field type value as stored
    pub field_type_raw: u16,

    /// Number of values
    pub count: u64,

    /// The 4-byte value/offset field, in file byte order
    pub value_offset_bytes: [u8; 4],

    /// Whether the value is stored inline in `value_offset_bytes`
    pub is_inline: bool,
}

impl IfdEntry {
    /// Decode an entry from its 12 raw bytes.
    pub fn parse(bytes: &[u8], byte_order: ByteOrder) -> Self {
        let tag_id = byte_order.read_u16(&bytes[0..2]);
        let field_type_raw = byte_order.read_u16(&bytes[2..4]);
        let field_type = FieldType::from_u16(field_type_raw);
        let count = byte_order.read_u32(&bytes[4..8]) as u64;

        let mut value_offset_bytes = [0u8; 4];
        value_offset_bytes.copy_from_slice(&bytes[8..12]);

        let is_inline = field_type.map(|ft| ft.fits_inline(count)).unwrap_or(false);

        IfdEntry {
            tag_id,
            field_type,
            field_type_raw,
            count,
            value_offset_bytes,
            is_inline,
        }
    }

    /// The recognized tag, if any.
    pub fn tag(&self) -> Option<TiffTag> {
        TiffTag::from_u16(self.tag_id)
    }

    /// Total size of the value in bytes, if the field type is known.
    pub fn value_byte_size(&self) -> Option<u64> {
        self.field_type
            .map(|ft| ft.size_in_bytes() as u64 * self.count)
    }

    /// Interpret the value/offset field as an offset.
    pub fn value_offset(&self, byte_order: ByteOrder) -> u64 {
        byte_order.read_u32(&self.value_offset_bytes) as u64
    }

    /// Read an inline single Short or Long value.
    ///
    /// Returns `None` if the value is not inline or not a single integer.
    pub fn inline_u32(&self, byte_order: ByteOrder) -> Option<u32> {
        if !self.is_inline || self.count != 1 {
            return None;
        }
        match self.field_type? {
            FieldType::Short => Some(byte_order.read_u16(&self.value_offset_bytes[0..2]) as u32),
            FieldType::Long => Some(byte_order.read_u32(&self.value_offset_bytes)),
            _ => None,
        }
    }
}

// =============================================================================
// Ifd
// =============================================================================

/// A parsed Image File Directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ifd {
    /// Entries in file order
    pub entries: Vec<IfdEntry>,

    /// Offset of the next IFD (0 if this is the last)
    pub next_ifd_offset: u64,
}

impl Ifd {
    /// Size in bytes of an IFD with `entry_count` entries.
    #[inline]
    pub const fn calculate_size(entry_count: usize) -> usize {
        2 + entry_count * IFD_ENTRY_SIZE + 4
    }

    /// Parse an IFD from bytes starting at the entry count.
    ///
    /// `bytes` must contain the full IFD (see [`Ifd::calculate_size`]).
    pub fn parse(bytes: &[u8], byte_order: ByteOrder) -> Result<Self, TiffError> {
        if bytes.len() < 2 {
            return Err(TiffError::FileTooSmall {
                required: 2,
                actual: bytes.len() as u64,
            });
        }

        let count = byte_order.read_u16(&bytes[0..2]) as usize;
        let required = Self::calculate_size(count);
        if bytes.len() < required {
            return Err(TiffError::FileTooSmall {
                required: required as u64,
                actual: bytes.len() as u64,
            });
        }

        let entries = (0..count)
            .map(|i| {
                let start = 2 + i * IFD_ENTRY_SIZE;
                IfdEntry::parse(&bytes[start..start + IFD_ENTRY_SIZE], byte_order)
            })
            .collect();

        let next_start = 2 + count * IFD_ENTRY_SIZE;
        let next_ifd_offset = byte_order.read_u32(&bytes[next_start..next_start + 4]) as u64;

        Ok(Ifd {
            entries,
            next_ifd_offset,
        })
    }

    /// Read and parse the IFD located at `offset`.
    pub async fn read(
        reader: &dyn RangeReader,
        offset: u64,
        byte_order: ByteOrder,
    ) -> Result<Self, TiffError> {
        if offset == 0 || offset + 2 > reader.size() {
            return Err(TiffError::InvalidIfdOffset(offset));
        }

        let count_bytes = reader.read_exact_at(offset, 2).await?;
        let count = byte_order.read_u16(&count_bytes) as usize;
        if count == 0 || count > MAX_IFD_ENTRIES {
            return Err(TiffError::InvalidIfdOffset(offset));
        }

        let bytes = reader
            .read_exact_at(offset, Self::calculate_size(count))
            .await?;
        Self::parse(&bytes, byte_order)
    }

    /// Find the entry for a tag.
    pub fn get(&self, tag: TiffTag) -> Option<&IfdEntry> {
        self.entries.iter().find(|e| e.tag_id == tag.as_u16())
    }

    /// Find the entry for a required tag.
    pub fn require(&self, tag: TiffTag) -> Result<&IfdEntry, TiffError> {
        self.get(tag).ok_or(TiffError::MissingTag(tag.name()))
    }

    /// Absolute position of the next-IFD field for an IFD stored at `ifd_offset`.
    pub fn next_offset_position(&self, ifd_offset: u64) -> u64 {
        ifd_offset + 2 + (self.entries.len() * IFD_ENTRY_SIZE) as u64
    }

    /// Absolute position of the entry for `tag` in an IFD stored at `ifd_offset`.
    pub fn entry_position(&self, ifd_offset: u64, tag: TiffTag) -> Option<u64> {
        self.entries
            .iter()
            .position(|e| e.tag_id == tag.as_u16())
            .map(|i| ifd_offset + 2 + (i * IFD_ENTRY_SIZE) as u64)
    }
}

// =============================================================================
// Tests
// =============================================================================
