//! TIFF tag value reading.
//!
//! Values are stored either inline in the IFD entry (up to 4 bytes) or at an
//! offset in the file. Out-of-line values are fetched with a single range
//! read per entry.

use bytes::Bytes;

use crate::error::TiffError;
use crate::io::RangeReader;

use super::parser::{ByteOrder, IfdEntry};
use super::tags::{FieldType, TiffTag};

// =============================================================================
// ValueReader
// =============================================================================

/// Reads tag values from a TIFF file, respecting its byte order.
pub struct ValueReader<'a> {
    reader: &'a dyn RangeReader,
    byte_order: ByteOrder,
}

impl<'a> ValueReader<'a> {
    /// Create a new ValueReader.
    pub fn new(reader: &'a dyn RangeReader, byte_order: ByteOrder) -> Self {
        Self { reader, byte_order }
    }

    /// Byte order used to decode values.
    #[inline]
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// Read raw bytes for an IFD entry's value.
    ///
    /// For inline values, returns the bytes from the entry.
    /// For offset values, fetches the bytes from the file.
    pub async fn read_bytes(&self, entry: &IfdEntry) -> Result<Bytes, TiffError> {
        let size = entry
            .value_byte_size()
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;

        if entry.is_inline {
            Ok(Bytes::copy_from_slice(
                &entry.value_offset_bytes[..size as usize],
            ))
        } else {
            let offset = entry.value_offset(self.byte_order);
            let bytes = self.reader.read_exact_at(offset, size as usize).await?;
            Ok(bytes)
        }
    }

    /// Read a single Short or Long value.
    pub async fn read_u32(&self, entry: &IfdEntry) -> Result<u32, TiffError> {
        if let Some(value) = entry.inline_u32(self.byte_order) {
            return Ok(value);
        }

        Err(TiffError::InvalidTagValue {
            tag: tag_name(entry),
            message: format!(
                "expected a single Short or Long, got type {} with count {}",
                entry.field_type_raw, entry.count
            ),
        })
    }

    /// Read an array of Short values (e.g. BitsPerSample for RGB).
    pub async fn read_u16_array(&self, entry: &IfdEntry) -> Result<Vec<u16>, TiffError> {
        match entry.field_type {
            Some(FieldType::Short) => {}
            _ => {
                return Err(TiffError::InvalidTagValue {
                    tag: tag_name(entry),
                    message: format!("expected Short array, got type {}", entry.field_type_raw),
                })
            }
        }

        let bytes = self.read_bytes(entry).await?;
        Ok(bytes
            .chunks_exact(2)
            .map(|chunk| self.byte_order.read_u16(chunk))
            .collect())
    }

    /// Read a single Rational value as `(numerator, denominator)`.
    pub async fn read_rational(&self, entry: &IfdEntry) -> Result<(u32, u32), TiffError> {
        if entry.field_type != Some(FieldType::Rational) || entry.count != 1 {
            return Err(TiffError::InvalidTagValue {
                tag: tag_name(entry),
                message: "expected a single Rational".to_string(),
            });
        }

        let bytes = self.read_bytes(entry).await?;
        Ok((
            self.byte_order.read_u32(&bytes[0..4]),
            self.byte_order.read_u32(&bytes[4..8]),
        ))
    }

    /// Read a string value from an entry (ASCII type).
    ///
    /// The string is expected to be null-terminated. The null terminator
    /// and anything after it are stripped from the result.
    pub async fn read_string(&self, entry: &IfdEntry) -> Result<String, TiffError> {
        let field_type = entry
            .field_type
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;

        if field_type != FieldType::Ascii {
            return Err(TiffError::InvalidTagValue {
                tag: tag_name(entry),
                message: format!("expected Ascii type for string, got {:?}", field_type),
            });
        }

        if entry.count == 0 {
            return Ok(String::new());
        }

        let bytes = self.read_bytes(entry).await?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}

fn tag_name(entry: &IfdEntry) -> &'static str {
    entry.tag().map(TiffTag::name).unwrap_or("unknown")
}

// =============================================================================
// Tests
// =============================================================================
