//! IFD encoding.
//!
//! [`IfdBuilder`] collects tag values and lays out a contiguous block:
//!
//! ```text
//! IFD (count, entries sorted by tag, next-IFD offset)
//! out-of-line values in the order they were added, each padded to even length
//! ```
//!
//! Keeping every value after its IFD means a block can be appended to a file
//! with a single sequence of writes, and its total length is known before
//! anything touches the disk.

use bytes::Bytes;

use crate::error::TiffError;

use super::parser::{ByteOrder, Ifd, IFD_ENTRY_SIZE};
use super::tags::{FieldType, TiffTag};

static PAD: [u8; 1] = [0];

#[derive(Debug, Clone)]
enum EntryValue {
    /// Value stored in the entry itself
    Inline([u8; 4]),
    /// Value stored after the IFD; the entry holds its offset
    OutOfLine(Bytes),
    /// Entry holds the offset of a data blob (count 1, Long)
    OffsetOf(Bytes),
    /// Zero count placeholder patched after the block is written
    Reserved,
}

#[derive(Debug, Clone)]
struct PendingEntry {
    tag: u16,
    field_type: FieldType,
    count: u32,
    value: EntryValue,
}

/// Builder for one IFD and its out-of-line values.
#[derive(Debug, Clone)]
pub struct IfdBuilder {
    byte_order: ByteOrder,
    entries: Vec<PendingEntry>,
}

impl IfdBuilder {
    /// Create an empty builder.
    pub fn new(byte_order: ByteOrder) -> Self {
        Self {
            byte_order,
            entries: Vec::new(),
        }
    }

    fn push(&mut self, tag: TiffTag, field_type: FieldType, count: u32, value: EntryValue) {
        self.entries.push(PendingEntry {
            tag: tag.as_u16(),
            field_type,
            count,
            value,
        });
    }

    fn inline(bytes: &[u8]) -> EntryValue {
        let mut value = [0u8; 4];
        value[..bytes.len()].copy_from_slice(bytes);
        EntryValue::Inline(value)
    }

    /// Add a single Short value.
    pub fn short(&mut self, tag: TiffTag, value: u16) -> &mut Self {
        let mut buf = Vec::with_capacity(2);
        self.byte_order.write_u16(&mut buf, value);
        self.push(tag, FieldType::Short, 1, Self::inline(&buf));
        self
    }

    /// Add a Short array, inline when it fits.
    pub fn shorts(&mut self, tag: TiffTag, values: &[u16]) -> &mut Self {
        let mut buf = Vec::with_capacity(values.len() * 2);
        for &v in values {
            self.byte_order.write_u16(&mut buf, v);
        }
        let value = if FieldType::Short.fits_inline(values.len() as u64) {
            Self::inline(&buf)
        } else {
            EntryValue::OutOfLine(Bytes::from(buf))
        };
        self.push(tag, FieldType::Short, values.len() as u32, value);
        self
    }

    /// Add a single Long value.
    pub fn long(&mut self, tag: TiffTag, value: u32) -> &mut Self {
        self.push(
            tag,
            FieldType::Long,
            1,
            EntryValue::Inline(self.byte_order.u32_bytes(value)),
        );
        self
    }

    /// Add a single Rational value.
    pub fn rational(&mut self, tag: TiffTag, numerator: u32, denominator: u32) -> &mut Self {
        let mut buf = Vec::with_capacity(8);
        self.byte_order.write_u32(&mut buf, numerator);
        self.byte_order.write_u32(&mut buf, denominator);
        self.push(tag, FieldType::Rational, 1, EntryValue::OutOfLine(Bytes::from(buf)));
        self
    }

    /// Add a NUL-terminated ASCII value.
    pub fn ascii(&mut self, tag: TiffTag, text: &str) -> &mut Self {
        let mut buf = Vec::with_capacity(text.len() + 1);
        buf.extend_from_slice(text.as_bytes());
        buf.push(0);
        let count = buf.len() as u32;
        let value = if FieldType::Ascii.fits_inline(count as u64) {
            Self::inline(&buf)
        } else {
            EntryValue::OutOfLine(Bytes::from(buf))
        };
        self.push(tag, FieldType::Ascii, count, value);
        self
    }

    /// Add an empty ASCII entry whose count and offset are filled in later.
    pub fn reserved_ascii(&mut self, tag: TiffTag) -> &mut Self {
        self.push(tag, FieldType::Ascii, 0, EntryValue::Reserved);
        self
    }

    /// Add a single strip holding `data`: StripOffsets, RowsPerStrip and
    /// StripByteCounts.
    pub fn strip(&mut self, data: Bytes, rows: u32) -> &mut Self {
        let len = data.len() as u32;
        self.push(TiffTag::StripOffsets, FieldType::Long, 1, EntryValue::OffsetOf(data));
        self.long(TiffTag::RowsPerStrip, rows);
        self.long(TiffTag::StripByteCounts, len);
        self
    }

    /// Number of entries added so far.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Total encoded length of the IFD and its values.
    pub fn encoded_len(&self) -> u64 {
        let values: u64 = self
            .entries
            .iter()
            .map(|e| match &e.value {
                EntryValue::OutOfLine(data) | EntryValue::OffsetOf(data) => padded(data.len()),
                EntryValue::Inline(_) | EntryValue::Reserved => 0,
            })
            .sum();
        Ifd::calculate_size(self.entries.len()) as u64 + values
    }

    /// Lay out the block at `ifd_offset`.
    ///
    /// When `link_next` is set the next-IFD field points just past the block,
    /// where the following IFD will be appended; otherwise it is 0.
    ///
    /// # Errors
    /// `InvalidIfdOffset` if any offset in the block would not fit in 32 bits.
    pub fn build(self, ifd_offset: u64, link_next: bool) -> Result<EncodedIfd, TiffError> {
        let total_len = self.encoded_len();
        let end = ifd_offset + total_len;
        if end > u32::MAX as u64 {
            return Err(TiffError::InvalidIfdOffset(end));
        }

        // Values are laid out in insertion order, entries sorted by tag
        let mut value_offsets = Vec::with_capacity(self.entries.len());
        let mut cursor = ifd_offset + Ifd::calculate_size(self.entries.len()) as u64;
        let mut blobs = Vec::new();
        for entry in &self.entries {
            match &entry.value {
                EntryValue::OutOfLine(data) | EntryValue::OffsetOf(data) => {
                    value_offsets.push(Some(cursor as u32));
                    cursor += padded(data.len());
                    blobs.push(data.clone());
                }
                _ => value_offsets.push(None),
            }
        }

        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        order.sort_by_key(|&i| self.entries[i].tag);

        let bo = self.byte_order;
        let mut ifd = Vec::with_capacity(Ifd::calculate_size(self.entries.len()));
        bo.write_u16(&mut ifd, self.entries.len() as u16);

        let mut positions = Vec::with_capacity(self.entries.len());
        for (slot, &i) in order.iter().enumerate() {
            let entry = &self.entries[i];
            positions.push((
                entry.tag,
                ifd_offset + 2 + (slot * IFD_ENTRY_SIZE) as u64,
            ));

            bo.write_u16(&mut ifd, entry.tag);
            bo.write_u16(&mut ifd, entry.field_type as u16);
            bo.write_u32(&mut ifd, entry.count);
            match (&entry.value, value_offsets[i]) {
                (EntryValue::Inline(bytes), _) => ifd.extend_from_slice(bytes),
                (_, Some(offset)) => bo.write_u32(&mut ifd, offset),
                _ => bo.write_u32(&mut ifd, 0),
            }
        }

        let next_field_position = ifd_offset + ifd.len() as u64;
        bo.write_u32(&mut ifd, if link_next { end as u32 } else { 0 });

        let mut pieces = Vec::with_capacity(1 + blobs.len() * 2);
        pieces.push(Bytes::from(ifd));
        for blob in blobs {
            let odd = blob.len() % 2 == 1;
            pieces.push(blob);
            if odd {
                pieces.push(Bytes::from_static(&PAD));
            }
        }

        Ok(EncodedIfd {
            offset: ifd_offset,
            pieces,
            len: total_len,
            next_field_position,
            positions,
        })
    }
}

#[inline]
fn padded(len: usize) -> u64 {
    (len + len % 2) as u64
}

/// A laid-out IFD block ready to be written at [`EncodedIfd::offset`].
#[derive(Debug, Clone)]
pub struct EncodedIfd {
    offset: u64,
    pieces: Vec<Bytes>,
    len: u64,
    next_field_position: u64,
    positions: Vec<(u16, u64)>,
}

impl EncodedIfd {
    /// Absolute offset of the IFD.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Byte pieces to write back to back.
    pub fn pieces(&self) -> &[Bytes] {
        &self.pieces
    }

    /// Total length of the block.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the block is empty (never true for a built IFD).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Absolute position of the next-IFD field.
    pub fn next_field_position(&self) -> u64 {
        self.next_field_position
    }

    /// Absolute position of the entry for `tag`.
    pub fn entry_position(&self, tag: TiffTag) -> Option<u64> {
        self.positions
            .iter()
            .find(|(id, _)| *id == tag.as_u16())
            .map(|(_, pos)| *pos)
    }

    /// Concatenate all pieces (for tests and small blocks).
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len as usize);
        for piece in &self.pieces {
            out.extend_from_slice(piece);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::tiff::ValueReader;
    use crate::io::RangeReader;
    use crate::io::MemoryRangeReader;

    fn sample(byte_order: ByteOrder) -> IfdBuilder {
        let mut builder = IfdBuilder::new(byte_order);
        builder
            .long(TiffTag::ImageWidth, 3)
            .long(TiffTag::ImageLength, 1)
            .short(TiffTag::BitsPerSample, 8)
            .reserved_ascii(TiffTag::ImageDescription)
            .strip(Bytes::from_static(&[1, 2, 3]), 1)
            .rational(TiffTag::XResolution, 10_000, 1)
            .ascii(TiffTag::ImageMetadata, "{\"a\":1}");
        builder
    }

    #[test]
    fn test_encoded_len_matches_pieces() {
        let builder = sample(ByteOrder::LittleEndian);
        let expected = builder.encoded_len();
        let encoded = builder.build(100, true).unwrap();
        assert_eq!(encoded.len(), expected);
        assert_eq!(encoded.to_vec().len() as u64, expected);
        // IFD: 2 + 9 * 12 + 4, strip 3 -> 4, rational 8, metadata 8 -> 8
        assert_eq!(expected, 114 + 4 + 8 + 8);
    }

    #[test]
    fn test_entries_sorted_by_tag() {
        let encoded = sample(ByteOrder::BigEndian).build(0, false).unwrap();
        let bytes = encoded.to_vec();
        let ifd = Ifd::parse(&bytes, ByteOrder::BigEndian).unwrap();
        let tags: Vec<u16> = ifd.entries.iter().map(|e| e.tag_id).collect();
        let mut sorted = tags.clone();
        sorted.sort_unstable();
        assert_eq!(tags, sorted);
        assert_eq!(ifd.next_ifd_offset, 0);
    }

    #[test]
    fn test_link_next_points_past_block() {
        let encoded = sample(ByteOrder::LittleEndian).build(64, true).unwrap();
        let bytes = encoded.to_vec();
        let ifd = Ifd::parse(&bytes, ByteOrder::LittleEndian).unwrap();
        assert_eq!(ifd.next_ifd_offset, 64 + encoded.len());
        assert_eq!(
            encoded.next_field_position(),
            ifd.next_offset_position(64)
        );
        assert_eq!(
            encoded.entry_position(TiffTag::ImageDescription),
            ifd.entry_position(64, TiffTag::ImageDescription)
        );
    }

    #[tokio::test]
    async fn test_values_read_back() {
        let order = ByteOrder::LittleEndian;
        let offset = 8u64;
        let encoded = sample(order).build(offset, true).unwrap();
        let mut file = vec![0u8; offset as usize];
        file.extend(encoded.to_vec());
        let reader = MemoryRangeReader::new(file, "mem://enc");

        let ifd = Ifd::read(&reader, offset, order).await.unwrap();
        let values = ValueReader::new(&reader, order);

        let strip = ifd.require(TiffTag::StripOffsets).unwrap();
        let strip_offset = values.read_u32(strip).await.unwrap();
        let count = values
            .read_u32(ifd.require(TiffTag::StripByteCounts).unwrap())
            .await
            .unwrap();
        let pixels = reader
            .read_exact_at(strip_offset as u64, count as usize)
            .await
            .unwrap();
        assert_eq!(&pixels[..], &[1, 2, 3]);

        let res = values
            .read_rational(ifd.require(TiffTag::XResolution).unwrap())
            .await
            .unwrap();
        assert_eq!(res, (10_000, 1));

        let md = values
            .read_string(ifd.require(TiffTag::ImageMetadata).unwrap())
            .await
            .unwrap();
        assert_eq!(md, "{\"a\":1}");

        let desc = ifd.require(TiffTag::ImageDescription).unwrap();
        assert_eq!(desc.count, 0);
    }

    #[test]
    fn test_offsets_must_fit_u32() {
        let result = sample(ByteOrder::LittleEndian).build(u32::MAX as u64 - 10, true);
        assert!(matches!(result, Err(TiffError::InvalidIfdOffset(_))));
    }

    #[test]
    fn test_shorts_inline_and_out_of_line() {
        let mut builder = IfdBuilder::new(ByteOrder::LittleEndian);
        builder.shorts(TiffTag::BitsPerSample, &[8, 8, 8]);
        // 3 shorts do not fit inline: 6 bytes of values
        assert_eq!(builder.encoded_len(), Ifd::calculate_size(1) as u64 + 6);

        let mut builder = IfdBuilder::new(ByteOrder::LittleEndian);
        builder.shorts(TiffTag::BitsPerSample, &[16]);
        assert_eq!(builder.encoded_len(), Ifd::calculate_size(1) as u64);
        assert_eq!(builder.entry_count(), 1);
    }
}
