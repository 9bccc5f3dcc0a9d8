//! Classic TIFF codec for dataset files.
//!
//! # Key Concepts
//!
//! - **Byte order**: TIFF files declare their endianness (II = little-endian, MM = big-endian)
//!   in the header. All multi-byte values must be read and written respecting this order.
//!
//! - **IFD (Image File Directory)**: One per image plane. Contains the plane's
//!   dimensions, pixel layout, the offset of its single uncompressed strip and
//!   the per-image JSON metadata. IFDs form a chain through their next-IFD
//!   offsets.
//!
//! - **Inline vs offset values**: Values of up to 4 bytes are stored inline in
//!   the IFD entry, larger values are stored at an offset pointed to by the entry.

mod encoder;
mod parser;
mod tags;
mod values;

pub use encoder::{EncodedIfd, IfdBuilder};
pub use parser::{ByteOrder, Ifd, IfdEntry, TiffHeader, IFD_ENTRY_SIZE, TIFF_HEADER_SIZE};
pub use tags::{
    Compression, FieldType, TiffTag, PHOTOMETRIC_MIN_IS_BLACK, PHOTOMETRIC_RGB,
    RESOLUTION_UNIT_CENTIMETER, SAMPLE_FORMAT_IEEE_FP, SAMPLE_FORMAT_UINT,
};
pub use values::ValueReader;
