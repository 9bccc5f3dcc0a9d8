//! TIFF tag and field type definitions.
//!
//! This module defines the vocabulary shared by the IFD encoder and parser:
//! - Field types that determine how values are encoded
//! - Tag IDs written for every image plane
//! - Enumerated tag values (compression, photometric, sample format)

// =============================================================================
// TIFF Field Types
// =============================================================================

/// TIFF field types that determine how values are encoded.
///
/// Each field type has a specific size in bytes, which is critical for:
/// - Determining if a value fits inline in an IFD entry
/// - Reading arrays of values correctly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FieldType {
    /// Unsigned 8-bit integer (1 byte)
    Byte = 1,

    /// 8-bit ASCII character, NUL terminated (1 byte)
    Ascii = 2,

    /// Unsigned 16-bit integer (2 bytes)
    Short = 3,

    /// Unsigned 32-bit integer (4 bytes)
    Long = 4,

    /// Two Longs: numerator then denominator (8 bytes)
    Rational = 5,

    /// Undefined byte data (1 byte per element)
    Undefined = 7,
}

impl FieldType {
    /// Size of a single value of this type in bytes.
    #[inline]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            FieldType::Byte => 1,
            FieldType::Ascii => 1,
            FieldType::Short => 2,
            FieldType::Long => 4,
            FieldType::Rational => 8,
            FieldType::Undefined => 1,
        }
    }

    /// Create a FieldType from its numeric value.
    ///
    /// Returns `None` for unsupported or unknown type values.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(FieldType::Byte),
            2 => Some(FieldType::Ascii),
            3 => Some(FieldType::Short),
            4 => Some(FieldType::Long),
            5 => Some(FieldType::Rational),
            7 => Some(FieldType::Undefined),
            _ => None,
        }
    }

    /// Maximum bytes that can be stored inline in a classic TIFF IFD entry.
    pub const INLINE_THRESHOLD: usize = 4;

    /// Check if a value with this type and count fits inline in an entry.
    #[inline]
    pub fn fits_inline(self, count: u64) -> bool {
        self.size_in_bytes() as u64 * count <= Self::INLINE_THRESHOLD as u64
    }
}

// =============================================================================
// TIFF Tags
// =============================================================================

/// TIFF tag IDs written to and read from image planes.
///
/// Tags not listed here are preserved by the parser as raw entries but never
/// interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TiffTag {
    // -------------------------------------------------------------------------
    // Basic Image Structure
    // -------------------------------------------------------------------------
    /// Image width in pixels
    ImageWidth = 256,

    /// Image height (length) in pixels
    ImageLength = 257,

    /// Bits per sample
    BitsPerSample = 258,

    /// Compression scheme used
    Compression = 259,

    /// Photometric interpretation (grayscale or RGB)
    PhotometricInterpretation = 262,

    /// Description string; carries the OME-XML document in the first IFD
    ImageDescription = 270,

    /// Number of components per pixel (3 for RGB)
    SamplesPerPixel = 277,

    /// Integer or floating point samples
    SampleFormat = 339,

    // -------------------------------------------------------------------------
    // Strip Organization
    // -------------------------------------------------------------------------
    /// Byte offset of the single strip holding the plane
    StripOffsets = 273,

    /// Row count per strip (equal to the image height)
    RowsPerStrip = 278,

    /// Byte count of the strip
    StripByteCounts = 279,

    // -------------------------------------------------------------------------
    // Resolution
    // -------------------------------------------------------------------------
    /// Pixels per unit in X direction
    XResolution = 282,

    /// Pixels per unit in Y direction
    YResolution = 283,

    /// Unit of resolution (1=none, 2=inch, 3=centimeter)
    ResolutionUnit = 296,

    // -------------------------------------------------------------------------
    // Private
    // -------------------------------------------------------------------------
    /// Per-image JSON metadata (coordinates and acquisition tags)
    ImageMetadata = 51123,
}

impl TiffTag {
    /// Create a TiffTag from its numeric value.
    ///
    /// Returns `None` for unrecognized tags.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            256 => Some(TiffTag::ImageWidth),
            257 => Some(TiffTag::ImageLength),
            258 => Some(TiffTag::BitsPerSample),
            259 => Some(TiffTag::Compression),
            262 => Some(TiffTag::PhotometricInterpretation),
            270 => Some(TiffTag::ImageDescription),
            273 => Some(TiffTag::StripOffsets),
            277 => Some(TiffTag::SamplesPerPixel),
            278 => Some(TiffTag::RowsPerStrip),
            279 => Some(TiffTag::StripByteCounts),
            282 => Some(TiffTag::XResolution),
            283 => Some(TiffTag::YResolution),
            296 => Some(TiffTag::ResolutionUnit),
            339 => Some(TiffTag::SampleFormat),
            51123 => Some(TiffTag::ImageMetadata),
            _ => None,
        }
    }

    /// Get the numeric tag ID.
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Name used in error messages.
    pub const fn name(self) -> &'static str {
        match self {
            TiffTag::ImageWidth => "ImageWidth",
            TiffTag::ImageLength => "ImageLength",
            TiffTag::BitsPerSample => "BitsPerSample",
            TiffTag::Compression => "Compression",
            TiffTag::PhotometricInterpretation => "PhotometricInterpretation",
            TiffTag::ImageDescription => "ImageDescription",
            TiffTag::SamplesPerPixel => "SamplesPerPixel",
            TiffTag::SampleFormat => "SampleFormat",
            TiffTag::StripOffsets => "StripOffsets",
            TiffTag::RowsPerStrip => "RowsPerStrip",
            TiffTag::StripByteCounts => "StripByteCounts",
            TiffTag::XResolution => "XResolution",
            TiffTag::YResolution => "YResolution",
            TiffTag::ResolutionUnit => "ResolutionUnit",
            TiffTag::ImageMetadata => "ImageMetadata",
        }
    }
}

// =============================================================================
// Enumerated Values
// =============================================================================

/// TIFF compression scheme identifiers.
///
/// Planes are always written uncompressed; other schemes are recognised only
/// to produce a useful error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Compression {
    /// No compression
    None = 1,

    /// LZW compression
    Lzw = 5,

    /// JPEG compression
    Jpeg = 7,

    /// Deflate/zlib compression
    Deflate = 8,

    /// PackBits run-length compression
    PackBits = 32773,
}

impl Compression {
    /// Create a Compression from its numeric value.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Compression::None),
            5 => Some(Compression::Lzw),
            7 => Some(Compression::Jpeg),
            8 => Some(Compression::Deflate),
            32773 => Some(Compression::PackBits),
            _ => None,
        }
    }

    /// Check if this compression scheme is supported.
    #[inline]
    pub const fn is_supported(self) -> bool {
        matches!(self, Compression::None)
    }

    /// Get a human-readable name for the compression scheme.
    pub const fn name(self) -> &'static str {
        match self {
            Compression::None => "None",
            Compression::Lzw => "LZW",
            Compression::Jpeg => "JPEG",
            Compression::Deflate => "Deflate",
            Compression::PackBits => "PackBits",
        }
    }
}

/// PhotometricInterpretation values written by the encoder.
pub const PHOTOMETRIC_MIN_IS_BLACK: u16 = 1;
pub const PHOTOMETRIC_RGB: u16 = 2;

/// SampleFormat values.
pub const SAMPLE_FORMAT_UINT: u16 = 1;
pub const SAMPLE_FORMAT_IEEE_FP: u16 = 3;

/// ResolutionUnit value for centimeters.
pub const RESOLUTION_UNIT_CENTIMETER: u16 = 3;

// =============================================================================
// Tests
// =============================================================================
