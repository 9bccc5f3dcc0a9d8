//! Image planes and their acquisition tags.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, TiffError};
use crate::format::tiff::{
    PHOTOMETRIC_MIN_IS_BLACK, PHOTOMETRIC_RGB, SAMPLE_FORMAT_IEEE_FP, SAMPLE_FORMAT_UINT,
};

use super::coords::Coordinate;

// =============================================================================
// PixelType
// =============================================================================

/// Pixel layout of an image plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelType {
    /// 8-bit grayscale
    Gray8,
    /// 16-bit grayscale
    Gray16,
    /// 32-bit floating point grayscale
    Gray32Float,
    /// 8-bit per channel interleaved RGB
    Rgb24,
}

impl PixelType {
    /// Bytes per pixel.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelType::Gray8 => 1,
            PixelType::Gray16 => 2,
            PixelType::Gray32Float => 4,
            PixelType::Rgb24 => 3,
        }
    }

    /// Bits per sample.
    pub const fn bits_per_sample(self) -> u16 {
        match self {
            PixelType::Gray8 | PixelType::Rgb24 => 8,
            PixelType::Gray16 => 16,
            PixelType::Gray32Float => 32,
        }
    }

    /// Samples per pixel.
    pub const fn samples_per_pixel(self) -> u16 {
        match self {
            PixelType::Rgb24 => 3,
            _ => 1,
        }
    }

    /// TIFF SampleFormat value.
    pub const fn sample_format(self) -> u16 {
        match self {
            PixelType::Gray32Float => SAMPLE_FORMAT_IEEE_FP,
            _ => SAMPLE_FORMAT_UINT,
        }
    }

    /// TIFF PhotometricInterpretation value.
    pub const fn photometric(self) -> u16 {
        match self {
            PixelType::Rgb24 => PHOTOMETRIC_RGB,
            _ => PHOTOMETRIC_MIN_IS_BLACK,
        }
    }

    /// OME `Pixels/@Type` name.
    pub const fn ome_type(self) -> &'static str {
        match self {
            PixelType::Gray8 | PixelType::Rgb24 => "uint8",
            PixelType::Gray16 => "uint16",
            PixelType::Gray32Float => "float",
        }
    }

    /// Map decoded TIFF tags back to a pixel type.
    pub fn from_tiff(bits: u16, samples: u16, sample_format: u16) -> Result<Self, TiffError> {
        match (bits, samples, sample_format) {
            (8, 1, SAMPLE_FORMAT_UINT) => Ok(PixelType::Gray8),
            (16, 1, SAMPLE_FORMAT_UINT) => Ok(PixelType::Gray16),
            (32, 1, SAMPLE_FORMAT_IEEE_FP) => Ok(PixelType::Gray32Float),
            (8, 3, SAMPLE_FORMAT_UINT) => Ok(PixelType::Rgb24),
            _ => Err(TiffError::UnsupportedPixelFormat {
                bits,
                samples,
                format: sample_format,
            }),
        }
    }
}

// =============================================================================
// ImageTags
// =============================================================================

/// Per-image acquisition metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageTags {
    /// Exposure time in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure_ms: Option<f64>,

    /// Stage X position in micrometers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_um: Option<f64>,

    /// Stage Y position in micrometers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_um: Option<f64>,

    /// Focus Z position in micrometers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_um: Option<f64>,

    /// Milliseconds since acquisition start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<f64>,

    /// Camera device identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<String>,

    /// Stage position label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_name: Option<String>,

    /// Free-text comment attached to this image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Any further device properties
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// =============================================================================
// Image
// =============================================================================

/// One image plane: pixels, dimensions, tags and its coordinate.
///
/// Images are immutable once constructed; the engine shares them as
/// `Arc<Image>` between the pending cache and the writer.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    coords: Coordinate,
    width: u32,
    height: u32,
    pixel_type: PixelType,
    pixels: Bytes,
    tags: ImageTags,
}

impl Image {
    /// Construct an image, checking that the buffer matches the dimensions.
    pub fn new(
        coords: Coordinate,
        width: u32,
        height: u32,
        pixel_type: PixelType,
        pixels: impl Into<Bytes>,
        tags: ImageTags,
    ) -> Result<Self, StorageError> {
        let pixels = pixels.into();
        if width == 0 || height == 0 {
            return Err(StorageError::InvalidImage(format!(
                "zero-sized image {width}x{height}"
            )));
        }
        let expected = width as u64 * height as u64 * pixel_type.bytes_per_pixel() as u64;
        if pixels.len() as u64 != expected {
            return Err(StorageError::InvalidImage(format!(
                "pixel buffer is {} bytes, expected {expected} for {width}x{height} {pixel_type:?}",
                pixels.len()
            )));
        }
        Ok(Self {
            coords,
            width,
            height,
            pixel_type,
            pixels,
            tags,
        })
    }

    /// Coordinate of this image.
    pub fn coords(&self) -> &Coordinate {
        &self.coords
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel layout.
    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    /// Raw pixel bytes, row-major.
    ///
    /// Multi-byte samples are stored and returned as given, so they must be
    /// in the byte order of the dataset files (`StorageConfig::byte_order`,
    /// the `BigEndian` attribute of the OME-XML).
    pub fn pixels(&self) -> &Bytes {
        &self.pixels
    }

    /// Acquisition tags.
    pub fn tags(&self) -> &ImageTags {
        &self.tags
    }

    /// Metadata record persisted alongside the pixels.
    pub fn record(&self) -> ImageRecord {
        ImageRecord {
            coords: self.coords.clone(),
            tags: self.tags.clone(),
            blank: false,
        }
    }
}

/// JSON document stored in each IFD's private metadata tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub coords: Coordinate,
    #[serde(default)]
    pub tags: ImageTags,
    /// Padding plane written for an incomplete final frame
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub blank: bool,
}
