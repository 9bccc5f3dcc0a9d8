use std::fmt::Display;

use thiserror::Error;

/// I/O errors that can occur when reading from or writing to dataset files
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// Error reported by the operating system
    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },

    /// Requested range exceeds resource bounds
    #[error("Range out of bounds: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        offset: u64,
        requested: u64,
        size: u64,
    },

    /// File not found
    #[error("File not found: {0}")]
    NotFound(String),
}

impl IoError {
    /// Wrap a `std::io::Error` raised while operating on `path`.
    pub fn from_std(path: impl Display, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            IoError::NotFound(path.to_string())
        } else {
            IoError::Io {
                path: path.to_string(),
                message: err.to_string(),
            }
        }
    }
}

/// Errors that can occur when parsing TIFF structures
#[derive(Debug, Clone, Error)]
pub enum TiffError {
    /// I/O error while reading the file
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Invalid TIFF magic bytes (not II or MM)
    #[error("Invalid TIFF magic bytes: expected 0x4949 (II) or 0x4D4D (MM), got 0x{0:04X}")]
    InvalidMagic(u16),

    /// Invalid TIFF version number
    #[error("Invalid TIFF version: expected 42, got {0}")]
    InvalidVersion(u16),

    /// File is too small to contain a valid header
    #[error("File too small: need at least {required} bytes, got {actual}")]
    FileTooSmall { required: u64, actual: u64 },

    /// Invalid IFD offset (points outside file or to invalid location)
    #[error("Invalid IFD offset: {0}")]
    InvalidIfdOffset(u64),

    /// Required tag is missing from IFD
    #[error("Missing required tag: {0}")]
    MissingTag(&'static str),

    /// Tag has unexpected type or count
    #[error("Invalid tag value for {tag}: {message}")]
    InvalidTagValue { tag: &'static str, message: String },

    /// Unsupported compression scheme
    #[error("Unsupported compression: {0} (only uncompressed strips are supported)")]
    UnsupportedCompression(String),

    /// Bit depth / sample layout that does not map to a known pixel type
    #[error("Unsupported pixel format: {bits} bits, {samples} samples per pixel, sample format {format}")]
    UnsupportedPixelFormat { bits: u16, samples: u16, format: u16 },

    /// Unknown field type in IFD entry
    #[error("Unknown field type: {0}")]
    UnknownFieldType(u16),

    /// File is a valid TIFF but lacks the dataset header blocks
    #[error("Not a dataset file: {0}")]
    NotADataset(String),
}

/// Errors surfaced by the storage engine and its file-level components.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// Operation not allowed in the current state (e.g. write after finishing)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O error while reading or writing a dataset file
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// TIFF structure could not be decoded
    #[error("TIFF error: {0}")]
    Tiff(#[from] TiffError),

    /// Index map missing or inconsistent with the file contents
    #[error("Corrupt metadata in {path}: {reason}")]
    MetadataCorruption { path: String, reason: String },

    /// Expected summary field absent or malformed
    #[error("Schema inconsistency: {0}")]
    SchemaInconsistency(String),

    /// Image rejected before it was queued
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Coordinate could not be parsed or encoded
    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The background writer is no longer accepting tasks
    #[error("Background writer is not running")]
    WriterClosed,
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
