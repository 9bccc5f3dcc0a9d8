//! On-disk formats.
//!
//! - [`tiff`] encodes and decodes classic TIFF headers and IFDs.
//! - [`layout`] defines the dataset header, the index map and the trailing
//!   metadata blocks that every physical file carries.

pub mod layout;
pub mod tiff;

pub use layout::{DatasetHeader, IndexMap, FILE_HEADER_SIZE};
