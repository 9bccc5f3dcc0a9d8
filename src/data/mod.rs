//! Data model: coordinates, images and dataset metadata.

pub mod coords;
mod image;
mod summary;

pub use coords::{validate_axis_name, Coordinate, CoordinateBuilder};
pub use image::{Image, ImageRecord, ImageTags, PixelType};
pub use summary::{ChannelDisplay, Comments, DisplaySettings, SummaryMetadata};
