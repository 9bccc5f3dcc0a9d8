//! # OME-TIFF Store
//!
//! A storage engine that streams multi-dimensional microscope images into
//! multi-file OME-TIFF datasets.
//!
//! Images arrive one at a time while an acquisition runs. Each is cached,
//! queued and appended by a single background writer to a classic TIFF file
//! of its partition (one partition per stage position by default). Every file
//! carries an index map from coordinate to IFD, so images can be read back by
//! coordinate while the acquisition is still being written. When the
//! acquisition finishes, an OME-XML document describing the whole dataset is
//! written to the file with the most room left, and every other file points
//! to it.
//!
//! ## Features
//!
//! - **Read while writing**: queued images are served from memory, written
//!   ones from disk
//! - **Rollover**: files continue in `<base>_<n>.ome.tif` before the classic
//!   TIFF 4 GiB limit
//! - **Incomplete acquisitions**: missing planes are filled with references to
//!   the nearest written plane of the same channel
//! - **Crash recovery**: files without an index map are rebuilt from the IFD
//!   chain on open
//!
//! ## Architecture
//!
//! - [`data`] - Coordinates, images and dataset metadata
//! - [`mod@format`] - TIFF codec and the dataset file layout
//! - [`io`] - Positional reads over local files
//! - [`ome`] - OME-XML model and serialization
//! - [`storage`] - Writers, readers, partitions and the engine
//! - [`server`] - Read-only HTTP API
//! - [`config`] - Storage and CLI configuration
//!
//! ## Example
//!
//! ```rust,no_run
//! use ometiff_store::{Coordinate, Image, ImageTags, PixelType, StorageConfig, StorageEngine, SummaryMetadata};
//!
//! # async fn run() -> Result<(), ometiff_store::StorageError> {
//! let summary = SummaryMetadata::default()
//!     .with_dimension("channel", 2)
//!     .with_dimension("time", 10);
//! let engine = StorageEngine::create("/data/run1", summary, StorageConfig::default()).await?;
//!
//! let coords = Coordinate::builder().channel(0).time(0).build();
//! let image = Image::new(coords.clone(), 512, 512, PixelType::Gray16, vec![0u8; 512 * 512 * 2], ImageTags::default())?;
//! engine.put_image(image).await?;
//!
//! let stored = engine.get_image(&coords).await?;
//! assert!(stored.is_some());
//!
//! engine.finished().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod format;
pub mod io;
pub mod ome;
pub mod server;
pub mod storage;

// Re-export commonly used types
pub use config::{Cli, Command, InspectConfig, OpenArgs, ServeConfig, StorageConfig, SynthConfig};
pub use data::{
    ChannelDisplay, Comments, Coordinate, CoordinateBuilder, DisplaySettings, Image, ImageRecord,
    ImageTags, PixelType, SummaryMetadata,
};
pub use error::{IoError, StorageError, TiffError};
pub use format::tiff::ByteOrder;
pub use ome::{DatasetDescriptor, OmeMetadataBuilder};
pub use server::{create_router, AppState, RouterConfig};
pub use storage::{
    EngineState, FinishReport, IndexRecovery, OpenOptions, PendingWrite, RepairPolicy,
    RepairReport, StorageEngine, TiffPageReader,
};
