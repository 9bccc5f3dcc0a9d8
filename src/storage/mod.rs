//! Storage engine: physical file writers and readers, partitions, the
//! background writer and the engine that ties them together.
//!
//! - [`engine`] is the public entry point ([`StorageEngine`]).
//! - [`fileset`] groups the files of one partition and handles rollover.
//! - [`writer`] and [`reader`] work on a single physical file.
//! - [`recovery`] rebuilds index maps of files that were never finished.

pub mod engine;
pub mod fileset;
pub mod metadata_file;
pub mod reader;
pub mod recovery;
mod worker;
pub mod writer;

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use engine::{EngineState, PendingWrite, StorageEngine};
pub use fileset::{base_name, FileSet, FileSetSettings, ReaderSet, Trailer, FILE_EXTENSION};
pub use metadata_file::{frame_key, MetadataTextFile};
pub use reader::TiffPageReader;
pub use recovery::{
    persist_index, ConfirmRepair, IfdChainScan, IndexRecovery, OpenOptions, RecoveredIndex,
    RepairPolicy, RepairReport,
};
pub use worker::FinishReport;
pub use writer::{TiffPageWriter, WriterLimits, DISPLAY_SETTINGS_RESERVE};

/// Name of the sidecar file used when no dataset file has room for the
/// OME-XML document.
pub const SIDECAR_FILE_NAME: &str = "OMEXMLMetadata.ome";

// A panic on another thread never leaves these maps half-updated, so a
// poisoned lock is still safe to use.
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
