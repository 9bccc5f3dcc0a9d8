//! Positional reads over local dataset files.
//!
//! Reads run on the blocking pool and share a bounded set of open handles,
//! so the writer thread can keep appending while readers fetch planes.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;

use super::range_reader::check_range;
use super::RangeReader;
use crate::error::IoError;

/// Default number of simultaneously open read handles.
pub const DEFAULT_OPEN_FILE_LIMIT: usize = 64;

type SharedFile = Arc<Mutex<File>>;

/// LRU-bounded pool of open read handles, shared by every reader of a dataset.
///
/// Datasets can span many physical files; keeping every handle open would
/// exhaust descriptors on long acquisitions. Handles evicted from the pool
/// are closed once the last in-flight read using them completes.
#[derive(Clone)]
pub struct FileHandlePool {
    handles: Arc<Mutex<LruCache<PathBuf, SharedFile>>>,
}

impl FileHandlePool {
    /// Create a pool holding at most `capacity` open files (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            handles: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Get an open handle for `path`, opening it if needed.
    ///
    /// Performs blocking I/O; call from a blocking context.
    pub fn acquire(&self, path: &Path) -> Result<SharedFile, IoError> {
        {
            let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(file) = handles.get(path) {
                return Ok(file.clone());
            }
        }

        let file = File::open(path).map_err(|e| IoError::from_std(path.display(), e))?;
        let file = Arc::new(Mutex::new(file));

        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.put(path.to_path_buf(), file.clone());
        Ok(file)
    }

    /// Drop the cached handle for `path`, if any.
    pub fn evict(&self, path: &Path) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.pop(path);
    }

    /// Number of currently open handles.
    pub fn open_count(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for FileHandlePool {
    fn default() -> Self {
        Self::new(DEFAULT_OPEN_FILE_LIMIT)
    }
}

// =============================================================================
// FileRangeReader
// =============================================================================

/// Local-file implementation of RangeReader.
///
/// Reads run on the blocking thread pool. The file size is queried on every
/// call to [`RangeReader::size`] because files being written keep growing.
#[derive(Clone)]
pub struct FileRangeReader {
    path: PathBuf,
    pool: FileHandlePool,
    identifier: String,
}

impl FileRangeReader {
    /// Create a reader for `path` that borrows handles from `pool`.
    pub fn new(path: impl Into<PathBuf>, pool: FileHandlePool) -> Self {
        let path = path.into();
        let identifier = path.display().to_string();
        Self {
            path,
            pool,
            identifier,
        }
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RangeReader for FileRangeReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        check_range(offset, len, self.size())?;

        let path = self.path.clone();
        let pool = self.pool.clone();
        let identifier = self.identifier.clone();

        tokio::task::spawn_blocking(move || {
            let file = pool.acquire(&path)?;
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let mut buf = vec![0u8; len];
            file.seek(SeekFrom::Start(offset))
                .and_then(|_| file.read_exact(&mut buf))
                .map_err(|e| IoError::from_std(&identifier, e))?;
            Ok(Bytes::from(buf))
        })
        .await
        .map_err(|e| IoError::Io {
            path: self.identifier.clone(),
            message: format!("read task failed: {e}"),
        })?
    }

    fn size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}
