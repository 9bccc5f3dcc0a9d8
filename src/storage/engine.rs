//! Storage engine: the public entry point for writing and reading a dataset.
//!
//! # Write path
//!
//! [`StorageEngine::put_image`] never touches the disk. It caches the image,
//! records the coordinate in the committed index and queues a write task for
//! the single background writer thread. Images are readable from the cache
//! until the writer has indexed them in their file, and from the file after.
//!
//! # Lifecycle
//!
//! ```text
//! create() ──> WriteMode ──finished()──> Finishing ──> ReadOnly
//! open_existing() ─────────────────────────────────────> ReadOnly
//! ```
//!
//! Dropping an engine that is still in `WriteMode` stops the writer after the
//! queued tasks, leaving the files without index maps or OME-XML, the same
//! state a crash leaves behind. Such files can be reopened with
//! [`StorageEngine::open_existing_with`] and a repair policy.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::data::{Coordinate, DisplaySettings, Image, SummaryMetadata};
use crate::error::{IoError, StorageError};
use crate::format::tiff::ByteOrder;
use crate::io::FileHandlePool;
use crate::ome::{parse_pointer_document, DatasetDescriptor, OmeMetadataBuilder};

use super::fileset::{ReaderSet, FILE_EXTENSION};
use super::reader::TiffPageReader;
use super::recovery::{OpenOptions, RepairReport};
use super::worker::{CommittedIndex, FinishReport, PendingCache, WriteTask, Worker};
use super::{read_lock, write_lock};

/// Interval of progress messages while `finished` waits for the writer.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(4);

/// Lifecycle state of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Accepting images
    WriteMode,
    /// Draining the queue and writing trailers
    Finishing,
    /// All files are final
    ReadOnly,
}

/// Handle to one queued write.
#[derive(Debug)]
pub struct PendingWrite {
    coords: Coordinate,
    done: oneshot::Receiver<Result<(), StorageError>>,
}

impl PendingWrite {
    /// Coordinate of the queued image.
    pub fn coords(&self) -> &Coordinate {
        &self.coords
    }

    /// Wait until the image is on disk, or for the reason it is not.
    pub async fn wait(self) -> Result<(), StorageError> {
        self.done.await.map_err(|_| StorageError::WriterClosed)?
    }
}

/// A multi-file OME-TIFF dataset.
pub struct StorageEngine {
    directory: PathBuf,
    config: StorageConfig,
    summary: Arc<SummaryMetadata>,
    display: RwLock<DisplaySettings>,
    state: tokio::sync::RwLock<EngineState>,
    read_only: AtomicBool,
    tasks: Option<mpsc::Sender<WriteTask>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: PendingCache,
    committed: CommittedIndex,
    /// Reader sets by partition
    partitions: RwLock<BTreeMap<u32, ReaderSet>>,
    max_indices: RwLock<Coordinate>,
    repair_reports: Vec<RepairReport>,
    finish_report: Mutex<Option<FinishReport>>,
}

impl StorageEngine {
    /// Create a new dataset in `directory` and start its writer.
    pub async fn create(
        directory: impl AsRef<Path>,
        summary: SummaryMetadata,
        config: StorageConfig,
    ) -> Result<Self, StorageError> {
        config.validate().map_err(StorageError::Configuration)?;
        let directory = directory.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&directory)
            .await
            .map_err(|e| IoError::from_std(directory.display(), e))?;

        let summary = Arc::new(summary);
        let pending = PendingCache::default();
        let committed = CommittedIndex::default();

        let mut descriptor = DatasetDescriptor::from_summary(&summary);
        descriptor.big_endian = config.byte_order == ByteOrder::BigEndian;

        let worker = Worker::new(
            directory.clone(),
            summary.clone(),
            config.fileset_settings(),
            FileHandlePool::new(config.open_file_limit),
            OmeMetadataBuilder::new(descriptor),
            pending.clone(),
            committed.clone(),
        );
        let (tx, rx) = mpsc::channel(config.write_queue_capacity);
        let handle = std::thread::Builder::new()
            .name("ometiff-writer".to_string())
            .spawn(move || worker.run(rx))
            .map_err(|e| IoError::from_std("writer thread", e))?;

        info!(
            directory = %directory.display(),
            prefix = %summary.prefix,
            split_by_position = config.split_by_position,
            max_file_size = config.max_file_size,
            "dataset created"
        );

        Ok(Self {
            directory,
            config,
            display: RwLock::new(DisplaySettings::from_summary(&summary)),
            summary,
            state: tokio::sync::RwLock::new(EngineState::WriteMode),
            read_only: AtomicBool::new(false),
            tasks: Some(tx),
            worker: Mutex::new(Some(handle)),
            pending,
            committed,
            partitions: RwLock::new(BTreeMap::new()),
            max_indices: RwLock::new(Coordinate::new()),
            repair_reports: Vec::new(),
            finish_report: Mutex::new(None),
        })
    }

    /// Open a finished (or crashed) dataset read-only with default options.
    pub async fn open_existing(directory: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_existing_with(directory, OpenOptions::default()).await
    }

    /// Open a dataset read-only.
    ///
    /// Every `*.tif` file in `directory` is opened and its index merged.
    /// Files with unusable index maps are handled per `options.repair`.
    pub async fn open_existing_with(
        directory: impl AsRef<Path>,
        options: OpenOptions,
    ) -> Result<Self, StorageError> {
        let directory = directory.as_ref().to_path_buf();
        let paths = dataset_files(&directory).await?;
        if paths.is_empty() {
            return Err(StorageError::Configuration(format!(
                "no dataset files in {}",
                directory.display()
            )));
        }

        let pool = options.handle_pool();
        let mut committed = HashMap::new();
        let mut partitions = BTreeMap::new();
        let mut max_indices = Coordinate::new();
        let mut summary = None;
        let mut display = None;
        let mut repair_reports = Vec::new();

        for (i, path) in paths.into_iter().enumerate() {
            let (reader, report) = TiffPageReader::open(path.clone(), pool.clone(), &options).await?;
            if let Some(report) = report {
                warn!(
                    file = %path.display(),
                    images = report.recovered_images,
                    rewritten = report.rewritten,
                    reason = %report.reason,
                    "index map repaired"
                );
                repair_reports.push(report);
            }

            let reader = Arc::new(reader);
            let set = ReaderSet::single(reader.clone());
            for coords in reader.index_keys() {
                max_indices = max_indices.max_with(&coords);
                committed.insert(coords, set.clone());
            }
            if summary.is_none() {
                summary = Some(reader.summary_metadata().clone());
            }
            if display.is_none() {
                display = reader.display_settings();
            }
            partitions.insert(i as u32, set);
        }

        let summary = Arc::new(summary.unwrap_or_default());
        let display = display.unwrap_or_else(|| DisplaySettings::from_summary(&summary));
        info!(
            directory = %directory.display(),
            files = partitions.len(),
            images = committed.len(),
            repaired = repair_reports.len(),
            "dataset opened"
        );

        Ok(Self {
            directory,
            config: StorageConfig::default(),
            summary,
            display: RwLock::new(display),
            state: tokio::sync::RwLock::new(EngineState::ReadOnly),
            read_only: AtomicBool::new(true),
            tasks: None,
            worker: Mutex::new(None),
            pending: PendingCache::default(),
            committed: Arc::new(RwLock::new(committed)),
            partitions: RwLock::new(partitions),
            max_indices: RwLock::new(max_indices),
            repair_reports,
            finish_report: Mutex::new(None),
        })
    }

    // -------------------------------------------------------------------------
    // Writing
    // -------------------------------------------------------------------------

    /// Queue `image` for writing.
    ///
    /// Returns as soon as the image is cached and queued; it is readable
    /// through [`get_image`](Self::get_image) from then on. Waits only when
    /// the write queue is full.
    pub async fn put_image(&self, image: Image) -> Result<PendingWrite, StorageError> {
        let state = self.state.read().await;
        if *state != EngineState::WriteMode {
            warn!(coords = %image.coords(), state = ?*state, "image received after acquisition finished");
            return Err(StorageError::Configuration(
                "dataset is no longer accepting images".to_string(),
            ));
        }
        image.coords().validate()?;
        let tasks = self.tasks.as_ref().ok_or(StorageError::WriterClosed)?;

        let permit = match tasks.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => {
                debug!(coords = %image.coords(), "write queue full, waiting for the writer");
                tasks
                    .reserve()
                    .await
                    .map_err(|_| StorageError::WriterClosed)?
            }
            Err(TrySendError::Closed(())) => return Err(StorageError::WriterClosed),
        };

        let coords = image.coords().clone();
        let partition = if self.config.split_by_position {
            coords.position()
        } else {
            0
        };
        let readers = write_lock(&self.partitions)
            .entry(partition)
            .or_default()
            .clone();

        let image = Arc::new(image);
        write_lock(&self.pending).insert(coords.clone(), image.clone());
        {
            let mut max = write_lock(&self.max_indices);
            *max = max.max_with(&coords);
        }
        write_lock(&self.committed).insert(coords.clone(), readers.clone());

        let (done, rx) = oneshot::channel();
        permit.send(WriteTask::Image {
            image,
            partition,
            readers,
            done,
        });
        drop(state);

        Ok(PendingWrite { coords, done: rx })
    }

    /// Wait until every image queued so far has been processed.
    ///
    /// Returns immediately once the dataset is read-only.
    pub async fn flush(&self) -> Result<(), StorageError> {
        let state = self.state.read().await;
        if *state != EngineState::WriteMode {
            return Ok(());
        }
        let Some(tasks) = &self.tasks else {
            return Ok(());
        };
        let (done, rx) = oneshot::channel();
        tasks
            .send(WriteTask::Barrier { done })
            .await
            .map_err(|_| StorageError::WriterClosed)?;
        drop(state);
        rx.await.map_err(|_| StorageError::WriterClosed)
    }

    /// Finish the acquisition: drain the queue, pad and gap-fill, write the
    /// OME-XML and close every file.
    ///
    /// Returns `Ok(None)` when the dataset is already finished or read-only.
    pub async fn finished(&self) -> Result<Option<FinishReport>, StorageError> {
        let mut state = self.state.write().await;
        if *state != EngineState::WriteMode {
            debug!(state = ?*state, "finish requested on a dataset that is not writing");
            return Ok(None);
        }
        *state = EngineState::Finishing;

        let tasks = self.tasks.as_ref().ok_or(StorageError::WriterClosed)?;
        let display = read_lock(&self.display).clone();
        let (done, mut rx) = oneshot::channel();
        tasks
            .send(WriteTask::Finish { display, done })
            .await
            .map_err(|_| StorageError::WriterClosed)?;

        let started = Instant::now();
        let mut progress = tokio::time::interval(PROGRESS_INTERVAL);
        progress.tick().await;
        let report = loop {
            tokio::select! {
                report = &mut rx => break report.map_err(|_| StorageError::WriterClosed)?,
                _ = progress.tick() => {
                    let remaining = read_lock(&self.pending).len();
                    info!(
                        remaining,
                        elapsed_secs = started.elapsed().as_secs(),
                        "waiting for queued images to be written"
                    );
                }
            }
        };

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let joined = tokio::task::spawn_blocking(move || handle.join().is_ok()).await;
            if !matches!(joined, Ok(true)) {
                warn!("writer thread did not exit cleanly");
            }
        }

        *state = EngineState::ReadOnly;
        self.read_only.store(true, Ordering::Release);
        *self
            .finish_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        info!(
            directory = %self.directory.display(),
            images = self.num_images(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "acquisition finished"
        );
        Ok(Some(report))
    }

    // -------------------------------------------------------------------------
    // Reading
    // -------------------------------------------------------------------------

    /// Image stored at `coords`, from the cache while it is still queued.
    pub async fn get_image(&self, coords: &Coordinate) -> Result<Option<Arc<Image>>, StorageError> {
        let cached = read_lock(&self.pending).get(coords).cloned();
        if cached.is_some() {
            return Ok(cached);
        }

        let readers = read_lock(&self.committed).get(coords).cloned();
        let Some(readers) = readers else {
            return Ok(None);
        };
        match readers.read_image(coords).await? {
            Some(image) => Ok(Some(Arc::new(image))),
            // Committed but not yet indexed: still cached
            None => Ok(read_lock(&self.pending).get(coords).cloned()),
        }
    }

    /// All images whose coordinate equals `coords` on every axis except
    /// `ignore_axes`, sorted by coordinate.
    pub async fn get_images_matching<S: AsRef<str>>(
        &self,
        coords: &Coordinate,
        ignore_axes: &[S],
    ) -> Result<Vec<Arc<Image>>, StorageError> {
        let target = coords.without_axes(ignore_axes);
        let matches = |c: &&Coordinate| c.without_axes(ignore_axes) == target;

        let mut keys: BTreeSet<Coordinate> = read_lock(&self.committed)
            .keys()
            .filter(matches)
            .cloned()
            .collect();
        keys.extend(read_lock(&self.pending).keys().filter(matches).cloned());

        let mut images = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(image) = self.get_image(key).await? {
                images.push(image);
            }
        }
        Ok(images)
    }

    /// Summary metadata of the dataset.
    pub fn summary_metadata(&self) -> &SummaryMetadata {
        &self.summary
    }

    /// Current display settings.
    pub fn display_settings(&self) -> DisplaySettings {
        read_lock(&self.display).clone()
    }

    /// Replace the display settings. On a finished dataset the settings
    /// stored in every file are rewritten too.
    pub async fn update_display_settings(
        &self,
        settings: DisplaySettings,
    ) -> Result<(), StorageError> {
        *write_lock(&self.display) = settings.clone();

        let state = *self.state.read().await;
        if state == EngineState::ReadOnly {
            for reader in self.readers() {
                reader.rewrite_display_settings(&settings).await?;
            }
        }
        Ok(())
    }

    /// Axis names used by any stored image.
    pub fn axes(&self) -> BTreeSet<String> {
        read_lock(&self.max_indices)
            .axes()
            .map(str::to_string)
            .collect()
    }

    /// Highest index seen on each axis.
    pub fn max_indices(&self) -> Coordinate {
        read_lock(&self.max_indices).clone()
    }

    /// Whether the dataset is read-only (finished or opened from disk).
    pub fn is_finished(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Lifecycle state.
    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    /// Number of stored (or queued) images.
    pub fn num_images(&self) -> usize {
        read_lock(&self.committed).len()
    }

    /// Repairs performed while opening.
    pub fn repair_reports(&self) -> &[RepairReport] {
        &self.repair_reports
    }

    /// Report of the `finished` call, once it completed.
    pub fn finish_report(&self) -> Option<FinishReport> {
        self.finish_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Dataset directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Every stored coordinate, sorted.
    pub fn coordinates(&self) -> Vec<Coordinate> {
        let keys: BTreeSet<Coordinate> = read_lock(&self.committed).keys().cloned().collect();
        keys.into_iter().collect()
    }

    /// Readers of every physical file, in partition then rollover order.
    pub fn readers(&self) -> Vec<Arc<TiffPageReader>> {
        read_lock(&self.partitions)
            .values()
            .flat_map(ReaderSet::readers)
            .collect()
    }

    /// The full OME-XML document, following pointer documents to the file
    /// or sidecar that holds it. `None` before the dataset is finished.
    pub async fn ome_xml(&self) -> Result<Option<String>, StorageError> {
        let readers = self.readers();
        let Some(first) = readers.first() else {
            return Ok(None);
        };
        let Some(doc) = first.ome_document().await? else {
            return Ok(None);
        };
        let Some((file_name, _)) = parse_pointer_document(&doc) else {
            return Ok(Some(doc));
        };

        if let Some(holder) = readers.iter().find(|r| r.filename() == file_name) {
            return holder.ome_document().await;
        }

        let Some(name) = Path::new(&file_name).file_name() else {
            return Ok(None);
        };
        let path = self.directory.join(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "OME-XML holder not found");
                Ok(None)
            }
            Err(e) => Err(IoError::from_std(path.display(), e).into()),
        }
    }
}

/// `*.tif` files of a dataset directory, each partition's files in
/// rollover order.
async fn dataset_files(directory: &Path) -> Result<Vec<PathBuf>, StorageError> {
    let io = |e: std::io::Error| IoError::from_std(directory.display(), e);
    let mut entries = tokio::fs::read_dir(directory).await.map_err(io)?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io)? {
        let name = entry.file_name().to_string_lossy().into_owned();
        // macOS resource forks
        if name.starts_with("._") {
            continue;
        }
        if !(name.ends_with(".tif") || name.ends_with(".TIF")) {
            continue;
        }
        if entry.file_type().await.map_err(io)?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort_by_cached_key(|path| rollover_key(path));
    Ok(paths)
}

/// `(base name, rollover index)` of a dataset file: `stack_Pos0_12.ome.tif`
/// is `("stack_Pos0", 12)` and `stack_Pos0.ome.tif` is `("stack_Pos0", 0)`.
fn rollover_key(path: &Path) -> (String, u64) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = [FILE_EXTENSION, ".tif", ".TIF"]
        .iter()
        .find_map(|ext| name.strip_suffix(ext))
        .unwrap_or(name.as_str());
    match stem.rsplit_once('_') {
        Some((base, index)) if !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()) => {
            match index.parse() {
                Ok(index) => (base.to_string(), index),
                Err(_) => (stem.to_string(), 0),
            }
        }
        _ => (stem.to_string(), 0),
    }
}
