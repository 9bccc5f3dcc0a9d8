//! Background writer thread.
//!
//! One worker per dataset drains the write queue in FIFO order and performs
//! every physical write. It owns all [`FileSet`]s and the OME model, so none
//! of them need locking.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::data::{Coordinate, DisplaySettings, Image, SummaryMetadata};
use crate::error::{IoError, StorageError};
use crate::io::FileHandlePool;
use crate::ome::OmeMetadataBuilder;

use super::fileset::{base_name, FileSet, FileSetSettings, ReaderSet, Trailer};
use super::{read_lock, write_lock, SIDECAR_FILE_NAME};

/// Images accepted but not yet confirmed on disk.
pub(crate) type PendingCache = Arc<RwLock<HashMap<Coordinate, Arc<Image>>>>;

/// Coordinate -> readers of the partition that holds (or will hold) it.
pub(crate) type CommittedIndex = Arc<RwLock<HashMap<Coordinate, ReaderSet>>>;

/// Placeholder of the same length as a real file UUID, used to measure the
/// rendered document before a holder is chosen.
const UUID_PLACEHOLDER: &str = "urn:uuid:00000000-0000-0000-0000-000000000000";

pub(crate) enum WriteTask {
    Image {
        image: Arc<Image>,
        partition: u32,
        readers: ReaderSet,
        done: oneshot::Sender<Result<(), StorageError>>,
    },
    /// Completes once every earlier task has been processed
    Barrier { done: oneshot::Sender<()> },
    /// Finalize all files; the worker exits afterwards
    Finish {
        display: DisplaySettings,
        done: oneshot::Sender<FinishReport>,
    },
}

/// Outcome of finalizing a dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FinishReport {
    /// Number of partitions (FileSets)
    pub partitions: usize,
    /// Every physical file written, in partition then rollover order
    pub files: Vec<String>,
    /// File whose trailer holds the full OME-XML document
    pub metadata_holder: Option<String>,
    /// Sidecar document, when no file had room for it
    pub sidecar: Option<PathBuf>,
    /// TiffData records synthesized for missing planes
    pub gap_filled: usize,
    /// Blank planes written to complete an aborted final frame
    pub blank_planes: usize,
    /// Failures that did not stop finalization
    pub errors: Vec<String>,
}

pub(crate) struct Worker {
    directory: PathBuf,
    summary: Arc<SummaryMetadata>,
    settings: FileSetSettings,
    pool: FileHandlePool,
    filesets: BTreeMap<u32, FileSet>,
    ome: OmeMetadataBuilder,
    pending: PendingCache,
    committed: CommittedIndex,
}

impl Worker {
    pub(crate) fn new(
        directory: PathBuf,
        summary: Arc<SummaryMetadata>,
        settings: FileSetSettings,
        pool: FileHandlePool,
        ome: OmeMetadataBuilder,
        pending: PendingCache,
        committed: CommittedIndex,
    ) -> Self {
        Self {
            directory,
            summary,
            settings,
            pool,
            filesets: BTreeMap::new(),
            ome,
            pending,
            committed,
        }
    }

    /// Process tasks until `Finish` or until every sender is dropped.
    ///
    /// Dropping the queue without `Finish` leaves the files unfinished, as a
    /// crash would.
    pub(crate) fn run(mut self, mut tasks: mpsc::Receiver<WriteTask>) {
        debug!(directory = %self.directory.display(), "writer started");
        while let Some(task) = tasks.blocking_recv() {
            match task {
                WriteTask::Image {
                    image,
                    partition,
                    readers,
                    done,
                } => {
                    let result = self.write(&image, partition, readers);
                    self.settle(&image, &result);
                    let _ = done.send(result);
                }
                WriteTask::Barrier { done } => {
                    let _ = done.send(());
                }
                WriteTask::Finish { display, done } => {
                    let report = self.finish(&display);
                    let _ = done.send(report);
                    return;
                }
            }
        }
        warn!(
            directory = %self.directory.display(),
            "write queue closed before the dataset was finished"
        );
    }

    fn write(
        &mut self,
        image: &Image,
        partition: u32,
        readers: ReaderSet,
    ) -> Result<(), StorageError> {
        let fileset = match self.filesets.entry(partition) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let name = base_name(
                    &self.summary.prefix,
                    self.settings.split_by_position,
                    partition,
                    image.tags().position_name.as_deref(),
                );
                entry.insert(FileSet::create(
                    &self.directory,
                    name,
                    partition,
                    self.summary.clone(),
                    self.settings,
                    self.pool.clone(),
                    readers,
                )?)
            }
        };
        fileset.write_image(image, &mut self.ome)?;
        Ok(())
    }

    /// Release the pending copy once the write is settled.
    ///
    /// Only the exact image that was written is removed; a newer image for
    /// the same coordinate stays cached. A failed write also withdraws the
    /// committed entry unless a file already holds the coordinate.
    fn settle(&self, image: &Arc<Image>, result: &Result<(), StorageError>) {
        let coords = image.coords();

        if let Err(e) = result {
            error!(coords = %coords, error = %e, "failed to write image");
            let mut committed = write_lock(&self.committed);
            let superseded = read_lock(&self.pending)
                .get(coords)
                .is_some_and(|cached| !Arc::ptr_eq(cached, image));
            let on_disk = committed
                .get(coords)
                .is_some_and(|readers| readers.contains(coords));
            if !superseded && !on_disk {
                committed.remove(coords);
            }
        }

        let mut pending = write_lock(&self.pending);
        if pending
            .get(coords)
            .is_some_and(|cached| Arc::ptr_eq(cached, image))
        {
            pending.remove(coords);
        }
    }

    fn finish(&mut self, display: &DisplaySettings) -> FinishReport {
        let mut report = FinishReport {
            partitions: self.filesets.len(),
            ..Default::default()
        };

        for fileset in self.filesets.values_mut() {
            match fileset.finish_aborted_acq_if_needed(&mut self.ome) {
                Ok(blanks) => report.blank_planes += blanks,
                Err(e) => {
                    error!(partition = %fileset.base_name(), error = %e, "failed to finish partition");
                    report.errors.push(format!("{}: {e}", fileset.base_name()));
                }
            }
        }

        if self.filesets.is_empty() {
            info!("dataset finished without images");
            return report;
        }

        report.gap_filled = self.ome.complete();
        let doc_len = self.ome.to_xml(UUID_PLACEHOLDER).len();

        let holder = self
            .filesets
            .iter()
            .filter(|(_, fileset)| fileset.has_space_for_full_omexml(doc_len))
            .max_by_key(|(_, fileset)| fileset.trailer_capacity())
            .map(|(&partition, fileset)| {
                let (name, uuid) = fileset.current_file();
                (partition, name.to_string(), uuid.to_string())
            });

        let placed = match holder {
            Some((partition, name, uuid)) => self
                .write_full_document(partition, &name, &uuid, display, &mut report)
                .then_some((name, uuid)),
            None => None,
        };

        let (target_name, target_uuid) = match placed {
            Some((name, uuid)) => {
                report.metadata_holder = Some(name.clone());
                (name, uuid)
            }
            None => {
                let uuid = format!("urn:uuid:{}", Uuid::new_v4());
                let xml = self.ome.to_xml(&uuid);
                let path = self.directory.join(SIDECAR_FILE_NAME);
                match write_sidecar(&path, &xml) {
                    Ok(()) => {
                        info!(path = %path.display(), bytes = xml.len(), "OME-XML written to sidecar");
                        report.sidecar = Some(path);
                    }
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "failed to write OME-XML sidecar");
                        report.errors.push(e.to_string());
                    }
                }
                (SIDECAR_FILE_NAME.to_string(), uuid)
            }
        };

        // The holder is already closed; every other partition points to it
        for fileset in self.filesets.values_mut() {
            let trailer = Trailer::Pointer {
                file_name: &target_name,
                uuid: &target_uuid,
            };
            close_fileset(fileset, trailer, display, &mut report);
        }

        report.files = self.filesets.values().flat_map(FileSet::files).collect();
        info!(
            partitions = report.partitions,
            files = report.files.len(),
            gap_filled = report.gap_filled,
            blank_planes = report.blank_planes,
            errors = report.errors.len(),
            "dataset finished"
        );
        report
    }

    /// Close the holder partition with the full document. Returns whether the
    /// document is now on disk.
    fn write_full_document(
        &mut self,
        partition: u32,
        name: &str,
        uuid: &str,
        display: &DisplaySettings,
        report: &mut FinishReport,
    ) -> bool {
        let xml = self.ome.to_xml(uuid);
        let Some(fileset) = self.filesets.get_mut(&partition) else {
            return false;
        };
        match fileset.close(Trailer::Full(&xml), display) {
            Ok(()) => {
                info!(file = %name, bytes = xml.len(), "OME-XML stored in dataset file");
                true
            }
            Err(e) => {
                error!(file = %name, error = %e, "failed to store OME-XML, falling back to sidecar");
                report.errors.push(format!("{}: {e}", fileset.base_name()));
                false
            }
        }
    }
}

fn close_fileset(
    fileset: &mut FileSet,
    trailer: Trailer<'_>,
    display: &DisplaySettings,
    report: &mut FinishReport,
) {
    if let Err(e) = fileset.close(trailer, display) {
        error!(partition = %fileset.base_name(), error = %e, "failed to close partition");
        report.errors.push(format!("{}: {e}", fileset.base_name()));
    }
}

fn write_sidecar(path: &Path, xml: &str) -> Result<(), StorageError> {
    let io = |e: std::io::Error| IoError::from_std(path.display(), e);
    let mut file = File::create(path).map_err(io)?;
    file.write_all(xml.as_bytes()).map_err(io)?;
    file.sync_all().map_err(io)?;
    Ok(())
}
