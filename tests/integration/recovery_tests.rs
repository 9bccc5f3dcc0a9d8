//! Opening datasets whose acquisition never finished.
//!
//! Tests verify:
//! - Each repair policy on files without an index map
//! - Rewritten files open cleanly afterwards
//! - Confirmation hooks can veto a rewrite

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ometiff_store::{
    OpenOptions, RepairPolicy, StorageConfig, StorageEngine, StorageError,
};

use super::test_utils::{acquisition_order, gray16_pixels, seed, summary, write_all, SIDE};

/// Write a 2x2x1 acquisition and drop the engine without finishing it.
async fn crashed_dataset(dir: &std::path::Path) {
    let config = StorageConfig::default().with_split_by_position(false);
    let engine = write_all(dir, summary(2, 2, 1), config, &acquisition_order(2, 2, 1)).await;
    drop(engine);
}

#[tokio::test]
async fn test_never_policy_refuses_unfinished_file() {
    let dir = tempfile::tempdir().unwrap();
    crashed_dataset(dir.path()).await;

    let options = OpenOptions::default().with_repair(RepairPolicy::Never);
    let result = StorageEngine::open_existing_with(dir.path(), options).await;
    assert!(matches!(result, Err(StorageError::MetadataCorruption { .. })));
}

#[tokio::test]
async fn test_in_memory_repair_recovers_images() {
    let dir = tempfile::tempdir().unwrap();
    crashed_dataset(dir.path()).await;
    let before = std::fs::read(dir.path().join("stack.ome.tif")).unwrap();

    let engine = StorageEngine::open_existing(dir.path()).await.unwrap();
    assert_eq!(engine.num_images(), 4);
    assert_eq!(engine.repair_reports().len(), 1);
    let report = &engine.repair_reports()[0];
    assert_eq!(report.recovered_images, 4);
    assert!(!report.rewritten);

    for coords in acquisition_order(2, 2, 1) {
        let stored = engine.get_image(&coords).await.unwrap().unwrap();
        assert_eq!(stored.pixels().as_ref(), gray16_pixels(SIDE, seed(&coords)).as_slice());
    }
    // No OME-XML was ever written
    assert!(engine.ome_xml().await.unwrap().is_none());

    // The file itself is untouched
    drop(engine);
    let after = std::fs::read(dir.path().join("stack.ome.tif")).unwrap();
    assert_eq!(before, after);
    let again = StorageEngine::open_existing(dir.path()).await.unwrap();
    assert_eq!(again.repair_reports().len(), 1);
}

#[tokio::test]
async fn test_rewrite_repair_persists_index() {
    let dir = tempfile::tempdir().unwrap();
    crashed_dataset(dir.path()).await;

    let options = OpenOptions::default().with_repair(RepairPolicy::Rewrite);
    let engine = StorageEngine::open_existing_with(dir.path(), options).await.unwrap();
    assert_eq!(engine.num_images(), 4);
    assert!(engine.repair_reports()[0].rewritten);
    drop(engine);

    let options = OpenOptions::default().with_repair(RepairPolicy::Never);
    let reopened = StorageEngine::open_existing_with(dir.path(), options).await.unwrap();
    assert!(reopened.repair_reports().is_empty());
    assert_eq!(reopened.num_images(), 4);
    for coords in acquisition_order(2, 2, 1) {
        let stored = reopened.get_image(&coords).await.unwrap().unwrap();
        assert_eq!(stored.pixels().as_ref(), gray16_pixels(SIDE, seed(&coords)).as_slice());
    }
}

#[tokio::test]
async fn test_declined_rewrite_repairs_in_memory() {
    let dir = tempfile::tempdir().unwrap();
    crashed_dataset(dir.path()).await;

    let asked = Arc::new(AtomicUsize::new(0));
    let options = {
        let asked = asked.clone();
        OpenOptions::default()
            .with_repair(RepairPolicy::Rewrite)
            .with_confirmation(move |_| {
                asked.fetch_add(1, Ordering::SeqCst);
                false
            })
    };
    let engine = StorageEngine::open_existing_with(dir.path(), options).await.unwrap();
    assert_eq!(asked.load(Ordering::SeqCst), 1);
    assert_eq!(engine.num_images(), 4);
    assert!(!engine.repair_reports()[0].rewritten);
    drop(engine);

    let options = OpenOptions::default().with_repair(RepairPolicy::Never);
    assert!(StorageEngine::open_existing_with(dir.path(), options).await.is_err());
}

#[tokio::test]
async fn test_truncated_tail_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    crashed_dataset(dir.path()).await;

    // Cut the last plane in half
    let path = dir.path().join("stack.ome.tif");
    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - (SIDE * SIDE) as u64).unwrap();
    drop(file);

    let engine = StorageEngine::open_existing(dir.path()).await.unwrap();
    assert_eq!(engine.num_images(), 3);
    assert_eq!(engine.repair_reports()[0].recovered_images, 3);
}
