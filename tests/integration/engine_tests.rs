//! End-to-end tests of the storage engine lifecycle.
//!
//! Tests verify:
//! - Images written, finished and reopened read back unchanged
//! - Reads are served while the writer is still behind
//! - File naming, partitioning and rollover
//! - Display settings rewritten after the acquisition

use std::collections::BTreeSet;
use std::sync::Arc;

use ometiff_store::{
    ChannelDisplay, Coordinate, DisplaySettings, EngineState, Image, ImageTags, OpenOptions,
    PixelType, RepairPolicy, StorageConfig, StorageEngine, StorageError,
};

use super::test_utils::{
    acquisition_order, czt, cztp, file_names, gray16_pixels, image, image_sized, seed, summary,
    tagged_image, write_all, SIDE,
};

fn ct(c: u32, t: u32) -> Coordinate {
    Coordinate::builder().channel(c).time(t).build()
}

// =============================================================================
// Write, finish, reopen
// =============================================================================

#[tokio::test]
async fn test_two_channels_two_frames_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let coords = vec![ct(0, 0), ct(1, 0), ct(0, 1), ct(1, 1)];
    let config = StorageConfig::default().with_split_by_position(false);

    let engine = StorageEngine::create(dir.path(), summary(2, 1, 2), config)
        .await
        .unwrap();
    for c in &coords {
        engine.put_image(tagged_image(c.clone())).await.unwrap();
    }
    let report = engine.finished().await.unwrap().unwrap();
    assert!(report.errors.is_empty());
    assert_eq!(report.files, vec!["stack.ome.tif".to_string()]);
    drop(engine);

    let reopened = StorageEngine::open_existing(dir.path()).await.unwrap();
    assert_eq!(reopened.num_images(), 4);
    assert!(reopened.is_finished());
    assert_eq!(reopened.state().await, EngineState::ReadOnly);

    let axes = reopened.axes();
    assert!(axes.contains("time"));
    assert!(axes.contains("channel"));
    assert_eq!(reopened.max_indices(), ct(1, 1));

    for c in &coords {
        let stored = reopened.get_image(c).await.unwrap().unwrap();
        assert_eq!(stored.width(), SIDE);
        assert_eq!(stored.height(), SIDE);
        assert_eq!(stored.pixel_type(), PixelType::Gray16);
        assert_eq!(stored.pixels().as_ref(), gray16_pixels(SIDE, seed(c)).as_slice());
        assert_eq!(stored.tags(), tagged_image(c.clone()).tags());
    }
    assert!(reopened.get_image(&ct(2, 0)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_summary_metadata_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut summary = summary(1, 1, 1);
    summary.prefix = "run".to_string();
    summary.comments = "bead sample".to_string();

    let engine = write_all(
        dir.path(),
        summary.clone(),
        StorageConfig::default(),
        &[cztp(0, 0, 0, 0)],
    )
    .await;
    engine.finished().await.unwrap();

    let reopened = StorageEngine::open_existing(dir.path()).await.unwrap();
    assert_eq!(reopened.summary_metadata(), &summary);
    assert!(dir.path().join("run_stack_Pos0.ome.tif").exists());
}

#[tokio::test]
async fn test_lifecycle_after_finish() {
    let dir = tempfile::tempdir().unwrap();
    let engine = write_all(
        dir.path(),
        summary(1, 1, 1),
        StorageConfig::default(),
        &[cztp(0, 0, 0, 0)],
    )
    .await;

    assert_eq!(engine.state().await, EngineState::WriteMode);
    assert!(!engine.is_finished());
    assert!(engine.finish_report().is_none());

    let report = engine.finished().await.unwrap().unwrap();
    assert_eq!(engine.state().await, EngineState::ReadOnly);
    assert_eq!(engine.finish_report(), Some(report));

    // Second finish is a no-op, and nothing is left to flush
    assert!(engine.finished().await.unwrap().is_none());
    engine.flush().await.unwrap();

    let late = engine.put_image(image(cztp(0, 0, 1, 0))).await;
    assert!(matches!(late, Err(StorageError::Configuration(_))));

    // Still readable through the same engine
    let stored = engine.get_image(&cztp(0, 0, 0, 0)).await.unwrap();
    assert!(stored.is_some());
}

#[tokio::test]
async fn test_finish_without_images() {
    let dir = tempfile::tempdir().unwrap();
    let engine = StorageEngine::create(dir.path(), summary(1, 1, 1), StorageConfig::default())
        .await
        .unwrap();

    let report = engine.finished().await.unwrap().unwrap();
    assert_eq!(report.partitions, 0);
    assert!(report.files.is_empty());
    assert!(report.metadata_holder.is_none());
    assert!(file_names(dir.path()).is_empty());
}

// =============================================================================
// Reading while writing
// =============================================================================

#[tokio::test]
async fn test_queued_image_is_readable_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let engine = StorageEngine::create(dir.path(), summary(1, 1, 3), StorageConfig::default())
        .await
        .unwrap();

    for t in 0..3 {
        let coords = cztp(0, 0, t, 0);
        let pending = engine.put_image(image(coords.clone())).await.unwrap();
        assert_eq!(pending.coords(), &coords);

        // Served from the cache or the file, whichever holds it now
        let stored = engine.get_image(&coords).await.unwrap().unwrap();
        assert_eq!(stored.pixels().as_ref(), gray16_pixels(SIDE, seed(&coords)).as_slice());

        pending.wait().await.unwrap();
        let stored = engine.get_image(&coords).await.unwrap().unwrap();
        assert_eq!(stored.pixels().as_ref(), gray16_pixels(SIDE, seed(&coords)).as_slice());
    }
    assert_eq!(engine.num_images(), 3);
    assert_eq!(engine.max_indices().time(), 2);
    engine.finished().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_readers_during_acquisition() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::default().with_write_queue_capacity(2);
    let engine = Arc::new(
        StorageEngine::create(dir.path(), summary(2, 4, 2), config)
            .await
            .unwrap(),
    );
    let order = acquisition_order(2, 4, 2);

    let writer = {
        let engine = engine.clone();
        let order = order.clone();
        tokio::spawn(async move {
            for coords in order {
                engine.put_image(image(coords)).await.unwrap();
            }
        })
    };

    let reader = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut seen = BTreeSet::new();
            while seen.len() < 16 {
                for coords in engine.coordinates() {
                    let stored = engine.get_image(&coords).await.unwrap();
                    let stored = stored.expect("indexed coordinate must be readable");
                    assert_eq!(
                        stored.pixels().as_ref(),
                        gray16_pixels(SIDE, seed(&coords)).as_slice()
                    );
                    seen.insert(coords);
                }
                tokio::task::yield_now().await;
            }
        })
    };

    writer.await.unwrap();
    reader.await.unwrap();

    let report = engine.finished().await.unwrap().unwrap();
    assert!(report.errors.is_empty());
    for coords in &order {
        assert!(engine.get_image(coords).await.unwrap().is_some());
    }
}

#[tokio::test]
async fn test_failed_write_is_reported_and_withdrawn() {
    let dir = tempfile::tempdir().unwrap();
    // A directory where position 1's file belongs makes its creation fail
    std::fs::create_dir(dir.path().join("stack_Pos1.ome.tif")).unwrap();

    let engine = StorageEngine::create(dir.path(), summary(1, 1, 1), StorageConfig::default())
        .await
        .unwrap();
    let good = cztp(0, 0, 0, 0);
    let bad = cztp(0, 0, 0, 1);

    engine.put_image(image(good.clone())).await.unwrap().wait().await.unwrap();
    let result = engine.put_image(image(bad.clone())).await.unwrap().wait().await;
    assert!(matches!(result, Err(StorageError::Io(_))), "{result:?}");

    assert!(engine.get_image(&bad).await.unwrap().is_none());
    assert!(!engine.coordinates().contains(&bad));
    assert_eq!(engine.num_images(), 1);
    assert!(engine.get_image(&good).await.unwrap().is_some());

    let report = engine.finished().await.unwrap().unwrap();
    assert_eq!(report.files, vec!["stack_Pos0.ome.tif".to_string()]);
    assert!(report.errors.is_empty());

    let reopened = StorageEngine::open_existing(dir.path()).await.unwrap();
    assert_eq!(reopened.num_images(), 1);
}

#[tokio::test]
async fn test_images_matching_ignores_axes() {
    let dir = tempfile::tempdir().unwrap();
    let order = acquisition_order(2, 3, 1);
    let engine = write_all(dir.path(), summary(2, 3, 1), StorageConfig::default(), &order).await;

    let target = order[0].with("channel", 1);
    let stack = engine.get_images_matching(&target, &["z"]).await.unwrap();
    let zs: Vec<u32> = stack.iter().map(|i| i.coords().z()).collect();
    assert_eq!(zs, vec![0, 1, 2]);
    assert!(stack.iter().all(|i| i.coords().channel() == 1));

    let everything = engine
        .get_images_matching(&target, &["z", "channel"])
        .await
        .unwrap();
    assert_eq!(everything.len(), 6);

    let exact = engine.get_images_matching(&target, &[] as &[&str]).await.unwrap();
    assert_eq!(exact.len(), 1);
    engine.finished().await.unwrap();
}

// =============================================================================
// Partitioning and rollover
// =============================================================================

#[tokio::test]
async fn test_positions_split_into_files() {
    let dir = tempfile::tempdir().unwrap();
    let coords = vec![cztp(0, 0, 0, 0), cztp(0, 0, 0, 1), cztp(0, 0, 1, 0), cztp(0, 0, 1, 1)];
    let engine = write_all(dir.path(), summary(1, 1, 2), StorageConfig::default(), &coords).await;
    let report = engine.finished().await.unwrap().unwrap();

    assert_eq!(report.partitions, 2);
    assert_eq!(
        file_names(dir.path()),
        vec!["stack_Pos0.ome.tif".to_string(), "stack_Pos1.ome.tif".to_string()]
    );

    let reopened = StorageEngine::open_existing(dir.path()).await.unwrap();
    assert_eq!(reopened.num_images(), 4);
    for reader in reopened.readers() {
        assert_eq!(reader.len(), 2);
    }
}

#[tokio::test]
async fn test_position_names_in_file_names() {
    let dir = tempfile::tempdir().unwrap();
    let engine = StorageEngine::create(dir.path(), summary(1, 1, 1), StorageConfig::default())
        .await
        .unwrap();
    let plain = image(cztp(0, 0, 0, 3));
    let tags = ImageTags {
        position_name: Some("Well A1".to_string()),
        ..plain.tags().clone()
    };
    let named = Image::new(
        plain.coords().clone(),
        plain.width(),
        plain.height(),
        plain.pixel_type(),
        plain.pixels().clone(),
        tags,
    )
    .unwrap();
    engine.put_image(named).await.unwrap();
    engine.finished().await.unwrap();

    assert_eq!(file_names(dir.path()), vec!["stack_Well_A1.ome.tif".to_string()]);
}

#[tokio::test]
async fn test_rollover_to_continuation_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::default()
        .with_split_by_position(false)
        .with_file_limits(40_000, 1024);
    let engine = StorageEngine::create(dir.path(), summary(1, 1, 12), config)
        .await
        .unwrap();

    // 64x64 Gray16 planes are 8 KiB each
    let coords: Vec<Coordinate> = (0..12).map(|t| cztp(0, 0, t, 0)).collect();
    for c in &coords {
        engine.put_image(image_sized(c.clone(), 64)).await.unwrap();
    }
    let report = engine.finished().await.unwrap().unwrap();
    assert!(report.errors.is_empty());
    assert!(report.files.len() >= 2, "files: {:?}", report.files);
    assert_eq!(report.files[0], "stack.ome.tif");
    assert_eq!(report.files[1], "stack_1.ome.tif");

    let reopened = StorageEngine::open_existing(dir.path()).await.unwrap();
    assert_eq!(reopened.num_images(), 12);
    let readers = reopened.readers();
    assert_eq!(readers[0].continuation().as_deref(), Some("stack_1.ome.tif"));
    assert!(readers.last().unwrap().continuation().is_none());

    for c in &coords {
        let stored = reopened.get_image(c).await.unwrap().unwrap();
        assert_eq!(stored.pixels().as_ref(), gray16_pixels(64, seed(c)).as_slice());
    }
}

#[tokio::test]
async fn test_latest_copy_wins_across_many_continuation_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::default()
        .with_split_by_position(false)
        .with_file_limits(4096, 0);
    let engine = StorageEngine::create(dir.path(), summary(1, 1, 1), config)
        .await
        .unwrap();

    // Each 8 KiB plane fills a file, so every copy lands in its own file
    let coords = czt(0, 0, 0);
    for copy in 0..12 {
        let image = Image::new(
            coords.clone(),
            64,
            64,
            PixelType::Gray16,
            gray16_pixels(64, copy),
            ImageTags::default(),
        )
        .unwrap();
        engine.put_image(image).await.unwrap().wait().await.unwrap();
    }
    let latest = gray16_pixels(64, 11);
    let live = engine.get_image(&coords).await.unwrap().unwrap();
    assert_eq!(live.pixels().as_ref(), latest.as_slice());

    let report = engine.finished().await.unwrap().unwrap();
    assert_eq!(report.files.len(), 12);
    assert_eq!(report.files[11], "stack_11.ome.tif");
    drop(engine);

    let reopened = StorageEngine::open_existing(dir.path()).await.unwrap();
    assert_eq!(reopened.num_images(), 1);
    let stored = reopened.get_image(&coords).await.unwrap().unwrap();
    assert_eq!(stored.pixels().as_ref(), latest.as_slice());
    let names: Vec<String> = reopened
        .readers()
        .iter()
        .map(|r| r.filename().to_string())
        .collect();
    assert_eq!(names, report.files);
}

#[tokio::test]
async fn test_axis_limit_continues_in_new_file() {
    let dir = tempfile::tempdir().unwrap();
    let engine = StorageEngine::create(dir.path(), summary(1, 1, 33), StorageConfig::default())
        .await
        .unwrap();

    // Every image adds one axis; a file's index holds at most 32
    let coords: Vec<Coordinate> = (0..33)
        .map(|t| Coordinate::builder().time(t).axis(format!("custom{t}"), 0).build())
        .collect();
    let mut writes = Vec::new();
    for c in &coords {
        writes.push(engine.put_image(image(c.clone())).await.unwrap());
    }
    for write in writes {
        write.wait().await.unwrap();
    }

    let report = engine.finished().await.unwrap().unwrap();
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(
        report.files,
        vec!["stack_Pos0.ome.tif".to_string(), "stack_Pos0_1.ome.tif".to_string()]
    );
    assert_eq!(report.metadata_holder.as_deref(), Some("stack_Pos0_1.ome.tif"));
    drop(engine);

    let options = OpenOptions::default().with_repair(RepairPolicy::Never);
    let reopened = StorageEngine::open_existing_with(dir.path(), options).await.unwrap();
    assert_eq!(reopened.num_images(), 33);
    for c in &coords {
        assert!(reopened.get_image(c).await.unwrap().is_some(), "{c}");
    }
    assert!(reopened.ome_xml().await.unwrap().is_some());
}

#[tokio::test]
async fn test_unencodable_coordinates_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let engine = StorageEngine::create(dir.path(), summary(1, 1, 1), StorageConfig::default())
        .await
        .unwrap();

    let wide: Coordinate = (0..33).map(|i| (format!("axis{i}"), 0)).collect();
    let long = Coordinate::builder().axis("a".repeat(70_000), 0).build();
    for coords in [wide, long] {
        let result = engine.put_image(image(coords.clone())).await;
        assert!(matches!(result, Err(StorageError::InvalidCoordinate(_))));
        assert!(engine.get_image(&coords).await.unwrap().is_none());
    }
    assert_eq!(engine.num_images(), 0);
    engine.finished().await.unwrap();
}

#[tokio::test]
async fn test_separate_metadata_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::default().with_separate_metadata_file(true);
    let engine = write_all(dir.path(), summary(1, 1, 1), config, &[cztp(0, 0, 0, 0)]).await;
    engine.finished().await.unwrap();

    let text = std::fs::read_to_string(dir.path().join("stack_Pos0_metadata.txt")).unwrap();
    assert!(text.contains("FrameKey-0-0-0"));
}

// =============================================================================
// Display settings
// =============================================================================

#[tokio::test]
async fn test_display_settings_rewritten_after_finish() {
    let dir = tempfile::tempdir().unwrap();
    let coords = vec![cztp(0, 0, 0, 0), cztp(1, 0, 0, 0), cztp(0, 0, 0, 1), cztp(1, 0, 0, 1)];
    let engine = write_all(dir.path(), summary(2, 1, 1), StorageConfig::default(), &coords).await;
    engine.finished().await.unwrap();

    let mut settings = engine.display_settings();
    assert_eq!(settings.channels.len(), 2);
    settings.channels[1].max = 1234;
    settings.channels[1].name = "GFP".to_string();
    engine.update_display_settings(settings.clone()).await.unwrap();
    assert_eq!(engine.display_settings(), settings);

    let reopened = StorageEngine::open_existing(dir.path()).await.unwrap();
    assert_eq!(reopened.display_settings(), settings);
    for reader in reopened.readers() {
        assert_eq!(reader.display_settings(), Some(settings.clone()));
    }
}

#[tokio::test]
async fn test_large_display_settings_are_relocated() {
    let dir = tempfile::tempdir().unwrap();
    let engine = write_all(
        dir.path(),
        summary(1, 1, 1),
        StorageConfig::default(),
        &[cztp(0, 0, 0, 0)],
    )
    .await;
    engine.finished().await.unwrap();
    drop(engine);

    let reopened = StorageEngine::open_existing(dir.path()).await.unwrap();
    let mut settings = DisplaySettings::default();
    for c in 0..400 {
        settings.channels.push(ChannelDisplay {
            name: format!("a rather long channel name number {c}"),
            color: 0x00FF00,
            min: 0,
            max: 65535,
        });
    }
    reopened.update_display_settings(settings.clone()).await.unwrap();
    drop(reopened);

    let again = StorageEngine::open_existing(dir.path()).await.unwrap();
    assert_eq!(again.display_settings(), settings);
    assert_eq!(again.num_images(), 1);
}
