//! OME-XML placement and completion tests.
//!
//! Tests verify:
//! - The full document lands in one file and every other file points to it
//! - Oversized documents fall back to the sidecar file
//! - Missing planes are filled from the nearest written plane
//! - Aborted acquisitions are padded with blank planes
//! - IFD numbers follow the order images were submitted in

use ometiff_store::ome::parse_pointer_document;
use ometiff_store::{OpenOptions, RepairPolicy, StorageConfig, StorageEngine};

use super::test_utils::{count, czt, cztp, file_names, summary, write_all};

// =============================================================================
// Metadata holder and pointers
// =============================================================================

#[tokio::test]
async fn test_no_document_before_finish() {
    let dir = tempfile::tempdir().unwrap();
    let engine = write_all(
        dir.path(),
        summary(1, 1, 1),
        StorageConfig::default(),
        &[cztp(0, 0, 0, 0)],
    )
    .await;

    assert!(engine.ome_xml().await.unwrap().is_none());
    engine.finished().await.unwrap();
    assert!(engine.ome_xml().await.unwrap().is_some());
}

#[tokio::test]
async fn test_holder_and_pointer_documents() {
    let dir = tempfile::tempdir().unwrap();
    let coords = vec![cztp(0, 0, 0, 0), cztp(0, 0, 0, 1), cztp(0, 0, 1, 0), cztp(0, 0, 1, 1)];
    let engine = write_all(dir.path(), summary(1, 1, 2), StorageConfig::default(), &coords).await;
    let report = engine.finished().await.unwrap().unwrap();

    let holder = report.metadata_holder.clone().unwrap();
    assert!(report.sidecar.is_none());
    assert!(report.files.contains(&holder));

    let reopened = StorageEngine::open_existing(dir.path()).await.unwrap();
    let mut full = 0;
    let mut pointers = 0;
    let mut holder_uuid = None;
    for reader in reopened.readers() {
        let doc = reader.ome_document().await.unwrap().unwrap();
        match parse_pointer_document(&doc) {
            Some((file_name, uuid)) => {
                assert_eq!(file_name, holder);
                pointers += 1;
                holder_uuid = Some(uuid);
            }
            None => {
                assert_eq!(reader.filename(), holder);
                assert_eq!(count(&doc, "<Image "), 2);
                full += 1;
            }
        }
    }
    assert_eq!((full, pointers), (1, 1));

    // The pointer names the holder by the UUID on its root element
    let xml = reopened.ome_xml().await.unwrap().unwrap();
    let uuid = holder_uuid.unwrap();
    assert!(uuid.starts_with("urn:uuid:"));
    assert!(xml.contains(&format!("UUID=\"{uuid}\"")));
    assert_eq!(count(&xml, "<TiffData "), 4);
    assert_eq!(count(&xml, "<Plane "), 4);
    assert!(xml.contains("SizeT=\"2\""));
}

#[tokio::test]
async fn test_document_references_files_by_uuid() {
    let dir = tempfile::tempdir().unwrap();
    let coords = vec![cztp(0, 0, 0, 0), cztp(0, 0, 0, 1)];
    let engine = write_all(dir.path(), summary(1, 1, 1), StorageConfig::default(), &coords).await;
    engine.finished().await.unwrap();

    let xml = engine.ome_xml().await.unwrap().unwrap();
    assert!(xml.contains("FileName=\"stack_Pos0.ome.tif\""));
    assert!(xml.contains("FileName=\"stack_Pos1.ome.tif\""));
    assert!(xml.contains("PhysicalSizeX=\"0.5\""));
    assert!(xml.contains("Name=\"Ch0\""));
}

#[tokio::test]
async fn test_sidecar_when_no_file_has_room() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::default()
        .with_split_by_position(false)
        .with_file_limits(64 * 1024, 1024);
    let coords = vec![cztp(0, 0, 0, 0), cztp(1, 0, 0, 0)];
    let engine = write_all(dir.path(), summary(2, 1, 1), config, &coords).await;
    let report = engine.finished().await.unwrap().unwrap();

    assert!(report.metadata_holder.is_none());
    let sidecar = report.sidecar.clone().unwrap();
    assert_eq!(sidecar, dir.path().join("OMEXMLMetadata.ome"));
    assert!(file_names(dir.path()).contains(&"OMEXMLMetadata.ome".to_string()));

    let on_disk = std::fs::read_to_string(&sidecar).unwrap();
    assert_eq!(count(&on_disk, "<TiffData "), 2);

    let reopened = StorageEngine::open_existing(dir.path()).await.unwrap();
    let reader = &reopened.readers()[0];
    let pointer = reader.ome_document().await.unwrap().unwrap();
    let (file_name, _) = parse_pointer_document(&pointer).unwrap();
    assert_eq!(file_name, "OMEXMLMetadata.ome");

    assert_eq!(reopened.ome_xml().await.unwrap(), Some(on_disk));
}

// =============================================================================
// Completion of incomplete acquisitions
// =============================================================================

#[tokio::test]
async fn test_gaps_filled_from_nearest_slice() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::default().with_split_by_position(false);
    let coords = vec![cztp(0, 0, 0, 0), cztp(0, 2, 0, 0), cztp(1, 1, 0, 0)];
    let engine = write_all(dir.path(), summary(2, 3, 2), config, &coords).await;
    let report = engine.finished().await.unwrap().unwrap();

    assert_eq!(report.blank_planes, 0);
    assert_eq!(report.gap_filled, 3);

    let xml = engine.ome_xml().await.unwrap().unwrap();
    // Trimmed to the frames reached
    assert!(xml.contains("SizeT=\"1\""));
    assert!(xml.contains("SizeZ=\"3\""));
    assert_eq!(count(&xml, "<TiffData "), 6);
    assert_eq!(count(&xml, "<Plane "), 3);

    // (c0, z1) borrows the plane below it, IFD 0
    assert!(xml.contains("<TiffData IFD=\"0\" FirstC=\"0\" FirstZ=\"1\" FirstT=\"0\""));
    // (c1, z0) and (c1, z2) both borrow (c1, z1), IFD 2
    assert!(xml.contains("<TiffData IFD=\"2\" FirstC=\"1\" FirstZ=\"0\" FirstT=\"0\""));
    assert!(xml.contains("<TiffData IFD=\"2\" FirstC=\"1\" FirstZ=\"2\" FirstT=\"0\""));

    // Gap filling does not add images
    let reopened = StorageEngine::open_existing(dir.path()).await.unwrap();
    assert_eq!(reopened.num_images(), 3);
}

#[tokio::test]
async fn test_aborted_acquisition_padded_with_blanks() {
    let dir = tempfile::tempdir().unwrap();
    // Frame 0 complete, frame 1 stopped after its first plane
    let coords = vec![
        cztp(0, 0, 0, 0),
        cztp(0, 1, 0, 0),
        cztp(1, 0, 0, 0),
        cztp(1, 1, 0, 0),
        cztp(0, 0, 1, 0),
    ];
    let engine = write_all(dir.path(), summary(2, 2, 2), StorageConfig::default(), &coords).await;
    let report = engine.finished().await.unwrap().unwrap();

    assert_eq!(report.blank_planes, 3);
    assert_eq!(report.gap_filled, 0);

    let xml = engine.ome_xml().await.unwrap().unwrap();
    assert!(xml.contains("SizeT=\"2\""));
    assert_eq!(count(&xml, "<TiffData "), 8);
    assert_eq!(count(&xml, "<Plane "), 5);

    // Blank planes occupy IFDs but are not indexed
    let reopened = StorageEngine::open_existing(dir.path()).await.unwrap();
    assert_eq!(reopened.num_images(), 5);
    assert!(reopened.get_image(&cztp(1, 1, 1, 0)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_out_of_order_acquisition_not_padded() {
    let dir = tempfile::tempdir().unwrap();
    let coords = vec![cztp(1, 0, 0, 0), cztp(0, 0, 0, 0), cztp(0, 0, 1, 0)];
    let engine = write_all(dir.path(), summary(2, 1, 2), StorageConfig::default(), &coords).await;
    let report = engine.finished().await.unwrap().unwrap();

    assert_eq!(report.blank_planes, 0);
    // (c1, t1) is synthesized from (c1, t0) instead
    assert_eq!(report.gap_filled, 1);
    let xml = engine.ome_xml().await.unwrap().unwrap();
    assert!(xml.contains("<TiffData IFD=\"0\" FirstC=\"1\" FirstZ=\"0\" FirstT=\"1\""));
}

#[tokio::test]
async fn test_time_first_acquisition_not_padded() {
    let dir = tempfile::tempdir().unwrap();
    let mut summary = summary(2, 1, 2);
    summary.time_first = true;
    let coords = vec![cztp(0, 0, 0, 0), cztp(1, 0, 0, 0), cztp(0, 0, 1, 0)];
    let engine = write_all(dir.path(), summary, StorageConfig::default(), &coords).await;
    let report = engine.finished().await.unwrap().unwrap();

    assert_eq!(report.blank_planes, 0);
    assert_eq!(report.gap_filled, 1);
}

#[tokio::test]
async fn test_abort_after_first_frame() {
    let dir = tempfile::tempdir().unwrap();
    // Two channels, two frames intended; only frame 0 arrives
    let coords = vec![czt(0, 0, 0), czt(1, 0, 0)];
    let engine = write_all(dir.path(), summary(2, 1, 2), StorageConfig::default(), &coords).await;
    let report = engine.finished().await.unwrap().unwrap();
    assert!(report.errors.is_empty());
    assert_eq!(report.blank_planes, 0);
    drop(engine);

    let options = OpenOptions::default().with_repair(RepairPolicy::Never);
    let reopened = StorageEngine::open_existing_with(dir.path(), options).await.unwrap();
    for c in &coords {
        assert!(reopened.get_image(c).await.unwrap().is_some());
    }

    let xml = reopened.ome_xml().await.unwrap().unwrap();
    assert_eq!(count(&xml, "<TiffData "), 2);
    assert!(xml.contains("FirstC=\"0\" FirstZ=\"0\" FirstT=\"0\""));
    assert!(xml.contains("FirstC=\"1\" FirstZ=\"0\" FirstT=\"0\""));
    assert!(!xml.contains("FirstT=\"1\""));
}

// =============================================================================
// Page order
// =============================================================================

#[tokio::test]
async fn test_ifd_numbers_follow_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::default().with_split_by_position(false);
    let coords = vec![czt(1, 1, 0), czt(0, 0, 0), czt(1, 0, 0), czt(0, 1, 0)];
    let engine = write_all(dir.path(), summary(2, 2, 1), config, &coords).await;
    let report = engine.finished().await.unwrap().unwrap();
    assert_eq!(report.gap_filled, 0);

    let xml = engine.ome_xml().await.unwrap().unwrap();
    assert_eq!(count(&xml, "<TiffData "), 4);
    for (ifd, c) in coords.iter().enumerate() {
        let record = format!(
            "<TiffData IFD=\"{ifd}\" FirstC=\"{}\" FirstZ=\"{}\" FirstT=\"{}\"",
            c.channel(),
            c.z(),
            c.time()
        );
        assert!(xml.contains(&record), "missing {record}");
    }
}
