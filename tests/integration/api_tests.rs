//! HTTP API integration tests.
//!
//! Tests verify:
//! - Image pixels and metadata served by coordinate
//! - Matching queries, OME-XML and display settings
//! - Error responses for malformed and unknown coordinates
//! - Cache headers for live and finished datasets

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use ometiff_store::{create_router, RouterConfig, StorageConfig, StorageEngine};

use super::test_utils::{acquisition_order, czt, gray16_pixels, seed, summary, write_all, SIDE};

async fn get(router: &Router, uri: &str) -> axum::response::Response {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    router.clone().oneshot(request).await.unwrap()
}

async fn body_bytes(response: axum::response::Response) -> bytes::Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// A finished 2-channel, 2-slice dataset in one file.
async fn finished_dataset(dir: &std::path::Path) -> Arc<StorageEngine> {
    let config = StorageConfig::default().with_split_by_position(false);
    let engine = write_all(dir, summary(2, 2, 1), config, &acquisition_order(2, 2, 1)).await;
    engine.finished().await.unwrap();
    Arc::new(engine)
}

// =============================================================================
// Health and dataset overview
// =============================================================================

#[tokio::test]
async fn test_health() {
    let dir = tempfile::tempdir().unwrap();
    let router = create_router(finished_dataset(dir.path()).await, RouterConfig::default());

    let response = get(&router, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
}

#[tokio::test]
async fn test_dataset_overview() {
    let dir = tempfile::tempdir().unwrap();
    let router = create_router(finished_dataset(dir.path()).await, RouterConfig::default());

    let response = get(&router, "/dataset").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["finished"], true);
    assert_eq!(json["num_images"], 4);
    assert_eq!(json["max_indices"]["channel"], 1);
    assert_eq!(json["max_indices"]["z"], 1);
    assert_eq!(json["files"][0], "stack.ome.tif");
    assert_eq!(json["repaired_files"], 0);
    assert_eq!(json["summary"]["intended_dimensions"]["channel"], 2);
}

// =============================================================================
// Images
// =============================================================================

#[tokio::test]
async fn test_image_pixels() {
    let dir = tempfile::tempdir().unwrap();
    let router = create_router(finished_dataset(dir.path()).await, RouterConfig::default());

    let response = get(&router, "/images?coords=channel:1,z:0,time:0").await;
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers.get("content-type").unwrap(), "application/octet-stream");
    assert_eq!(headers.get("x-image-width").unwrap(), &SIDE.to_string());
    assert_eq!(headers.get("x-image-height").unwrap(), &SIDE.to_string());
    assert_eq!(headers.get("x-image-coords").unwrap(), "channel:1,time:0,z:0");
    assert_eq!(headers.get("x-image-pixel-type").unwrap(), "gray16");
    let cache_control = headers.get("cache-control").unwrap().to_str().unwrap();
    assert!(cache_control.contains("max-age=3600"));

    let body = body_bytes(response).await;
    assert_eq!(body.as_ref(), gray16_pixels(SIDE, seed(&czt(1, 0, 0))).as_slice());
}

#[tokio::test]
async fn test_image_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let router = create_router(finished_dataset(dir.path()).await, RouterConfig::default());

    let response = get(&router, "/images/metadata?coords=channel:0,z:1,time:0").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["coords"]["channel"], 0);
    assert_eq!(json["coords"]["z"], 1);
    assert_eq!(json["width"], SIDE);
    assert_eq!(json["pixel_type"], "gray16");
    assert_eq!(json["tags"]["exposure_ms"], 5.0);
}

#[tokio::test]
async fn test_matching_images() {
    let dir = tempfile::tempdir().unwrap();
    let router = create_router(finished_dataset(dir.path()).await, RouterConfig::default());

    let response = get(&router, "/images/matching?coords=channel:1,z:0,time:0&ignore=z").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let images = json["images"].as_array().unwrap();
    assert_eq!(images.len(), 2);
    assert!(images.iter().all(|i| i["coords"]["channel"] == 1));
}

#[tokio::test]
async fn test_unknown_coordinate_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let router = create_router(finished_dataset(dir.path()).await, RouterConfig::default());

    let response = get(&router, "/images?coords=channel:7,z:0,time:0").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["error"], "not_found");
}

#[tokio::test]
async fn test_malformed_coordinate_is_400() {
    let dir = tempfile::tempdir().unwrap();
    let router = create_router(finished_dataset(dir.path()).await, RouterConfig::default());

    let response = get(&router, "/images?coords=channel-1").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"], "invalid_request");

    let response = get(&router, "/images?coords=channel:x").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_missing_query_is_400() {
    let dir = tempfile::tempdir().unwrap();
    let router = create_router(finished_dataset(dir.path()).await, RouterConfig::default());

    let response = get(&router, "/images").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// =============================================================================
// Metadata documents
// =============================================================================

#[tokio::test]
async fn test_omexml() {
    let dir = tempfile::tempdir().unwrap();
    let router = create_router(finished_dataset(dir.path()).await, RouterConfig::default());

    let response = get(&router, "/omexml").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("content-type").unwrap(), "application/xml");
    let body = body_bytes(response).await;
    let xml = std::str::from_utf8(&body).unwrap();
    assert!(xml.starts_with("<?xml"));
    assert!(xml.contains("SizeC=\"2\""));
}

#[tokio::test]
async fn test_display_settings() {
    let dir = tempfile::tempdir().unwrap();
    let router = create_router(finished_dataset(dir.path()).await, RouterConfig::default());

    let response = get(&router, "/display-settings").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["channels"].as_array().unwrap().len(), 2);
    assert_eq!(json["channels"][0]["name"], "Ch0");
}

// =============================================================================
// Live datasets
// =============================================================================

#[tokio::test]
async fn test_live_dataset_is_not_cached() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(
        StorageEngine::create(dir.path(), summary(1, 1, 2), StorageConfig::default())
            .await
            .unwrap(),
    );
    let router = create_router(engine.clone(), RouterConfig::default());

    engine
        .put_image(super::test_utils::image(czt(0, 0, 0)))
        .await
        .unwrap();

    let response = get(&router, "/images?coords=channel:0,z:0,time:0").await;
    assert_eq!(response.status(), StatusCode::OK);
    let cache_control = response.headers().get("cache-control").unwrap().to_str().unwrap();
    assert!(cache_control.contains("no-cache"));

    let response = get(&router, "/omexml").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let json = body_json(get(&router, "/dataset").await).await;
    assert_eq!(json["finished"], false);
    assert_eq!(json["num_images"], 1);

    engine.finished().await.unwrap();
    let response = get(&router, "/omexml").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_cors_headers() {
    let dir = tempfile::tempdir().unwrap();
    let router = create_router(finished_dataset(dir.path()).await, RouterConfig::default());

    let request = Request::builder()
        .uri("/health")
        .header("origin", "https://viewer.example")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(
        response.headers().get("access-control-allow-origin").unwrap(),
        "*"
    );
}
