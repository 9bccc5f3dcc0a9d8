//! HTTP request handlers for the dataset read API.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /dataset` - Dataset summary, axes and state
//! - `GET /images?coords=channel:0,time:1` - Raw pixels of one image
//! - `GET /images/metadata?coords=...` - Shape and tags of one image
//! - `GET /images/matching?coords=...&ignore=z,time` - Metadata of matching images
//! - `GET /omexml` - Full OME-XML document
//! - `GET /display-settings` - Current display settings

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::data::{Coordinate, DisplaySettings, Image, ImageTags, PixelType, SummaryMetadata};
use crate::error::{IoError, StorageError};
use crate::storage::StorageEngine;

// =============================================================================
// Application State
// =============================================================================

/// Shared application state containing the dataset.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<StorageEngine>,

    /// Cache-Control max-age in seconds for responses from a finished dataset
    pub cache_max_age: u32,
}

impl AppState {
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self {
            engine,
            cache_max_age: 3600,
        }
    }

    pub fn with_cache_max_age(engine: Arc<StorageEngine>, cache_max_age: u32) -> Self {
        Self {
            engine,
            cache_max_age,
        }
    }

    /// Cache-Control value; only finished datasets are cacheable.
    fn cache_control(&self) -> HeaderValue {
        if self.engine.is_finished() {
            HeaderValue::from_str(&format!("public, max-age={}", self.cache_max_age))
                .unwrap_or_else(|_| HeaderValue::from_static("no-cache"))
        } else {
            HeaderValue::from_static("no-cache")
        }
    }
}

// =============================================================================
// Request Parameters
// =============================================================================

/// Query parameters selecting one image.
#[derive(Debug, Deserialize)]
pub struct ImageQueryParams {
    /// Coordinate in `axis:index,axis:index` form
    #[serde(default)]
    pub coords: String,
}

/// Query parameters for the matching endpoint.
#[derive(Debug, Deserialize)]
pub struct MatchingQueryParams {
    #[serde(default)]
    pub coords: String,

    /// Comma-separated axes to ignore when comparing
    #[serde(default)]
    pub ignore: Option<String>,
}

impl MatchingQueryParams {
    fn ignored_axes(&self) -> Vec<String> {
        self.ignore
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect()
    }
}

// =============================================================================
// Response Types
// =============================================================================

/// JSON error response returned for all error conditions.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type identifier (e.g., "not_found", "invalid_request")
    pub error: String,

    /// Human-readable error message
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorResponse {
    pub fn with_status(
        error: impl Into<String>,
        message: impl Into<String>,
        status: StatusCode,
    ) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: Some(status.as_u16()),
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Dataset overview.
#[derive(Debug, Serialize)]
pub struct DatasetResponse {
    pub finished: bool,
    pub num_images: usize,
    pub axes: Vec<String>,
    pub max_indices: BTreeMap<String, u32>,
    pub files: Vec<String>,
    pub repaired_files: usize,
    pub summary: SummaryMetadata,
}

/// Shape and tags of one image.
#[derive(Debug, Serialize)]
pub struct ImageMetadataResponse {
    pub coords: Coordinate,
    pub width: u32,
    pub height: u32,
    pub pixel_type: PixelType,
    pub tags: ImageTags,
}

impl From<&Image> for ImageMetadataResponse {
    fn from(image: &Image) -> Self {
        Self {
            coords: image.coords().clone(),
            width: image.width(),
            height: image.height(),
            pixel_type: image.pixel_type(),
            tags: image.tags().clone(),
        }
    }
}

/// Response from the matching endpoint.
#[derive(Debug, Serialize)]
pub struct MatchingResponse {
    pub images: Vec<ImageMetadataResponse>,
}

// =============================================================================
// Error Mapping
// =============================================================================

/// Errors returned by the handlers.
#[derive(Debug)]
pub enum ApiError {
    Storage(StorageError),
    ImageNotFound(Coordinate),
    MetadataUnavailable,
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        ApiError::Storage(err)
    }
}

/// Convert ApiError to HTTP response.
///
/// - 4xx errors are logged at WARN level (404 at DEBUG)
/// - 5xx errors are logged at ERROR level
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            ApiError::ImageNotFound(coords) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("No image at {}", coords),
            ),
            ApiError::MetadataUnavailable => (
                StatusCode::NOT_FOUND,
                "not_found",
                "OME-XML is written when the acquisition finishes".to_string(),
            ),
            ApiError::Storage(err) => match err {
                StorageError::InvalidCoordinate(_) | StorageError::InvalidImage(_) => {
                    (StatusCode::BAD_REQUEST, "invalid_request", err.to_string())
                }
                StorageError::Configuration(_) => {
                    (StatusCode::CONFLICT, "invalid_state", err.to_string())
                }
                StorageError::Io(IoError::NotFound(path)) => (
                    StatusCode::NOT_FOUND,
                    "not_found",
                    format!("File not found: {}", path),
                ),
                StorageError::Tiff(_)
                | StorageError::MetadataCorruption { .. }
                | StorageError::SchemaInconsistency(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "corrupt_dataset", err.to_string())
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error", err.to_string()),
            },
        };

        if status.is_server_error() {
            error!(
                error_type = error_type,
                status = status.as_u16(),
                "Server error: {}",
                message
            );
        } else if status == StatusCode::NOT_FOUND {
            debug!(
                error_type = error_type,
                status = status.as_u16(),
                "Resource not found: {}",
                message
            );
        } else {
            warn!(
                error_type = error_type,
                status = status.as_u16(),
                "Client error: {}",
                message
            );
        }

        let error_response = ErrorResponse::with_status(error_type, message, status);
        (status, Json(error_response)).into_response()
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// `GET /health`
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// `GET /dataset`
pub async fn dataset_handler(State(state): State<AppState>) -> Json<DatasetResponse> {
    let engine = &state.engine;
    Json(DatasetResponse {
        finished: engine.is_finished(),
        num_images: engine.num_images(),
        axes: engine.axes().into_iter().collect(),
        max_indices: engine
            .max_indices()
            .iter()
            .map(|(axis, index)| (axis.to_string(), index))
            .collect(),
        files: engine
            .readers()
            .iter()
            .map(|r| r.filename().to_string())
            .collect(),
        repaired_files: engine.repair_reports().len(),
        summary: engine.summary_metadata().clone(),
    })
}

async fn fetch_image(state: &AppState, coords: &str) -> Result<Arc<Image>, ApiError> {
    let coords: Coordinate = coords.parse()?;
    state
        .engine
        .get_image(&coords)
        .await?
        .ok_or(ApiError::ImageNotFound(coords))
}

/// `GET /images?coords=...`
///
/// Returns the raw pixel buffer (row-major, native sample order) with the
/// shape in `x-image-*` headers.
pub async fn image_handler(
    State(state): State<AppState>,
    Query(query): Query<ImageQueryParams>,
) -> Result<Response, ApiError> {
    let image = fetch_image(&state, &query.coords).await?;

    let mut response = image.pixels().clone().into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CACHE_CONTROL, state.cache_control());
    headers.insert("x-image-width", HeaderValue::from(image.width()));
    headers.insert("x-image-height", HeaderValue::from(image.height()));
    if let Ok(value) = HeaderValue::from_str(&image.coords().to_string()) {
        headers.insert("x-image-coords", value);
    }
    if let Ok(pixel_type) = serde_json::to_value(image.pixel_type()) {
        if let Some(value) = pixel_type.as_str().and_then(|s| HeaderValue::from_str(s).ok()) {
            headers.insert("x-image-pixel-type", value);
        }
    }
    Ok(response)
}

/// `GET /images/metadata?coords=...`
pub async fn image_metadata_handler(
    State(state): State<AppState>,
    Query(query): Query<ImageQueryParams>,
) -> Result<Json<ImageMetadataResponse>, ApiError> {
    let image = fetch_image(&state, &query.coords).await?;
    Ok(Json(ImageMetadataResponse::from(image.as_ref())))
}

/// `GET /images/matching?coords=...&ignore=...`
pub async fn matching_handler(
    State(state): State<AppState>,
    Query(query): Query<MatchingQueryParams>,
) -> Result<Json<MatchingResponse>, ApiError> {
    let coords: Coordinate = query.coords.parse()?;
    let images = state
        .engine
        .get_images_matching(&coords, query.ignored_axes().as_slice())
        .await?;
    Ok(Json(MatchingResponse {
        images: images
            .iter()
            .map(|image| ImageMetadataResponse::from(image.as_ref()))
            .collect(),
    }))
}

/// `GET /omexml`
pub async fn omexml_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    let xml = state
        .engine
        .ome_xml()
        .await?
        .ok_or(ApiError::MetadataUnavailable)?;

    let mut response = xml.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/xml"));
    headers.insert(header::CACHE_CONTROL, state.cache_control());
    Ok(response)
}

/// `GET /display-settings`
pub async fn display_settings_handler(State(state): State<AppState>) -> Json<DisplaySettings> {
    Json(state.engine.display_settings())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_serialization() {
        let response = ErrorResponse::with_status("not_found", "missing", StatusCode::NOT_FOUND);
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("not_found"));
        assert!(json.contains("404"));
    }

    #[test]
    fn test_api_error_to_status_code() {
        let err = ApiError::ImageNotFound(Coordinate::builder().time(3).build());
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let err = ApiError::Storage(StorageError::InvalidCoordinate("bad".into()));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        let err = ApiError::Storage(StorageError::Configuration("finished".into()));
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);

        let err = ApiError::Storage(StorageError::Io(IoError::NotFound("a.ome.tif".into())));
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let err = ApiError::Storage(StorageError::MetadataCorruption {
            path: "a.ome.tif".into(),
            reason: "no index map".into(),
        });
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);

        let err = ApiError::Storage(StorageError::WriterClosed);
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_ignored_axes_parsing() {
        let params = MatchingQueryParams {
            coords: "channel:0".into(),
            ignore: Some("z, time,,".into()),
        };
        assert_eq!(params.ignored_axes(), vec!["z", "time"]);

        let params = MatchingQueryParams {
            coords: String::new(),
            ignore: None,
        };
        assert!(params.ignored_axes().is_empty());
    }

    #[test]
    fn test_image_metadata_response_serialization() {
        let image = Image::new(
            Coordinate::builder().channel(1).build(),
            2,
            1,
            PixelType::Gray16,
            vec![0u8; 4],
            ImageTags::default(),
        )
        .unwrap();
        let json = serde_json::to_string(&ImageMetadataResponse::from(&image)).unwrap();
        assert!(json.contains("\"coords\":{\"channel\":1}"));
        assert!(json.contains("\"pixel_type\":\"gray16\""));
    }
}
