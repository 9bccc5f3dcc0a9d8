//! Read-only HTTP API over a dataset.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         HTTP Layer                              │
//! │              GET /images?coords=channel:0,time:1                │
//! │                                                                 │
//! │  ┌─────────────────────────┐  ┌─────────────────────────────┐   │
//! │  │        handlers         │  │           routes            │   │
//! │  │       (requests)        │  │   (router, CORS, tracing)   │   │
//! │  └─────────────────────────┘  └─────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                        StorageEngine
//! ```

pub mod handlers;
pub mod routes;

pub use handlers::{
    dataset_handler, display_settings_handler, health_handler, image_handler,
    image_metadata_handler, matching_handler, omexml_handler, ApiError, AppState,
    DatasetResponse, ErrorResponse, HealthResponse, ImageMetadataResponse, ImageQueryParams,
    MatchingQueryParams, MatchingResponse,
};
pub use routes::{create_router, RouterConfig};
