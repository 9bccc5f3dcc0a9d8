//! Router configuration for the dataset read API.
//!
//! # Route Structure
//!
//! ```text
//! /health              - Health check
//! /dataset             - Dataset overview
//! /images              - Raw pixels of one image
//! /images/metadata     - Metadata of one image
//! /images/matching     - Metadata of images matching a coordinate
//! /omexml              - OME-XML document
//! /display-settings    - Display settings
//! ```
//!
//! # Example
//!
//! ```ignore
//! let engine = Arc::new(StorageEngine::open_existing("/data/run1").await?);
//! let router = create_router(engine, RouterConfig::default());
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//! axum::serve(listener, router).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use http::header::CONTENT_TYPE;
use http::Method;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{
    dataset_handler, display_settings_handler, health_handler, image_handler,
    image_metadata_handler, matching_handler, omexml_handler, AppState,
};
use crate::storage::StorageEngine;

// =============================================================================
// Router Configuration
// =============================================================================

/// Configuration for the HTTP router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Allowed CORS origins (None = allow any origin)
    pub cors_origins: Option<Vec<String>>,

    /// Cache-Control max-age in seconds for finished datasets
    pub cache_max_age: u32,

    /// Whether to enable request tracing
    pub enable_tracing: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cors_origins: None,
            cache_max_age: 3600,
            enable_tracing: true,
        }
    }
}

impl RouterConfig {
    /// Set specific allowed CORS origins.
    ///
    /// Pass an empty vec to disallow all cross-origin requests.
    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    /// Set the Cache-Control max-age in seconds.
    pub fn with_cache_max_age(mut self, seconds: u32) -> Self {
        self.cache_max_age = seconds;
        self
    }

    /// Enable or disable request tracing.
    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.enable_tracing = enabled;
        self
    }
}

// =============================================================================
// Router Builder
// =============================================================================

/// Create the application router over `engine`.
pub fn create_router(engine: Arc<StorageEngine>, config: RouterConfig) -> Router {
    let app_state = AppState::with_cache_max_age(engine, config.cache_max_age);
    let cors = build_cors_layer(&config);

    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/dataset", get(dataset_handler))
        .route("/images", get(image_handler))
        .route("/images/metadata", get(image_metadata_handler))
        .route("/images/matching", get(matching_handler))
        .route("/omexml", get(omexml_handler))
        .route("/display-settings", get(display_settings_handler))
        .with_state(app_state)
        .layer(cors);

    if config.enable_tracing {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

/// Build the CORS layer based on configuration.
fn build_cors_layer(config: &RouterConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(86400));

    match &config.cors_origins {
        None => cors.allow_origin(Any),
        Some(origins) if origins.is_empty() => cors,
        Some(origins) => {
            let parsed_origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
            cors.allow_origin(parsed_origins)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
