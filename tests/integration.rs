//! Integration tests for OME-TIFF Store.
//!
//! These tests verify end-to-end functionality including:
//! - Writing, finishing and reopening datasets
//! - Reads served while an acquisition is still being written
//! - File rollover and per-position partitioning
//! - OME-XML placement, gap filling and blank padding
//! - Index repair for acquisitions that never finished
//! - The read-only HTTP API

mod integration {
    pub mod test_utils;

    pub mod api_tests;
    pub mod engine_tests;
    pub mod ome_tests;
    pub mod recovery_tests;
}
