//! Test utilities for integration tests.
//!
//! Helpers for building synthetic images and acquisitions.

use ometiff_store::{
    Coordinate, Image, ImageTags, PixelType, StorageConfig, StorageEngine, SummaryMetadata,
};

/// Side length of the default test image.
pub const SIDE: u32 = 16;

/// Summary metadata with the given intended dimensions.
pub fn summary(channels: u32, slices: u32, frames: u32) -> SummaryMetadata {
    SummaryMetadata {
        prefix: String::new(),
        pixel_size_um: Some(0.5),
        z_step_um: Some(2.0),
        channel_names: (0..channels).map(|c| format!("Ch{c}")).collect(),
        ..Default::default()
    }
    .with_dimension("channel", channels)
    .with_dimension("z", slices)
    .with_dimension("time", frames)
}

/// Deterministic Gray16 pixels derived from `seed`.
pub fn gray16_pixels(side: u32, seed: u32) -> Vec<u8> {
    (0..side * side)
        .flat_map(|i| ((i.wrapping_mul(7) + seed * 131) as u16).to_le_bytes())
        .collect()
}

/// Seed that is unique per (c, z, t, p).
pub fn seed(coords: &Coordinate) -> u32 {
    coords.channel() + 10 * coords.z() + 100 * coords.time() + 1000 * coords.position()
}

/// A `side`x`side` Gray16 image whose pixels depend on its coordinate.
pub fn image_sized(coords: Coordinate, side: u32) -> Image {
    let pixels = gray16_pixels(side, seed(&coords));
    let tags = ImageTags {
        exposure_ms: Some(5.0),
        elapsed_ms: Some(coords.time() as f64 * 100.0),
        ..Default::default()
    };
    Image::new(coords, side, side, PixelType::Gray16, pixels, tags).unwrap()
}

/// A [`SIDE`]x[`SIDE`] Gray16 image whose pixels depend on its coordinate.
pub fn image(coords: Coordinate) -> Image {
    image_sized(coords, SIDE)
}

/// Like [`image`], with every acquisition tag set.
pub fn tagged_image(coords: Coordinate) -> Image {
    let mut extra = serde_json::Map::new();
    extra.insert("Binning".to_string(), serde_json::json!("2x2"));
    extra.insert("Gain".to_string(), serde_json::json!(4));
    let tags = ImageTags {
        exposure_ms: Some(12.5),
        x_um: Some(100.25),
        y_um: Some(-40.5),
        z_um: Some(coords.z() as f64 * 2.0),
        elapsed_ms: Some(coords.time() as f64 * 1500.0),
        camera: Some("TestCam".to_string()),
        position_name: Some("Site 1".to_string()),
        comment: Some(format!("plane {coords}")),
        extra,
    };
    let pixels = gray16_pixels(SIDE, seed(&coords));
    Image::new(coords, SIDE, SIDE, PixelType::Gray16, pixels, tags).unwrap()
}

/// Coordinate on the four standard axes.
pub fn czt(c: u32, z: u32, t: u32) -> Coordinate {
    Coordinate::builder().channel(c).z(z).time(t).build()
}

/// Coordinate with a stage position.
pub fn cztp(c: u32, z: u32, t: u32, p: u32) -> Coordinate {
    Coordinate::builder().channel(c).z(z).time(t).position(p).build()
}

/// Acquisition order for a slices-first grid: time, then channel, then z.
pub fn acquisition_order(channels: u32, slices: u32, frames: u32) -> Vec<Coordinate> {
    let mut order = Vec::new();
    for t in 0..frames {
        for c in 0..channels {
            for z in 0..slices {
                order.push(czt(c, z, t));
            }
        }
    }
    order
}

/// Create an engine in `dir` and write `coords` in order, waiting for each
/// write to land on disk.
pub async fn write_all(
    dir: &std::path::Path,
    summary: SummaryMetadata,
    config: StorageConfig,
    coords: &[Coordinate],
) -> StorageEngine {
    let engine = StorageEngine::create(dir, summary, config).await.unwrap();
    for c in coords {
        engine.put_image(image(c.clone())).await.unwrap();
    }
    engine.flush().await.unwrap();
    engine
}

/// Count occurrences of `needle` in `haystack`.
pub fn count(haystack: &str, needle: &str) -> usize {
    haystack.matches(needle).count()
}

/// Names of the files directly inside `dir`, sorted.
pub fn file_names(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
