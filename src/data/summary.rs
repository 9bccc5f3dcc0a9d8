//! Dataset-level metadata: summary, display settings and comments.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::coords::{Coordinate, CHANNEL, TIME, Z};

fn default_true() -> bool {
    true
}

/// Acquisition-wide metadata, set once when the dataset is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryMetadata {
    /// Dataset name, used as the base of physical file names
    #[serde(default)]
    pub prefix: String,

    /// Intended number of indices per axis
    #[serde(default)]
    pub intended_dimensions: BTreeMap<String, u32>,

    /// Pixel size in micrometers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixel_size_um: Option<f64>,

    /// Distance between focal slices in micrometers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_step_um: Option<f64>,

    /// Acquisition comment
    #[serde(default)]
    pub comments: String,

    /// Channel names by channel index
    #[serde(default)]
    pub channel_names: Vec<String>,

    /// Channel colors as 0xRRGGBB by channel index
    #[serde(default)]
    pub channel_colors: Vec<u32>,

    /// Slices vary faster than channels
    #[serde(default = "default_true")]
    pub slices_first: bool,

    /// Time varies faster than position
    #[serde(default)]
    pub time_first: bool,

    /// Acquisition start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// Arbitrary caller-supplied properties
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub user_data: serde_json::Map<String, serde_json::Value>,
}

impl Default for SummaryMetadata {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            intended_dimensions: BTreeMap::new(),
            pixel_size_um: None,
            z_step_um: None,
            comments: String::new(),
            channel_names: Vec::new(),
            channel_colors: Vec::new(),
            slices_first: true,
            time_first: false,
            start_time: None,
            user_data: serde_json::Map::new(),
        }
    }
}

impl SummaryMetadata {
    /// Intended size of `axis`, if declared.
    pub fn intended(&self, axis: &str) -> Option<u32> {
        self.intended_dimensions.get(axis).copied()
    }

    /// Declare the intended size of `axis`.
    pub fn with_dimension(mut self, axis: &str, size: u32) -> Self {
        self.intended_dimensions.insert(axis.to_string(), size);
        self
    }

    /// Intended channel count (at least 1).
    pub fn channels(&self) -> u32 {
        self.intended(CHANNEL).unwrap_or(1).max(1)
    }

    /// Intended slice count (at least 1).
    pub fn slices(&self) -> u32 {
        self.intended(Z).unwrap_or(1).max(1)
    }

    /// Intended frame count (at least 1).
    pub fn frames(&self) -> u32 {
        self.intended(TIME).unwrap_or(1).max(1)
    }
}

// =============================================================================
// DisplaySettings
// =============================================================================

/// Contrast and color of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDisplay {
    pub name: String,
    /// 0xRRGGBB
    pub color: u32,
    pub min: u32,
    pub max: u32,
}

/// Per-channel display settings. Mutable after acquisition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplaySettings {
    pub channels: Vec<ChannelDisplay>,
}

impl DisplaySettings {
    /// Default settings derived from the summary: full range, summary colors.
    pub fn from_summary(summary: &SummaryMetadata) -> Self {
        let channels = (0..summary.channels() as usize)
            .map(|c| ChannelDisplay {
                name: summary
                    .channel_names
                    .get(c)
                    .cloned()
                    .unwrap_or_else(|| format!("Channel {c}")),
                color: summary.channel_colors.get(c).copied().unwrap_or(0xFF_FF_FF),
                min: 0,
                max: u16::MAX as u32,
            })
            .collect();
        Self { channels }
    }
}

// =============================================================================
// Comments
// =============================================================================

/// Acquisition comment plus per-image comments, stored in each physical file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Comments {
    #[serde(default)]
    pub summary: String,
    /// Image comments keyed by the coordinate text form
    #[serde(default)]
    pub images: BTreeMap<String, String>,
}

impl Comments {
    /// Record the comment for one image.
    pub fn add_image_comment(&mut self, coords: &Coordinate, comment: &str) {
        self.images.insert(coords.to_string(), comment.to_string());
    }
}
