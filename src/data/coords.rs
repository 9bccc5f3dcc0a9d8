//! N-dimensional image coordinates.
//!
//! A [`Coordinate`] maps axis names to non-negative indices. Axes that are not
//! present read as index 0, but equality is structural: `{channel: 0}` and
//! `{channel: 0, z: 0}` are different coordinates. Coordinates are totally
//! ordered so they can key sorted maps.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::format::layout::MAX_INDEX_AXES;

/// Well-known axis: channel index.
pub const CHANNEL: &str = "channel";
/// Well-known axis: focal slice index.
pub const Z: &str = "z";
/// Well-known axis: time point index.
pub const TIME: &str = "time";
/// Well-known axis: stage position index.
pub const POSITION: &str = "position";

/// Immutable mapping from axis name to index.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Coordinate {
    axes: BTreeMap<String, u32>,
}

impl Coordinate {
    /// Coordinate with no axes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building a coordinate.
    pub fn builder() -> CoordinateBuilder {
        CoordinateBuilder::default()
    }

    /// Index along `axis`, 0 when the axis is absent.
    pub fn index(&self, axis: &str) -> u32 {
        self.axes.get(axis).copied().unwrap_or(0)
    }

    /// Index along `axis` if the axis is present.
    pub fn get(&self, axis: &str) -> Option<u32> {
        self.axes.get(axis).copied()
    }

    /// Whether `axis` is present.
    pub fn has_axis(&self, axis: &str) -> bool {
        self.axes.contains_key(axis)
    }

    /// Channel index.
    pub fn channel(&self) -> u32 {
        self.index(CHANNEL)
    }

    /// Focal slice index.
    pub fn z(&self) -> u32 {
        self.index(Z)
    }

    /// Time point index.
    pub fn time(&self) -> u32 {
        self.index(TIME)
    }

    /// Stage position index.
    pub fn position(&self) -> u32 {
        self.index(POSITION)
    }

    /// Axis names in sorted order.
    pub fn axes(&self) -> impl Iterator<Item = &str> {
        self.axes.keys().map(String::as_str)
    }

    /// `(axis, index)` pairs in axis order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.axes.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Number of axes.
    pub fn len(&self) -> usize {
        self.axes.len()
    }

    /// Whether the coordinate has no axes.
    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    /// Copy with `axis` set to `index`.
    pub fn with(&self, axis: &str, index: u32) -> Self {
        let mut axes = self.axes.clone();
        axes.insert(axis.to_string(), index);
        Self { axes }
    }

    /// Copy without the given axes.
    pub fn without_axes<S: AsRef<str>>(&self, axes: &[S]) -> Self {
        let mut copy = self.axes.clone();
        for axis in axes {
            copy.remove(axis.as_ref());
        }
        Self { axes: copy }
    }

    /// Per-axis maximum of two coordinates over the union of their axes.
    pub fn max_with(&self, other: &Coordinate) -> Coordinate {
        let mut axes = self.axes.clone();
        for (axis, &value) in &other.axes {
            let entry = axes.entry(axis.clone()).or_insert(value);
            *entry = (*entry).max(value);
        }
        Coordinate { axes }
    }

    /// Check that every axis name is valid and that the coordinate has no
    /// more axes than one file's index map can hold.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.axes.len() > MAX_INDEX_AXES {
            return Err(StorageError::InvalidCoordinate(format!(
                "{} axes, at most {MAX_INDEX_AXES} are supported",
                self.axes.len()
            )));
        }
        self.axes().try_for_each(validate_axis_name)
    }
}

/// Axis names may not contain separators used by the text form, and must
/// fit the 16-bit length field of the index map.
pub fn validate_axis_name(axis: &str) -> Result<(), StorageError> {
    if axis.len() > u16::MAX as usize {
        return Err(StorageError::InvalidCoordinate(format!(
            "axis name of {} bytes is too long",
            axis.len()
        )));
    }
    if axis.is_empty()
        || axis
            .chars()
            .any(|c| c == ':' || c == ',' || c.is_whitespace())
    {
        return Err(StorageError::InvalidCoordinate(format!(
            "invalid axis name {axis:?}"
        )));
    }
    Ok(())
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (axis, index)) in self.axes.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{axis}:{index}")?;
        }
        Ok(())
    }
}

impl FromStr for Coordinate {
    type Err = StorageError;

    /// Parse the `channel:0,time:1` text form. The empty string is the empty
    /// coordinate.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut builder = Coordinate::builder();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (axis, index) = part.split_once(':').ok_or_else(|| {
                StorageError::InvalidCoordinate(format!("expected axis:index, got {part:?}"))
            })?;
            let axis = axis.trim();
            validate_axis_name(axis)?;
            let index = index.trim().parse::<u32>().map_err(|_| {
                StorageError::InvalidCoordinate(format!("invalid index for axis {axis:?}"))
            })?;
            builder = builder.axis(axis, index);
        }
        Ok(builder.build())
    }
}

impl<S: Into<String>> FromIterator<(S, u32)> for Coordinate {
    fn from_iter<T: IntoIterator<Item = (S, u32)>>(iter: T) -> Self {
        Coordinate {
            axes: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Builder for [`Coordinate`].
#[derive(Debug, Clone, Default)]
pub struct CoordinateBuilder {
    axes: BTreeMap<String, u32>,
}

impl CoordinateBuilder {
    /// Set an arbitrary axis.
    pub fn axis(mut self, axis: impl Into<String>, index: u32) -> Self {
        self.axes.insert(axis.into(), index);
        self
    }

    /// Set the channel index.
    pub fn channel(self, index: u32) -> Self {
        self.axis(CHANNEL, index)
    }

    /// Set the focal slice index.
    pub fn z(self, index: u32) -> Self {
        self.axis(Z, index)
    }

    /// Set the time point index.
    pub fn time(self, index: u32) -> Self {
        self.axis(TIME, index)
    }

    /// Set the stage position index.
    pub fn position(self, index: u32) -> Self {
        self.axis(POSITION, index)
    }

    /// Finish building.
    pub fn build(self) -> Coordinate {
        Coordinate { axes: self.axes }
    }
}
