//! Optional plain-text metadata file written next to each partition.
//!
//! The file is one JSON object, streamed as images arrive:
//!
//! ```text
//! {
//! "Summary": {...},
//! "FrameKey-0-1-2": {...},
//! ...
//! }
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::json;

use crate::data::{Image, SummaryMetadata};
use crate::error::{IoError, StorageError};

/// Key of one image entry: `FrameKey-<time>-<channel>-<z>`.
pub fn frame_key(time: u32, channel: u32, z: u32) -> String {
    format!("FrameKey-{time}-{channel}-{z}")
}

/// Streams per-image metadata into `<base>_metadata.txt`.
pub struct MetadataTextFile {
    path: PathBuf,
    out: BufWriter<File>,
    entries: usize,
    closed: bool,
}

impl MetadataTextFile {
    /// Create the file and write the summary entry.
    pub fn create(
        directory: &Path,
        base_name: &str,
        summary: &SummaryMetadata,
    ) -> Result<Self, StorageError> {
        let path = directory.join(format!("{base_name}_metadata.txt"));
        let file = File::create(&path).map_err(|e| IoError::from_std(path.display(), e))?;
        let mut text = Self {
            path,
            out: BufWriter::new(file),
            entries: 0,
            closed: false,
        };
        let summary = serde_json::to_string(summary)?;
        text.write(format!("{{\n\"Summary\": {summary}"))?;
        Ok(text)
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of image entries written.
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Append the entry for `image`.
    pub fn append(&mut self, image: &Image) -> Result<(), StorageError> {
        let coords = image.coords();
        let key = frame_key(coords.time(), coords.channel(), coords.z());
        let entry = json!({
            "Coords": coords,
            "Width": image.width(),
            "Height": image.height(),
            "PixelType": image.pixel_type(),
            "Tags": image.tags(),
        });
        self.write(format!(",\n\"{key}\": {entry}"))?;
        self.entries += 1;
        Ok(())
    }

    /// Terminate the object and sync.
    pub fn close(&mut self) -> Result<(), StorageError> {
        if self.closed {
            return Ok(());
        }
        self.write("\n}\n".to_string())?;
        self.out
            .flush()
            .and_then(|_| self.out.get_ref().sync_all())
            .map_err(|e| IoError::from_std(self.path.display(), e))?;
        self.closed = true;
        Ok(())
    }

    fn write(&mut self, text: String) -> Result<(), StorageError> {
        self.out
            .write_all(text.as_bytes())
            .map_err(|e| IoError::from_std(self.path.display(), e).into())
    }
}
