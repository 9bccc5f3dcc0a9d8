//! Configuration for the storage engine and the command line.
//!
//! [`StorageConfig`] is the library-level configuration passed to
//! [`StorageEngine::create`](crate::StorageEngine::create). The [`Cli`] types
//! are parsed with clap and support environment variables with the
//! `OMETIFF_` prefix:
//!
//! - `OMETIFF_HOST` - Server bind address (default: 0.0.0.0)
//! - `OMETIFF_PORT` - Server port (default: 3000)
//! - `OMETIFF_DIR` - Dataset directory
//! - `OMETIFF_CACHE_MAX_AGE` - HTTP cache max-age seconds for finished datasets
//! - `OMETIFF_REPAIR` - Repair policy for unfinished files (default: in-memory)
//! - `OMETIFF_OPEN_FILES` - Maximum open read handles (default: 64)

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::format::tiff::ByteOrder;
use crate::io::DEFAULT_OPEN_FILE_LIMIT;
use crate::storage::{FileSetSettings, RepairPolicy, WriterLimits};

// =============================================================================
// Default Values
// =============================================================================

/// Default server host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default server port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default HTTP cache max-age in seconds for finished datasets (1 hour).
pub const DEFAULT_CACHE_MAX_AGE: u32 = 3600;

/// Largest physical file a classic TIFF can address.
pub const MAX_FILE_SIZE: u64 = u32::MAX as u64;

/// Smallest accepted per-file limit.
pub const MIN_FILE_SIZE: u64 = 4096;

/// Bytes kept free in each file for the OME-XML trailer (6 MB).
pub const DEFAULT_METADATA_RESERVE: u64 = 6 * 1024 * 1024;

/// Default depth of the write queue.
pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 64;

// =============================================================================
// Storage Configuration
// =============================================================================

/// Settings of a dataset being written.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StorageConfig {
    /// Write each stage position to its own set of files
    pub split_by_position: bool,
    /// Also stream per-image metadata to `<base>_metadata.txt`
    pub separate_metadata_file: bool,
    /// Size limit of one physical file; larger datasets roll over
    pub max_file_size: u64,
    /// Bytes kept free in each file for the OME-XML trailer
    pub metadata_reserve: u64,
    /// Images that may wait for the writer before `put_image` blocks
    pub write_queue_capacity: usize,
    pub byte_order: ByteOrder,
    /// Maximum number of open read handles
    pub open_file_limit: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            split_by_position: true,
            separate_metadata_file: false,
            max_file_size: MAX_FILE_SIZE,
            metadata_reserve: DEFAULT_METADATA_RESERVE,
            write_queue_capacity: DEFAULT_WRITE_QUEUE_CAPACITY,
            byte_order: ByteOrder::LittleEndian,
            open_file_limit: DEFAULT_OPEN_FILE_LIMIT,
        }
    }
}

impl StorageConfig {
    pub fn with_split_by_position(mut self, split: bool) -> Self {
        self.split_by_position = split;
        self
    }

    pub fn with_separate_metadata_file(mut self, separate: bool) -> Self {
        self.separate_metadata_file = separate;
        self
    }

    /// Set the per-file size limit and the trailer reserve.
    pub fn with_file_limits(mut self, max_file_size: u64, metadata_reserve: u64) -> Self {
        self.max_file_size = max_file_size;
        self.metadata_reserve = metadata_reserve;
        self
    }

    pub fn with_write_queue_capacity(mut self, capacity: usize) -> Self {
        self.write_queue_capacity = capacity;
        self
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn with_open_file_limit(mut self, limit: usize) -> Self {
        self.open_file_limit = limit;
        self
    }

    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_file_size > MAX_FILE_SIZE {
            return Err(format!(
                "max_file_size must not exceed {MAX_FILE_SIZE} bytes (classic TIFF limit)"
            ));
        }
        if self.max_file_size < MIN_FILE_SIZE {
            return Err(format!("max_file_size must be at least {MIN_FILE_SIZE} bytes"));
        }
        if self.metadata_reserve >= self.max_file_size - MIN_FILE_SIZE / 2 {
            return Err("metadata_reserve leaves no room for images".to_string());
        }
        if self.write_queue_capacity == 0 {
            return Err("write_queue_capacity must be greater than 0".to_string());
        }
        if self.open_file_limit == 0 {
            return Err("open_file_limit must be greater than 0".to_string());
        }
        Ok(())
    }

    pub(crate) fn fileset_settings(&self) -> FileSetSettings {
        FileSetSettings {
            limits: WriterLimits {
                max_file_size: self.max_file_size,
                metadata_reserve: self.metadata_reserve,
            },
            byte_order: self.byte_order,
            split_by_position: self.split_by_position,
            separate_metadata_file: self.separate_metadata_file,
        }
    }
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// OME-TIFF Store - multi-file OME-TIFF storage for microscope acquisitions.
#[derive(Parser, Debug, Clone)]
#[command(name = "ometiff-store")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve a dataset directory over HTTP (read-only).
    Serve(ServeConfig),
    /// Print what a dataset directory contains.
    Inspect(InspectConfig),
    /// Write a synthetic dataset.
    Synth(SynthConfig),
}

/// Options shared by commands that open an existing dataset.
#[derive(Args, Debug, Clone)]
pub struct OpenArgs {
    /// Dataset directory.
    #[arg(env = "OMETIFF_DIR")]
    pub dir: PathBuf,

    /// What to do with files whose index map is missing or damaged.
    #[arg(long, value_enum, default_value_t = RepairPolicy::InMemory, env = "OMETIFF_REPAIR")]
    pub repair: RepairPolicy,

    /// Maximum number of open read handles.
    #[arg(long, default_value_t = DEFAULT_OPEN_FILE_LIMIT, env = "OMETIFF_OPEN_FILES")]
    pub open_files: usize,
}

impl OpenArgs {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.open_files == 0 {
            return Err("open_files must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServeConfig {
    #[command(flatten)]
    pub open: OpenArgs,

    /// Host address to bind the server to.
    #[arg(long, default_value = DEFAULT_HOST, env = "OMETIFF_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "OMETIFF_PORT")]
    pub port: u16,

    /// HTTP Cache-Control max-age in seconds.
    #[arg(long, default_value_t = DEFAULT_CACHE_MAX_AGE, env = "OMETIFF_CACHE_MAX_AGE")]
    pub cache_max_age: u32,

    /// Allowed CORS origins (comma-separated).
    ///
    /// If not specified, allows any origin.
    #[arg(long, env = "OMETIFF_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Option<Vec<String>>,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Disable request tracing.
    #[arg(long, default_value_t = false)]
    pub no_tracing: bool,
}

impl ServeConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        self.open.validate()?;
        if self.host.is_empty() {
            return Err("host must not be empty".to_string());
        }
        Ok(())
    }

    /// Get the server bind address as "host:port".
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Args, Debug, Clone)]
pub struct InspectConfig {
    #[command(flatten)]
    pub open: OpenArgs,

    /// List every stored coordinate.
    #[arg(long, default_value_t = false)]
    pub list: bool,

    /// Print the OME-XML document.
    #[arg(long, default_value_t = false)]
    pub omexml: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SynthConfig {
    /// Output directory.
    pub dir: PathBuf,

    /// Dataset name used as the file name prefix.
    #[arg(long, default_value = "synth")]
    pub prefix: String,

    #[arg(long, default_value_t = 2)]
    pub channels: u32,

    #[arg(long, default_value_t = 3)]
    pub slices: u32,

    #[arg(long, default_value_t = 2)]
    pub frames: u32,

    #[arg(long, default_value_t = 1)]
    pub positions: u32,

    /// Image width and height in pixels.
    #[arg(long, default_value_t = 64)]
    pub size: u32,

    /// Stop after this many images, as an aborted acquisition would.
    #[arg(long)]
    pub abort_after: Option<usize>,

    /// Size limit of one physical file in bytes.
    #[arg(long, default_value_t = MAX_FILE_SIZE)]
    pub max_file_size: u64,

    /// Write big-endian files.
    #[arg(long, default_value_t = false)]
    pub big_endian: bool,

    /// Also write `<base>_metadata.txt`.
    #[arg(long, default_value_t = false)]
    pub metadata_file: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl SynthConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.channels == 0 || self.slices == 0 || self.frames == 0 || self.positions == 0 {
            return Err("every dimension must be at least 1".to_string());
        }
        if self.size == 0 || self.size > 8192 {
            return Err("size must be between 1 and 8192".to_string());
        }
        self.storage_config().validate()
    }

    /// Storage settings for the synthetic dataset.
    pub fn storage_config(&self) -> StorageConfig {
        let byte_order = if self.big_endian {
            ByteOrder::BigEndian
        } else {
            ByteOrder::LittleEndian
        };
        let reserve = DEFAULT_METADATA_RESERVE.min(self.max_file_size / 4);
        StorageConfig::default()
            .with_file_limits(self.max_file_size, reserve)
            .with_byte_order(byte_order)
            .with_separate_metadata_file(self.metadata_file)
            .with_split_by_position(self.positions > 1)
    }
}

// =============================================================================
// Tests
// =============================================================================
