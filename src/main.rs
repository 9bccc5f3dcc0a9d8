//! OME-TIFF Store command line.
//!
//! `serve` exposes a dataset over HTTP, `inspect` prints what a dataset
//! directory holds and `synth` writes a synthetic acquisition.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ometiff_store::{
    config::{Cli, Command, InspectConfig, OpenArgs, ServeConfig, SynthConfig},
    create_router, Coordinate, Image, ImageTags, OpenOptions, PixelType,
    RouterConfig, StorageEngine, StorageError, SummaryMetadata,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(config) => run_serve(config).await,
        Command::Inspect(config) => run_inspect(config).await,
        Command::Synth(config) => run_synth(config).await,
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "ometiff_store=debug,tower_http=debug"
    } else {
        "ometiff_store=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn open_options(args: &OpenArgs) -> OpenOptions {
    OpenOptions::default()
        .with_repair(args.repair)
        .with_open_file_limit(args.open_files)
}

// =============================================================================
// Serve Command
// =============================================================================

async fn run_serve(config: ServeConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let engine = match StorageEngine::open_existing_with(&config.open.dir, open_options(&config.open)).await {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!("Failed to open {}: {}", config.open.dir.display(), e);
            return ExitCode::FAILURE;
        }
    };

    info!("Dataset: {}", config.open.dir.display());
    info!("  Images: {}", engine.num_images());
    info!("  Files: {}", engine.readers().len());
    for report in engine.repair_reports() {
        warn!(
            "  Repaired {} ({} images): {}",
            report.path.display(),
            report.recovered_images,
            report.reason
        );
    }

    let mut router_config = RouterConfig::default()
        .with_cache_max_age(config.cache_max_age)
        .with_tracing(!config.no_tracing);
    if let Some(ref origins) = config.cors_origins {
        router_config = router_config.with_cors_origins(origins.clone());
    }
    let router = create_router(engine, router_config);

    let addr = config.bind_address();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };
    info!("Server listening on: http://{}", addr);
    info!("  curl http://{}/dataset", addr);

    if let Err(e) = axum::serve(listener, router).await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

// =============================================================================
// Inspect Command
// =============================================================================

async fn run_inspect(config: InspectConfig) -> ExitCode {
    if config.verbose {
        init_logging(true);
    }
    if let Err(e) = config.open.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    let engine = match StorageEngine::open_existing_with(&config.open.dir, open_options(&config.open)).await {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let summary = engine.summary_metadata();
    println!("Dataset: {}", config.open.dir.display());
    if !summary.prefix.is_empty() {
        println!("Prefix: {}", summary.prefix);
    }
    println!("Images: {}", engine.num_images());
    println!("Max indices: {}", engine.max_indices());
    println!("Files:");
    for reader in engine.readers() {
        let continuation = reader
            .continuation()
            .map(|next| format!(" -> {next}"))
            .unwrap_or_default();
        println!("  {} ({} images){}", reader.filename(), reader.len(), continuation);
    }

    if !engine.repair_reports().is_empty() {
        println!("Repaired:");
        for report in engine.repair_reports() {
            let mode = if report.rewritten { "rewritten" } else { "in memory" };
            println!(
                "  {} ({} images, {}): {}",
                report.path.display(),
                report.recovered_images,
                mode,
                report.reason
            );
        }
    }

    if config.list {
        println!("Coordinates:");
        for coords in engine.coordinates() {
            println!("  {}", coords);
        }
    }

    if config.omexml {
        match engine.ome_xml().await {
            Ok(Some(xml)) => println!("{}", xml),
            Ok(None) => println!("(no OME-XML, dataset was not finished)"),
            Err(e) => {
                eprintln!("Error reading OME-XML: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}

// =============================================================================
// Synth Command
// =============================================================================

async fn run_synth(config: SynthConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    match write_synthetic(&config).await {
        Ok(written) => {
            info!("Wrote {} images to {}", written, config.dir.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Synthetic acquisition failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn write_synthetic(config: &SynthConfig) -> Result<usize, StorageError> {
    let summary = SummaryMetadata {
        prefix: config.prefix.clone(),
        pixel_size_um: Some(0.65),
        z_step_um: Some(1.0),
        channel_names: (0..config.channels).map(|c| format!("Channel {c}")).collect(),
        start_time: Some(chrono::Utc::now()),
        ..Default::default()
    }
    .with_dimension("channel", config.channels)
    .with_dimension("z", config.slices)
    .with_dimension("time", config.frames)
    .with_dimension("position", config.positions);

    let engine = StorageEngine::create(&config.dir, summary, config.storage_config()).await?;
    let limit = config.abort_after.unwrap_or(usize::MAX);
    let side = config.size;
    let mut written = 0;

    'acquisition: for t in 0..config.frames {
        for p in 0..config.positions {
            for c in 0..config.channels {
                for z in 0..config.slices {
                    if written >= limit {
                        warn!(images = written, "aborting acquisition early");
                        break 'acquisition;
                    }
                    let coords = Coordinate::builder()
                        .time(t)
                        .position(p)
                        .channel(c)
                        .z(z)
                        .build();
                    let pixels: Vec<u8> = (0..side * side)
                        .flat_map(|i| {
                            let value = (i % side + i / side + 16 * (c + z + t)) as u16;
                            if config.big_endian {
                                value.to_be_bytes()
                            } else {
                                value.to_le_bytes()
                            }
                        })
                        .collect();
                    let tags = ImageTags {
                        exposure_ms: Some(10.0),
                        z_um: Some(z as f64),
                        x_um: Some(p as f64 * 1000.0),
                        y_um: Some(0.0),
                        elapsed_ms: Some(t as f64 * 1000.0),
                        camera: Some("SyntheticCamera".to_string()),
                        ..Default::default()
                    };
                    let image = Image::new(coords, side, side, PixelType::Gray16, pixels, tags)?;
                    engine.put_image(image).await?;
                    written += 1;
                }
            }
        }
    }

    let mut display = engine.display_settings();
    for (c, channel) in display.channels.iter_mut().enumerate() {
        channel.max = 4095;
        channel.name = format!("Channel {c}");
    }
    engine.update_display_settings(display).await?;

    if let Some(report) = engine.finished().await? {
        info!(
            files = report.files.len(),
            holder = ?report.metadata_holder,
            gap_filled = report.gap_filled,
            blank_planes = report.blank_planes,
            "synthetic dataset finished"
        );
        for e in &report.errors {
            error!("{}", e);
        }
    }
    Ok(written)
}
