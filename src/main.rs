//! CLI entry point for frame_acq
//!
//! Drives the acquisition pipeline against the simulated camera:
//!
//! ```bash
//! frame_acq run --frames 100 --period 10ms --mode recorder-sequence
//! frame_acq config --config config/frame_acq.toml
//! frame_acq health
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use frame_acq::config::{AcqConfig, DEFAULT_CONFIG_PATH};
use frame_acq::mock::{MockCamera, MockHealth};
use frame_acq::{logging, HookPayload, Pipeline, StorageMode};
use mimalloc::MiMalloc;
use tracing::info;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "frame_acq")]
#[command(about = "Camera frame acquisition pipeline (simulated camera)", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire frames from the simulated camera and print a summary
    Run {
        /// Stop after this many frames (overrides session.max_frames)
        #[arg(long)]
        frames: Option<u64>,

        /// Stop after this long if the frame limit was not reached
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration, default_value = "5s")]
        duration: Duration,

        /// Buffers to allocate
        #[arg(long)]
        buffers: Option<usize>,

        /// Scheduler tick period (overrides scheduler.period)
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
        period: Option<Duration>,

        /// fifo, recorder-sequence or recorder-ring
        #[arg(long, value_parser = parse_storage_mode)]
        mode: Option<StorageMode>,
    },

    /// Print the resolved configuration as TOML
    Config,

    /// Print the simulated camera health as JSON
    Health,
}

fn parse_storage_mode(name: &str) -> Result<StorageMode, String> {
    StorageMode::parse(name).ok_or_else(|| {
        format!("unknown storage mode '{name}' (fifo, recorder-sequence, recorder-ring)")
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AcqConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init(&config.logging)?;

    match cli.command {
        Commands::Run {
            frames,
            duration,
            buffers,
            period,
            mode,
        } => {
            let overrides = RunOverrides {
                frames,
                buffers,
                period,
                mode,
            };
            run(overrides.apply(config), duration).await
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Health => {
            let pipeline = mock_pipeline(config)?;
            let snapshot = pipeline.health().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
    }
}

fn mock_pipeline(config: AcqConfig) -> Result<Pipeline> {
    let roi = config.camera.roi;
    let camera = Arc::new(
        MockCamera::builder()
            .sensor(roi.x + roi.width, roi.y + roi.height)
            .auto_produce(true)
            .build(),
    );
    Ok(Pipeline::new(
        config,
        camera.clone(),
        camera,
        Arc::new(MockHealth::new()),
    )?)
}

struct RunOverrides {
    frames: Option<u64>,
    buffers: Option<usize>,
    period: Option<Duration>,
    mode: Option<StorageMode>,
}

impl RunOverrides {
    fn apply(self, mut config: AcqConfig) -> AcqConfig {
        if let Some(frames) = self.frames {
            config.session.max_frames = frames;
        }
        if let Some(buffers) = self.buffers {
            config.pool.default_buffer_count = buffers;
        }
        if let Some(period) = self.period {
            config.scheduler.period = period;
        }
        if let Some(mode) = self.mode {
            config.camera.storage_mode = mode;
        }
        config.scheduler.manual = false;
        config
    }
}

async fn run(config: AcqConfig, duration: Duration) -> Result<()> {
    let pipeline = mock_pipeline(config)?;
    let (done_tx, mut done_rx) = tokio::sync::watch::channel(false);
    pipeline.on_frames_acquired(|_, payload| {
        if let Some(HookPayload::Frames { count, run_total }) = payload {
            info!(count, run_total, "Frames acquired");
        }
    });
    pipeline.on_stop(move |_, _| {
        done_tx.send_replace(true);
    });
    pipeline.on_error(|_, payload| {
        if let Some(HookPayload::Error { message, .. }) = payload {
            eprintln!("Acquisition failed: {message}");
        }
    });

    pipeline.arm().await?;
    pipeline.start().await?;

    if tokio::time::timeout(duration, done_rx.wait_for(|done| *done))
        .await
        .is_err()
    {
        info!(?duration, "Run time elapsed, stopping");
        pipeline.stop().await?;
    }

    let stats = pipeline.stats().await?;
    let health = pipeline.health().await?;
    let (frames, _) = pipeline.get_data(None).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!("Memory: {:.2} MiB", stats.memory_mib);
    println!("Health: {:?} {}", health.level(), serde_json::to_string(&health)?);
    if let (Some(first), Some(last)) = (frames.first(), frames.last()) {
        println!(
            "Frames {}..={} ({}x{}, {}-bit)",
            first.image_number, last.image_number, first.width, first.height, first.bit_depth
        );
    }
    Ok(())
}
