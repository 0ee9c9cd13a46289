//! Splatgate
//!
//! Streams posed images into the ingestion buffer, waits until enough have
//! arrived, then trains.

mod app;

use clap::Parser;
use splatgate_train::{SetupMode, VisMode};
use std::path::PathBuf;

/// Splatgate - train on a live image stream
#[derive(Parser, Debug)]
#[command(name = "splatgate")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// JSON trainer config; flags below override its fields
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Replay images from this directory (default: synthetic frames)
    #[arg(short, long)]
    image_dir: Option<PathBuf>,

    /// Replay rate for --image-dir, in frames per second
    #[arg(long)]
    fps: Option<f32>,

    /// Milliseconds between synthetic frames
    #[arg(long, default_value_t = 50)]
    synthetic_interval_ms: u64,

    /// Stop the synthetic source after this many frames
    #[arg(long)]
    synthetic_frames: Option<u64>,

    /// Orbit radius for generated camera poses
    #[arg(long, default_value_t = 2.0)]
    orbit_radius: f32,

    /// Setup mode (val, test, inference)
    #[arg(short, long, default_value = "val")]
    mode: SetupMode,

    /// Observations required before training starts
    #[arg(short = 'n', long)]
    num_msgs_to_start: Option<usize>,

    /// Seconds to wait for those observations
    #[arg(short = 't', long)]
    msg_timeout: Option<f64>,

    #[arg(long)]
    max_iterations: Option<usize>,

    /// Visualization backends (viewer, viewer_legacy, tensorboard, wandb, comet, viewer+tensorboard, ...)
    #[arg(long)]
    vis: Option<VisMode>,

    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Resume from checkpoints in this directory
    #[arg(long)]
    load_dir: Option<PathBuf>,

    /// Write the effective config to this path and exit
    #[arg(long)]
    dump_config: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();

    if let Err(e) = app::run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
