//! Wires a capture source, the ingest worker and the trainer together.

use crate::Args;
use glam::Vec3;
use splatgate_capture::{CaptureError, ImageDirSource, PoseTrack, PosedCaptureSource, SyntheticSource};
use splatgate_train::config::LoggingConfig;
use splatgate_train::{
    ConfigError, ConsoleFeedback, Feedback, IngestWorker, IngestionBuffer, SetupError, StreamingPipelineFactory,
    TracingFeedback, TrainError, Trainer, TrainerConfig, TrainingRunner,
};
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SYNTHETIC_RESOLUTION: (u32, u32) = (64, 48);
const FRAMES_PER_REVOLUTION: u32 = 120;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("capture source: {0}")]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error("training failed: {0}")]
    Train(#[from] TrainError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("SPLATGATE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_logging(logging: &LoggingConfig) {
    #[cfg(feature = "tracy")]
    {
        if logging.enable_tracy {
            use tracing_subscriber::Layer;
            use tracing_subscriber::layer::SubscriberExt;
            use tracing_subscriber::util::SubscriberInitExt;
            tracing_subscriber::registry()
                .with(tracing_tracy::TracyLayer::default())
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter()))
                .init();
            return;
        }
    }
    #[cfg(not(feature = "tracy"))]
    {
        if logging.enable_tracy {
            eprintln!("enable_tracy is set but splatgate was built without the `tracy` feature");
        }
    }

    tracing_subscriber::fmt().with_env_filter(env_filter()).with_target(false).init();
}

/// Load the config file, if any, and apply command-line overrides.
fn build_config(args: &Args) -> Result<TrainerConfig, AppError> {
    let mut config = match &args.config {
        Some(path) => TrainerConfig::from_json_file(path)?,
        None => TrainerConfig::default(),
    };
    if let Some(n) = args.num_msgs_to_start {
        config.num_msgs_to_start = n;
    }
    if let Some(timeout) = args.msg_timeout {
        config.msg_timeout = timeout;
    }
    if let Some(iters) = args.max_iterations {
        config.max_num_iterations = iters;
    }
    if let Some(vis) = args.vis {
        config.vis = vis;
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(dir) = &args.load_dir {
        config.load_dir = Some(dir.clone());
    }
    if let Some(dir) = &args.image_dir {
        config.data = Some(dir.clone());
    }
    config.validate()?;
    Ok(config)
}

fn spawn_ingest(args: &Args, buffer: Arc<IngestionBuffer>) -> Result<IngestWorker, AppError> {
    let track = PoseTrack::Orbit {
        radius: args.orbit_radius,
        height: 0.0,
        frames_per_revolution: FRAMES_PER_REVOLUTION,
    };

    let worker = match &args.image_dir {
        Some(dir) => {
            let mut source = ImageDirSource::open(dir)?;
            if let Some(fps) = args.fps {
                source = source.with_frame_rate(fps)?;
            }
            IngestWorker::spawn(PosedCaptureSource::new(source).with_track(track), buffer)?
        }
        None => {
            let (width, height) = SYNTHETIC_RESOLUTION;
            let mut source =
                SyntheticSource::new(width, height, Duration::from_millis(args.synthetic_interval_ms))?;
            if let Some(max) = args.synthetic_frames {
                source = source.with_max_frames(max);
            }
            let stream = if args.orbit_radius > 0.0 {
                PosedCaptureSource::new(source).with_track(track)
            } else {
                PosedCaptureSource::new(source).with_pose(Vec3::new(0.0, 0.0, 1.0), glam::Quat::IDENTITY)
            };
            IngestWorker::spawn(stream, buffer)?
        }
    };
    Ok(worker)
}

fn feedback() -> Arc<dyn Feedback> {
    if std::io::stderr().is_terminal() {
        Arc::new(ConsoleFeedback::new())
    } else {
        Arc::new(TracingFeedback::new())
    }
}

pub fn run(args: Args) -> Result<(), AppError> {
    let config = build_config(&args)?;
    init_logging(&config.logging);

    if let Some(path) = &args.dump_config {
        config.to_json_file(path)?;
        info!("Wrote config to {}", path.display());
        return Ok(());
    }
    let mode = args.mode;

    info!(
        "Starting {} / {}: waiting for {} observations ({}s timeout), then {} iterations",
        config.project_name,
        config.experiment_name,
        config.num_msgs_to_start,
        config.msg_timeout,
        config.max_num_iterations
    );

    let buffer = Arc::new(IngestionBuffer::new());
    let factory = StreamingPipelineFactory::new(Arc::clone(&buffer));
    let mut trainer = Trainer::new(config, Box::new(factory), 0, 1)?.with_feedback(feedback());

    let worker = spawn_ingest(&args, Arc::clone(&buffer))?;

    let result = trainer
        .setup(mode)
        .map_err(AppError::from)
        .and_then(|()| trainer.train().map_err(AppError::from));

    worker.stop();
    match worker.join() {
        Ok(stats) => info!("Ingested {} frames ({} dropped)", stats.received, stats.dropped),
        Err(e) => warn!("Ingest worker ended with error: {}", e),
    }

    let summary = result?;
    info!(
        "Done: {} steps from step {} (final loss {:?})",
        summary.steps_run, summary.start_step, summary.final_loss
    );
    Ok(())
}
