//! Splatgate Training Crate
//!
//! Start-up orchestration for training a scene-reconstruction model on a
//! live stream of posed images. Observations arrive asynchronously on an
//! ingest thread; the trainer brings its subsystems online and then waits at
//! a readiness gate until enough observations are buffered.
//!
//! ## Modules
//!
//! - [`ingest`]: Camera frames, the ingestion buffer and the ingest worker
//! - [`pipeline`]: Pipeline/data-manager contracts, callbacks, streaming pipeline
//! - [`readiness`]: The bounded-wait readiness gate
//! - [`trainer`]: Setup orchestration and the training loop
//! - [`config`], [`optim`], [`checkpoint`], [`viewer`], [`writer`], [`profiler`], [`feedback`]

pub mod checkpoint;
pub mod config;
pub mod feedback;
pub mod ingest;
pub mod optim;
pub mod pipeline;
pub mod profiler;
pub mod readiness;
pub mod trainer;
pub mod viewer;
pub mod writer;

pub use config::{ConfigError, TrainerConfig, VisMode};
pub use feedback::{ConsoleFeedback, Feedback, Level, TracingFeedback};
pub use ingest::{CameraFrame, CameraStream, IngestWorker, IngestionBuffer, ObservationDataset};
pub use pipeline::{SetupMode, StreamingPipelineFactory};
pub use readiness::{GateError, GateState, ReadinessGate, ReadinessPrecondition};
pub use trainer::{SetupError, TrainError, Trainer, TrainerState, TrainingRunner};
