//! Data ingestion module
//!
//! Live observations arrive on a background thread and accumulate in a
//! shared buffer:
//! - Camera frames and the stream trait that produces them
//! - The ingestion buffer and its lock-free progress counter
//! - The dataset handle handed to training
//! - The worker thread that drains a stream into the buffer

pub mod buffer;
pub mod camera;
pub mod dataset;
pub mod worker;

pub use buffer::{BufferError, IngestionBuffer, ObservationCounter};
pub use camera::{CameraFrame, CameraStream, StreamError};
pub use dataset::{CameraInfo, ObservationDataset};
pub use worker::{IngestStats, IngestWorker};
