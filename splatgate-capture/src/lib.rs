//! Splatgate Capture - frame sources for the ingestion buffer
//!
//! Raw sources implement [`CaptureSource`]; wrapping one in a
//! [`PosedCaptureSource`] attaches camera poses and yields a
//! [`CameraStream`] that the ingest worker can drain.
//!
//! - [`ImageDirSource`]: replay a directory of images, optionally paced
//! - [`SyntheticSource`]: generated frames at a fixed interval
//!
//! ## Example
//!
//! ```ignore
//! use splatgate_capture::{ImageDirSource, PosedCaptureSource, PoseTrack};
//! use splatgate_train::{IngestWorker, IngestionBuffer};
//!
//! let source = ImageDirSource::open("frames/")?.with_frame_rate(10.0)?;
//! let stream = PosedCaptureSource::new(source).with_track(PoseTrack::Orbit {
//!     radius: 2.0,
//!     height: 0.0,
//!     frames_per_revolution: 120,
//! });
//! let worker = IngestWorker::spawn(stream, buffer)?;
//! ```

mod image_dir;
mod source;
mod synthetic;

pub use image_dir::ImageDirSource;
pub use source::{CaptureError, CaptureSource, FrameData, PoseTrack, PosedCaptureSource};
pub use synthetic::SyntheticSource;

pub use splatgate_train::ingest::{CameraFrame, CameraStream, StreamError};
