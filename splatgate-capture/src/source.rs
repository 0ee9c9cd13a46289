//! Common capture source types and traits.

use glam::{Quat, Vec3};
use image::RgbImage;
use splatgate_train::ingest::{CameraFrame, CameraStream, StreamError};
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during capture.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("No images found in {0}")]
    NoImages(PathBuf),

    #[error("Failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Invalid source configuration: {0}")]
    InvalidConfig(String),

    #[error("Stream ended")]
    StreamEnded,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CaptureError> for StreamError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::Io(e) => StreamError::Io(e),
            CaptureError::Decode { source, .. } => StreamError::ImageDecode(source),
            CaptureError::StreamEnded => StreamError::StreamEnded,
            other => StreamError::InvalidData(other.to_string()),
        }
    }
}

/// Raw frame data from a capture source.
#[derive(Debug, Clone)]
pub struct FrameData {
    pub image: RgbImage,
    /// Seconds since the source started.
    pub timestamp: f64,
    pub frame_number: u64,
}

impl FrameData {
    pub fn new(image: RgbImage, timestamp: f64, frame_number: u64) -> Self {
        Self {
            image,
            timestamp,
            frame_number,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Source of raw frames without pose information.
pub trait CaptureSource {
    fn next_frame(&mut self) -> Result<Option<FrameData>, CaptureError>;

    fn frame_rate(&self) -> Option<f32>;

    fn resolution(&self) -> (u32, u32);

    fn is_active(&self) -> bool;

    fn stop(&mut self);
}

/// Where the camera is for a given frame number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PoseTrack {
    Fixed { position: Vec3, rotation: Quat },
    /// Circle around the origin at `radius`, looking inward, one revolution
    /// every `frames_per_revolution` frames.
    Orbit {
        radius: f32,
        height: f32,
        frames_per_revolution: u32,
    },
}

impl Default for PoseTrack {
    fn default() -> Self {
        PoseTrack::Fixed {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }
}

impl PoseTrack {
    pub fn pose_at(&self, frame_number: u64) -> (Vec3, Quat) {
        match *self {
            PoseTrack::Fixed { position, rotation } => (position, rotation),
            PoseTrack::Orbit {
                radius,
                height,
                frames_per_revolution,
            } => {
                let period = frames_per_revolution.max(1) as u64;
                let angle = (frame_number % period) as f32 / period as f32 * std::f32::consts::TAU;
                let position = Vec3::new(radius * angle.sin(), height, radius * angle.cos());
                // -Z of the camera points at the origin
                let rotation = Quat::from_rotation_y(angle);
                (position, rotation)
            }
        }
    }
}

/// A capture source paired with a pose track; feeds the ingest worker.
pub struct PosedCaptureSource<S: CaptureSource> {
    source: S,
    track: PoseTrack,
}

impl<S: CaptureSource> PosedCaptureSource<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            track: PoseTrack::default(),
        }
    }

    pub fn with_track(mut self, track: PoseTrack) -> Self {
        self.track = track;
        self
    }

    pub fn with_pose(self, position: Vec3, rotation: Quat) -> Self {
        self.with_track(PoseTrack::Fixed { position, rotation })
    }

    pub fn track(&self) -> PoseTrack {
        self.track
    }

    pub fn inner(&self) -> &S {
        &self.source
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.source
    }
}

impl<S: CaptureSource> CameraStream for PosedCaptureSource<S> {
    fn next_frame(&mut self) -> Result<Option<CameraFrame>, StreamError> {
        let Some(frame) = self.source.next_frame()? else {
            return Ok(None);
        };
        let (position, rotation) = self.track.pose_at(frame.frame_number);
        Ok(Some(CameraFrame::new(
            frame.image,
            position,
            rotation.to_array(),
            frame.timestamp,
        )))
    }

    fn frame_rate(&self) -> Option<f32> {
        self.source.frame_rate()
    }

    fn is_active(&self) -> bool {
        self.source.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        left: u64,
    }

    impl CaptureSource for Fixed {
        fn next_frame(&mut self) -> Result<Option<FrameData>, CaptureError> {
            if self.left == 0 {
                return Ok(None);
            }
            self.left -= 1;
            Ok(Some(FrameData::new(RgbImage::new(2, 2), 0.0, 4 - self.left)))
        }

        fn frame_rate(&self) -> Option<f32> {
            None
        }

        fn resolution(&self) -> (u32, u32) {
            (2, 2)
        }

        fn is_active(&self) -> bool {
            self.left > 0
        }

        fn stop(&mut self) {
            self.left = 0;
        }
    }

    #[test]
    fn test_orbit_pose_stays_on_circle() {
        let track = PoseTrack::Orbit {
            radius: 2.0,
            height: 0.5,
            frames_per_revolution: 8,
        };
        for n in 0..16 {
            let (position, rotation) = track.pose_at(n);
            let planar = Vec3::new(position.x, 0.0, position.z).length();
            assert!((planar - 2.0).abs() < 1e-5);
            assert_eq!(position.y, 0.5);
            // forward axis points back at the origin
            let forward = rotation * Vec3::NEG_Z;
            let to_origin = (-Vec3::new(position.x, 0.0, position.z)).normalize();
            assert!(forward.dot(to_origin) > 0.999);
        }
        assert_eq!(track.pose_at(1), track.pose_at(9));
    }

    #[test]
    fn test_posed_source_attaches_pose() {
        let mut posed = PosedCaptureSource::new(Fixed { left: 4 }).with_pose(Vec3::X, Quat::IDENTITY);
        let frame = posed.next_frame().unwrap().unwrap();
        assert_eq!(frame.position, Vec3::X);
        assert_eq!(frame.rotation, [0.0, 0.0, 0.0, 1.0]);
        while posed.next_frame().unwrap().is_some() {}
        assert!(!CameraStream::is_active(&posed));
    }

    #[test]
    fn test_capture_error_maps_to_stream_error() {
        let err: StreamError = CaptureError::StreamEnded.into();
        assert!(matches!(err, StreamError::StreamEnded));
        let err: StreamError = CaptureError::NoImages(PathBuf::from("x")).into();
        assert!(matches!(err, StreamError::InvalidData(_)));
    }
}
