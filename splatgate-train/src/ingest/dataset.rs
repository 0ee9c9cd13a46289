//! Dataset handle backed by the live ingestion buffer.

use crate::ingest::buffer::IngestionBuffer;
use crate::ingest::camera::CameraFrame;
use glam::Mat4;
use std::sync::Arc;

/// Pose-only view of a received observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraInfo {
    pub index: usize,
    pub camera_to_world: Mat4,
    pub width: u32,
    pub height: u32,
    pub timestamp: f64,
}

/// Training dataset handle.
///
/// Cloning is cheap; every clone observes the same buffer, which keeps
/// growing while ingestion runs. No snapshot is taken.
#[derive(Debug, Clone)]
pub struct ObservationDataset {
    buffer: Arc<IngestionBuffer>,
}

impl ObservationDataset {
    pub fn new(buffer: Arc<IngestionBuffer>) -> Self {
        Self { buffer }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<CameraFrame> {
        self.buffer.get(index)
    }

    pub fn latest(&self) -> Option<CameraFrame> {
        let len = self.len();
        if len == 0 { None } else { self.get(len - 1) }
    }

    /// Poses of the frames with index in `start..`, in arrival order.
    pub fn cameras_from(&self, start: usize) -> Vec<CameraInfo> {
        let Ok(frames) = self.buffer.read() else {
            return Vec::new();
        };
        frames
            .iter()
            .enumerate()
            .skip(start)
            .map(|(index, frame)| {
                let (width, height) = frame.dimensions();
                CameraInfo {
                    index,
                    camera_to_world: frame.camera_to_world(),
                    width,
                    height,
                    timestamp: frame.timestamp,
                }
            })
            .collect()
    }

    pub fn cameras(&self) -> Vec<CameraInfo> {
        self.cameras_from(0)
    }

    pub fn buffer(&self) -> &Arc<IngestionBuffer> {
        &self.buffer
    }
}
