//! Concurrently-written observation buffer.
//!
//! The ingest worker appends frames from its own thread while the trainer
//! reads the published index without taking the frame lock.

use crate::ingest::camera::CameraFrame;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};
use tracing::debug;

/// Read-only view of how far ingestion has progressed.
pub trait ObservationCounter: Send + Sync {
    /// Zero-based index of the most recently received observation.
    ///
    /// Reports 0 both before the first observation and after it, so a
    /// reader comparing against `k - 1` sees "k items received". The value
    /// never decreases.
    fn current_idx(&self) -> usize;
}

impl<T: ObservationCounter + ?Sized> ObservationCounter for Arc<T> {
    fn current_idx(&self) -> usize {
        (**self).current_idx()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("ingestion buffer is full ({capacity} observations)")]
    Full { capacity: usize },
    #[error("ingestion buffer lock poisoned")]
    Poisoned,
}

/// Append-only store of received camera frames.
#[derive(Debug, Default)]
pub struct IngestionBuffer {
    frames: RwLock<Vec<CameraFrame>>,
    current_idx: AtomicUsize,
    has_data: AtomicBool,
    capacity: Option<usize>,
}

impl IngestionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer that rejects frames once `capacity` have been stored.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frames: RwLock::new(Vec::with_capacity(capacity)),
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Store a frame and publish its index. Returns the frame's index.
    pub fn push(&self, frame: CameraFrame) -> Result<usize, BufferError> {
        let index = {
            let mut frames = self.frames.write().map_err(|_| BufferError::Poisoned)?;
            if let Some(capacity) = self.capacity {
                if frames.len() >= capacity {
                    return Err(BufferError::Full { capacity });
                }
            }
            frames.push(frame);
            frames.len() - 1
        };
        // Publish after the frame is visible so readers of the index can fetch it.
        self.current_idx.fetch_max(index, Ordering::AcqRel);
        self.has_data.store(true, Ordering::Release);
        debug!("Buffered observation {}", index);
        Ok(index)
    }

    /// Number of frames stored.
    pub fn len(&self) -> usize {
        self.read().map(|frames| frames.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        !self.has_data.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.capacity.is_some_and(|capacity| self.len() >= capacity)
    }

    /// Clone of the frame at `index`, if it has been received.
    pub fn get(&self, index: usize) -> Option<CameraFrame> {
        self.read().ok()?.get(index).cloned()
    }

    /// Shared access to every stored frame.
    pub fn read(&self) -> Result<RwLockReadGuard<'_, Vec<CameraFrame>>, BufferError> {
        self.frames.read().map_err(|_| BufferError::Poisoned)
    }
}

impl ObservationCounter for IngestionBuffer {
    fn current_idx(&self) -> usize {
        self.current_idx.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use image::RgbImage;
    use std::thread;

    fn frame(t: f64) -> CameraFrame {
        CameraFrame::new(RgbImage::new(2, 2), Vec3::ZERO, [0.0, 0.0, 0.0, 1.0], t)
    }

    #[test]
    fn test_current_idx_is_zero_based() {
        let buffer = IngestionBuffer::new();
        assert_eq!(buffer.current_idx(), 0);
        assert!(buffer.is_empty());

        buffer.push(frame(0.0)).unwrap();
        assert_eq!(buffer.current_idx(), 0);
        assert!(!buffer.is_empty());

        buffer.push(frame(0.1)).unwrap();
        buffer.push(frame(0.2)).unwrap();
        assert_eq!(buffer.current_idx(), 2);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_capacity_rejects_overflow() {
        let buffer = IngestionBuffer::with_capacity(2);
        buffer.push(frame(0.0)).unwrap();
        buffer.push(frame(0.1)).unwrap();
        assert!(buffer.is_full());
        assert!(matches!(
            buffer.push(frame(0.2)),
            Err(BufferError::Full { capacity: 2 })
        ));
        assert_eq!(buffer.current_idx(), 1);
    }

    #[test]
    fn test_get_returns_stored_frame() {
        let buffer = IngestionBuffer::new();
        buffer.push(frame(1.5)).unwrap();
        assert_eq!(buffer.get(0).map(|f| f.timestamp), Some(1.5));
        assert!(buffer.get(1).is_none());
    }

    #[test]
    fn test_concurrent_writers_never_lower_index() {
        let buffer = Arc::new(IngestionBuffer::new());
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for i in 0..50 {
                        buffer.push(frame(i as f64)).unwrap();
                    }
                })
            })
            .collect();

        let mut last = 0;
        while writers.iter().any(|w| !w.is_finished()) {
            let idx = buffer.current_idx();
            assert!(idx >= last);
            last = idx;
        }
        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(buffer.current_idx(), 199);
        assert_eq!(buffer.len(), 200);
    }
}
