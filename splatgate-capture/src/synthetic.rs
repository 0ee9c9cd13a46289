//! Generated frames for dry runs and tests.

use crate::source::{CaptureError, CaptureSource, FrameData};
use image::{Rgb, RgbImage};
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

/// Emits gradient frames whose hue drifts with the frame number.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    interval: Duration,
    max_frames: Option<u64>,
    frame_count: u64,
    start_time: Instant,
    active: bool,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, interval: Duration) -> Result<Self, CaptureError> {
        if width == 0 || height == 0 {
            return Err(CaptureError::InvalidConfig(format!(
                "resolution must be non-zero, got {}x{}",
                width, height
            )));
        }
        Ok(Self {
            width,
            height,
            interval,
            max_frames: None,
            frame_count: 0,
            start_time: Instant::now(),
            active: true,
        })
    }

    /// End the stream after `max_frames` frames.
    pub fn with_max_frames(mut self, max_frames: u64) -> Self {
        self.max_frames = Some(max_frames);
        self
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    fn render(&self, n: u64) -> RgbImage {
        let phase = (n % 64) as f32 / 64.0;
        let (w, h) = (self.width as f32, self.height as f32);
        RgbImage::from_fn(self.width, self.height, |x, y| {
            let u = x as f32 / w;
            let v = y as f32 / h;
            Rgb([
                (255.0 * ((u + phase) % 1.0)) as u8,
                (255.0 * v) as u8,
                (255.0 * (1.0 - phase)) as u8,
            ])
        })
    }
}

impl CaptureSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Option<FrameData>, CaptureError> {
        if !self.active {
            return Ok(None);
        }
        if self.max_frames.is_some_and(|max| self.frame_count >= max) {
            self.stop();
            return Ok(None);
        }
        if !self.interval.is_zero() {
            thread::sleep(self.interval);
        }
        let frame_number = self.frame_count;
        self.frame_count += 1;
        Ok(Some(FrameData::new(
            self.render(frame_number),
            self.start_time.elapsed().as_secs_f64(),
            frame_number,
        )))
    }

    fn frame_rate(&self) -> Option<f32> {
        (!self.interval.is_zero()).then(|| 1.0 / self.interval.as_secs_f32())
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn stop(&mut self) {
        if self.active {
            self.active = false;
            info!("Synthetic source stopped after {} frames", self.frame_count);
        }
    }
}
