//! Replay a directory of images as a frame stream.

use crate::source::{CaptureError, CaptureSource, FrameData};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

/// Image files in a directory, replayed in file-name order.
pub struct ImageDirSource {
    dir: PathBuf,
    paths: Vec<PathBuf>,
    next: usize,
    frame_interval: Option<Duration>,
    start_time: Instant,
    last_emit: Option<Instant>,
    resolution: (u32, u32),
    active: bool,
}

impl ImageDirSource {
    /// Open `dir`. Fails if it holds no supported images.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let dir = dir.as_ref().to_path_buf();
        let mut paths: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_image(path))
            .collect();
        paths.sort();

        let first = paths.first().ok_or_else(|| CaptureError::NoImages(dir.clone()))?;
        let resolution = image::image_dimensions(first).map_err(|source| CaptureError::Decode {
            path: first.clone(),
            source,
        })?;
        info!(
            "Replaying {} images from {} at {}x{}",
            paths.len(),
            dir.display(),
            resolution.0,
            resolution.1
        );

        Ok(Self {
            dir,
            paths,
            next: 0,
            frame_interval: None,
            start_time: Instant::now(),
            last_emit: None,
            resolution,
            active: true,
        })
    }

    /// Pace replay at `fps`. Without pacing frames are emitted as fast as
    /// they decode.
    pub fn with_frame_rate(mut self, fps: f32) -> Result<Self, CaptureError> {
        if !(fps.is_finite() && fps > 0.0) {
            return Err(CaptureError::InvalidConfig(format!("frame rate must be positive, got {}", fps)));
        }
        let interval = Duration::try_from_secs_f32(1.0 / fps)
            .map_err(|e| CaptureError::InvalidConfig(format!("frame rate {} out of range: {}", fps, e)))?;
        self.frame_interval = Some(interval);
        Ok(self)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    fn pace(&mut self) {
        if let (Some(interval), Some(last)) = (self.frame_interval, self.last_emit) {
            let since = last.elapsed();
            if since < interval {
                thread::sleep(interval - since);
            }
        }
        self.last_emit = Some(Instant::now());
    }
}

fn is_image(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

impl CaptureSource for ImageDirSource {
    fn next_frame(&mut self) -> Result<Option<FrameData>, CaptureError> {
        if !self.active {
            return Ok(None);
        }
        let Some(path) = self.paths.get(self.next).cloned() else {
            self.stop();
            return Ok(None);
        };

        let image = image::open(&path)
            .map_err(|source| CaptureError::Decode {
                path: path.clone(),
                source,
            })?
            .to_rgb8();
        self.pace();

        let frame_number = self.next as u64;
        self.next += 1;
        let timestamp = self.start_time.elapsed().as_secs_f64();
        debug!("Read frame {} from {}", frame_number, path.display());
        Ok(Some(FrameData::new(image, timestamp, frame_number)))
    }

    fn frame_rate(&self) -> Option<f32> {
        self.frame_interval.map(|interval| 1.0 / interval.as_secs_f32())
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn stop(&mut self) {
        if self.active {
            self.active = false;
            info!("Image replay stopped after {} frames", self.next);
        }
    }
}
