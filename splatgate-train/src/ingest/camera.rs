//! Posed camera observations and the stream trait that produces them.

use glam::{Mat4, Quat, Vec3};
use image::RgbImage;

/// A single posed image received from the sensor stream.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    /// RGB image data
    pub image: RgbImage,
    /// Camera position in world space
    pub position: Vec3,
    /// Camera orientation (quaternion: x, y, z, w)
    pub rotation: [f32; 4],
    /// Timestamp in seconds (relative to stream start)
    pub timestamp: f64,
    /// Optional depth map (same resolution as image)
    pub depth: Option<Vec<f32>>,
}

impl CameraFrame {
    pub fn new(image: RgbImage, position: Vec3, rotation: [f32; 4], timestamp: f64) -> Self {
        Self {
            image,
            position,
            rotation,
            timestamp,
            depth: None,
        }
    }

    /// Attach a depth map. Fails if the map does not cover every pixel.
    pub fn with_depth(mut self, depth: Vec<f32>) -> Result<Self, StreamError> {
        let (width, height) = self.dimensions();
        let expected = width as usize * height as usize;
        if depth.len() != expected {
            return Err(StreamError::InvalidData(format!(
                "depth map has {} values, expected {}",
                depth.len(),
                expected
            )));
        }
        self.depth = Some(depth);
        Ok(self)
    }

    /// Image dimensions (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Camera-to-world transform built from the pose.
    pub fn camera_to_world(&self) -> Mat4 {
        let [x, y, z, w] = self.rotation;
        Mat4::from_rotation_translation(Quat::from_xyzw(x, y, z, w).normalize(), self.position)
    }

    /// Mean RGB color of the image, each channel in 0..=1.
    pub fn mean_color(&self) -> Vec3 {
        let pixel_count = self.image.width() as usize * self.image.height() as usize;
        if pixel_count == 0 {
            return Vec3::ZERO;
        }
        let mut sum = [0u64; 3];
        for pixel in self.image.pixels() {
            sum[0] += pixel[0] as u64;
            sum[1] += pixel[1] as u64;
            sum[2] += pixel[2] as u64;
        }
        let scale = 1.0 / (pixel_count as f32 * 255.0);
        Vec3::new(
            sum[0] as f32 * scale,
            sum[1] as f32 * scale,
            sum[2] as f32 * scale,
        )
    }
}

/// Source of posed frames, drained by the ingest worker.
pub trait CameraStream {
    /// Get the next frame from the stream.
    /// Returns None when the stream ends
    fn next_frame(&mut self) -> Result<Option<CameraFrame>, StreamError>;

    /// Frame rate (frames per second), if known
    fn frame_rate(&self) -> Option<f32>;

    fn is_active(&self) -> bool;
}

/// Errors that can occur during stream processing
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image decoding error: {0}")]
    ImageDecode(#[from] image::ImageError),
    #[error("Stream ended unexpectedly")]
    StreamEnded,
    #[error("Invalid frame data: {0}")]
    InvalidData(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_mean_color_of_solid_image() {
        let image = RgbImage::from_pixel(4, 2, Rgb([255, 0, 51]));
        let frame = CameraFrame::new(image, Vec3::ZERO, [0.0, 0.0, 0.0, 1.0], 0.0);
        let mean = frame.mean_color();
        assert!((mean.x - 1.0).abs() < 1e-6);
        assert!(mean.y.abs() < 1e-6);
        assert!((mean.z - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_with_depth_rejects_wrong_size() {
        let image = RgbImage::new(2, 2);
        let frame = CameraFrame::new(image, Vec3::ZERO, [0.0, 0.0, 0.0, 1.0], 0.0);
        assert!(frame.clone().with_depth(vec![1.0; 3]).is_err());
        let frame = frame.with_depth(vec![1.0; 4]).unwrap();
        assert_eq!(frame.depth.as_ref().map(Vec::len), Some(4));
    }

    #[test]
    fn test_camera_to_world_translation() {
        let frame = CameraFrame::new(
            RgbImage::new(1, 1),
            Vec3::new(1.0, 2.0, 3.0),
            [0.0, 0.0, 0.0, 1.0],
            0.0,
        );
        let origin = frame.camera_to_world().transform_point3(Vec3::ZERO);
        assert_eq!(origin, Vec3::new(1.0, 2.0, 3.0));
    }
}
