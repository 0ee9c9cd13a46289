//! Live viewer service.
//!
//! The viewer records where it is served and which cameras it has drawn.
//! Rendering happens in the client; this side only tracks state and
//! publishes the banner shown at start-up.

use crate::config::ViewerConfig;
use crate::ingest::{CameraInfo, ObservationDataset};
use crate::pipeline::Pipeline;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ViewerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct ViewerState {
    config: ViewerConfig,
    log_filename: PathBuf,
    datapath: PathBuf,
    train_lock: Arc<Mutex<()>>,
    drawn: Vec<CameraInfo>,
    /// Banner lines shown once at start-up.
    pub viewer_info: Vec<String>,
}

impl ViewerState {
    pub fn new(
        config: &ViewerConfig,
        log_filename: &Path,
        datapath: &Path,
        pipeline: &dyn Pipeline,
        train_lock: Arc<Mutex<()>>,
        share: bool,
    ) -> Result<Self, ViewerError> {
        let url = format!("ws://{}:{}", config.websocket_host, config.websocket_port);
        let mut viewer_info = vec![format!("Viewer running locally at: {}", url)];
        if share {
            viewer_info.push("Share URLs require a tunnel service; serving locally only".to_string());
        }

        if let Some(parent) = log_filename.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut log = BufWriter::new(File::create(log_filename)?);
        writeln!(log, "{}", url)?;
        writeln!(log, "data: {}", datapath.display())?;
        writeln!(log, "parameter groups: {}", pipeline.parameter_groups().join(", "))?;
        log.flush()?;

        info!("Viewer log written to {}", log_filename.display());
        Ok(Self {
            config: config.clone(),
            log_filename: log_filename.to_path_buf(),
            datapath: datapath.to_path_buf(),
            train_lock,
            drawn: Vec::new(),
            viewer_info,
        })
    }

    /// Register cameras that arrived since the last call.
    ///
    /// `cameras_drawn` holds the dataset indices already drawn; it grows
    /// until `max_num_display_images` is reached. Returns how many were added.
    pub fn update_cameras(&mut self, dataset: &ObservationDataset, cameras_drawn: &mut Vec<usize>) -> usize {
        let limit = self.config.max_num_display_images;
        if cameras_drawn.len() >= limit {
            return 0;
        }
        let start = cameras_drawn.last().map_or(0, |&last| last + 1);
        let new: Vec<CameraInfo> = dataset
            .cameras_from(start)
            .into_iter()
            .take(limit - cameras_drawn.len())
            .collect();

        // Drawing reads the model, so hold off training while it happens.
        let _guard = self.train_lock.lock();
        for camera in &new {
            cameras_drawn.push(camera.index);
        }
        self.drawn.extend(new.iter().copied());
        if !new.is_empty() {
            debug!("Viewer drew {} new cameras ({} total)", new.len(), cameras_drawn.len());
        }
        new.len()
    }

    pub fn drawn(&self) -> &[CameraInfo] {
        &self.drawn
    }

    pub fn log_filename(&self) -> &Path {
        &self.log_filename
    }

    pub fn datapath(&self) -> &Path {
        &self.datapath
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{CameraFrame, IngestionBuffer};
    use crate::pipeline::{Device, SetupMode, StreamingDataManager, StreamingPipeline};
    use glam::Vec3;
    use image::RgbImage;

    fn pipeline(buffer: Arc<IngestionBuffer>) -> StreamingPipeline {
        StreamingPipeline::new(StreamingDataManager::new(buffer, SetupMode::Val), Device::Cpu)
    }

    fn push(buffer: &IngestionBuffer, n: usize) {
        for i in 0..n {
            buffer
                .push(CameraFrame::new(
                    RgbImage::new(1, 1),
                    Vec3::new(i as f32, 0.0, 0.0),
                    [0.0, 0.0, 0.0, 1.0],
                    i as f64,
                ))
                .unwrap();
        }
    }

    #[test]
    fn test_banner_and_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("nested/viewer_log_filename.txt");
        let buffer = Arc::new(IngestionBuffer::new());
        let viewer = ViewerState::new(
            &ViewerConfig::default(),
            &log,
            dir.path(),
            &pipeline(buffer),
            Arc::new(Mutex::new(())),
            true,
        )
        .unwrap();

        assert_eq!(viewer.viewer_info.len(), 2);
        assert!(viewer.viewer_info[0].contains("ws://0.0.0.0:7007"));
        let contents = fs::read_to_string(&log).unwrap();
        assert!(contents.contains("appearance"));
    }

    #[test]
    fn test_update_cameras_is_incremental_and_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(IngestionBuffer::new());
        let config = ViewerConfig {
            max_num_display_images: 5,
            ..ViewerConfig::default()
        };
        let mut viewer = ViewerState::new(
            &config,
            &dir.path().join("viewer.txt"),
            dir.path(),
            &pipeline(Arc::clone(&buffer)),
            Arc::new(Mutex::new(())),
            false,
        )
        .unwrap();
        let dataset = ObservationDataset::new(Arc::clone(&buffer));
        let mut drawn = Vec::new();

        push(&buffer, 3);
        assert_eq!(viewer.update_cameras(&dataset, &mut drawn), 3);
        assert_eq!(viewer.update_cameras(&dataset, &mut drawn), 0);

        push(&buffer, 4);
        assert_eq!(viewer.update_cameras(&dataset, &mut drawn), 2);
        assert_eq!(drawn, vec![0, 1, 2, 3, 4]);
        assert_eq!(viewer.drawn().len(), 5);
    }
}
