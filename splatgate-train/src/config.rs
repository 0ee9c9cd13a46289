//! Trainer configuration.
//!
//! A [`TrainerConfig`] is built once at process start (usually from a JSON
//! file) and is read-only afterwards. Every field has a default so partial
//! files are accepted.

use crate::optim::OptimizerConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("num_msgs_to_start must be at least 1")]
    ZeroStartCount,
    #[error("msg_timeout must be a finite, non-negative number of seconds (got {0})")]
    InvalidTimeout(f64),
    #[error("max_num_iterations must be at least 1")]
    ZeroIterations,
    #[error("unknown vis mode: {0}")]
    UnknownVisMode(String),
}

/// Which visualization and event backends are requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisMode {
    #[serde(rename = "viewer")]
    Viewer,
    #[serde(rename = "viewer_legacy")]
    ViewerLegacy,
    #[serde(rename = "tensorboard")]
    Tensorboard,
    #[serde(rename = "wandb")]
    Wandb,
    #[serde(rename = "comet")]
    Comet,
    #[serde(rename = "viewer+tensorboard")]
    ViewerTensorboard,
    #[serde(rename = "viewer+wandb")]
    ViewerWandb,
    #[serde(rename = "viewer+comet")]
    ViewerComet,
}

impl VisMode {
    pub fn as_str(self) -> &'static str {
        match self {
            VisMode::Viewer => "viewer",
            VisMode::ViewerLegacy => "viewer_legacy",
            VisMode::Tensorboard => "tensorboard",
            VisMode::Wandb => "wandb",
            VisMode::Comet => "comet",
            VisMode::ViewerTensorboard => "viewer+tensorboard",
            VisMode::ViewerWandb => "viewer+wandb",
            VisMode::ViewerComet => "viewer+comet",
        }
    }

    pub fn all() -> &'static [VisMode] {
        &[
            VisMode::Viewer,
            VisMode::ViewerLegacy,
            VisMode::Tensorboard,
            VisMode::Wandb,
            VisMode::Comet,
            VisMode::ViewerTensorboard,
            VisMode::ViewerWandb,
            VisMode::ViewerComet,
        ]
    }
}

impl fmt::Display for VisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VisMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VisMode::all()
            .iter()
            .copied()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownVisMode(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Cuda,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub device_type: DeviceKind,
    pub device_index: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            device_type: DeviceKind::Cpu,
            device_index: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Viewer log file, relative to the experiment directory.
    pub relative_log_filename: PathBuf,
    pub websocket_host: String,
    pub websocket_port: u16,
    pub make_share_url: bool,
    /// Upper bound on cameras drawn in the viewer.
    pub max_num_display_images: usize,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            relative_log_filename: PathBuf::from("viewer_log_filename.txt"),
            websocket_host: "0.0.0.0".to_string(),
            websocket_port: 7007,
            make_share_url: false,
            max_num_display_images: 512,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfilerKind {
    None,
    Basic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalWriterConfig {
    pub enable: bool,
    /// Number of recent scalar names shown per log line.
    pub max_log_size: usize,
}

impl Default for LocalWriterConfig {
    fn default() -> Self {
        Self {
            enable: true,
            max_log_size: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Event/profile output directory, relative to the experiment directory.
    pub relative_log_dir: PathBuf,
    pub steps_per_log: usize,
    /// Events held in memory before the event writers are flushed.
    pub max_buffer_size: usize,
    pub local_writer: LocalWriterConfig,
    pub profiler: ProfilerKind,
    /// Stream tracing spans to Tracy. Needs the app's `tracy` feature.
    pub enable_tracy: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            relative_log_dir: PathBuf::from("."),
            steps_per_log: 10,
            max_buffer_size: 20,
            local_writer: LocalWriterConfig::default(),
            profiler: ProfilerKind::Basic,
            enable_tracy: false,
        }
    }
}

/// Names of the sensor topics the ingestion side subscribes to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub image_topic: String,
    pub pose_topic: String,
    pub camera_info_topic: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            image_topic: "/camera/color/image_raw".to_string(),
            pose_topic: "/camera/pose".to_string(),
            camera_info_topic: "/camera/color/camera_info".to_string(),
        }
    }
}

impl fmt::Display for TopicConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "image={}, pose={}, camera_info={}",
            self.image_topic, self.pose_topic, self.camera_info_topic
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// How long to wait (seconds) for enough observations before training.
    pub msg_timeout: f64,
    /// Number of observations that must be received before training can start.
    pub num_msgs_to_start: usize,
    pub experiment_name: String,
    pub project_name: String,
    pub method_name: String,
    pub timestamp: String,
    pub output_dir: PathBuf,
    /// Source data location shown by the viewer. Defaults to the experiment directory.
    pub data: Option<PathBuf>,
    pub max_num_iterations: usize,
    pub steps_per_save: usize,
    pub save_only_latest_checkpoint: bool,
    pub load_dir: Option<PathBuf>,
    pub load_step: Option<usize>,
    pub mixed_precision: bool,
    pub vis: VisMode,
    pub machine: MachineConfig,
    pub viewer: ViewerConfig,
    pub logging: LoggingConfig,
    pub optimizer: OptimizerConfig,
    pub topics: TopicConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs().to_string())
            .unwrap_or_else(|_| "0".to_string());
        Self {
            msg_timeout: 300.0,
            num_msgs_to_start: 10,
            experiment_name: "live".to_string(),
            project_name: "splatgate".to_string(),
            method_name: "streaming".to_string(),
            timestamp,
            output_dir: PathBuf::from("outputs"),
            data: None,
            max_num_iterations: 30_000,
            steps_per_save: 2_000,
            save_only_latest_checkpoint: true,
            load_dir: None,
            load_step: None,
            mixed_precision: false,
            vis: VisMode::Viewer,
            machine: MachineConfig::default(),
            viewer: ViewerConfig::default(),
            logging: LoggingConfig::default(),
            optimizer: OptimizerConfig::default(),
            topics: TopicConfig::default(),
        }
    }
}

impl TrainerConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading trainer config from {}", path.display());
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Reject settings the readiness gate and training loop cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_msgs_to_start == 0 {
            return Err(ConfigError::ZeroStartCount);
        }
        if !self.msg_timeout.is_finite() || self.msg_timeout < 0.0 {
            return Err(ConfigError::InvalidTimeout(self.msg_timeout));
        }
        // finite values past Duration's range
        self.msg_timeout()?;
        if self.max_num_iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        Ok(())
    }

    /// Gate wait budget.
    pub fn msg_timeout(&self) -> Result<Duration, ConfigError> {
        Duration::try_from_secs_f64(self.msg_timeout)
            .map_err(|_| ConfigError::InvalidTimeout(self.msg_timeout))
    }

    /// `<output_dir>/<experiment_name>/<method_name>/<timestamp>`
    pub fn base_dir(&self) -> PathBuf {
        self.output_dir
            .join(&self.experiment_name)
            .join(&self.method_name)
            .join(&self.timestamp)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.base_dir().join("checkpoints")
    }

    pub fn is_viewer_enabled(&self) -> bool {
        matches!(
            self.vis,
            VisMode::Viewer | VisMode::ViewerTensorboard | VisMode::ViewerWandb | VisMode::ViewerComet
        )
    }

    pub fn is_viewer_legacy_enabled(&self) -> bool {
        self.vis == VisMode::ViewerLegacy
    }

    pub fn is_tensorboard_enabled(&self) -> bool {
        matches!(self.vis, VisMode::Tensorboard | VisMode::ViewerTensorboard)
    }

    pub fn is_wandb_enabled(&self) -> bool {
        matches!(self.vis, VisMode::Wandb | VisMode::ViewerWandb)
    }

    pub fn is_comet_enabled(&self) -> bool {
        matches!(self.vis, VisMode::Comet | VisMode::ViewerComet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TrainerConfig::default();
        assert_eq!(config.msg_timeout, 300.0);
        assert_eq!(config.num_msgs_to_start, 10);
        assert!(config.validate().is_ok());
        assert_eq!(config.msg_timeout().unwrap(), Duration::from_secs(300));
    }

    #[test]
    fn test_validate_rejects_zero_start_count() {
        let config = TrainerConfig {
            num_msgs_to_start: 0,
            ..TrainerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroStartCount)));
    }

    #[test]
    fn test_validate_rejects_bad_timeouts() {
        for timeout in [-1.0, f64::NAN, f64::INFINITY] {
            let config = TrainerConfig {
                msg_timeout: timeout,
                ..TrainerConfig::default()
            };
            assert!(matches!(config.validate(), Err(ConfigError::InvalidTimeout(_))));
        }
        let config = TrainerConfig {
            msg_timeout: 0.0,
            ..TrainerConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_timeout_beyond_duration_range() {
        let config = TrainerConfig {
            msg_timeout: 1e20,
            ..TrainerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTimeout(t)) if t == 1e20));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "num_msgs_to_start": 3, "vis": "viewer+tensorboard", "topics": { "image_topic": "/rgb" } }"#;
        let config: TrainerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.num_msgs_to_start, 3);
        assert_eq!(config.msg_timeout, 300.0);
        assert_eq!(config.topics.image_topic, "/rgb");
        assert_eq!(config.topics.pose_topic, "/camera/pose");
        assert!(!config.logging.enable_tracy);
        assert!(config.is_viewer_enabled());
        assert!(config.is_tensorboard_enabled());
        assert!(!config.is_viewer_legacy_enabled());
    }

    #[test]
    fn test_vis_mode_from_str() {
        for mode in VisMode::all() {
            assert_eq!(mode.as_str().parse::<VisMode>().unwrap(), *mode);
        }
        assert!("viewer+nothing".parse::<VisMode>().is_err());
    }

    #[test]
    fn test_json_file_roundtrip_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = TrainerConfig {
            num_msgs_to_start: 0,
            ..TrainerConfig::default()
        };
        config.to_json_file(&path).unwrap();
        assert!(matches!(
            TrainerConfig::from_json_file(&path),
            Err(ConfigError::ZeroStartCount)
        ));
    }

    #[test]
    fn test_base_dir_layout() {
        let config = TrainerConfig {
            output_dir: PathBuf::from("out"),
            experiment_name: "lab".to_string(),
            method_name: "streaming".to_string(),
            timestamp: "42".to_string(),
            ..TrainerConfig::default()
        };
        assert_eq!(config.base_dir(), PathBuf::from("out/lab/streaming/42"));
        assert_eq!(
            config.checkpoint_dir(),
            PathBuf::from("out/lab/streaming/42/checkpoints")
        );
    }
}
