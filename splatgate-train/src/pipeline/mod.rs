//! Pipeline and data-manager contracts consumed by the trainer.
//!
//! The trainer never looks inside the model. It builds a pipeline through a
//! [`PipelineFactory`], asks it for parameter groups and callbacks, watches
//! its data manager's loader index during start-up, and afterwards drives
//! [`Pipeline::train_iteration`].

pub mod callbacks;
pub mod streaming;

pub use callbacks::{
    CallbackContext, CallbackFn, CallbackLocation, TrainingCallback, TrainingCallbackAttributes,
};
pub use streaming::{StreamingDataManager, StreamingPipeline, StreamingPipelineFactory};

use crate::config::{DeviceKind, MachineConfig};
use crate::ingest::{ObservationCounter, ObservationDataset};
use crate::optim::{GradScaler, OptimizerError, Optimizers};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no observations available for training")]
    NoData,
    #[error("unsupported device: {0}")]
    UnsupportedDevice(Device),
    #[error("state mismatch: {0}")]
    StateMismatch(String),
    #[error("optimizer error: {0}")]
    Optimizer(#[from] OptimizerError),
    #[error("unknown setup mode '{0}' (expected val, test or inference)")]
    UnknownSetupMode(String),
}

/// Which datasets the pipeline materializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetupMode {
    /// Train plus validation split.
    #[default]
    Val,
    /// Train plus test split.
    Test,
    /// No held-out split.
    Inference,
}

impl fmt::Display for SetupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupMode::Val => write!(f, "val"),
            SetupMode::Test => write!(f, "test"),
            SetupMode::Inference => write!(f, "inference"),
        }
    }
}

impl FromStr for SetupMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "val" => Ok(SetupMode::Val),
            "test" => Ok(SetupMode::Test),
            "inference" => Ok(SetupMode::Inference),
            other => Err(PipelineError::UnknownSetupMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda(usize),
}

impl Device {
    /// Device for this process. CUDA ranks are offset by the local rank.
    pub fn from_config(machine: &MachineConfig, local_rank: usize) -> Self {
        match machine.device_type {
            DeviceKind::Cpu => Device::Cpu,
            DeviceKind::Cuda => Device::Cuda(machine.device_index + local_rank),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(index) => write!(f, "cuda:{}", index),
        }
    }
}

/// Held-out split materialized by the data manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalSplit {
    pub mode: SetupMode,
    /// Every `interval`-th observation is held out.
    pub interval: usize,
}

impl EvalSplit {
    pub fn contains(&self, index: usize) -> bool {
        self.interval > 0 && index % self.interval == self.interval - 1
    }
}

/// Scalars produced by one training iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepMetrics {
    pub loss: f32,
    pub scalars: BTreeMap<String, f32>,
}

pub trait DataManager: Send + Sync {
    /// Loader whose index reports ingestion progress.
    fn train_image_dataloader(&self) -> &dyn ObservationCounter;

    /// Handle to the training observations, `None` if not materialized.
    fn train_dataset(&self) -> Option<ObservationDataset>;

    fn eval_split(&self) -> Option<EvalSplit>;
}

pub trait Pipeline: Send {
    fn datamanager(&self) -> &dyn DataManager;

    /// Names of the parameter groups to build optimizers for.
    fn parameter_groups(&self) -> Vec<String>;

    fn training_callbacks(&self, attrs: &TrainingCallbackAttributes<'_>) -> Vec<TrainingCallback>;

    fn train_iteration(
        &mut self,
        step: usize,
        optimizers: &mut Optimizers,
        grad_scaler: &GradScaler,
    ) -> Result<StepMetrics, PipelineError>;

    fn state_dict(&self) -> BTreeMap<String, Vec<f32>>;

    fn load_state_dict(&mut self, state: BTreeMap<String, Vec<f32>>) -> Result<(), PipelineError>;
}

/// Builds the pipeline for one training run.
pub trait PipelineFactory {
    fn setup(
        &self,
        device: Device,
        mode: SetupMode,
        world_size: usize,
        local_rank: usize,
        grad_scaler: &GradScaler,
    ) -> Result<Box<dyn Pipeline>, PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_mode_from_str() {
        for mode in [SetupMode::Val, SetupMode::Test, SetupMode::Inference] {
            assert_eq!(mode.to_string().parse::<SetupMode>().unwrap(), mode);
        }
        assert!(matches!(
            "train".parse::<SetupMode>(),
            Err(PipelineError::UnknownSetupMode(_))
        ));
    }

    #[test]
    fn test_device_from_config() {
        let cpu = MachineConfig::default();
        assert_eq!(Device::from_config(&cpu, 3), Device::Cpu);

        let cuda = MachineConfig {
            device_type: DeviceKind::Cuda,
            device_index: 1,
        };
        assert_eq!(Device::from_config(&cuda, 2), Device::Cuda(3));
        assert_eq!(Device::Cuda(3).to_string(), "cuda:3");
    }

    #[test]
    fn test_eval_split_membership() {
        let split = EvalSplit {
            mode: SetupMode::Val,
            interval: 4,
        };
        let held_out: Vec<usize> = (0..12).filter(|&i| split.contains(i)).collect();
        assert_eq!(held_out, vec![3, 7, 11]);
    }
}
