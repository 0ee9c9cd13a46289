//! JSON checkpoints of pipeline and optimizer state.

use crate::optim::{OptimizerError, OptimizerState, Optimizers};
use crate::pipeline::{Pipeline, PipelineError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const SUFFIX: &str = ".ckpt.json";

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no checkpoints found in {0}")]
    NotFound(PathBuf),
    #[error("pipeline rejected checkpoint: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("optimizers rejected checkpoint: {0}")]
    Optimizer(#[from] OptimizerError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub step: usize,
    pub pipeline: BTreeMap<String, Vec<f32>>,
    pub optimizers: BTreeMap<String, OptimizerState>,
}

pub fn checkpoint_path(dir: &Path, step: usize) -> PathBuf {
    dir.join(format!("step-{:09}{}", step, SUFFIX))
}

fn step_of(path: &Path) -> Option<usize> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix("step-")?.strip_suffix(SUFFIX)?.parse().ok()
}

/// Checkpoint files in `dir`, sorted by step.
pub fn list_checkpoints(dir: &Path) -> Result<Vec<(usize, PathBuf)>, CheckpointError> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(step) = step_of(&path) {
            found.push((step, path));
        }
    }
    found.sort_by_key(|(step, _)| *step);
    Ok(found)
}

impl Checkpoint {
    pub fn capture(step: usize, pipeline: &dyn Pipeline, optimizers: &Optimizers) -> Self {
        Self {
            step,
            pipeline: pipeline.state_dict(),
            optimizers: optimizers.state_dict(),
        }
    }

    pub fn read(path: &Path) -> Result<Self, CheckpointError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Write to `path` through a temporary file so a crash never leaves a
    /// truncated checkpoint behind.
    pub fn write(&self, path: &Path) -> Result<(), CheckpointError> {
        let tmp = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer(&mut writer, self)?;
            writer.flush()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Restore state from `load_dir` if one is configured.
///
/// Uses `load_step` when given, otherwise the latest checkpoint. Returns the
/// step to resume from (one past the saved step), or `None` for a fresh start.
#[tracing::instrument(skip_all, fields(load_dir = ?load_dir))]
pub fn load_checkpoint(
    load_dir: Option<&Path>,
    load_step: Option<usize>,
    pipeline: &mut dyn Pipeline,
    optimizers: &mut Optimizers,
) -> Result<Option<usize>, CheckpointError> {
    let Some(dir) = load_dir else {
        info!("No checkpoint to load, training from scratch");
        return Ok(None);
    };

    let path = match load_step {
        Some(step) => checkpoint_path(dir, step),
        None => list_checkpoints(dir)?
            .pop()
            .map(|(_, path)| path)
            .ok_or_else(|| CheckpointError::NotFound(dir.to_path_buf()))?,
    };

    let checkpoint = Checkpoint::read(&path)?;
    pipeline.load_state_dict(checkpoint.pipeline)?;
    optimizers.load_state_dict(checkpoint.optimizers)?;
    info!("Restored checkpoint {} (step {})", path.display(), checkpoint.step);
    Ok(Some(checkpoint.step + 1))
}

/// Save a checkpoint for `step`, optionally deleting older ones.
#[tracing::instrument(skip_all, fields(step = step))]
pub fn save_checkpoint(
    dir: &Path,
    step: usize,
    pipeline: &dyn Pipeline,
    optimizers: &Optimizers,
    only_latest: bool,
) -> Result<PathBuf, CheckpointError> {
    fs::create_dir_all(dir)?;
    let path = checkpoint_path(dir, step);
    Checkpoint::capture(step, pipeline, optimizers).write(&path)?;
    debug!("Saved checkpoint {}", path.display());

    if only_latest {
        for (old_step, old_path) in list_checkpoints(dir)? {
            if old_step != step {
                fs::remove_file(&old_path)?;
            }
        }
    }
    Ok(path)
}
