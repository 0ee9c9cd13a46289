//! Optimizers over named parameter groups, plus the loss scaler used for
//! mixed-precision steps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum OptimizerError {
    #[error("no optimizer for parameter group '{0}'")]
    UnknownGroup(String),
    #[error("parameter group '{group}' has {params} values but {grads} gradients")]
    ShapeMismatch {
        group: String,
        params: usize,
        grads: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub lr: f32,
    pub betas: (f32, f32),
    pub eps: f32,
    /// Multiplicative learning-rate decay applied by the pipeline's schedule callback.
    pub lr_decay: f32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Adam,
            lr: 1e-2,
            betas: (0.9, 0.999),
            eps: 1e-15,
            lr_decay: 0.999,
        }
    }
}

/// Per-group optimizer state, kept serializable for checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub lr: f32,
    pub step: u64,
    pub exp_avg: Vec<f32>,
    pub exp_avg_sq: Vec<f32>,
}

#[derive(Debug, Clone)]
struct GroupOptimizer {
    kind: OptimizerKind,
    betas: (f32, f32),
    eps: f32,
    state: OptimizerState,
}

impl GroupOptimizer {
    fn step(&mut self, params: &mut [f32], grads: &[f32]) {
        let state = &mut self.state;
        state.step += 1;
        match self.kind {
            OptimizerKind::Sgd => {
                for (p, g) in params.iter_mut().zip(grads) {
                    *p -= state.lr * g;
                }
            }
            OptimizerKind::Adam => {
                if state.exp_avg.len() != params.len() {
                    state.exp_avg = vec![0.0; params.len()];
                    state.exp_avg_sq = vec![0.0; params.len()];
                }
                let (beta1, beta2) = self.betas;
                let bias1 = 1.0 - beta1.powi(state.step as i32);
                let bias2 = 1.0 - beta2.powi(state.step as i32);
                for i in 0..params.len() {
                    let g = grads[i];
                    state.exp_avg[i] = beta1 * state.exp_avg[i] + (1.0 - beta1) * g;
                    state.exp_avg_sq[i] = beta2 * state.exp_avg_sq[i] + (1.0 - beta2) * g * g;
                    let m_hat = state.exp_avg[i] / bias1;
                    let v_hat = state.exp_avg_sq[i] / bias2;
                    params[i] -= state.lr * m_hat / (v_hat.sqrt() + self.eps);
                }
            }
        }
    }
}

/// One optimizer per named parameter group.
#[derive(Debug, Clone, Default)]
pub struct Optimizers {
    groups: BTreeMap<String, GroupOptimizer>,
}

impl Optimizers {
    /// Build optimizers for every group the pipeline exposes.
    pub fn from_parameter_groups<I, S>(config: &OptimizerConfig, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let groups = groups
            .into_iter()
            .map(|name| {
                let name = name.into();
                debug!("Creating {:?} optimizer for '{}' (lr {})", config.kind, name, config.lr);
                let optimizer = GroupOptimizer {
                    kind: config.kind,
                    betas: config.betas,
                    eps: config.eps,
                    state: OptimizerState {
                        lr: config.lr,
                        ..OptimizerState::default()
                    },
                };
                (name, optimizer)
            })
            .collect();
        Self { groups }
    }

    pub fn step(&mut self, group: &str, params: &mut [f32], grads: &[f32]) -> Result<(), OptimizerError> {
        let optimizer = self
            .groups
            .get_mut(group)
            .ok_or_else(|| OptimizerError::UnknownGroup(group.to_string()))?;
        if params.len() != grads.len() {
            return Err(OptimizerError::ShapeMismatch {
                group: group.to_string(),
                params: params.len(),
                grads: grads.len(),
            });
        }
        optimizer.step(params, grads);
        Ok(())
    }

    pub fn lr(&self, group: &str) -> Option<f32> {
        self.groups.get(group).map(|o| o.state.lr)
    }

    pub fn set_lr(&mut self, group: &str, lr: f32) -> Result<(), OptimizerError> {
        let optimizer = self
            .groups
            .get_mut(group)
            .ok_or_else(|| OptimizerError::UnknownGroup(group.to_string()))?;
        optimizer.state.lr = lr;
        Ok(())
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn state_dict(&self) -> BTreeMap<String, OptimizerState> {
        self.groups
            .iter()
            .map(|(name, o)| (name.clone(), o.state.clone()))
            .collect()
    }

    /// Restore saved state. Groups missing from `states` keep their fresh state.
    pub fn load_state_dict(&mut self, states: BTreeMap<String, OptimizerState>) -> Result<(), OptimizerError> {
        for (name, state) in states {
            let optimizer = self
                .groups
                .get_mut(&name)
                .ok_or(OptimizerError::UnknownGroup(name))?;
            optimizer.state = state;
        }
        Ok(())
    }
}

/// Loss scaling for mixed-precision training. A disabled scaler is a no-op.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradScaler {
    enabled: bool,
    scale: f32,
}

impl GradScaler {
    const INITIAL_SCALE: f32 = 65_536.0;

    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale: if enabled { Self::INITIAL_SCALE } else { 1.0 },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn scale_loss(&self, loss: f32) -> f32 {
        loss * self.scale
    }

    pub fn unscale(&self, grads: &mut [f32]) {
        if self.enabled {
            let inv = 1.0 / self.scale;
            grads.iter_mut().for_each(|g| *g *= inv);
        }
    }
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sgd(lr: f32) -> OptimizerConfig {
        OptimizerConfig {
            kind: OptimizerKind::Sgd,
            lr,
            ..OptimizerConfig::default()
        }
    }

    #[test]
    fn test_sgd_step() {
        let mut optimizers = Optimizers::from_parameter_groups(&sgd(0.5), ["color"]);
        let mut params = vec![1.0, 2.0];
        optimizers.step("color", &mut params, &[2.0, -2.0]).unwrap();
        assert_eq!(params, vec![0.0, 3.0]);
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() {
        let config = OptimizerConfig {
            kind: OptimizerKind::Adam,
            lr: 0.1,
            ..OptimizerConfig::default()
        };
        let mut optimizers = Optimizers::from_parameter_groups(&config, ["color"]);
        let mut params = vec![1.0];
        optimizers.step("color", &mut params, &[3.0]).unwrap();
        assert!((params[0] - 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_unknown_group_and_shape_errors() {
        let mut optimizers = Optimizers::from_parameter_groups(&sgd(0.1), ["color"]);
        let mut params = vec![0.0; 3];
        assert!(matches!(
            optimizers.step("opacity", &mut params, &[0.0; 3]),
            Err(OptimizerError::UnknownGroup(_))
        ));
        assert!(matches!(
            optimizers.step("color", &mut params, &[0.0; 2]),
            Err(OptimizerError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_state_dict_restores_lr_and_step() {
        let mut optimizers = Optimizers::from_parameter_groups(&OptimizerConfig::default(), ["color"]);
        let mut params = vec![0.5; 3];
        optimizers.step("color", &mut params, &[0.1; 3]).unwrap();
        optimizers.set_lr("color", 0.003).unwrap();
        let saved = optimizers.state_dict();

        let mut restored = Optimizers::from_parameter_groups(&OptimizerConfig::default(), ["color"]);
        restored.load_state_dict(saved.clone()).unwrap();
        assert_eq!(restored.state_dict(), saved);
        assert_eq!(restored.lr("color"), Some(0.003));
    }

    #[test]
    fn test_grad_scaler_roundtrip() {
        let scaler = GradScaler::new(true);
        let scaled = scaler.scale_loss(0.25);
        let mut grads = vec![scaled];
        scaler.unscale(&mut grads);
        assert!((grads[0] - 0.25).abs() < 1e-6);

        let disabled = GradScaler::default();
        assert_eq!(disabled.scale_loss(0.25), 0.25);
    }
}
