//! Reference pipeline trained directly from the live ingestion buffer.
//!
//! The model is a single scene appearance (RGB) fitted to the mean color of
//! the received frames. It is small enough to run anywhere while still
//! exercising optimizers, callbacks and checkpoints end to end.

use crate::ingest::{IngestionBuffer, ObservationCounter, ObservationDataset};
use crate::optim::{GradScaler, Optimizers};
use crate::pipeline::{
    CallbackLocation, DataManager, Device, EvalSplit, Pipeline, PipelineError, PipelineFactory,
    SetupMode, StepMetrics, TrainingCallback, TrainingCallbackAttributes,
};
use glam::Vec3;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

const APPEARANCE: &str = "appearance";
const EVAL_INTERVAL: usize = 8;
const STEPS_PER_EVAL: usize = 100;

pub struct StreamingDataManager {
    buffer: Arc<IngestionBuffer>,
    eval_split: Option<EvalSplit>,
}

impl StreamingDataManager {
    pub fn new(buffer: Arc<IngestionBuffer>, mode: SetupMode) -> Self {
        let eval_split = match mode {
            SetupMode::Val | SetupMode::Test => Some(EvalSplit {
                mode,
                interval: EVAL_INTERVAL,
            }),
            SetupMode::Inference => None,
        };
        Self { buffer, eval_split }
    }

    /// Index of the training observation used at `step`, cycling over the
    /// frames received so far and skipping held-out ones.
    pub fn train_index(&self, step: usize) -> Option<usize> {
        let len = self.buffer.len();
        let train: Vec<usize> = (0..len).filter(|&i| !self.is_eval(i)).collect();
        if train.is_empty() {
            return None;
        }
        Some(train[step % train.len()])
    }

    pub fn eval_indices(&self) -> Vec<usize> {
        (0..self.buffer.len()).filter(|&i| self.is_eval(i)).collect()
    }

    fn is_eval(&self, index: usize) -> bool {
        self.eval_split.is_some_and(|split| split.contains(index))
    }
}

impl DataManager for StreamingDataManager {
    fn train_image_dataloader(&self) -> &dyn ObservationCounter {
        self.buffer.as_ref()
    }

    fn train_dataset(&self) -> Option<ObservationDataset> {
        Some(ObservationDataset::new(Arc::clone(&self.buffer)))
    }

    fn eval_split(&self) -> Option<EvalSplit> {
        self.eval_split
    }
}

pub struct StreamingPipeline {
    datamanager: StreamingDataManager,
    appearance: Vec<f32>,
    device: Device,
}

impl StreamingPipeline {
    pub fn new(datamanager: StreamingDataManager, device: Device) -> Self {
        Self {
            datamanager,
            appearance: vec![0.5; 3],
            device,
        }
    }

    pub fn appearance(&self) -> Vec3 {
        Vec3::from_slice(&self.appearance)
    }

    pub fn device(&self) -> Device {
        self.device
    }

    fn loss_against(&self, target: Vec3) -> (f32, Vec3) {
        let diff = self.appearance() - target;
        (diff.length_squared() / 3.0, diff * (2.0 / 3.0))
    }

    fn eval_loss(&self) -> Option<f32> {
        let dataset = self.datamanager.train_dataset()?;
        let losses: Vec<f32> = self
            .datamanager
            .eval_indices()
            .into_iter()
            .filter_map(|i| dataset.get(i))
            .map(|frame| self.loss_against(frame.mean_color()).0)
            .collect();
        if losses.is_empty() {
            None
        } else {
            Some(losses.iter().sum::<f32>() / losses.len() as f32)
        }
    }
}

impl Pipeline for StreamingPipeline {
    fn datamanager(&self) -> &dyn DataManager {
        &self.datamanager
    }

    fn parameter_groups(&self) -> Vec<String> {
        vec![APPEARANCE.to_string()]
    }

    fn training_callbacks(&self, attrs: &TrainingCallbackAttributes<'_>) -> Vec<TrainingCallback> {
        let decay = attrs.config.optimizer.lr_decay;
        let buffer = Arc::clone(&self.datamanager.buffer);
        let steps_per_log = attrs.config.logging.steps_per_log;
        debug!(
            "Building streaming callbacks from step {} (lr {:?})",
            attrs.start_step,
            attrs.optimizers.lr(APPEARANCE)
        );

        vec![
            TrainingCallback::every(&[CallbackLocation::AfterTrainIteration], 1, move |ctx| {
                if let Some(lr) = ctx.optimizers.lr(APPEARANCE) {
                    // group exists by construction
                    let _ = ctx.optimizers.set_lr(APPEARANCE, lr * decay);
                }
            }),
            TrainingCallback::every(
                &[CallbackLocation::BeforeTrainIteration],
                steps_per_log,
                move |ctx| {
                    debug!("Step {}: training on {} observations", ctx.step, buffer.len());
                },
            ),
        ]
    }

    fn train_iteration(
        &mut self,
        step: usize,
        optimizers: &mut Optimizers,
        grad_scaler: &GradScaler,
    ) -> Result<StepMetrics, PipelineError> {
        let dataset = self.datamanager.train_dataset().ok_or(PipelineError::NoData)?;
        let index = self.datamanager.train_index(step).ok_or(PipelineError::NoData)?;
        let frame = dataset.get(index).ok_or(PipelineError::NoData)?;

        let (loss, grad) = self.loss_against(frame.mean_color());
        let mut grads = (grad * grad_scaler.scale()).to_array().to_vec();
        grad_scaler.unscale(&mut grads);
        optimizers.step(APPEARANCE, &mut self.appearance, &grads)?;

        let mut scalars = BTreeMap::new();
        scalars.insert("observations".to_string(), dataset.len() as f32);
        if loss > 0.0 {
            scalars.insert("psnr".to_string(), -10.0 * loss.log10());
        }
        if let Some(lr) = optimizers.lr(APPEARANCE) {
            scalars.insert("lr".to_string(), lr);
        }
        if step % STEPS_PER_EVAL == 0 {
            if let Some(eval_loss) = self.eval_loss() {
                scalars.insert("eval_loss".to_string(), eval_loss);
            }
        }
        Ok(StepMetrics { loss, scalars })
    }

    fn state_dict(&self) -> BTreeMap<String, Vec<f32>> {
        BTreeMap::from([(APPEARANCE.to_string(), self.appearance.clone())])
    }

    fn load_state_dict(&mut self, mut state: BTreeMap<String, Vec<f32>>) -> Result<(), PipelineError> {
        let appearance = state
            .remove(APPEARANCE)
            .ok_or_else(|| PipelineError::StateMismatch(format!("missing '{}'", APPEARANCE)))?;
        if appearance.len() != 3 {
            return Err(PipelineError::StateMismatch(format!(
                "'{}' has {} values, expected 3",
                APPEARANCE,
                appearance.len()
            )));
        }
        self.appearance = appearance;
        Ok(())
    }
}

/// Builds a [`StreamingPipeline`] over a buffer the ingest worker fills.
pub struct StreamingPipelineFactory {
    buffer: Arc<IngestionBuffer>,
}

impl StreamingPipelineFactory {
    pub fn new(buffer: Arc<IngestionBuffer>) -> Self {
        Self { buffer }
    }
}

impl PipelineFactory for StreamingPipelineFactory {
    fn setup(
        &self,
        device: Device,
        mode: SetupMode,
        world_size: usize,
        local_rank: usize,
        grad_scaler: &GradScaler,
    ) -> Result<Box<dyn Pipeline>, PipelineError> {
        if let Device::Cuda(_) = device {
            return Err(PipelineError::UnsupportedDevice(device));
        }
        info!(
            "Streaming pipeline on {} (mode {}, rank {}/{}, mixed precision {})",
            device,
            mode,
            local_rank,
            world_size.max(1),
            grad_scaler.is_enabled()
        );
        let datamanager = StreamingDataManager::new(Arc::clone(&self.buffer), mode);
        Ok(Box::new(StreamingPipeline::new(datamanager, device)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainerConfig;
    use crate::ingest::CameraFrame;
    use crate::optim::{OptimizerConfig, OptimizerKind};
    use image::{Rgb, RgbImage};

    fn push_solid(buffer: &IngestionBuffer, rgb: [u8; 3]) {
        let image = RgbImage::from_pixel(2, 2, Rgb(rgb));
        buffer
            .push(CameraFrame::new(image, Vec3::ZERO, [0.0, 0.0, 0.0, 1.0], 0.0))
            .unwrap();
    }

    #[test]
    fn test_inference_mode_has_no_eval_split() {
        let buffer = Arc::new(IngestionBuffer::new());
        let dm = StreamingDataManager::new(Arc::clone(&buffer), SetupMode::Inference);
        assert!(dm.eval_split().is_none());
        let dm = StreamingDataManager::new(buffer, SetupMode::Test);
        assert_eq!(dm.eval_split().map(|s| s.mode), Some(SetupMode::Test));
    }

    #[test]
    fn test_train_index_skips_held_out_frames() {
        let buffer = Arc::new(IngestionBuffer::new());
        for _ in 0..9 {
            push_solid(&buffer, [0, 0, 0]);
        }
        let dm = StreamingDataManager::new(Arc::clone(&buffer), SetupMode::Val);
        assert_eq!(dm.eval_indices(), vec![7]);
        let picked: Vec<usize> = (0..8).filter_map(|s| dm.train_index(s)).collect();
        assert_eq!(picked, vec![0, 1, 2, 3, 4, 5, 6, 8]);
    }

    #[test]
    fn test_training_converges_to_frame_color() {
        let buffer = Arc::new(IngestionBuffer::new());
        push_solid(&buffer, [255, 0, 0]);
        let factory = StreamingPipelineFactory::new(Arc::clone(&buffer));
        let scaler = GradScaler::new(true);
        let mut pipeline = factory
            .setup(Device::Cpu, SetupMode::Inference, 1, 0, &scaler)
            .unwrap();
        let config = OptimizerConfig {
            kind: OptimizerKind::Sgd,
            lr: 0.5,
            ..OptimizerConfig::default()
        };
        let mut optimizers = Optimizers::from_parameter_groups(&config, pipeline.parameter_groups());

        let first = pipeline.train_iteration(0, &mut optimizers, &scaler).unwrap();
        let mut last = first.clone();
        for step in 1..200 {
            last = pipeline.train_iteration(step, &mut optimizers, &scaler).unwrap();
        }
        assert!(last.loss < first.loss);
        assert!(last.loss < 1e-4);
        let appearance = &pipeline.state_dict()[APPEARANCE];
        assert!((appearance[0] - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_train_iteration_without_data() {
        let buffer = Arc::new(IngestionBuffer::new());
        let mut pipeline = StreamingPipeline::new(
            StreamingDataManager::new(buffer, SetupMode::Val),
            Device::Cpu,
        );
        let mut optimizers =
            Optimizers::from_parameter_groups(&OptimizerConfig::default(), pipeline.parameter_groups());
        assert!(matches!(
            pipeline.train_iteration(0, &mut optimizers, &GradScaler::default()),
            Err(PipelineError::NoData)
        ));
    }

    #[test]
    fn test_cuda_is_rejected() {
        let factory = StreamingPipelineFactory::new(Arc::new(IngestionBuffer::new()));
        let result = factory.setup(Device::Cuda(0), SetupMode::Val, 1, 0, &GradScaler::default());
        assert!(matches!(result, Err(PipelineError::UnsupportedDevice(_))));
    }

    #[test]
    fn test_load_state_dict_validates_shape() {
        let mut pipeline = StreamingPipeline::new(
            StreamingDataManager::new(Arc::new(IngestionBuffer::new()), SetupMode::Val),
            Device::Cpu,
        );
        let bad = BTreeMap::from([(APPEARANCE.to_string(), vec![0.0; 2])]);
        assert!(pipeline.load_state_dict(bad).is_err());
        let good = BTreeMap::from([(APPEARANCE.to_string(), vec![0.1, 0.2, 0.3])]);
        pipeline.load_state_dict(good).unwrap();
        assert_eq!(pipeline.appearance(), Vec3::new(0.1, 0.2, 0.3));
    }

    #[test]
    fn test_callbacks_decay_learning_rate() {
        let pipeline = StreamingPipeline::new(
            StreamingDataManager::new(Arc::new(IngestionBuffer::new()), SetupMode::Val),
            Device::Cpu,
        );
        let config = TrainerConfig::default();
        let mut optimizers =
            Optimizers::from_parameter_groups(&config.optimizer, pipeline.parameter_groups());
        let scaler = GradScaler::default();
        let mut callbacks = pipeline.training_callbacks(&TrainingCallbackAttributes {
            optimizers: &optimizers,
            grad_scaler: &scaler,
            config: &config,
            start_step: 0,
        });
        assert_eq!(callbacks.len(), 2);

        let mut ctx = crate::pipeline::CallbackContext {
            step: 1,
            optimizers: &mut optimizers,
            grad_scaler: &scaler,
        };
        for callback in &mut callbacks {
            callback.run_callback_at_location(CallbackLocation::AfterTrainIteration, &mut ctx);
        }
        let expected = config.optimizer.lr * config.optimizer.lr_decay;
        assert!((optimizers.lr(APPEARANCE).unwrap() - expected).abs() < 1e-9);
    }
}
