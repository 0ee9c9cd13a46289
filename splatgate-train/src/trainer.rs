//! Trainer: start-up orchestration and the training loop.
//!
//! [`Trainer::setup`] brings the subsystems online in dependency order and
//! finishes with the readiness precondition. Only a trainer whose setup
//! reached `Ready` holds a dataset handle and may train.

use crate::checkpoint::{self, CheckpointError};
use crate::config::{ConfigError, TrainerConfig};
use crate::feedback::{Feedback, Level, TracingFeedback};
use crate::ingest::ObservationDataset;
use crate::optim::{GradScaler, Optimizers};
use crate::pipeline::{
    CallbackContext, CallbackLocation, Device, Pipeline, PipelineError, PipelineFactory, SetupMode,
    TrainingCallback, TrainingCallbackAttributes,
};
use crate::profiler::Profiler;
use crate::readiness::{DEFAULT_POLL_INTERVAL, GateError, ReadinessGate, ReadinessPrecondition};
use crate::viewer::{ViewerError, ViewerState};
use crate::writer::{WriterError, Writers};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("setup already ran on this trainer; construct a new trainer to retry")]
    AlreadySetUp,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Viewer(#[from] ViewerError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Writer(#[from] WriterError),
    #[error("trainer setup failed: {0}")]
    Timeout(#[from] GateError),
    #[error("pipeline did not provide a training dataset")]
    MissingDataset,
}

#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("trainer is not ready to train (state: {0})")]
    NotReady(TrainerState),
    #[error("no observations arrived within {0:.1?} of training start")]
    NoObservations(Duration),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Writer(#[from] WriterError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("train lock poisoned")]
    LockPoisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    /// Constructed, setup not yet run.
    Created,
    /// Setup finished and the readiness precondition held.
    Ready,
    /// Setup failed. The trainer cannot be reused.
    Failed,
}

impl fmt::Display for TrainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainerState::Created => write!(f, "created"),
            TrainerState::Ready => write!(f, "ready"),
            TrainerState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainSummary {
    pub start_step: usize,
    pub steps_run: usize,
    pub final_loss: Option<f32>,
}

/// A training run split into a setup phase and a training phase.
pub trait TrainingRunner {
    fn setup(&mut self, mode: SetupMode) -> Result<(), SetupError>;

    fn train(&mut self) -> Result<TrainSummary, TrainError>;
}

pub struct Trainer {
    config: TrainerConfig,
    factory: Box<dyn PipelineFactory>,
    local_rank: usize,
    world_size: usize,
    device: Device,
    state: TrainerState,
    pipeline: Option<Box<dyn Pipeline>>,
    optimizers: Optimizers,
    grad_scaler: GradScaler,
    train_lock: Arc<Mutex<()>>,
    viewer_state: Option<ViewerState>,
    callbacks: Vec<TrainingCallback>,
    writers: Writers,
    profiler: Profiler,
    /// Dataset indices of the cameras the viewer has drawn.
    cameras_drawn: Vec<usize>,
    dataset: Option<ObservationDataset>,
    start_step: usize,
    feedback: Arc<dyn Feedback>,
    precondition: Option<Box<dyn ReadinessPrecondition>>,
}

impl Trainer {
    pub fn new(
        config: TrainerConfig,
        factory: Box<dyn PipelineFactory>,
        local_rank: usize,
        world_size: usize,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let device = Device::from_config(&config.machine, local_rank);
        let grad_scaler = GradScaler::new(config.mixed_precision);
        Ok(Self {
            config,
            factory,
            local_rank,
            world_size,
            device,
            state: TrainerState::Created,
            pipeline: None,
            optimizers: Optimizers::default(),
            grad_scaler,
            train_lock: Arc::new(Mutex::new(())),
            viewer_state: None,
            callbacks: Vec::new(),
            writers: Writers::new(),
            profiler: Profiler::default(),
            cameras_drawn: Vec::new(),
            dataset: None,
            start_step: 0,
            feedback: Arc::new(TracingFeedback::new()),
            precondition: None,
        })
    }

    pub fn with_feedback(mut self, feedback: Arc<dyn Feedback>) -> Self {
        self.feedback = feedback;
        self
    }

    /// Replace the readiness gate built from the config.
    pub fn with_precondition(mut self, precondition: Box<dyn ReadinessPrecondition>) -> Self {
        self.precondition = Some(precondition);
        self
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn is_main_process(&self) -> bool {
        self.local_rank == 0
    }

    pub fn pipeline(&self) -> Option<&dyn Pipeline> {
        self.pipeline.as_deref()
    }

    pub fn optimizers(&self) -> &Optimizers {
        &self.optimizers
    }

    pub fn viewer_state(&self) -> Option<&ViewerState> {
        self.viewer_state.as_ref()
    }

    pub fn callbacks(&self) -> &[TrainingCallback] {
        &self.callbacks
    }

    /// Training dataset, available once setup has succeeded.
    pub fn dataset(&self) -> Option<&ObservationDataset> {
        self.dataset.as_ref()
    }

    pub fn cameras_drawn(&self) -> &[usize] {
        &self.cameras_drawn
    }

    pub fn start_step(&self) -> usize {
        self.start_step
    }

    pub fn base_dir(&self) -> PathBuf {
        self.config.base_dir()
    }

    fn check_viewer_warnings(config: &TrainerConfig, feedback: &dyn Feedback) {
        let viewer = config.is_viewer_enabled() || config.is_viewer_legacy_enabled();
        let events = config.is_tensorboard_enabled() || config.is_wandb_enabled() || config.is_comet_enabled();
        if viewer && !events {
            feedback.message(
                Level::Info,
                "[NOTE] Only the viewer is enabled, so training events are not recorded. \
                 Use --vis viewer+tensorboard to record them.",
            );
        }
    }

    #[tracing::instrument(skip_all, fields(mode = %mode, rank = self.local_rank))]
    fn run_setup(&mut self, mode: SetupMode) -> Result<(), SetupError> {
        let base_dir = self.config.base_dir();
        let feedback = Arc::clone(&self.feedback);

        let pipeline = self.pipeline.insert(self.factory.setup(
            self.device,
            mode,
            self.world_size,
            self.local_rank,
            &self.grad_scaler,
        )?);
        self.optimizers = Optimizers::from_parameter_groups(&self.config.optimizer, pipeline.parameter_groups());

        let viewer_log_path = base_dir.join(&self.config.viewer.relative_log_filename);
        let mut banner_messages = Vec::new();
        if self.config.is_viewer_legacy_enabled() && self.local_rank == 0 {
            feedback.message(Level::Warning, "Legacy Viewer is not supported!");
        }
        if self.config.is_viewer_enabled() && self.local_rank == 0 {
            let datapath = self.config.data.clone().unwrap_or_else(|| base_dir.clone());
            let viewer = ViewerState::new(
                &self.config.viewer,
                &viewer_log_path,
                &datapath,
                &**pipeline,
                Arc::clone(&self.train_lock),
                self.config.viewer.make_share_url,
            )?;
            banner_messages = viewer.viewer_info.clone();
            self.viewer_state = Some(viewer);
        }

        Self::check_viewer_warnings(&self.config, feedback.as_ref());

        // Callbacks may read restored state, so restore first.
        self.start_step = checkpoint::load_checkpoint(
            self.config.load_dir.as_deref(),
            self.config.load_step,
            &mut **pipeline,
            &mut self.optimizers,
        )?
        .unwrap_or(0);

        self.callbacks = pipeline.training_callbacks(&TrainingCallbackAttributes {
            optimizers: &self.optimizers,
            grad_scaler: &self.grad_scaler,
            config: &self.config,
            start_step: self.start_step,
        });
        debug!("Registered {} training callbacks", self.callbacks.len());

        let writer_log_path = base_dir.join(&self.config.logging.relative_log_dir);
        self.writers.setup_event_writer(
            self.config.is_wandb_enabled(),
            self.config.is_tensorboard_enabled(),
            self.config.is_comet_enabled(),
            &writer_log_path,
            &self.config.experiment_name,
            &self.config.project_name,
        )?;
        self.writers.setup_local_writer(
            &self.config.logging,
            self.config.max_num_iterations,
            &banner_messages,
        );
        self.writers.put_config("config", &self.config, 0)?;
        self.writers.write_out()?;
        self.profiler = Profiler::setup_profiler(&self.config.logging, &writer_log_path);

        let precondition: Box<dyn ReadinessPrecondition> = match self.precondition.take() {
            Some(precondition) => precondition,
            None => Box::new(ReadinessGate::from_config(&self.config)?),
        };
        let counter = pipeline.datamanager().train_image_dataloader();
        let outcome = self
            .profiler
            .time("readiness_gate", || precondition.await_ready(counter, feedback.as_ref()))?;
        info!(
            "Readiness gate passed at index {} after {:?} ({} polls)",
            outcome.last_idx, outcome.waited, outcome.polls
        );

        let dataset = pipeline
            .datamanager()
            .train_dataset()
            .ok_or(SetupError::MissingDataset)?;
        self.dataset = Some(dataset);
        Ok(())
    }

    fn run_callbacks(&mut self, step: usize, location: CallbackLocation) {
        let mut ctx = CallbackContext {
            step,
            optimizers: &mut self.optimizers,
            grad_scaler: &self.grad_scaler,
        };
        for callback in &mut self.callbacks {
            callback.run_callback_at_location(location, &mut ctx);
        }
    }

    /// An empty buffer also reports index 0, so a gate requiring a single
    /// observation can pass before any frame exists. Hold step 0 until one
    /// does, within the same `msg_timeout` budget.
    fn wait_for_first_observation(&self, dataset: &ObservationDataset) -> Result<(), TrainError> {
        if !dataset.is_empty() {
            return Ok(());
        }
        let budget = self.config.msg_timeout()?;
        let start = Instant::now();
        loop {
            let elapsed = start.elapsed();
            if !dataset.is_empty() {
                self.feedback.clear_status();
                debug!("First observation arrived after {:?}", elapsed);
                return Ok(());
            }
            if elapsed >= budget {
                self.feedback.clear_status();
                return Err(TrainError::NoObservations(elapsed));
            }
            self.feedback.status("Waiting for the first observation...");
            thread::sleep(DEFAULT_POLL_INTERVAL.min(budget - elapsed));
        }
    }

    fn save_checkpoint(&mut self, step: usize) -> Result<(), TrainError> {
        if !self.is_main_process() {
            return Ok(());
        }
        let pipeline = self.pipeline.as_deref().ok_or(TrainError::NotReady(self.state))?;
        let dir = self.config.checkpoint_dir();
        let only_latest = self.config.save_only_latest_checkpoint;
        let optimizers = &self.optimizers;
        self.profiler.time("save_checkpoint", || {
            checkpoint::save_checkpoint(&dir, step, pipeline, optimizers, only_latest)
        })?;
        Ok(())
    }
}

impl TrainingRunner for Trainer {
    /// Bring the trainer up for `mode`. Runs at most once per trainer.
    fn setup(&mut self, mode: SetupMode) -> Result<(), SetupError> {
        if self.state != TrainerState::Created {
            return Err(SetupError::AlreadySetUp);
        }
        // Anything short of full success leaves the trainer unusable.
        self.state = TrainerState::Failed;
        self.run_setup(mode)?;
        self.state = TrainerState::Ready;
        Ok(())
    }

    fn train(&mut self) -> Result<TrainSummary, TrainError> {
        if self.state != TrainerState::Ready {
            return Err(TrainError::NotReady(self.state));
        }
        let dataset = self.dataset.clone().ok_or(TrainError::NotReady(self.state))?;
        let train_lock = Arc::clone(&self.train_lock);
        let max_iter = self.config.max_num_iterations;
        let steps_per_log = self.config.logging.steps_per_log.max(1);
        let steps_per_save = self.config.steps_per_save.max(1);
        let is_save_step = |step: usize| step > 0 && step % steps_per_save == 0;

        if self.start_step < max_iter {
            self.wait_for_first_observation(&dataset)?;
        }

        info!("Training steps {}..{}", self.start_step, max_iter);
        let mut summary = TrainSummary {
            start_step: self.start_step,
            steps_run: 0,
            final_loss: None,
        };
        let mut last_step = None;

        for step in self.start_step..max_iter {
            self.run_callbacks(step, CallbackLocation::BeforeTrainIteration);

            let metrics = {
                let _guard = train_lock.lock().map_err(|_| TrainError::LockPoisoned)?;
                let pipeline = self.pipeline.as_mut().ok_or(TrainError::NotReady(self.state))?;
                let optimizers = &mut self.optimizers;
                let grad_scaler = &self.grad_scaler;
                self.profiler.time("train_iteration", || {
                    pipeline.train_iteration(step, optimizers, grad_scaler)
                })?
            };

            self.run_callbacks(step, CallbackLocation::AfterTrainIteration);

            if let Some(viewer) = self.viewer_state.as_mut() {
                viewer.update_cameras(&dataset, &mut self.cameras_drawn);
            }

            if step % steps_per_log == 0 {
                self.writers.put_scalar("train_loss", metrics.loss, step);
                for (name, value) in &metrics.scalars {
                    self.writers.put_scalar(name, *value, step);
                }
                self.writers.write_out()?;
            } else if self.writers.is_buffer_full() {
                self.writers.write_out()?;
            }

            if is_save_step(step) {
                self.save_checkpoint(step)?;
            }

            summary.steps_run += 1;
            summary.final_loss = Some(metrics.loss);
            last_step = Some(step);
        }

        if let Some(step) = last_step.filter(|&step| !is_save_step(step)) {
            self.save_checkpoint(step)?;
        }
        self.writers.write_out()?;
        self.profiler.flush()?;
        info!("Training finished after {} steps", summary.steps_run);
        Ok(summary)
    }
}
