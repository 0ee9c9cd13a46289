//! Per-iteration callbacks contributed by the pipeline.

use crate::config::TrainerConfig;
use crate::optim::{GradScaler, Optimizers};
use std::fmt;

/// Where in the training iteration a callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackLocation {
    BeforeTrainIteration,
    AfterTrainIteration,
}

/// State the trainer hands to the pipeline when callbacks are built.
///
/// Built after checkpoint restoration, so `start_step` and the optimizer
/// state already reflect any restored run.
pub struct TrainingCallbackAttributes<'a> {
    pub optimizers: &'a Optimizers,
    pub grad_scaler: &'a GradScaler,
    pub config: &'a TrainerConfig,
    pub start_step: usize,
}

/// Mutable state a callback may touch while it runs.
pub struct CallbackContext<'a> {
    pub step: usize,
    pub optimizers: &'a mut Optimizers,
    pub grad_scaler: &'a GradScaler,
}

pub type CallbackFn = Box<dyn FnMut(&mut CallbackContext<'_>) + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Schedule {
    Every(usize),
    AtIters(Vec<usize>),
}

pub struct TrainingCallback {
    locations: Vec<CallbackLocation>,
    schedule: Schedule,
    func: CallbackFn,
}

impl TrainingCallback {
    /// Run every `every` iterations (every iteration when `every` is 0 or 1).
    pub fn every<F>(locations: &[CallbackLocation], every: usize, func: F) -> Self
    where
        F: FnMut(&mut CallbackContext<'_>) + Send + 'static,
    {
        Self {
            locations: locations.to_vec(),
            schedule: Schedule::Every(every.max(1)),
            func: Box::new(func),
        }
    }

    /// Run only at the listed iterations.
    pub fn at_iters<F>(locations: &[CallbackLocation], iters: Vec<usize>, func: F) -> Self
    where
        F: FnMut(&mut CallbackContext<'_>) + Send + 'static,
    {
        Self {
            locations: locations.to_vec(),
            schedule: Schedule::AtIters(iters),
            func: Box::new(func),
        }
    }

    pub fn runs_at(&self, location: CallbackLocation) -> bool {
        self.locations.contains(&location)
    }

    fn is_due(&self, step: usize) -> bool {
        match &self.schedule {
            Schedule::Every(n) => step % n == 0,
            Schedule::AtIters(iters) => iters.contains(&step),
        }
    }

    /// Invoke the callback if it is registered at `location` and due at this step.
    /// Returns whether it ran.
    pub fn run_callback_at_location(&mut self, location: CallbackLocation, ctx: &mut CallbackContext<'_>) -> bool {
        if !self.runs_at(location) || !self.is_due(ctx.step) {
            return false;
        }
        (self.func)(ctx);
        true
    }
}

impl fmt::Debug for TrainingCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainingCallback")
            .field("locations", &self.locations)
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::OptimizerConfig;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn run(callback: &mut TrainingCallback, step: usize, location: CallbackLocation) -> bool {
        let mut optimizers = Optimizers::from_parameter_groups(&OptimizerConfig::default(), ["color"]);
        let scaler = GradScaler::default();
        let mut ctx = CallbackContext {
            step,
            optimizers: &mut optimizers,
            grad_scaler: &scaler,
        };
        callback.run_callback_at_location(location, &mut ctx)
    }

    #[test]
    fn test_every_n_schedule() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut callback = TrainingCallback::every(&[CallbackLocation::AfterTrainIteration], 5, move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        for step in 0..12 {
            run(&mut callback, step, CallbackLocation::AfterTrainIteration);
            assert!(!run(&mut callback, step, CallbackLocation::BeforeTrainIteration));
        }
        // steps 0, 5, 10
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_at_iters_schedule() {
        let mut callback =
            TrainingCallback::at_iters(&[CallbackLocation::BeforeTrainIteration], vec![3, 7], |_| {});
        assert!(!run(&mut callback, 2, CallbackLocation::BeforeTrainIteration));
        assert!(run(&mut callback, 3, CallbackLocation::BeforeTrainIteration));
        assert!(run(&mut callback, 7, CallbackLocation::BeforeTrainIteration));
    }

    #[test]
    fn test_callback_can_adjust_learning_rate() {
        let mut callback = TrainingCallback::every(&[CallbackLocation::AfterTrainIteration], 1, |ctx| {
            let lr = ctx.optimizers.lr("color").unwrap_or_default();
            ctx.optimizers.set_lr("color", lr * 0.5).unwrap();
        });
        let mut optimizers = Optimizers::from_parameter_groups(
            &OptimizerConfig {
                lr: 1.0,
                ..OptimizerConfig::default()
            },
            ["color"],
        );
        let scaler = GradScaler::default();
        let mut ctx = CallbackContext {
            step: 0,
            optimizers: &mut optimizers,
            grad_scaler: &scaler,
        };
        callback.run_callback_at_location(CallbackLocation::AfterTrainIteration, &mut ctx);
        assert_eq!(optimizers.lr("color"), Some(0.5));
    }
}
