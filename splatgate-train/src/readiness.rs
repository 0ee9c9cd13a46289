//! Readiness gate: block training start until enough observations arrive.
//!
//! The gate polls the loader's published index on a short fixed interval
//! instead of waiting on a signal from the ingest side. Detection lags by at
//! most one poll interval and no lock is taken on the writer.
//!
//! ```text
//! WAITING --(current_idx >= required - 1)--> READY
//! WAITING --(elapsed >= timeout)-----------> TIMED_OUT
//! ```
//!
//! Readiness is checked before the deadline on every poll, so a zero
//! timeout still succeeds when the buffer is already full at entry.

use crate::config::{ConfigError, TrainerConfig};
use crate::feedback::{Feedback, Level};
use crate::ingest::ObservationCounter;
use std::num::NonZeroUsize;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Waiting,
    Ready,
    TimedOut,
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error(
        "timed out after {waited:.1?} waiting for {required} observations (last index {last_idx}); \
         check that messages are being published and that the data source is correctly named ({source_hint})"
    )]
    TimedOut {
        required: usize,
        last_idx: usize,
        waited: Duration,
        source_hint: String,
    },
}

/// How a successful wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateOutcome {
    pub last_idx: usize,
    pub waited: Duration,
    pub polls: u64,
}

/// Strategy deciding when the trainer may leave setup.
pub trait ReadinessPrecondition: Send {
    fn await_ready(&self, counter: &dyn ObservationCounter, feedback: &dyn Feedback) -> Result<GateOutcome, GateError>;
}

#[derive(Debug, Clone)]
pub struct ReadinessGate {
    required: NonZeroUsize,
    timeout: Duration,
    poll_interval: Duration,
    source_hint: String,
}

impl ReadinessGate {
    pub fn new(required: NonZeroUsize, timeout: Duration) -> Self {
        Self {
            required,
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            source_hint: "unspecified source".to_string(),
        }
    }

    pub fn from_config(config: &TrainerConfig) -> Result<Self, ConfigError> {
        let required = NonZeroUsize::new(config.num_msgs_to_start).ok_or(ConfigError::ZeroStartCount)?;
        Ok(Self::new(required, config.msg_timeout()?).with_source_hint(config.topics.to_string()))
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Names of the data source, quoted in the timeout error.
    pub fn with_source_hint(mut self, hint: impl Into<String>) -> Self {
        self.source_hint = hint.into();
        self
    }

    pub fn required(&self) -> usize {
        self.required.get()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `current_idx` is zero-based: index `k - 1` means `k` observations.
    pub fn is_ready(&self, current_idx: usize) -> bool {
        current_idx >= self.required.get() - 1
    }

    /// One step of the state machine from an observed index and elapsed time.
    pub fn poll(&self, current_idx: usize, elapsed: Duration) -> GateState {
        if self.is_ready(current_idx) {
            GateState::Ready
        } else if elapsed >= self.timeout {
            GateState::TimedOut
        } else {
            GateState::Waiting
        }
    }

    /// Block until the counter reaches the required index or the timeout expires.
    pub fn wait(&self, counter: &dyn ObservationCounter, feedback: &dyn Feedback) -> Result<GateOutcome, GateError> {
        feedback.message(
            Level::Info,
            &format!("Waiting to receive {} images...", self.required),
        );
        info!(
            "Readiness gate waiting for {} observations (timeout {:?})",
            self.required, self.timeout
        );

        let start = Instant::now();
        let mut polls = 0u64;
        let mut last_idx = 0usize;
        loop {
            // The counter is monotonic; max() keeps a misbehaving one from moving us backwards.
            last_idx = last_idx.max(counter.current_idx());
            polls += 1;
            let elapsed = start.elapsed();

            match self.poll(last_idx, elapsed) {
                GateState::Ready => {
                    feedback.clear_status();
                    feedback.message(
                        Level::Success,
                        "Pre-train image buffer filled, starting training!",
                    );
                    debug!("Gate ready after {} polls ({:?})", polls, elapsed);
                    return Ok(GateOutcome {
                        last_idx,
                        waited: elapsed,
                        polls,
                    });
                }
                GateState::TimedOut => {
                    feedback.clear_status();
                    let err = GateError::TimedOut {
                        required: self.required.get(),
                        last_idx,
                        waited: elapsed,
                        source_hint: self.source_hint.clone(),
                    };
                    feedback.message(Level::Error, &err.to_string());
                    return Err(err);
                }
                GateState::Waiting => {
                    feedback.status(&format!("Images received: {}", last_idx));
                    thread::sleep(self.poll_interval.min(self.timeout - elapsed));
                }
            }
        }
    }
}

impl ReadinessPrecondition for ReadinessGate {
    fn await_ready(&self, counter: &dyn ObservationCounter, feedback: &dyn Feedback) -> Result<GateOutcome, GateError> {
        self.wait(counter, feedback)
    }
}
