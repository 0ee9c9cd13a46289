//! Operator-facing progress messages.
//!
//! The trainer and the readiness gate report through an injected
//! [`Feedback`] rather than a process-wide console.

use std::io::{self, Write};
use std::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Success,
    Warning,
    Error,
}

pub trait Feedback: Send + Sync {
    /// A one-off message.
    fn message(&self, level: Level, text: &str);

    /// Replace the live status line.
    fn status(&self, text: &str);

    /// Remove the live status line, if one is shown.
    fn clear_status(&self);
}

/// Routes feedback into `tracing`. Status lines are logged only when they
/// change, so polling loops do not flood the log.
#[derive(Debug, Default)]
pub struct TracingFeedback {
    last_status: Mutex<Option<String>>,
}

impl TracingFeedback {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Feedback for TracingFeedback {
    fn message(&self, level: Level, text: &str) {
        match level {
            Level::Info | Level::Success => info!("{}", text),
            Level::Warning => warn!("{}", text),
            Level::Error => error!("{}", text),
        }
    }

    fn status(&self, text: &str) {
        let Ok(mut last) = self.last_status.lock() else {
            return;
        };
        if last.as_deref() != Some(text) {
            info!("{}", text);
            *last = Some(text.to_string());
        }
    }

    fn clear_status(&self) {
        if let Ok(mut last) = self.last_status.lock() {
            *last = None;
        }
    }
}

const SPINNER: &[char] = &['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];

/// Writes to stderr, redrawing the status line in place with a spinner.
#[derive(Debug, Default)]
pub struct ConsoleFeedback {
    tick: Mutex<usize>,
}

impl ConsoleFeedback {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Feedback for ConsoleFeedback {
    fn message(&self, level: Level, text: &str) {
        let prefix = match level {
            Level::Info => "",
            Level::Success => "✔ ",
            Level::Warning => "⚠ ",
            Level::Error => "✖ ",
        };
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "\r\x1b[2K{}{}", prefix, text);
    }

    fn status(&self, text: &str) {
        let Ok(mut tick) = self.tick.lock() else {
            return;
        };
        let frame = SPINNER[*tick % SPINNER.len()];
        *tick += 1;
        let mut stderr = io::stderr().lock();
        let _ = write!(stderr, "\r\x1b[2K{} {}", frame, text);
        let _ = stderr.flush();
    }

    fn clear_status(&self) {
        let mut stderr = io::stderr().lock();
        let _ = write!(stderr, "\r\x1b[2K");
        let _ = stderr.flush();
    }
}

/// Keeps every message and status update in memory.
#[derive(Debug, Default)]
pub struct RecordingFeedback {
    messages: Mutex<Vec<(Level, String)>>,
    statuses: Mutex<Vec<String>>,
}

impl RecordingFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(Level, String)> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.statuses.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn has_message(&self, level: Level, needle: &str) -> bool {
        self.messages()
            .iter()
            .any(|(l, text)| *l == level && text.contains(needle))
    }
}

impl Feedback for RecordingFeedback {
    fn message(&self, level: Level, text: &str) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push((level, text.to_string()));
        }
    }

    fn status(&self, text: &str) {
        if let Ok(mut statuses) = self.statuses.lock() {
            statuses.push(text.to_string());
        }
    }

    fn clear_status(&self) {}
}
