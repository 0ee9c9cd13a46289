//! Event writers for training progress.
//!
//! [`Writers`] is owned by the trainer. Events are buffered and flushed to
//! every configured backend on [`Writers::write_out`].

use crate::config::LoggingConfig;
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Event {
    Scalar { name: String, value: f32, step: usize },
    Config { name: String, value: JsonValue, step: usize },
}

pub trait EventWriter: Send {
    fn write_event(&mut self, event: &Event) -> Result<(), WriterError>;

    fn flush(&mut self) -> Result<(), WriterError> {
        Ok(())
    }
}

/// Appends one JSON object per event to `<log_dir>/events.jsonl`.
pub struct JsonlEventWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlEventWriter {
    pub fn create(log_dir: &Path, experiment_name: &str, project_name: &str) -> Result<Self, WriterError> {
        fs::create_dir_all(log_dir)?;
        let path = log_dir.join("events.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(
            &mut writer,
            &json!({ "kind": "run", "experiment": experiment_name, "project": project_name }),
        )?;
        writer.write_all(b"\n")?;
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventWriter for JsonlEventWriter {
    fn write_event(&mut self, event: &Event) -> Result<(), WriterError> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), WriterError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Logs the latest scalars to the console through `tracing`.
pub struct LocalWriter {
    max_iter: usize,
    max_log_size: usize,
    latest: BTreeMap<String, f32>,
    last_step: Option<usize>,
}

impl LocalWriter {
    pub fn new(max_iter: usize, max_log_size: usize, banner_messages: &[String]) -> Self {
        for line in banner_messages {
            info!("{}", line);
        }
        Self {
            max_iter,
            max_log_size: max_log_size.max(1),
            latest: BTreeMap::new(),
            last_step: None,
        }
    }
}

impl EventWriter for LocalWriter {
    fn write_event(&mut self, event: &Event) -> Result<(), WriterError> {
        if let Event::Scalar { name, value, step } = event {
            self.latest.insert(name.clone(), *value);
            self.last_step = Some(*step);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), WriterError> {
        let Some(step) = self.last_step.take() else {
            return Ok(());
        };
        let line = self
            .latest
            .iter()
            .take(self.max_log_size)
            .map(|(name, value)| format!("{}={:.4}", name, value))
            .collect::<Vec<_>>()
            .join(" ");
        let percent = 100.0 * (step + 1) as f32 / self.max_iter.max(1) as f32;
        info!("[{:>6}/{} {:5.1}%] {}", step, self.max_iter, percent, line);
        Ok(())
    }
}

#[derive(Default)]
pub struct Writers {
    backends: Vec<Box<dyn EventWriter>>,
    pending: Vec<Event>,
    max_buffer_size: usize,
}

impl Writers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the event backends requested by the vis mode.
    ///
    /// The tensorboard slot is served by a JSON-lines log that tensorboard
    /// importers can read. wandb and comet have no exporter here and only
    /// produce a warning.
    pub fn setup_event_writer(
        &mut self,
        wandb: bool,
        tensorboard: bool,
        comet: bool,
        log_dir: &Path,
        experiment_name: &str,
        project_name: &str,
    ) -> Result<(), WriterError> {
        if wandb {
            warn!("wandb logging is not available, events go to the local log only");
        }
        if comet {
            warn!("comet logging is not available, events go to the local log only");
        }
        if tensorboard {
            let writer = JsonlEventWriter::create(log_dir, experiment_name, project_name)?;
            info!("Writing events to {}", writer.path().display());
            self.backends.push(Box::new(writer));
        }
        Ok(())
    }

    pub fn setup_local_writer(&mut self, logging: &LoggingConfig, max_iter: usize, banner_messages: &[String]) {
        self.max_buffer_size = logging.max_buffer_size;
        if logging.local_writer.enable {
            self.backends.push(Box::new(LocalWriter::new(
                max_iter,
                logging.local_writer.max_log_size,
                banner_messages,
            )));
        } else {
            for line in banner_messages {
                info!("{}", line);
            }
        }
    }

    pub fn put_scalar(&mut self, name: &str, value: f32, step: usize) {
        self.pending.push(Event::Scalar {
            name: name.to_string(),
            value,
            step,
        });
    }

    pub fn put_config<T: Serialize>(&mut self, name: &str, config: &T, step: usize) -> Result<(), WriterError> {
        let value = serde_json::to_value(config)?;
        self.pending.push(Event::Config {
            name: name.to_string(),
            value,
            step,
        });
        Ok(())
    }

    /// Whether enough events are buffered that a flush is due.
    pub fn is_buffer_full(&self) -> bool {
        self.pending.len() >= self.max_buffer_size.max(1)
    }

    pub fn pending(&self) -> &[Event] {
        &self.pending
    }

    /// Deliver buffered events to every backend and flush them.
    pub fn write_out(&mut self) -> Result<(), WriterError> {
        for event in self.pending.drain(..) {
            for backend in &mut self.backends {
                backend.write_event(&event)?;
            }
        }
        for backend in &mut self.backends {
            backend.flush()?;
        }
        Ok(())
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalWriterConfig;

    #[test]
    fn test_jsonl_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut writers = Writers::new();
        writers
            .setup_event_writer(false, true, false, dir.path(), "exp", "proj")
            .unwrap();
        writers.put_config("config", &json!({ "num_msgs_to_start": 10 }), 0).unwrap();
        writers.put_scalar("loss", 0.5, 1);
        writers.write_out().unwrap();
        assert!(writers.pending().is_empty());

        let contents = fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        let lines: Vec<JsonValue> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["experiment"], "exp");
        assert_eq!(lines[1]["kind"], "config");
        assert_eq!(lines[1]["value"]["num_msgs_to_start"], 10);
        assert_eq!(lines[2]["name"], "loss");
    }

    #[test]
    fn test_unavailable_backends_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut writers = Writers::new();
        writers
            .setup_event_writer(true, false, true, dir.path(), "exp", "proj")
            .unwrap();
        assert_eq!(writers.backend_count(), 0);
    }

    #[test]
    fn test_local_writer_respects_enable_flag() {
        let mut writers = Writers::new();
        let logging = LoggingConfig {
            local_writer: LocalWriterConfig {
                enable: false,
                max_log_size: 5,
            },
            ..LoggingConfig::default()
        };
        writers.setup_local_writer(&logging, 100, &["banner".to_string()]);
        assert_eq!(writers.backend_count(), 0);

        writers.setup_local_writer(&LoggingConfig::default(), 100, &[]);
        assert_eq!(writers.backend_count(), 1);
    }

    #[test]
    fn test_buffer_full() {
        let mut writers = Writers::new();
        let logging = LoggingConfig {
            max_buffer_size: 2,
            ..LoggingConfig::default()
        };
        writers.setup_local_writer(&logging, 10, &[]);
        writers.put_scalar("a", 1.0, 0);
        assert!(!writers.is_buffer_full());
        writers.put_scalar("b", 1.0, 0);
        assert!(writers.is_buffer_full());
        writers.write_out().unwrap();
        assert!(!writers.is_buffer_full());
    }
}
