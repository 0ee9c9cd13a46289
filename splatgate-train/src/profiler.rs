//! Wall-clock profiler for named training sections.

use crate::config::{LoggingConfig, ProfilerKind};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SectionStats {
    pub count: u64,
    pub total_secs: f64,
    pub mean_secs: f64,
}

#[derive(Debug)]
pub struct Profiler {
    kind: ProfilerKind,
    output: PathBuf,
    sections: BTreeMap<String, (u64, Duration)>,
}

impl Default for Profiler {
    /// Disabled profiler, used until setup configures one.
    fn default() -> Self {
        Self {
            kind: ProfilerKind::None,
            output: PathBuf::from("profile.json"),
            sections: BTreeMap::new(),
        }
    }
}

impl Profiler {
    pub fn setup_profiler(logging: &LoggingConfig, log_dir: &Path) -> Self {
        Self {
            kind: logging.profiler,
            output: log_dir.join("profile.json"),
            sections: BTreeMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.kind != ProfilerKind::None
    }

    /// Run `f`, attributing its duration to `name` when profiling is on.
    pub fn time<T>(&mut self, name: &str, f: impl FnOnce() -> T) -> T {
        if !self.is_enabled() {
            return f();
        }
        let start = Instant::now();
        let out = f();
        self.record(name, start.elapsed());
        out
    }

    pub fn record(&mut self, name: &str, elapsed: Duration) {
        let entry = self.sections.entry(name.to_string()).or_default();
        entry.0 += 1;
        entry.1 += elapsed;
    }

    pub fn stats(&self) -> BTreeMap<String, SectionStats> {
        self.sections
            .iter()
            .map(|(name, &(count, total))| {
                let total_secs = total.as_secs_f64();
                let stats = SectionStats {
                    count,
                    total_secs,
                    mean_secs: if count == 0 { 0.0 } else { total_secs / count as f64 },
                };
                (name.clone(), stats)
            })
            .collect()
    }

    /// Log the summary and write it to `profile.json`.
    pub fn flush(&self) -> std::io::Result<()> {
        if !self.is_enabled() || self.sections.is_empty() {
            return Ok(());
        }
        let stats = self.stats();
        for (name, s) in &stats {
            info!("{:<24} {:>8} calls  {:>10.6}s mean", name, s.count, s.mean_secs);
        }
        if let Some(parent) = self.output.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&stats).map_err(std::io::Error::other)?;
        fs::write(&self.output, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_profiler_records_nothing() {
        let logging = LoggingConfig {
            profiler: ProfilerKind::None,
            ..LoggingConfig::default()
        };
        let mut profiler = Profiler::setup_profiler(&logging, Path::new("unused"));
        assert_eq!(profiler.time("step", || 7), 7);
        assert!(profiler.stats().is_empty());
        profiler.flush().unwrap();
    }

    #[test]
    fn test_basic_profiler_writes_summary() {
        let dir = tempfile::tempdir().unwrap();
        let mut profiler = Profiler::setup_profiler(&LoggingConfig::default(), dir.path());
        profiler.record("train_iteration", Duration::from_millis(10));
        profiler.record("train_iteration", Duration::from_millis(30));
        profiler.time("checkpoint", || ());

        let stats = profiler.stats();
        assert_eq!(stats["train_iteration"].count, 2);
        assert!((stats["train_iteration"].mean_secs - 0.02).abs() < 1e-9);

        profiler.flush().unwrap();
        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("profile.json")).unwrap()).unwrap();
        assert_eq!(written["checkpoint"]["count"], 1);
    }
}
