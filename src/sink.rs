//! Result Sinks
//!
//! Every run report ends up in a sink: the log, memory (tests), or a JSON
//! directory tree laid out as
//! `<output_dir>/<policy>/<account>/<region>/{resources,metrics}.json`.

use crate::policy::RunReport;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Receives the report of every finished run (DONE or FAILED)
pub trait ResultSink: Send + Sync {
    fn record(&self, report: &RunReport) -> Result<()>;
}

/// Keeps reports in memory
#[derive(Default)]
pub struct MemorySink {
    reports: Mutex<Vec<RunReport>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<RunReport> {
        self.reports.lock().clone()
    }
}

impl ResultSink for MemorySink {
    fn record(&self, report: &RunReport) -> Result<()> {
        self.reports.lock().push(report.clone());
        Ok(())
    }
}

/// Logs a one-line summary per run and every action failure
#[derive(Debug, Default)]
pub struct LogSink;

impl ResultSink for LogSink {
    fn record(&self, report: &RunReport) -> Result<()> {
        let metrics = report.metrics();
        tracing::info!(
            policy = %report.policy,
            scope = %report.scope,
            "{}: {} resource(s), {} matched, {} filter error(s), {} action failure(s){}",
            report.state,
            metrics.resource_count,
            metrics.matched,
            metrics.filter_errors,
            metrics.action_failures,
            if report.dry_run { " [dry-run]" } else { "" }
        );
        for error in report.action_errors() {
            tracing::warn!(policy = %report.policy, scope = %report.scope, "{}", error);
        }
        Ok(())
    }
}

/// Writes `resources.json` and `metrics.json` per (policy, account, region)
#[derive(Debug, Clone)]
pub struct JsonDirSink {
    root: PathBuf,
}

impl JsonDirSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the results of one run
    pub fn run_dir(&self, report: &RunReport) -> PathBuf {
        self.root
            .join(sanitize(&report.policy))
            .join(sanitize(&report.scope.account))
            .join(sanitize(&report.scope.region))
    }
}

/// Keep path components to one directory level
fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == ':' { '_' } else { c })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

fn write_json(path: &Path, value: &impl serde::Serialize) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

impl ResultSink for JsonDirSink {
    fn record(&self, report: &RunReport) -> Result<()> {
        let dir = self.run_dir(report);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
        write_json(&dir.join("resources.json"), &report.resource_records())?;
        write_json(&dir.join("metrics.json"), &report.metrics())?;
        tracing::debug!("Wrote results to {}", dir.display());
        Ok(())
    }
}

/// Forwards every report to several sinks; all are tried even if one fails
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ResultSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl ResultSink for FanoutSink {
    fn record(&self, report: &RunReport) -> Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.record(report) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
