//! Caller-supplied reporting sink.
//!
//! Long-running operations surface per-item warnings and progress through a
//! [`Reporter`] passed in by the caller instead of a process-wide handler.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub details: String,
}

pub trait Reporter: Send + Sync {
    fn report(&self, severity: Severity, title: &str, message: &str, details: &str);

    /// Called after each unit of work of a multi-item operation.
    fn progress(&self, _done: usize, _total: usize) {}
}

/// Forwards every report to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, severity: Severity, title: &str, message: &str, details: &str) {
        match severity {
            Severity::Info => tracing::info!(title, details, "{message}"),
            Severity::Warning => tracing::warn!(title, details, "{message}"),
            Severity::Error => tracing::error!(title, details, "{message}"),
        }
    }

    fn progress(&self, done: usize, total: usize) {
        tracing::debug!(done, total, "progress");
    }
}

/// Keeps reports in memory so the caller can present them later.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    reports: Mutex<Vec<Report>>,
    last_progress: Mutex<Option<(usize, usize)>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<Report> {
        self.reports
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.reports()
            .iter()
            .filter(|r| r.severity == severity)
            .count()
    }

    pub fn last_progress(&self) -> Option<(usize, usize)> {
        self.last_progress.lock().ok().and_then(|p| *p)
    }
}

impl Reporter for CollectingReporter {
    fn report(&self, severity: Severity, title: &str, message: &str, details: &str) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(Report {
                severity,
                title: title.to_string(),
                message: message.to_string(),
                details: details.to_string(),
            });
        }
    }

    fn progress(&self, done: usize, total: usize) {
        if let Ok(mut p) = self.last_progress.lock() {
            *p = Some((done, total));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_reporter_keeps_order_and_progress() {
        let r = CollectingReporter::new();
        r.report(Severity::Warning, "Calibration", "image skipped", "a.png");
        r.report(Severity::Info, "Calibration", "done", "");
        r.progress(2, 3);

        let all = r.reports();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].details, "a.png");
        assert_eq!(r.count(Severity::Warning), 1);
        assert_eq!(r.last_progress(), Some((2, 3)));
    }
}
