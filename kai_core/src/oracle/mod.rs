use crate::result::ExecutionResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

mod compiler;
mod composite;
mod signal;

pub use compiler::CompilerOracle;
pub use composite::CompositeOracle;
pub use signal::SignalOracle;

/// Classification an oracle reports when nothing noteworthy happened.
pub const NORMAL_CLASSIFICATION: &str = "NORMAL";

/// How serious a finding is. The ordering is total and increasing, so
/// `Severity::Info < Severity::Critical`.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Interesting behaviour, nothing wrong.
    #[default]
    Info,
    /// Potential issue.
    Warning,
    /// Definite error, but not a crash.
    Error,
    /// The target crashed.
    Crash,
    /// The toolchain itself crashed.
    Critical,
}

/// An oracle's judgement about one [`ExecutionResult`].
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Verdict {
    /// Whether the input that produced this result should be kept in the corpus.
    pub is_interesting: bool,
    pub is_crash: bool,
    pub classification: String,
    pub severity: Severity,
    /// Oracle-specific metadata (exit code, durations, extracted messages, ...).
    pub details: BTreeMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Verdict {
    pub fn new(
        is_interesting: bool,
        is_crash: bool,
        classification: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            is_interesting,
            is_crash,
            classification: classification.into(),
            severity,
            details: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// The verdict for "nothing to see here".
    pub fn normal() -> Self {
        Self::new(false, false, NORMAL_CLASSIFICATION, Severity::Info)
    }
}

/// Read-only snapshot of an oracle's running counters.
#[derive(Serialize, Debug, Clone, PartialEq, Default)]
pub struct OracleStats {
    pub total_analyses: u64,
    pub unique_crashes: u64,
    pub unique_warnings: u64,
    pub classifications: BTreeMap<String, u64>,
    pub avg_analysis_time_ms: f64,
}

/// An `Oracle` turns the raw outcome of one execution into a [`Verdict`].
///
/// Oracles are shared by every worker of the engine, so implementations keep
/// their counters behind interior mutability and take `&self` everywhere.
pub trait Oracle: Send + Sync {
    /// A short, stable name used in logs.
    fn name(&self) -> &'static str;

    /// Produces a verdict for `result` and records it in the oracle's statistics.
    fn analyze(&self, result: &ExecutionResult) -> Verdict;

    /// Whether `result` indicates a crash. Does not touch statistics.
    fn is_crash(&self, result: &ExecutionResult) -> bool;

    /// The classification label `analyze` would report. Does not touch statistics.
    fn classify(&self, result: &ExecutionResult) -> String;

    fn stats(&self) -> OracleStats;

    /// Zeroes all counters, e.g. for a new fuzzing session.
    fn reset(&self);
}

/// Bookkeeping shared by the single oracles.
#[derive(Debug, Default)]
pub(crate) struct AnalysisCounters {
    total_analyses: u64,
    total_analysis_time: Duration,
    classifications: BTreeMap<String, u64>,
    crash_classifications: BTreeSet<String>,
    warnings: u64,
}

impl AnalysisCounters {
    pub(crate) fn record(&mut self, verdict: &Verdict, elapsed: Duration, is_warning: bool) {
        self.total_analyses += 1;
        self.total_analysis_time += elapsed;
        *self
            .classifications
            .entry(verdict.classification.clone())
            .or_insert(0) += 1;
        if verdict.is_crash {
            self.crash_classifications
                .insert(verdict.classification.clone());
        }
        if is_warning {
            self.warnings += 1;
        }
    }

    pub(crate) fn snapshot(&self) -> OracleStats {
        let avg_analysis_time_ms = if self.total_analyses == 0 {
            0.0
        } else {
            self.total_analysis_time.as_secs_f64() * 1000.0 / self.total_analyses as f64
        };
        OracleStats {
            total_analyses: self.total_analyses,
            unique_crashes: self.crash_classifications.len() as u64,
            unique_warnings: self.warnings,
            classifications: self.classifications.clone(),
            avg_analysis_time_ms,
        }
    }
}
