use super::{AnalysisCounters, Oracle, OracleStats, Severity, Verdict};
use crate::result::ExecutionResult;
use parking_lot::Mutex;
use std::time::Instant;

/// Lower-cased stderr fragments that mean the compiler itself blew up.
const COMPILER_CRASH_SIGNATURES: &[&str] = &[
    "compiler crash",
    "internal compiler error",
    "ice:",
    "panic:",
    "segmentation fault",
    "assertion failed",
    "kotlin: internal error",
];

pub const COMPILER_CRASH: &str = "COMPILER_CRASH";
pub const COMPILER_ERROR: &str = "COMPILER_ERROR";
pub const COMPILER_WARNING: &str = "COMPILER_WARNING";
pub const COMPILER_SUCCESS: &str = "COMPILER_SUCCESS";

const MAX_ERROR_MESSAGE_CHARS: usize = 200;

/// Pattern-matching oracle for compiler diagnostics.
///
/// Every non-zero exit counts as a crash here; the classification then says
/// whether it was a genuine compiler crash, a rejected program or something
/// else.
#[derive(Debug, Default)]
pub struct CompilerOracle {
    counters: Mutex<AnalysisCounters>,
}

impl CompilerOracle {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches_crash_signature(stderr_lower: &str) -> bool {
        COMPILER_CRASH_SIGNATURES
            .iter()
            .any(|signature| stderr_lower.contains(signature))
    }

    fn error_message(stderr: &str) -> String {
        stderr
            .lines()
            .find(|line| line.contains("error") || line.contains("panic"))
            .map(|line| line.chars().take(MAX_ERROR_MESSAGE_CHARS).collect())
            .unwrap_or_default()
    }
}

impl Oracle for CompilerOracle {
    fn name(&self) -> &'static str {
        "CompilerOracle"
    }

    fn analyze(&self, result: &ExecutionResult) -> Verdict {
        let started = Instant::now();
        let classification = self.classify(result);
        let is_crash = self.is_crash(result);

        let severity = match classification.as_str() {
            COMPILER_CRASH => Severity::Critical,
            COMPILER_ERROR => Severity::Warning,
            _ if is_crash => Severity::Crash,
            _ => Severity::Info,
        };
        let is_interesting = is_crash || classification.starts_with("COMPILER_");
        let is_warning = classification == COMPILER_WARNING;

        let verdict = Verdict::new(is_interesting, is_crash, classification, severity)
            .with_detail("exit_code", result.exit_code)
            .with_detail("error_message", Self::error_message(&result.stderr));

        self.counters
            .lock()
            .record(&verdict, started.elapsed(), is_warning);
        verdict
    }

    fn is_crash(&self, result: &ExecutionResult) -> bool {
        Self::matches_crash_signature(&result.stderr.to_lowercase()) || result.exit_code != 0
    }

    fn classify(&self, result: &ExecutionResult) -> String {
        let stderr = result.stderr.to_lowercase();
        if Self::matches_crash_signature(&stderr) {
            COMPILER_CRASH.to_string()
        } else if stderr.contains("error") {
            COMPILER_ERROR.to_string()
        } else if stderr.contains("warning") {
            COMPILER_WARNING.to_string()
        } else if result.exit_code != 0 {
            format!("COMPILER_EXIT_{}", result.exit_code)
        } else {
            COMPILER_SUCCESS.to_string()
        }
    }

    fn stats(&self) -> OracleStats {
        self.counters.lock().snapshot()
    }

    fn reset(&self) {
        *self.counters.lock() = AnalysisCounters::default();
    }
}
