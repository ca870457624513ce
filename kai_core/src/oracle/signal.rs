use super::{AnalysisCounters, NORMAL_CLASSIFICATION, Oracle, OracleStats, Severity, Verdict};
use crate::result::ExecutionResult;
use parking_lot::Mutex;
use std::time::Instant;

/// Runs slower than this are reported as `TIMEOUT` and flagged as interesting.
pub const SLOW_EXECUTION_THRESHOLD_MS: u64 = 5000;

/// Exit codes that identify a fatal signal, both as a raw negative signal
/// number and in the shell's `128 + signal` form.
const SIGNAL_EXIT_CODES: &[(i32, &str)] = &[
    (-11, "SEGMENTATION_FAULT"),
    (-6, "ABORT"),
    (-8, "FPE"),
    (-4, "ILLEGAL_INSTRUCTION"),
    (134, "ABORT"),
    (139, "SEGMENTATION_FAULT"),
    (136, "FPE"),
];

const CRASH_KEYWORDS: &[&str] = &[
    "segmentation fault",
    "segfault",
    "abort",
    "illegal instruction",
    "floating point exception",
];

const INTERESTING_OUTPUT_KEYWORDS: &[&str] = &[
    "error",
    "warning",
    "exception",
    "panic",
    "invalid",
    "unexpected",
    "failed",
];

/// Platform-agnostic oracle that looks at how the process ended: fatal
/// signals, slow runs and suspicious output.
#[derive(Debug, Default)]
pub struct SignalOracle {
    counters: Mutex<AnalysisCounters>,
}

impl SignalOracle {
    pub fn new() -> Self {
        Self::default()
    }

    fn signal_name(exit_code: i32) -> Option<&'static str> {
        SIGNAL_EXIT_CODES
            .iter()
            .find(|(code, _)| *code == exit_code)
            .map(|(_, name)| *name)
    }

    fn is_slow(result: &ExecutionResult) -> bool {
        result.duration_ms > SLOW_EXECUTION_THRESHOLD_MS
    }

    fn has_interesting_output(result: &ExecutionResult) -> bool {
        let output = format!("{}{}", result.stdout, result.stderr).to_lowercase();
        INTERESTING_OUTPUT_KEYWORDS
            .iter()
            .any(|keyword| output.contains(keyword))
    }
}

impl Oracle for SignalOracle {
    fn name(&self) -> &'static str {
        "SignalOracle"
    }

    fn analyze(&self, result: &ExecutionResult) -> Verdict {
        let started = Instant::now();
        let classification = self.classify(result);
        let is_crash = self.is_crash(result);
        let is_slow = Self::is_slow(result);

        let severity = if is_crash && classification.contains("COMPILER") {
            Severity::Critical
        } else if result.exit_code != 0 {
            Severity::Error
        } else if is_slow {
            Severity::Warning
        } else {
            Severity::Info
        };

        let is_interesting = is_crash
            || result.exit_code != 0
            || is_slow
            || Self::has_interesting_output(result);

        let verdict = Verdict::new(is_interesting, is_crash, classification, severity)
            .with_detail("exit_code", result.exit_code)
            .with_detail("duration_ms", result.duration_ms)
            .with_detail("output_size", result.stdout.len() + result.stderr.len())
            .with_detail("signal", result.exit_code < 0);

        self.counters.lock().record(&verdict, started.elapsed(), is_slow);
        verdict
    }

    fn is_crash(&self, result: &ExecutionResult) -> bool {
        if Self::signal_name(result.exit_code).is_some() {
            return true;
        }
        let stderr = result.stderr.to_lowercase();
        CRASH_KEYWORDS.iter().any(|keyword| stderr.contains(keyword))
    }

    fn classify(&self, result: &ExecutionResult) -> String {
        if let Some(name) = Self::signal_name(result.exit_code) {
            name.to_string()
        } else if Self::is_slow(result) {
            "TIMEOUT".to_string()
        } else if result.exit_code != 0 {
            format!("EXIT_{}", result.exit_code)
        } else {
            NORMAL_CLASSIFICATION.to_string()
        }
    }

    fn stats(&self) -> OracleStats {
        self.counters.lock().snapshot()
    }

    fn reset(&self) {
        *self.counters.lock() = AnalysisCounters::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::FuzzInput;
    use std::sync::Arc;

    fn result(exit_code: i32, stdout: &str, stderr: &str, duration_ms: u64) -> ExecutionResult {
        ExecutionResult::new(
            Arc::new(FuzzInput::new("fun main() {}")),
            exit_code,
            stdout,
            stderr,
            duration_ms,
        )
    }

    #[test]
    fn maps_signal_exit_codes() {
        let oracle = SignalOracle::new();
        for (code, expected) in [
            (-11, "SEGMENTATION_FAULT"),
            (139, "SEGMENTATION_FAULT"),
            (-6, "ABORT"),
            (134, "ABORT"),
            (-8, "FPE"),
            (136, "FPE"),
            (-4, "ILLEGAL_INSTRUCTION"),
        ] {
            let res = result(code, "", "", 10);
            assert!(oracle.is_crash(&res), "exit code {code} should be a crash");
            assert_eq!(oracle.classify(&res), expected);
        }
    }

    #[test]
    fn signal_classification_wins_over_slowness() {
        let oracle = SignalOracle::new();
        assert_eq!(
            oracle.classify(&result(139, "", "", 60_000)),
            "SEGMENTATION_FAULT"
        );
        assert_eq!(oracle.classify(&result(0, "", "", 5001)), "TIMEOUT");
        assert_eq!(oracle.classify(&result(0, "", "", 5000)), "NORMAL");
        assert_eq!(oracle.classify(&result(2, "", "", 10)), "EXIT_2");
    }

    #[test]
    fn crash_keywords_in_stderr() {
        let oracle = SignalOracle::new();
        assert!(oracle.is_crash(&result(0, "", "Segfault at 0x0", 1)));
        assert!(oracle.is_crash(&result(1, "", "Floating point exception", 1)));
        assert!(!oracle.is_crash(&result(1, "", "error: nope", 1)));
    }

    #[test]
    fn verdict_severity_and_interest() {
        let oracle = SignalOracle::new();

        let segv = oracle.analyze(&result(-11, "", "", 10));
        assert!(segv.is_crash);
        assert!(segv.is_interesting);
        assert_eq!(segv.severity, Severity::Error);
        assert_eq!(segv.details["signal"], true);

        let slow = oracle.analyze(&result(0, "", "", 9000));
        assert_eq!(slow.severity, Severity::Warning);
        assert!(slow.is_interesting);
        assert!(!slow.is_crash);

        let chatty = oracle.analyze(&result(0, "Unexpected token", "", 10));
        assert_eq!(chatty.classification, "NORMAL");
        assert_eq!(chatty.severity, Severity::Info);
        assert!(chatty.is_interesting);

        let quiet = oracle.analyze(&result(0, "hello", "", 10));
        assert!(!quiet.is_interesting);
        assert_eq!(quiet.details["output_size"], 5);
        assert_eq!(quiet.details["duration_ms"], 10);
    }

    #[test]
    fn stats_count_distinct_crash_signatures_and_slow_runs() {
        let oracle = SignalOracle::new();
        oracle.analyze(&result(-11, "", "", 1));
        oracle.analyze(&result(139, "", "", 1));
        oracle.analyze(&result(134, "", "", 1));
        oracle.analyze(&result(0, "", "", 6000));

        let stats = oracle.stats();
        assert_eq!(stats.total_analyses, 4);
        assert_eq!(stats.unique_crashes, 2);
        assert_eq!(stats.unique_warnings, 1);
        assert_eq!(stats.classifications.get("SEGMENTATION_FAULT"), Some(&2));
        assert_eq!(stats.classifications.get("TIMEOUT"), Some(&1));

        oracle.reset();
        assert_eq!(oracle.stats().total_analyses, 0);
    }
}
