use crate::input::FuzzInput;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Exit code a runner reports when it had to kill the target on timeout.
pub const TIMEOUT_EXIT_CODE: i32 = -1;
/// Marker a runner writes to stderr alongside [`TIMEOUT_EXIT_CODE`].
pub const TIMEOUT_MARKER: &str = "TIMEOUT";

/// Substrings of stderr that indicate the compiler itself failed, as opposed
/// to rejecting the program.
const INTERNAL_ERROR_MARKERS: &[&str] = &[
    "Internal error",
    "internal compiler error",
    "java.lang.",
    "kotlin.",
    "AssertionError",
];

/// Coarse outcome of one execution, derived purely from the result fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResultClass {
    Success,
    Timeout,
    Killed,
    CompilerCrash,
    CompilationError,
    UnknownFailure,
}

impl ResultClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultClass::Success => "SUCCESS",
            ResultClass::Timeout => "TIMEOUT",
            ResultClass::Killed => "KILLED",
            ResultClass::CompilerCrash => "COMPILER_CRASH",
            ResultClass::CompilationError => "COMPILATION_ERROR",
            ResultClass::UnknownFailure => "UNKNOWN_FAILURE",
        }
    }
}

impl fmt::Display for ResultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed outcome of compiling and/or running one [`FuzzInput`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub input: Arc<FuzzInput>,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub coverage_data: Option<String>,
    #[serde(default)]
    pub exception: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn new(
        input: Arc<FuzzInput>,
        exit_code: i32,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            input,
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration_ms,
            coverage_data: None,
            exception: None,
            timestamp: Utc::now(),
        }
    }

    /// The result a runner reports when the target exceeded its time budget.
    pub fn timed_out(input: Arc<FuzzInput>, timeout_ms: u64) -> Self {
        Self::new(
            input,
            TIMEOUT_EXIT_CODE,
            "",
            format!("{TIMEOUT_MARKER} after {timeout_ms}ms"),
            timeout_ms,
        )
    }

    /// A stand-in result for inputs whose real outcome is unknown, e.g. sources
    /// reloaded from disk without a matching `results.json` entry.
    pub fn placeholder(input: Arc<FuzzInput>) -> Self {
        Self::new(input, 0, "", "", 0)
    }

    /// The result a runner reports when the target was started but the runner
    /// lost track of it, e.g. because its output could not be collected.
    pub fn runner_exception(
        input: Arc<FuzzInput>,
        exception: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        let exception = exception.into();
        Self::new(
            input,
            TIMEOUT_EXIT_CODE,
            "",
            format!("Runner exception: {exception}"),
            duration_ms,
        )
        .with_exception(exception)
    }

    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }

    pub fn is_successful(&self) -> bool {
        self.exit_code == 0
    }

    pub fn is_timeout(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE && self.stderr.contains(TIMEOUT_MARKER)
    }

    /// Exit codes in 128..=255 are how a shell reports death by signal.
    pub fn is_killed(&self) -> bool {
        (128..=255).contains(&self.exit_code)
    }

    pub fn is_compiler_crash(&self) -> bool {
        !self.is_successful()
            && INTERNAL_ERROR_MARKERS
                .iter()
                .any(|marker| self.stderr.contains(marker))
    }

    pub fn is_compilation_error(&self) -> bool {
        !self.is_successful() && self.stderr.contains("error:") && self.stderr.contains("Exception")
    }

    pub fn classify(&self) -> ResultClass {
        if self.is_successful() {
            ResultClass::Success
        } else if self.is_timeout() {
            ResultClass::Timeout
        } else if self.is_killed() {
            ResultClass::Killed
        } else if self.is_compiler_crash() {
            ResultClass::CompilerCrash
        } else if self.is_compilation_error() {
            ResultClass::CompilationError
        } else {
            ResultClass::UnknownFailure
        }
    }

    /// Whether persisting the corpus should extract this result into its own
    /// crash folder.
    pub fn is_crash_artifact(&self) -> bool {
        self.classify().as_str().contains("CRASH") || self.is_timeout() || self.is_killed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(exit_code: i32, stderr: &str) -> ExecutionResult {
        ExecutionResult::new(Arc::new(FuzzInput::new("fun main() {}")), exit_code, "", stderr, 10)
    }

    #[test]
    fn zero_exit_is_success_regardless_of_stderr() {
        assert_eq!(result(0, "").classify(), ResultClass::Success);
        assert_eq!(result(0, "Internal error").classify(), ResultClass::Success);
    }

    #[test]
    fn timeout_sentinel_is_recognised() {
        let input = Arc::new(FuzzInput::new(""));
        let timed_out = ExecutionResult::timed_out(input, 30_000);
        assert!(timed_out.is_timeout());
        assert_eq!(timed_out.classify(), ResultClass::Timeout);
        assert_eq!(timed_out.duration_ms, 30_000);

        // -1 without the marker is an ordinary failure.
        assert_eq!(result(-1, "boom").classify(), ResultClass::UnknownFailure);
    }

    #[test]
    fn runner_exceptions_are_plain_failures() {
        let input = Arc::new(FuzzInput::new(""));
        let failed = ExecutionResult::runner_exception(input, "Broken pipe (os error 32)", 12);
        assert_eq!(failed.exception.as_deref(), Some("Broken pipe (os error 32)"));
        assert!(failed.stderr.contains("Broken pipe"));
        assert!(!failed.is_timeout());
        assert_eq!(failed.classify(), ResultClass::UnknownFailure);
        assert!(!failed.is_crash_artifact());
    }

    #[test]
    fn signal_range_exit_codes_are_killed() {
        assert_eq!(result(128, "").classify(), ResultClass::Killed);
        assert_eq!(result(137, "Internal error").classify(), ResultClass::Killed);
        assert_eq!(result(255, "").classify(), ResultClass::Killed);
        assert_eq!(result(127, "").classify(), ResultClass::UnknownFailure);
        assert_eq!(result(256, "").classify(), ResultClass::UnknownFailure);
    }

    #[test]
    fn internal_error_markers_mean_compiler_crash() {
        assert_eq!(
            result(1, "Internal error: something broke").classify(),
            ResultClass::CompilerCrash
        );
        assert_eq!(
            result(1, "exception: java.lang.IllegalStateException").classify(),
            ResultClass::CompilerCrash
        );
    }

    #[test]
    fn compilation_error_needs_error_and_exception_markers() {
        assert_eq!(
            result(1, "error: unresolved reference\nCompilationException").classify(),
            ResultClass::CompilationError
        );
        assert_eq!(
            result(1, "error: unresolved reference").classify(),
            ResultClass::UnknownFailure
        );
    }

    #[test]
    fn crash_artifacts_cover_crashes_timeouts_and_kills() {
        assert!(result(1, "Internal error").is_crash_artifact());
        assert!(result(139, "").is_crash_artifact());
        assert!(ExecutionResult::timed_out(Arc::new(FuzzInput::new("")), 5).is_crash_artifact());
        assert!(!result(0, "").is_crash_artifact());
        assert!(!result(2, "error: nope").is_crash_artifact());
    }

    #[test]
    fn display_matches_persisted_labels() {
        assert_eq!(ResultClass::CompilerCrash.to_string(), "COMPILER_CRASH");
        assert_eq!(ResultClass::UnknownFailure.to_string(), "UNKNOWN_FAILURE");
    }
}
