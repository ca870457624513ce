use crate::config::{ConfigError, RunnerConfig};
use crate::input::FuzzInput;
use crate::result::ExecutionResult;
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Captured stdout and stderr are each truncated to this many bytes.
pub const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;
/// How often the background task sweeps the scratch directory.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
/// Scratch files older than this are removed by the sweep.
pub const STALE_FILE_AGE: Duration = Duration::from_secs(300);

/// Placeholder replaced by the path of the source file under test.
pub const SOURCE_PLACEHOLDER: &str = "{}";
/// Placeholder replaced by a fresh, per-execution output directory.
pub const OUTPUT_PLACEHOLDER: &str = "{out}";

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RunnerInfo {
    /// Target platform identifier, e.g. `jvm`.
    pub platform: String,
    pub name: String,
    pub supports_coverage: bool,
    pub timeout_seconds: u64,
}

#[derive(Serialize, Debug, Clone, PartialEq, Default)]
pub struct RunnerStats {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub total_duration_ms: u64,
    pub average_duration_ms: f64,
    pub last_error: Option<String>,
}

/// Executes candidate programs against the toolchain under test.
///
/// A runner must enforce its own time limit. A run that exceeds it is not an
/// error: it is reported as [`ExecutionResult::timed_out`] so the timeout can
/// be classified like any other outcome. `Err` is reserved for failures of the
/// runner itself, such as a compiler binary that cannot be spawned.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn execute(&self, input: &Arc<FuzzInput>) -> anyhow::Result<ExecutionResult>;

    fn info(&self) -> RunnerInfo;

    async fn initialize(&self) -> anyhow::Result<()>;

    async fn shutdown(&self) -> anyhow::Result<()>;

    fn stats(&self) -> RunnerStats;
}

/// Settings for a [`CommandRunner`].
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRunnerSettings {
    pub platform: String,
    pub name: String,
    /// Program followed by its arguments; see [`SOURCE_PLACEHOLDER`] and
    /// [`OUTPUT_PLACEHOLDER`].
    pub command: Vec<String>,
    pub timeout: Duration,
    pub source_extension: String,
}

impl CommandRunnerSettings {
    /// Preset invoking `kotlinc` for the JVM backend.
    pub fn kotlin_jvm(timeout: Duration) -> Self {
        Self {
            platform: "jvm".to_string(),
            name: "Kotlin JVM Runner".to_string(),
            command: ["kotlinc", SOURCE_PLACEHOLDER, "-nowarn", "-d", OUTPUT_PLACEHOLDER]
                .into_iter()
                .map(String::from)
                .collect(),
            timeout,
            source_extension: "kt".to_string(),
        }
    }
}

/// Scratch state that exists between `initialize` and `shutdown`.
#[derive(Debug)]
struct Workspace {
    dir: TempDir,
    cleanup: JoinHandle<()>,
}

/// Runs an external command on a temporary source file.
#[derive(Debug)]
pub struct CommandRunner {
    settings: CommandRunnerSettings,
    workspace: Mutex<Option<Workspace>>,
    total_executions: AtomicU64,
    successful_executions: AtomicU64,
    failed_executions: AtomicU64,
    total_duration_ms: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl CommandRunner {
    pub fn new(settings: CommandRunnerSettings) -> Self {
        Self {
            settings,
            workspace: Mutex::new(None),
            total_executions: AtomicU64::new(0),
            successful_executions: AtomicU64::new(0),
            failed_executions: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    fn scratch_dir(&self) -> anyhow::Result<PathBuf> {
        self.workspace
            .lock()
            .as_ref()
            .map(|workspace| workspace.dir.path().to_path_buf())
            .ok_or_else(|| anyhow!("{} is not initialized", self.settings.name))
    }

    fn build_command(&self, source: &Path, output_dir: &Path) -> anyhow::Result<Command> {
        let (program, args) = self
            .settings
            .command
            .split_first()
            .ok_or_else(|| anyhow!("Runner command is empty"))?;
        let source = source.to_string_lossy();
        let output_dir = output_dir.to_string_lossy();
        let substitute = |arg: &String| {
            arg.replace(OUTPUT_PLACEHOLDER, &output_dir)
                .replace(SOURCE_PLACEHOLDER, &source)
        };

        let mut cmd = Command::new(substitute(program));
        cmd.args(args.iter().map(substitute))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    async fn run_process(
        &self,
        input: &Arc<FuzzInput>,
        scratch: &Path,
    ) -> anyhow::Result<ExecutionResult> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let source_path = scratch.join(format!(
            "kai_{token}.{}",
            self.settings.source_extension
        ));
        let output_dir = scratch.join(format!("out_{token}"));

        tokio::fs::write(&source_path, input.source_code())
            .await
            .with_context(|| format!("Failed to write source file {:?}", source_path))?;
        tokio::fs::create_dir_all(&output_dir)
            .await
            .with_context(|| format!("Failed to create output directory {:?}", output_dir))?;

        let outcome = self.spawn_and_wait(input, &source_path, &output_dir).await;

        if let Err(e) = tokio::fs::remove_file(&source_path).await {
            debug!(file = %source_path.display(), error = %e, "Leaving source file for the sweeper");
        }
        if let Err(e) = tokio::fs::remove_dir_all(&output_dir).await {
            debug!(dir = %output_dir.display(), error = %e, "Leaving output directory for the sweeper");
        }
        outcome
    }

    async fn spawn_and_wait(
        &self,
        input: &Arc<FuzzInput>,
        source_path: &Path,
        output_dir: &Path,
    ) -> anyhow::Result<ExecutionResult> {
        let mut cmd = self.build_command(source_path, output_dir)?;
        let started = Instant::now();
        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn command {:?}", self.settings.command))?;

        // Dropping the pending future drops the child, which kills it.
        let timeout_ms = self.settings.timeout.as_millis() as u64;
        let output = match tokio::time::timeout(self.settings.timeout, child.wait_with_output()).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                debug!(input_id = input.id(), error = %e, "Lost track of child process");
                return Ok(ExecutionResult::runner_exception(
                    Arc::clone(input),
                    format!("Failed to wait for child process: {e}"),
                    started.elapsed().as_millis() as u64,
                ));
            }
            Err(_) => {
                debug!(input_id = input.id(), timeout_ms, "Target timed out, killed");
                return Ok(ExecutionResult::timed_out(Arc::clone(input), timeout_ms));
            }
        };

        Ok(ExecutionResult::new(
            Arc::clone(input),
            exit_code(output.status),
            capped_utf8(&output.stdout),
            capped_utf8(&output.stderr),
            started.elapsed().as_millis() as u64,
        ))
    }

    fn record(&self, outcome: &anyhow::Result<ExecutionResult>, elapsed: Duration) {
        self.total_executions.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        match outcome {
            Ok(result) if result.is_successful() => {
                self.successful_executions.fetch_add(1, Ordering::Relaxed);
            }
            Ok(ExecutionResult {
                exception: Some(exception),
                ..
            }) => {
                self.failed_executions.fetch_add(1, Ordering::Relaxed);
                *self.last_error.lock() = Some(exception.clone());
            }
            Ok(_) => {
                self.failed_executions.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failed_executions.fetch_add(1, Ordering::Relaxed);
                *self.last_error.lock() = Some(format!("{e:#}"));
            }
        }
    }
}

/// Exit code of a finished process. Death by signal is reported as the
/// negated signal number.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

fn capped_utf8(bytes: &[u8]) -> String {
    let end = bytes.len().min(MAX_OUTPUT_BYTES);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Deletes entries directly under `dir` last modified more than `max_age` ago.
/// Returns how many were removed.
pub async fn remove_stale_entries(dir: &Path, max_age: Duration) -> usize {
    let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
        return 0;
    };
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Scratch directory not readable");
            return 0;
        }
    };

    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let is_stale = metadata.modified().is_ok_and(|modified| modified < cutoff);
        if !is_stale {
            continue;
        }
        let path = entry.path();
        let outcome = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match outcome {
            Ok(()) => removed += 1,
            Err(e) => debug!(path = %path.display(), error = %e, "Failed to remove stale scratch entry"),
        }
    }
    removed
}

#[async_trait]
impl Runner for CommandRunner {
    async fn execute(&self, input: &Arc<FuzzInput>) -> anyhow::Result<ExecutionResult> {
        let started = Instant::now();
        let outcome = match self.scratch_dir() {
            Ok(scratch) => self.run_process(input, &scratch).await,
            Err(e) => Err(e),
        };
        self.record(&outcome, started.elapsed());
        outcome
    }

    fn info(&self) -> RunnerInfo {
        RunnerInfo {
            platform: self.settings.platform.clone(),
            name: self.settings.name.clone(),
            supports_coverage: false,
            timeout_seconds: self.settings.timeout.as_secs(),
        }
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        let mut workspace = self.workspace.lock();
        if workspace.is_some() {
            return Ok(());
        }
        let dir = tempfile::Builder::new()
            .prefix("kai_fuzzer_")
            .tempdir()
            .context("Failed to create runner scratch directory")?;

        let sweep_path = dir.path().to_path_buf();
        let cleanup = tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = remove_stale_entries(&sweep_path, STALE_FILE_AGE).await;
                if removed > 0 {
                    debug!(removed, "Removed stale scratch files");
                }
            }
        });

        info!(
            runner = %self.settings.name,
            scratch = %dir.path().display(),
            "Runner initialized"
        );
        *workspace = Some(Workspace { dir, cleanup });
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        let Some(workspace) = self.workspace.lock().take() else {
            return Ok(());
        };
        workspace.cleanup.abort();
        let path = workspace.dir.path().to_path_buf();
        workspace
            .dir
            .close()
            .with_context(|| format!("Failed to remove scratch directory {:?}", path))?;
        info!(runner = %self.settings.name, "Runner shut down");
        Ok(())
    }

    fn stats(&self) -> RunnerStats {
        let total = self.total_executions.load(Ordering::Relaxed);
        let total_duration_ms = self.total_duration_ms.load(Ordering::Relaxed);
        RunnerStats {
            total_executions: total,
            successful_executions: self.successful_executions.load(Ordering::Relaxed),
            failed_executions: self.failed_executions.load(Ordering::Relaxed),
            total_duration_ms,
            average_duration_ms: if total > 0 {
                total_duration_ms as f64 / total as f64
            } else {
                0.0
            },
            last_error: self.last_error.lock().clone(),
        }
    }
}

/// Builds the runner named by `config.id`.
pub fn from_config(config: &RunnerConfig) -> Result<Arc<dyn Runner>, ConfigError> {
    let timeout = Duration::from_millis(config.timeout_ms);
    let mut settings = match config.id.to_lowercase().as_str() {
        "jvm" | "kotlin-jvm" => CommandRunnerSettings::kotlin_jvm(timeout),
        "command" => {
            let command = config.command.clone().ok_or_else(|| {
                ConfigError::Invalid("runner.command is required for the `command` runner".into())
            })?;
            CommandRunnerSettings {
                platform: "command".to_string(),
                name: format!("Command Runner ({})", command.first().map_or("", String::as_str)),
                command,
                timeout,
                source_extension: config.source_extension.clone(),
            }
        }
        _ => return Err(ConfigError::UnknownRunner(config.id.clone())),
    };
    if let Some(command) = &config.command {
        settings.command = command.clone();
    }
    if settings.command.is_empty() {
        return Err(ConfigError::Invalid("runner.command must not be empty".into()));
    }
    settings.source_extension = config.source_extension.clone();
    Ok(Arc::new(CommandRunner::new(settings)))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> CommandRunner {
        CommandRunner::new(CommandRunnerSettings {
            platform: "test".to_string(),
            name: "sh".to_string(),
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                script.to_string(),
                SOURCE_PLACEHOLDER.to_string(),
            ],
            timeout,
            source_extension: "kt".to_string(),
        })
    }

    fn input(source: &str) -> Arc<FuzzInput> {
        Arc::new(FuzzInput::new(source))
    }

    #[tokio::test]
    async fn captures_output_of_a_successful_run() {
        let runner = sh("cat \"$0\"; echo warn >&2", Duration::from_secs(10));
        runner.initialize().await.unwrap();

        let result = runner.execute(&input("fun main() {}")).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "fun main() {}");
        assert_eq!(result.stderr, "warn\n");
        assert!(result.is_successful());

        let stats = runner.stats();
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.successful_executions, 1);
        assert_eq!(stats.failed_executions, 0);
        assert!(stats.last_error.is_none());
        runner.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn reports_non_zero_exit_and_cleans_up_source() {
        let runner = sh(
            "echo 'error: Internal error in backend' >&2; exit 3",
            Duration::from_secs(10),
        );
        runner.initialize().await.unwrap();
        let scratch = runner.scratch_dir().unwrap();

        let result = runner.execute(&input("x")).await.unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(result.is_compiler_crash());
        assert_eq!(runner.stats().failed_executions, 1);

        let leftovers = std::fs::read_dir(&scratch).unwrap().count();
        assert_eq!(leftovers, 0, "source and output dir should be removed");
        runner.shutdown().await.unwrap();
        assert!(!scratch.exists());
    }

    #[tokio::test]
    async fn kills_and_reports_timeouts() {
        let runner = sh("sleep 5", Duration::from_millis(100));
        runner.initialize().await.unwrap();

        let started = Instant::now();
        let result = runner.execute(&input("loop")).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(result.is_timeout());
        assert_eq!(result.duration_ms, 100);
        assert_eq!(result.classify().as_str(), "TIMEOUT");
        runner.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let runner = CommandRunner::new(CommandRunnerSettings {
            command: vec!["/nonexistent/kai-compiler".to_string(), "{}".to_string()],
            ..CommandRunnerSettings::kotlin_jvm(Duration::from_secs(1))
        });
        runner.initialize().await.unwrap();

        let err = runner.execute(&input("x")).await.unwrap_err();
        assert!(format!("{err:#}").contains("Failed to spawn"));
        let stats = runner.stats();
        assert_eq!(stats.failed_executions, 1);
        assert!(stats.last_error.is_some());
        runner.shutdown().await.unwrap();
    }

    #[test]
    fn lost_children_are_failures_with_a_last_error() {
        let runner = sh("true", Duration::from_secs(1));
        let outcome = Ok(ExecutionResult::runner_exception(
            input("x"),
            "Failed to wait for child process: boom",
            4,
        ));
        runner.record(&outcome, Duration::from_millis(4));

        let stats = runner.stats();
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.successful_executions, 0);
        assert_eq!(stats.failed_executions, 1);
        assert_eq!(
            stats.last_error.as_deref(),
            Some("Failed to wait for child process: boom")
        );
    }

    #[tokio::test]
    async fn execute_requires_initialize() {
        let runner = sh("true", Duration::from_secs(1));
        assert!(runner.execute(&input("x")).await.is_err());
        runner.initialize().await.unwrap();
        runner.initialize().await.unwrap();
        assert!(runner.execute(&input("x")).await.is_ok());
        runner.shutdown().await.unwrap();
        runner.shutdown().await.unwrap();
        assert!(runner.execute(&input("x")).await.is_err());
    }

    #[tokio::test]
    async fn signal_deaths_are_negative_exit_codes() {
        let runner = sh("kill -SEGV $$", Duration::from_secs(10));
        runner.initialize().await.unwrap();
        let result = runner.execute(&input("x")).await.unwrap();
        assert_eq!(result.exit_code, -11);
        runner.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn sweeper_removes_only_old_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fresh.kt"), "x").unwrap();
        assert_eq!(
            remove_stale_entries(dir.path(), Duration::from_secs(300)).await,
            0
        );
        assert_eq!(remove_stale_entries(dir.path(), Duration::ZERO).await, 1);
        assert!(!dir.path().join("fresh.kt").exists());
    }

    #[test]
    fn factory_maps_runner_ids() {
        let jvm = from_config(&RunnerConfig::default()).unwrap();
        assert_eq!(jvm.info().platform, "jvm");
        assert_eq!(jvm.info().timeout_seconds, 30);

        let upper = RunnerConfig {
            id: "Kotlin-JVM".to_string(),
            ..RunnerConfig::default()
        };
        assert_eq!(from_config(&upper).unwrap().info().name, "Kotlin JVM Runner");

        let command = RunnerConfig {
            id: "command".to_string(),
            command: Some(vec!["kotlinc-native".to_string(), "{}".to_string()]),
            ..RunnerConfig::default()
        };
        assert_eq!(from_config(&command).unwrap().info().platform, "command");

        let missing_command = RunnerConfig {
            id: "command".to_string(),
            ..RunnerConfig::default()
        };
        assert!(matches!(
            from_config(&missing_command),
            Err(ConfigError::Invalid(_))
        ));

        let unknown = RunnerConfig {
            id: "js".to_string(),
            ..RunnerConfig::default()
        };
        match from_config(&unknown) {
            Err(ConfigError::UnknownRunner(id)) => assert_eq!(id, "js"),
            Err(other) => panic!("expected UnknownRunner, got {other:?}"),
            Ok(_) => panic!("expected UnknownRunner, got a runner"),
        }
    }
}
