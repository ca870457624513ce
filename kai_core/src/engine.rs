use crate::corpus::Corpus;
use crate::input::FuzzInput;
use crate::mutator::Mutator;
use crate::oracle::{Oracle, Severity};
use crate::runner::Runner;
use anyhow::Context;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Program used to bootstrap an empty corpus.
pub const SEED_PROGRAM: &str = "fun main() { println(\"Hello Kai\") }";

/// Pause after a failed iteration so a persistent fault does not spin.
const ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub workers: usize,
    pub max_corpus_size: Option<usize>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct EngineStats {
    /// Iterations that got as far as mutating a parent.
    pub iterations: u64,
    pub executions: u64,
    /// Executions whose input was added to the corpus.
    pub interesting: u64,
    pub crashes: u64,
    /// Iterations that failed with an error or a panic.
    pub errors: u64,
}

/// A crash found by a worker, as forwarded to the crash channel.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CrashReport {
    pub worker_id: usize,
    pub classification: String,
    pub severity: Severity,
    pub input_id: String,
}

#[derive(Debug, Default)]
struct Counters {
    iterations: AtomicU64,
    executions: AtomicU64,
    interesting: AtomicU64,
    crashes: AtomicU64,
    errors: AtomicU64,
}

enum Step {
    /// Nothing to work on this time around.
    Idle,
    Done,
}

/// State shared by the engine handle and every worker task.
struct Shared {
    corpus: Arc<dyn Corpus>,
    mutator: Arc<dyn Mutator>,
    runner: Arc<dyn Runner>,
    oracle: Arc<dyn Oracle>,
    settings: EngineSettings,
    running: AtomicBool,
    counters: Counters,
    crash_reports: Option<UnboundedSender<CrashReport>>,
}

impl Shared {
    async fn seed_if_empty(&self) -> anyhow::Result<()> {
        if !self.corpus.is_empty().await {
            return Ok(());
        }
        let seed = Arc::new(FuzzInput::new(SEED_PROGRAM).with_tags(["seed"]));
        let result = self
            .runner
            .execute(&seed)
            .await
            .context("Failed to execute the seed program")?;
        self.counters.executions.fetch_add(1, Ordering::Relaxed);
        let added = self.corpus.add(seed, Arc::new(result)).await;
        info!(added, "Seeded empty corpus");
        Ok(())
    }

    async fn iteration(&self, worker_id: usize) -> anyhow::Result<Step> {
        let Some(parent) = self.corpus.select_for_mutation().await else {
            return Ok(Step::Idle);
        };
        if !self.mutator.can_mutate(&parent) {
            return Ok(Step::Idle);
        }
        self.counters.iterations.fetch_add(1, Ordering::Relaxed);

        let child = Arc::new(
            self.mutator
                .mutate(&parent)
                .await
                .with_context(|| format!("Mutation of {} failed", parent.id()))?,
        );
        let result = Arc::new(
            self.runner
                .execute(&child)
                .await
                .with_context(|| format!("Execution of {} failed", child.id()))?,
        );
        self.counters.executions.fetch_add(1, Ordering::Relaxed);

        let verdict = self.oracle.analyze(&result);
        debug!(
            worker_id,
            input_id = child.id(),
            classification = %verdict.classification,
            interesting = verdict.is_interesting,
            "Iteration finished"
        );

        if verdict.is_interesting && self.corpus.add(Arc::clone(&child), result).await {
            self.counters.interesting.fetch_add(1, Ordering::Relaxed);
            if let Some(max) = self.settings.max_corpus_size {
                self.corpus.prune(max).await;
            }
        }

        if verdict.is_crash {
            self.counters.crashes.fetch_add(1, Ordering::Relaxed);
            warn!(
                worker_id,
                input_id = child.id(),
                classification = %verdict.classification,
                severity = ?verdict.severity,
                "Crash found"
            );
            if let Some(reports) = &self.crash_reports {
                let report = CrashReport {
                    worker_id,
                    classification: verdict.classification,
                    severity: verdict.severity,
                    input_id: child.id().to_string(),
                };
                if reports.send(report).is_err() {
                    debug!("Crash report receiver dropped");
                }
            }
        }
        Ok(Step::Done)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}

async fn run_worker(shared: Arc<Shared>, worker_id: usize) {
    debug!(worker_id, "Worker started");
    while shared.running.load(Ordering::Acquire) {
        match AssertUnwindSafe(shared.iteration(worker_id))
            .catch_unwind()
            .await
        {
            Ok(Ok(Step::Done)) => {}
            Ok(Ok(Step::Idle)) => tokio::task::yield_now().await,
            Ok(Err(e)) => {
                shared.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(worker_id, error = %format!("{e:#}"), "Iteration failed");
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
            Err(payload) => {
                shared.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(worker_id, panic = %panic_message(payload.as_ref()), "Iteration panicked");
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }
    }
    debug!(worker_id, "Worker stopped");
}

/// Drives the mutate → execute → analyze loop on a pool of worker tasks.
///
/// The engine is either stopped or running. `start` and both stop methods
/// are idempotent, and a stopped engine can be started again.
pub struct FuzzingEngine {
    shared: Arc<Shared>,
    workers: Mutex<Option<JoinSet<()>>>,
}

impl FuzzingEngine {
    pub fn new(
        corpus: Arc<dyn Corpus>,
        mutator: Arc<dyn Mutator>,
        runner: Arc<dyn Runner>,
        oracle: Arc<dyn Oracle>,
        settings: EngineSettings,
    ) -> Self {
        Self::build(corpus, mutator, runner, oracle, settings, None)
    }

    /// Like [`FuzzingEngine::new`], additionally forwarding every crash to
    /// `crash_reports`.
    pub fn with_crash_reports(
        corpus: Arc<dyn Corpus>,
        mutator: Arc<dyn Mutator>,
        runner: Arc<dyn Runner>,
        oracle: Arc<dyn Oracle>,
        settings: EngineSettings,
        crash_reports: UnboundedSender<CrashReport>,
    ) -> Self {
        Self::build(corpus, mutator, runner, oracle, settings, Some(crash_reports))
    }

    fn build(
        corpus: Arc<dyn Corpus>,
        mutator: Arc<dyn Mutator>,
        runner: Arc<dyn Runner>,
        oracle: Arc<dyn Oracle>,
        settings: EngineSettings,
        crash_reports: Option<UnboundedSender<CrashReport>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                corpus,
                mutator,
                runner,
                oracle,
                settings,
                running: AtomicBool::new(false),
                counters: Counters::default(),
                crash_reports,
            }),
            workers: Mutex::new(None),
        }
    }

    /// Seeds an empty corpus and spawns the workers. Does nothing if the
    /// engine is already running.
    ///
    /// Fails, leaving the engine stopped, if the seed program cannot be
    /// executed.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Engine already running");
            return Ok(());
        }

        if let Err(e) = self.shared.seed_if_empty().await {
            self.shared.running.store(false, Ordering::Release);
            return Err(e);
        }

        let mut workers = JoinSet::new();
        for worker_id in 0..self.shared.settings.workers {
            workers.spawn(run_worker(Arc::clone(&self.shared), worker_id));
        }
        *self.workers.lock() = Some(workers);
        info!(workers = self.shared.settings.workers, "Fuzzing engine started");
        Ok(())
    }

    /// Stops the workers without waiting for them to finish.
    pub fn stop_now(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(mut workers) = self.workers.lock().take() {
            workers.abort_all();
            info!("Fuzzing engine stopping");
        }
    }

    /// Stops the workers and waits until every one of them has terminated.
    pub async fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        let workers = self.workers.lock().take();
        if let Some(mut workers) = workers {
            workers.shutdown().await;
            info!("Fuzzing engine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> EngineStats {
        let counters = &self.shared.counters;
        EngineStats {
            iterations: counters.iterations.load(Ordering::Relaxed),
            executions: counters.executions.load(Ordering::Relaxed),
            interesting: counters.interesting.load(Ordering::Relaxed),
            crashes: counters.crashes.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for FuzzingEngine {
    fn drop(&mut self) {
        self.stop_now();
    }
}
