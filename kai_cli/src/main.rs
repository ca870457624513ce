use kai_core::config::KaiConfig;
use kai_core::corpus::{Corpus, InMemoryCorpus};
use kai_core::engine::{CrashReport, EngineSettings, FuzzingEngine};
use kai_core::mutator::{LineMutator, Mutator};
use kai_core::oracle::{CompilerOracle, CompositeOracle, Oracle, SignalOracle};
use kai_core::runner::{self, Runner};
use kai_core::shutdown::{self, ShutdownTrigger};

use anyhow::Context;
use clap::Parser;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "kai.toml";
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults to ./kai.toml when present.
    #[clap(short, long, env = "KAI_CONFIG", value_parser)]
    config: Option<PathBuf>,
    /// Runner identifier: jvm, kotlin-jvm or command.
    #[clap(short, long, env = "KAI_RUNNER")]
    runner: Option<String>,
    /// Directory the corpus is loaded from and saved to.
    #[clap(long, env = "KAI_CORPUS_PATH")]
    corpus: Option<PathBuf>,
    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[clap(long, env = "KAI_RUN_SECONDS")]
    run_seconds: Option<u64>,
    #[clap(short, long, env = "KAI_WORKERS")]
    workers: Option<usize>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(cli: &Cli) -> anyhow::Result<KaiConfig> {
    let mut config = match &cli.config {
        Some(config_path) => {
            info!(path = %config_path.display(), "Loading configuration");
            KaiConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = Path::new(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                info!(path = %default_config_path.display(), "Loading default configuration file");
                KaiConfig::load_from_file(default_config_path)?
            } else {
                info!("No configuration file found, using built-in defaults");
                KaiConfig::default()
            }
        }
    };

    if let Some(runner_id) = &cli.runner {
        config.runner.id = runner_id.clone();
    }
    if let Some(path) = &cli.corpus {
        config.corpus.path = Some(path.clone());
    }
    if let Some(seconds) = cli.run_seconds {
        config.fuzzer.run_seconds = Some(seconds);
    }
    if let Some(workers) = cli.workers {
        config.fuzzer.workers = workers;
    }

    config.validate()?;
    Ok(config)
}

/// Logs every crash report and tallies them by classification until the
/// engine drops its sender.
async fn collect_crash_reports(
    mut reports: UnboundedReceiver<CrashReport>,
) -> BTreeMap<String, u64> {
    let mut by_classification = BTreeMap::new();
    while let Some(report) = reports.recv().await {
        info!(
            worker_id = report.worker_id,
            input_id = %report.input_id,
            classification = %report.classification,
            severity = ?report.severity,
            "Crash report"
        );
        *by_classification.entry(report.classification).or_insert(0) += 1;
    }
    by_classification
}

async fn report_status(engine: Arc<FuzzingEngine>, corpus: Arc<InMemoryCorpus>) {
    let started = Instant::now();
    let mut interval = tokio::time::interval(STATUS_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let stats = engine.stats();
        let corpus_size = corpus.size().await;
        let elapsed = started.elapsed().as_secs_f64();
        let execs_per_sec = if elapsed > 0.0 {
            stats.executions as f64 / elapsed
        } else {
            0.0
        };
        info!(
            executions = stats.executions,
            corpus = corpus_size,
            interesting = stats.interesting,
            crashes = stats.crashes,
            errors = stats.errors,
            execs_per_sec = %format!("{execs_per_sec:.2}"),
            "Status"
        );
    }
}

/// Runs once, whatever ended the session: stop workers, release the
/// collaborators, then persist the corpus.
async fn shut_down(
    engine: &FuzzingEngine,
    runner: &dyn Runner,
    mutator: &dyn Mutator,
    corpus: &InMemoryCorpus,
    corpus_path: Option<&Path>,
) {
    engine.stop().await;
    if let Err(e) = runner.shutdown().await {
        warn!(error = %format!("{e:#}"), "Runner shutdown failed");
    }
    if let Err(e) = mutator.shutdown().await {
        warn!(error = %format!("{e:#}"), "Mutator shutdown failed");
    }
    let Some(path) = corpus_path else {
        return;
    };
    if let Err(e) = corpus.save(path).await {
        warn!(path = %path.display(), error = %e, "Failed to save corpus");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    info!(?config, "Effective configuration");

    let runner = runner::from_config(&config.runner).context("Failed to create runner")?;
    let mutator: Arc<dyn Mutator> = Arc::new(LineMutator::new());
    mutator
        .initialize()
        .await
        .context("Failed to initialize mutator")?;
    runner
        .initialize()
        .await
        .context("Failed to initialize runner")?;
    info!(runner = ?runner.info(), mutator = ?mutator.info(), "Collaborators ready");

    let corpus = Arc::new(
        InMemoryCorpus::new()
            .with_weights(config.fuzzer.selection_weights())
            .with_source_extension(config.corpus.source_extension.clone()),
    );
    let corpus_path = config.corpus.path.as_deref();
    if let Some(path) = corpus_path {
        corpus.load(path).await;
    }

    let oracle: Arc<dyn Oracle> = Arc::new(CompositeOracle::new(vec![
        Arc::new(CompilerOracle::new()),
        Arc::new(SignalOracle::new()),
    ]));

    let (crash_tx, crash_rx) = tokio::sync::mpsc::unbounded_channel();
    let crash_log = tokio::spawn(collect_crash_reports(crash_rx));
    let engine = Arc::new(FuzzingEngine::with_crash_reports(
        corpus.clone(),
        mutator.clone(),
        runner.clone(),
        oracle.clone(),
        EngineSettings {
            workers: config.fuzzer.workers,
            max_corpus_size: config.fuzzer.max_corpus_size,
        },
        crash_tx,
    ));

    if let Err(e) = engine.start().await {
        shut_down(&engine, runner.as_ref(), mutator.as_ref(), &corpus, None).await;
        return Err(e.context("Failed to start fuzzing engine"));
    }
    let corpus_size = corpus.size().await;
    info!(
        corpus = corpus_size,
        run_seconds = ?config.fuzzer.run_seconds,
        "Fuzzing; press Ctrl-C to stop"
    );

    let status = tokio::spawn(report_status(engine.clone(), corpus.clone()));
    let run_for = config.fuzzer.run_seconds.map(Duration::from_secs);
    let started = Instant::now();
    let trigger = shutdown::wait_for_shutdown(shutdown::ctrl_c(), run_for).await;
    if trigger == ShutdownTrigger::Deadline {
        info!("Run duration elapsed");
    }

    status.abort();
    let _ = status.await;
    shut_down(
        &engine,
        runner.as_ref(),
        mutator.as_ref(),
        &corpus,
        corpus_path,
    )
    .await;

    let engine_stats = engine.stats();
    drop(engine);
    let crashes_by_classification = crash_log.await.unwrap_or_default();

    info!(
        elapsed = ?started.elapsed(),
        iterations = engine_stats.iterations,
        executions = engine_stats.executions,
        interesting = engine_stats.interesting,
        crashes = engine_stats.crashes,
        errors = engine_stats.errors,
        "Fuzzing finished"
    );
    let corpus_stats = corpus.stats().await;
    info!(corpus = ?corpus_stats, "Corpus summary");
    info!(oracle = ?oracle.stats(), runner = ?runner.stats(), "Analysis summary");
    for (classification, count) in crashes_by_classification {
        info!(%classification, count, "Crashes by classification");
    }
    Ok(())
}
