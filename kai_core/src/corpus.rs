use crate::input::{FuzzInput, content_hash};
use crate::result::{ExecutionResult, ResultClass};
use crate::scheduler::SelectionWeights;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default file extension for persisted sources.
pub const DEFAULT_SOURCE_EXTENSION: &str = "kt";

const INPUTS_DIR: &str = "inputs";
const CRASHES_DIR: &str = "crashes";
const HASHES_FILE: &str = "hashes.json";
const RESULTS_FILE: &str = "results.json";
const STAGING_PREFIX: &str = ".saving_";

/// Defines errors that can arise while persisting a corpus.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// An I/O error occurred while reading or writing the corpus directory.
    #[error("Corpus I/O error: {0}")]
    Io(String),

    /// A persisted document could not be encoded.
    #[error("Corpus serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CorpusError {
    fn from(err: serde_json::Error) -> Self {
        CorpusError::Serialization(format!("JSON operation error: {}", err))
    }
}

/// Read-only snapshot of the corpus composition.
#[derive(Serialize, Debug, Clone, PartialEq, Default)]
pub struct CorpusStats {
    pub total_inputs: usize,
    pub unique_crashes: usize,
    pub average_generation: f64,
    /// Reserved for coverage-guided runners; always `0.0` for now.
    pub coverage_growth: f64,
    pub classifications: BTreeMap<String, usize>,
    pub oldest_timestamp: Option<DateTime<Utc>>,
    pub newest_timestamp: Option<DateTime<Utc>>,
}

/// Contents of `meta.json` inside a crash folder.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CrashMetadata {
    pub classification: String,
    pub exit_code: i32,
    pub timestamp: DateTime<Utc>,
}

/// The shared store of interesting inputs and their results.
///
/// A `Corpus` is the single source of truth for retained inputs. Every
/// operation must be safe under arbitrary concurrent callers and must observe
/// and leave a consistent state: an input is retained if and only if its
/// result and its content hash are recorded as well.
#[async_trait]
pub trait Corpus: Send + Sync {
    /// Adds `input` with the `result` it produced.
    ///
    /// Returns `false`, without changing anything, if an input with the same
    /// source is already known. This is the only way the corpus grows.
    async fn add(&self, input: Arc<FuzzInput>, result: Arc<ExecutionResult>) -> bool;

    /// Picks a parent for the next mutation.
    ///
    /// Returns `None` if and only if the corpus is empty; otherwise the
    /// returned input is currently retained.
    async fn select_for_mutation(&self) -> Option<Arc<FuzzInput>>;

    /// Number of retained inputs.
    async fn size(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.size().await == 0
    }

    async fn stats(&self) -> CorpusStats;

    /// Persists the corpus under `path`, extracting crash artifacts.
    ///
    /// Failing to write a single crash folder is logged and does not abort
    /// the save; failing to write the inputs or index documents does.
    async fn save(&self, path: &Path) -> Result<(), CorpusError>;

    /// Re-adds every source found under `path` and returns how many were added.
    ///
    /// Loading is best effort: missing or malformed files are logged and
    /// skipped, so a corrupt directory yields a partial (or empty) corpus
    /// rather than an error.
    async fn load(&self, path: &Path) -> usize;

    /// Drops the oldest inputs (by creation time) until at most `max_size`
    /// remain, along with their results and hashes. Returns how many were removed.
    ///
    /// Survivors keep their insertion order. Pruning never re-sorts the corpus
    /// by creation time, so the age term of selection still ranks inputs by
    /// when they were added.
    async fn prune(&self, max_size: usize) -> usize;

    /// All retained inputs whose recorded result classifies as `classification`.
    async fn find_by_classification(&self, classification: &str) -> Vec<Arc<FuzzInput>>;
}

/// Everything guarded by the corpus lock. The three collections only ever
/// change together.
#[derive(Debug)]
struct CorpusState {
    /// Insertion order doubles as evolutionary age order.
    inputs: Vec<Arc<FuzzInput>>,
    results: HashMap<String, Arc<ExecutionResult>>,
    hashes: HashSet<String>,
    rng: ChaCha8Rng,
}

impl CorpusState {
    fn insert(&mut self, input: Arc<FuzzInput>, result: Arc<ExecutionResult>) -> bool {
        let hash = input.content_hash();
        if !self.hashes.insert(hash) {
            return false;
        }
        self.results.insert(input.id().to_string(), result);
        self.inputs.push(input);
        true
    }
}

/// Point-in-time copy of the corpus taken under the lock, written to disk
/// after the lock is released.
struct CorpusSnapshot {
    inputs: Vec<Arc<FuzzInput>>,
    results: HashMap<String, Arc<ExecutionResult>>,
    hashes: BTreeSet<String>,
}

/// An in-memory corpus with optional on-disk persistence.
///
/// All state lives behind one async mutex, held only for the body of a
/// single call, so workers never wait on each other's compile or run time.
#[derive(Debug)]
pub struct InMemoryCorpus {
    state: Mutex<CorpusState>,
    weights: SelectionWeights,
    source_extension: String,
}

impl InMemoryCorpus {
    /// Creates a new, empty corpus with a randomly seeded selection RNG.
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    /// Creates a new, empty corpus whose selection sequence is reproducible.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Mutex::new(CorpusState {
                inputs: Vec::new(),
                results: HashMap::new(),
                hashes: HashSet::new(),
                rng: ChaCha8Rng::seed_from_u64(seed),
            }),
            weights: SelectionWeights::default(),
            source_extension: DEFAULT_SOURCE_EXTENSION.to_string(),
        }
    }

    pub fn with_weights(mut self, weights: SelectionWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_source_extension(mut self, extension: impl Into<String>) -> Self {
        self.source_extension = extension.into();
        self
    }

    /// Whether an input with exactly this source is currently known.
    pub async fn contains_source(&self, source: &str) -> bool {
        self.state.lock().await.hashes.contains(&content_hash(source))
    }

    async fn snapshot(&self) -> CorpusSnapshot {
        let state = self.state.lock().await;
        CorpusSnapshot {
            inputs: state.inputs.clone(),
            results: state.results.clone(),
            hashes: state.hashes.iter().cloned().collect(),
        }
    }

    fn source_file_name(&self, stem: &str) -> String {
        format!("{}.{}", stem, self.source_extension)
    }

    async fn write_crash_artifact(
        &self,
        dir: &Path,
        input: &FuzzInput,
        result: &ExecutionResult,
    ) -> Result<(), CorpusError> {
        fs::create_dir_all(dir).await?;
        fs::write(dir.join(self.source_file_name("input")), input.source_code()).await?;
        fs::write(
            dir.join("result.json"),
            serde_json::to_string_pretty(result)?,
        )
        .await?;
        let metadata = CrashMetadata {
            classification: result.classify().to_string(),
            exit_code: result.exit_code,
            timestamp: result.timestamp,
        };
        fs::write(
            dir.join("meta.json"),
            serde_json::to_string_pretty(&metadata)?,
        )
        .await?;
        Ok(())
    }

    /// Writes the complete on-disk layout under `staging` and returns how many
    /// crash folders were written.
    async fn write_staged(
        &self,
        staging: &Path,
        snapshot: &CorpusSnapshot,
    ) -> Result<usize, CorpusError> {
        let inputs_dir = staging.join(INPUTS_DIR);
        fs::create_dir_all(&inputs_dir).await.map_err(|e| {
            CorpusError::Io(format!(
                "Failed to create corpus directory at {:?}: {}",
                inputs_dir, e
            ))
        })?;
        for (index, input) in snapshot.inputs.iter().enumerate() {
            let file_path = inputs_dir.join(self.source_file_name(&format!("input_{index}")));
            fs::write(&file_path, input.source_code())
                .await
                .map_err(|e| {
                    CorpusError::Io(format!("Failed to write input file {:?}: {}", file_path, e))
                })?;
        }

        fs::write(
            staging.join(HASHES_FILE),
            serde_json::to_string_pretty(&snapshot.hashes)?,
        )
        .await?;
        let ordered_results: BTreeMap<&String, &Arc<ExecutionResult>> =
            snapshot.results.iter().collect();
        fs::write(
            staging.join(RESULTS_FILE),
            serde_json::to_string_pretty(&ordered_results)?,
        )
        .await?;

        let crashes_dir = staging.join(CRASHES_DIR);
        fs::create_dir_all(&crashes_dir).await?;
        Ok(self.write_crash_artifacts(&crashes_dir, snapshot).await)
    }

    /// One `crash_<k>` folder per crash artifact, numbered in insertion order.
    /// A folder that cannot be written is logged and skipped, keeping its
    /// number. Returns how many folders were written.
    async fn write_crash_artifacts(
        &self,
        crashes_dir: &Path,
        snapshot: &CorpusSnapshot,
    ) -> usize {
        let crash_results = snapshot.inputs.iter().filter_map(|input| {
            snapshot
                .results
                .get(input.id())
                .filter(|result| result.is_crash_artifact())
                .map(|result| (input, result))
        });
        let mut written = 0;
        for (index, (input, result)) in crash_results.enumerate() {
            let dir = crashes_dir.join(format!("crash_{index}"));
            match self.write_crash_artifact(&dir, input, result).await {
                Ok(()) => written += 1,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Failed to write crash artifact");
                }
            }
        }
        written
    }

    /// Source files with our extension directly inside `dir`, ordered by the
    /// numeric suffix of `input_<n>` names and then by name.
    async fn list_sources(&self, dir: &Path) -> Vec<PathBuf> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "No source directory to load");
                return Vec::new();
            }
        };
        let mut paths = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    let matches_extension = path
                        .extension()
                        .is_some_and(|ext| ext == self.source_extension.as_str());
                    let is_file = entry
                        .file_type()
                        .await
                        .is_ok_and(|file_type| file_type.is_file());
                    if matches_extension && is_file {
                        paths.push(path);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Error reading corpus directory entry");
                    break;
                }
            }
        }
        paths.sort_by_cached_key(|path| {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let index = stem
                .strip_prefix("input_")
                .and_then(|n| n.parse::<usize>().ok());
            (index.is_none(), index, stem)
        });
        paths
    }
}

impl Default for InMemoryCorpus {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads and parses a JSON document, logging and discarding anything that
/// is missing or malformed.
async fn read_json_best_effort<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) => {
            debug!(file = %path.display(), error = %e, "Persisted corpus document not readable");
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(file = %path.display(), error = %e, "Ignoring malformed corpus document");
            None
        }
    }
}

/// Replaces the live `inputs/`, `crashes/` and index documents under `path`
/// with the staged ones. The replaced directories are moved into `staging`.
async fn publish_staged(path: &Path, staging: &Path) -> std::io::Result<()> {
    for name in [INPUTS_DIR, CRASHES_DIR] {
        let live = path.join(name);
        if fs::try_exists(&live).await? {
            fs::rename(&live, staging.join(format!("{name}.previous"))).await?;
        }
        fs::rename(staging.join(name), &live).await?;
    }
    for name in [HASHES_FILE, RESULTS_FILE] {
        fs::rename(staging.join(name), path.join(name)).await?;
    }
    Ok(())
}

async fn discard_staging(staging: &Path) {
    if let Err(e) = fs::remove_dir_all(staging).await {
        debug!(dir = %staging.display(), error = %e, "Failed to remove corpus staging directory");
    }
}

#[async_trait]
impl Corpus for InMemoryCorpus {
    async fn add(&self, input: Arc<FuzzInput>, result: Arc<ExecutionResult>) -> bool {
        self.state.lock().await.insert(input, result)
    }

    async fn select_for_mutation(&self) -> Option<Arc<FuzzInput>> {
        let mut state = self.state.lock().await;
        let CorpusState { inputs, rng, .. } = &mut *state;
        let index = self.weights.select(inputs.as_slice(), rng)?;
        Some(Arc::clone(&inputs[index]))
    }

    async fn size(&self) -> usize {
        self.state.lock().await.inputs.len()
    }

    async fn stats(&self) -> CorpusStats {
        let state = self.state.lock().await;
        if state.inputs.is_empty() {
            return CorpusStats::default();
        }

        let mut classifications: BTreeMap<String, usize> = BTreeMap::new();
        for result in state.results.values() {
            *classifications
                .entry(result.classify().to_string())
                .or_insert(0) += 1;
        }
        let unique_crashes = classifications
            .get(ResultClass::CompilerCrash.as_str())
            .copied()
            .unwrap_or(0);
        let generation_sum: f64 = state
            .inputs
            .iter()
            .map(|input| f64::from(input.generation()))
            .sum();

        CorpusStats {
            total_inputs: state.inputs.len(),
            unique_crashes,
            average_generation: generation_sum / state.inputs.len() as f64,
            coverage_growth: 0.0,
            classifications,
            oldest_timestamp: state.inputs.iter().map(|i| i.created_at()).min(),
            newest_timestamp: state.inputs.iter().map(|i| i.created_at()).max(),
        }
    }

    async fn save(&self, path: &Path) -> Result<(), CorpusError> {
        let snapshot = self.snapshot().await;

        fs::create_dir_all(path).await.map_err(|e| {
            CorpusError::Io(format!("Failed to create corpus directory at {:?}: {}", path, e))
        })?;
        // Built aside and swapped in whole; a failed save keeps the previous one.
        let staging = path.join(format!("{STAGING_PREFIX}{}", uuid::Uuid::new_v4().simple()));
        let crashes = match self.write_staged(&staging, &snapshot).await {
            Ok(crashes) => crashes,
            Err(e) => {
                discard_staging(&staging).await;
                return Err(e);
            }
        };
        publish_staged(path, &staging).await.map_err(|e| {
            CorpusError::Io(format!(
                "Failed to move saved corpus into place from {:?}: {}",
                staging, e
            ))
        })?;
        discard_staging(&staging).await;

        info!(
            path = %path.display(),
            inputs = snapshot.inputs.len(),
            crashes,
            "Corpus saved"
        );
        Ok(())
    }

    async fn load(&self, path: &Path) -> usize {
        let is_dir = fs::metadata(path).await.is_ok_and(|metadata| metadata.is_dir());
        if !is_dir {
            debug!(path = %path.display(), "No corpus directory, nothing to load");
            return 0;
        }

        let mut source_paths = self.list_sources(&path.join(INPUTS_DIR)).await;
        source_paths.extend(self.list_sources(path).await);

        let mut sources = Vec::with_capacity(source_paths.len());
        for file_path in source_paths {
            match fs::read_to_string(&file_path).await {
                Ok(source) => sources.push(source),
                Err(e) => {
                    warn!(file = %file_path.display(), error = %e, "Skipping unreadable corpus input");
                }
            }
        }

        let saved_hashes: Vec<String> = read_json_best_effort(&path.join(HASHES_FILE))
            .await
            .unwrap_or_default();
        let saved_results: HashMap<String, ExecutionResult> =
            read_json_best_effort(&path.join(RESULTS_FILE))
                .await
                .unwrap_or_default();
        // Ids change on reload, so saved results are matched back by content.
        let results_by_hash: HashMap<String, ExecutionResult> = saved_results
            .into_values()
            .map(|result| (result.input.content_hash(), result))
            .collect();

        let mut state = self.state.lock().await;
        let mut added = 0;
        for source in sources {
            let hash = content_hash(&source);
            let input = Arc::new(FuzzInput::new(source));
            let result = match results_by_hash.get(&hash) {
                Some(saved) => ExecutionResult {
                    input: Arc::clone(&input),
                    ..saved.clone()
                },
                None => ExecutionResult::placeholder(Arc::clone(&input)),
            };
            if state.insert(input, Arc::new(result)) {
                added += 1;
            }
        }
        // Hashes are only ever recorded alongside a retained input.
        let orphaned = saved_hashes
            .iter()
            .filter(|hash| !state.hashes.contains(*hash))
            .count();
        if orphaned > 0 {
            warn!(orphaned, "Ignoring saved hashes whose source file is missing");
        }

        info!(path = %path.display(), loaded = added, total = state.inputs.len(), "Corpus loaded");
        added
    }

    async fn prune(&self, max_size: usize) -> usize {
        let mut state = self.state.lock().await;
        if state.inputs.len() <= max_size {
            return 0;
        }
        let excess = state.inputs.len() - max_size;
        let mut by_age: Vec<&Arc<FuzzInput>> = state.inputs.iter().collect();
        by_age.sort_by_key(|input| input.created_at());
        let doomed: HashSet<String> = by_age[..excess]
            .iter()
            .map(|input| input.id().to_string())
            .collect();

        // Survivors keep their relative order, which selection reads as age.
        let CorpusState {
            inputs,
            results,
            hashes,
            ..
        } = &mut *state;
        inputs.retain(|input| {
            if !doomed.contains(input.id()) {
                return true;
            }
            results.remove(input.id());
            hashes.remove(&input.content_hash());
            false
        });
        debug!(removed = excess, retained = state.inputs.len(), "Corpus pruned");
        excess
    }

    async fn find_by_classification(&self, classification: &str) -> Vec<Arc<FuzzInput>> {
        let state = self.state.lock().await;
        state
            .inputs
            .iter()
            .filter(|input| {
                state
                    .results
                    .get(input.id())
                    .is_some_and(|result| result.classify().as_str() == classification)
            })
            .cloned()
            .collect()
    }
}
