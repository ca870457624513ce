use crate::corpus::DEFAULT_SOURCE_EXTENSION;
use crate::scheduler::{DEFAULT_AGE_WEIGHT, DEFAULT_GENERATION_WEIGHT, SelectionWeights};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Failed to parse TOML from config file {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Unknown runner: {0}. Supported: jvm, kotlin-jvm, command")]
    UnknownRunner(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Stop on our own after this many seconds; run until interrupted if unset.
    #[serde(default)]
    pub run_seconds: Option<u64>,
    /// Prune the corpus back to this size after every addition.
    #[serde(default)]
    pub max_corpus_size: Option<usize>,
    #[serde(default = "default_age_weight")]
    pub age_weight: f64,
    #[serde(default = "default_generation_weight")]
    pub generation_weight: f64,
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_age_weight() -> f64 {
    DEFAULT_AGE_WEIGHT
}

fn default_generation_weight() -> f64 {
    DEFAULT_GENERATION_WEIGHT
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            run_seconds: None,
            max_corpus_size: None,
            age_weight: default_age_weight(),
            generation_weight: default_generation_weight(),
        }
    }
}

impl FuzzerSettings {
    pub fn selection_weights(&self) -> SelectionWeights {
        SelectionWeights {
            age_weight: self.age_weight,
            generation_weight: self.generation_weight,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    #[serde(default = "default_runner_id")]
    pub id: String,
    /// Argument vector; `{}` is replaced by the source file path and `{out}`
    /// by a scratch output directory. Overrides the preset of `jvm` runners.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_source_extension")]
    pub source_extension: String,
}

fn default_runner_id() -> String {
    "jvm".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_source_extension() -> String {
    DEFAULT_SOURCE_EXTENSION.to_string()
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            id: default_runner_id(),
            command: None,
            timeout_ms: default_timeout_ms(),
            source_extension: default_source_extension(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusConfig {
    /// Persistence directory. Without one the corpus lives only in memory.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_source_extension")]
    pub source_extension: String,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            path: None,
            source_extension: default_source_extension(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct KaiConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
}

impl KaiConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::Parse { reason, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            reason: e.to_string(),
        })
    }

    /// Checks cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fuzzer.workers == 0 {
            return Err(ConfigError::Invalid(
                "fuzzer.workers must be at least 1".to_string(),
            ));
        }
        if self.fuzzer.max_corpus_size == Some(0) {
            return Err(ConfigError::Invalid(
                "fuzzer.max-corpus-size must be at least 1".to_string(),
            ));
        }
        self.fuzzer
            .selection_weights()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.runner.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "runner.timeout-ms must be positive".to_string(),
            ));
        }
        if let Some(command) = &self.runner.command {
            if command.first().is_none_or(|program| program.trim().is_empty()) {
                return Err(ConfigError::Invalid(
                    "runner.command must name a program".to_string(),
                ));
            }
        } else if self.runner.id.eq_ignore_ascii_case("command") {
            return Err(ConfigError::Invalid(
                "runner.command is required for the `command` runner".to_string(),
            ));
        }
        for (field, extension) in [
            ("runner.source-extension", &self.runner.source_extension),
            ("corpus.source-extension", &self.corpus.source_extension),
        ] {
            if extension.is_empty() || extension.contains(['.', '/', '\\']) {
                return Err(ConfigError::Invalid(format!(
                    "{field} must be a bare extension, got {extension:?}"
                )));
            }
        }
        Ok(())
    }
}
