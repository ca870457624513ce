pub mod config;
pub mod corpus;
pub mod engine;
pub mod input;
pub mod mutator;
pub mod oracle;
pub mod result;
pub mod runner;
pub mod scheduler;
pub mod shutdown;

pub use config::{ConfigError, KaiConfig};
pub use corpus::{Corpus, CorpusError, CorpusStats, InMemoryCorpus};
pub use engine::{CrashReport, EngineSettings, EngineStats, FuzzingEngine};
pub use input::FuzzInput;
pub use mutator::{LineMutator, Mutator, MutatorInfo};
pub use oracle::{
    CompilerOracle, CompositeOracle, Oracle, OracleStats, Severity, SignalOracle, Verdict,
};
pub use result::{ExecutionResult, ResultClass};
pub use runner::{CommandRunner, Runner, RunnerInfo, RunnerStats};
pub use scheduler::SelectionWeights;
pub use shutdown::{ShutdownTrigger, wait_for_shutdown};
