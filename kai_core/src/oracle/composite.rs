use super::{NORMAL_CLASSIFICATION, Oracle, OracleStats, Verdict};
use crate::result::ExecutionResult;
use std::sync::Arc;

const CLASSIFICATION_SEPARATOR: &str = " | ";

/// Fans one result out to an ordered list of oracles and merges their verdicts.
///
/// The merged verdict is the most severe sub-verdict, where a tie goes to the
/// oracle listed first, so list order expresses priority. Its classification
/// is replaced by every non-`NORMAL` sub-classification, joined in list order.
#[derive(Default)]
pub struct CompositeOracle {
    oracles: Vec<Arc<dyn Oracle>>,
}

impl CompositeOracle {
    pub fn new(oracles: Vec<Arc<dyn Oracle>>) -> Self {
        Self { oracles }
    }

    fn join_classifications<I>(labels: I) -> String
    where
        I: IntoIterator<Item = String>,
    {
        let joined = labels
            .into_iter()
            .filter(|label| label != NORMAL_CLASSIFICATION)
            .collect::<Vec<_>>()
            .join(CLASSIFICATION_SEPARATOR);
        if joined.is_empty() {
            NORMAL_CLASSIFICATION.to_string()
        } else {
            joined
        }
    }
}

impl Oracle for CompositeOracle {
    fn name(&self) -> &'static str {
        "CompositeOracle"
    }

    fn analyze(&self, result: &ExecutionResult) -> Verdict {
        let verdicts: Vec<Verdict> = self
            .oracles
            .iter()
            .map(|oracle| oracle.analyze(result))
            .collect();

        // `Iterator::max_by_key` keeps the last maximum; the first one must win.
        let mut most_severe: Option<&Verdict> = None;
        for verdict in &verdicts {
            if most_severe.is_none_or(|best| verdict.severity > best.severity) {
                most_severe = Some(verdict);
            }
        }
        let Some(most_severe) = most_severe else {
            return Verdict::normal();
        };

        let mut merged = most_severe.clone();
        merged.classification =
            Self::join_classifications(verdicts.iter().map(|v| v.classification.clone()));
        merged
            .details
            .insert("oracle_count".to_string(), verdicts.len().into());
        merged
    }

    fn is_crash(&self, result: &ExecutionResult) -> bool {
        self.oracles.iter().any(|oracle| oracle.is_crash(result))
    }

    fn classify(&self, result: &ExecutionResult) -> String {
        Self::join_classifications(self.oracles.iter().map(|oracle| oracle.classify(result)))
    }

    /// Sums the counters of every sub-oracle. The average analysis time is the
    /// plain mean of the sub-oracles' own averages, not weighted by how many
    /// analyses each of them ran.
    fn stats(&self) -> OracleStats {
        let all: Vec<OracleStats> = self.oracles.iter().map(|oracle| oracle.stats()).collect();
        let mut merged = OracleStats::default();
        for stats in &all {
            merged.total_analyses += stats.total_analyses;
            merged.unique_crashes += stats.unique_crashes;
            merged.unique_warnings += stats.unique_warnings;
            for (label, count) in &stats.classifications {
                *merged.classifications.entry(label.clone()).or_insert(0) += count;
            }
        }
        if !all.is_empty() {
            merged.avg_analysis_time_ms =
                all.iter().map(|s| s.avg_analysis_time_ms).sum::<f64>() / all.len() as f64;
        }
        merged
    }

    fn reset(&self) {
        for oracle in &self.oracles {
            oracle.reset();
        }
    }
}
