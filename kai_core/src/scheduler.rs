use crate::input::FuzzInput;
use rand::Rng;
use thiserror::Error;

pub const DEFAULT_AGE_WEIGHT: f64 = 0.7;
pub const DEFAULT_GENERATION_WEIGHT: f64 = 0.3;

#[derive(Error, Debug, PartialEq)]
pub enum SchedulerError {
    #[error("Selection weight `{name}` must be finite and non-negative, got {value}")]
    InvalidWeight { name: &'static str, value: f64 },
}

/// Tuning constants for evolutionary parent selection.
///
/// The weight of the input at position `i` of an `n`-element corpus is
/// `age_weight * (n - i) / n + generation_weight / (generation + 1)`: recently
/// added inputs and inputs close to a seed are preferred.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectionWeights {
    pub age_weight: f64,
    pub generation_weight: f64,
}

impl Default for SelectionWeights {
    fn default() -> Self {
        Self {
            age_weight: DEFAULT_AGE_WEIGHT,
            generation_weight: DEFAULT_GENERATION_WEIGHT,
        }
    }
}

impl SelectionWeights {
    pub fn new(age_weight: f64, generation_weight: f64) -> Result<Self, SchedulerError> {
        let weights = Self {
            age_weight,
            generation_weight,
        };
        weights.validate()?;
        Ok(weights)
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        for (name, value) in [
            ("age-weight", self.age_weight),
            ("generation-weight", self.generation_weight),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(SchedulerError::InvalidWeight { name, value });
            }
        }
        Ok(())
    }

    /// Weight of the input at `position` in a corpus of `len` inputs.
    pub fn weight(&self, position: usize, len: usize, generation: u32) -> f64 {
        let age = (len - position) as f64 / len as f64;
        let freshness = 1.0 / (f64::from(generation) + 1.0);
        self.age_weight * age + self.generation_weight * freshness
    }

    /// Roulette-wheel selection over `inputs`, returning the chosen index.
    ///
    /// Returns `None` only for an empty slice. A zero or non-finite total
    /// weight draws `0`, which picks the first input; if floating-point
    /// accumulation falls short of the draw the last input is returned.
    pub fn select<T, R>(&self, inputs: &[T], rng: &mut R) -> Option<usize>
    where
        T: AsRef<FuzzInput>,
        R: Rng + ?Sized,
    {
        if inputs.is_empty() {
            return None;
        }
        let len = inputs.len();
        let weights: Vec<f64> = inputs
            .iter()
            .enumerate()
            .map(|(position, input)| self.weight(position, len, input.as_ref().generation()))
            .collect();

        let total: f64 = weights.iter().sum();
        let draw = if total.is_finite() && total > 0.0 {
            rng.random_range(0.0..total)
        } else {
            0.0
        };

        let mut cumulative = 0.0;
        for (index, weight) in weights.iter().enumerate() {
            cumulative += weight;
            if cumulative >= draw {
                return Some(index);
            }
        }
        Some(len - 1)
    }
}
