use crate::input::FuzzInput;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use rand::seq::{IndexedRandom, SliceRandom};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use serde::Serialize;
use tracing::debug;

/// Inputs at or above this size are left alone by [`LineMutator`].
pub const MAX_MUTATABLE_BYTES: usize = 50_000;

/// Descriptive metadata a mutator reports about itself.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct MutatorInfo {
    pub name: String,
    pub description: String,
    /// Preference when several mutators are available, 1 (low) to 10 (high).
    pub priority: u8,
    /// Estimated cost, 1 (fast) to 10 (slow).
    pub complexity: u8,
}

/// A `Mutator` derives new candidate programs from existing ones.
///
/// The engine treats mutators as opaque: it only asks whether an input is
/// acceptable and then for a child of it. Implementations are shared between
/// all workers and must be safe to call concurrently.
#[async_trait]
pub trait Mutator: Send + Sync {
    /// Produces a mutated child of `input`.
    ///
    /// The child should be built with [`FuzzInput::child_of`] so lineage is
    /// recorded. Implementations that hit an internal problem should return
    /// an unchanged copy of the input rather than an error; errors are
    /// reserved for failures the caller has to know about.
    async fn mutate(&self, input: &FuzzInput) -> anyhow::Result<FuzzInput>;

    /// Whether this mutator can handle `input` at all.
    fn can_mutate(&self, input: &FuzzInput) -> bool;

    /// Acquires any resources the mutator needs.
    async fn initialize(&self) -> anyhow::Result<()>;

    /// Releases resources acquired in [`Mutator::initialize`].
    async fn shutdown(&self) -> anyhow::Result<()>;

    fn info(&self) -> MutatorInfo;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStrategy {
    DeleteLine,
    DuplicateLine,
    SwapLines,
    InsertStatement,
    PerturbLiteral,
}

impl LineStrategy {
    pub const ALL: [LineStrategy; 5] = [
        LineStrategy::DeleteLine,
        LineStrategy::DuplicateLine,
        LineStrategy::SwapLines,
        LineStrategy::InsertStatement,
        LineStrategy::PerturbLiteral,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            LineStrategy::DeleteLine => "line:delete",
            LineStrategy::DuplicateLine => "line:duplicate",
            LineStrategy::SwapLines => "line:swap",
            LineStrategy::InsertStatement => "line:insert",
            LineStrategy::PerturbLiteral => "line:literal",
        }
    }
}

/// Statements spliced in by [`LineStrategy::InsertStatement`]. `#` is replaced
/// with a random number.
const STATEMENT_TEMPLATES: &[&str] = &[
    "val kai# = #",
    "var kaiVar#: Int? = null",
    "println(#)",
    "if (# > 0) { println(\"kai\") }",
    "run { val x = # * 2; x }",
    "listOf(#, #, #).map { it + 1 }",
    "when (#) { 0 -> Unit; else -> Unit }",
    "@Suppress(\"UNUSED\") val kaiLambda# = { x: Int -> x + # }",
];

/// Replacement values for [`LineStrategy::PerturbLiteral`].
const INTERESTING_LITERALS: &[&str] = &["0", "1", "-1", "2147483647", "9223372036854775807"];

/// Text-level mutator that edits whole lines and numeric literals.
///
/// It knows nothing about the language, so many children will not compile.
/// That still exercises the compiler's error paths, which is where a lot of
/// crashes live.
#[derive(Debug)]
pub struct LineMutator {
    rng: Mutex<ChaCha8Rng>,
}

impl LineMutator {
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    /// Applies `strategy` to `source`, or returns `None` when the strategy has
    /// nothing to work on (e.g. swapping in a one-line program).
    pub fn apply<R: Rng + ?Sized>(
        strategy: LineStrategy,
        source: &str,
        rng: &mut R,
    ) -> Option<String> {
        let mut lines: Vec<&str> = source.lines().collect();
        match strategy {
            LineStrategy::DeleteLine => {
                if lines.len() < 2 {
                    return None;
                }
                lines.remove(rng.random_range(0..lines.len()));
                Some(lines.join("\n"))
            }
            LineStrategy::DuplicateLine => {
                if lines.is_empty() {
                    return None;
                }
                let index = rng.random_range(0..lines.len());
                lines.insert(index, lines[index]);
                Some(lines.join("\n"))
            }
            LineStrategy::SwapLines => {
                if lines.len() < 2 {
                    return None;
                }
                let a = rng.random_range(0..lines.len());
                let b = rng.random_range(0..lines.len());
                lines.swap(a, b);
                Some(lines.join("\n"))
            }
            LineStrategy::InsertStatement => {
                let template = STATEMENT_TEMPLATES.choose(rng)?;
                let statement = template.replace('#', &rng.random_range(0..1000).to_string());
                let at = rng.random_range(0..=lines.len());
                let mut owned: Vec<String> = lines.into_iter().map(str::to_string).collect();
                owned.insert(at, statement);
                Some(owned.join("\n"))
            }
            LineStrategy::PerturbLiteral => {
                let literals = numeric_literals(source);
                let &(start, end) = literals.choose(rng)?;
                let replacement = if rng.random_bool(0.5) {
                    (*INTERESTING_LITERALS.choose(rng)?).to_string()
                } else {
                    rng.random_range(0..i32::MAX).to_string()
                };
                Some(format!("{}{}{}", &source[..start], replacement, &source[end..]))
            }
        }
    }
}

impl Default for LineMutator {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte ranges of standalone runs of ASCII digits. Digits inside identifiers
/// such as `x1` are skipped.
fn numeric_literals(source: &str) -> Vec<(usize, usize)> {
    let bytes = source.as_bytes();
    let mut ranges = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let part_of_identifier = start > 0
            && (bytes[start - 1].is_ascii_alphabetic() || bytes[start - 1] == b'_');
        if !part_of_identifier {
            ranges.push((start, i));
        }
    }
    ranges
}

#[async_trait]
impl Mutator for LineMutator {
    async fn mutate(&self, input: &FuzzInput) -> anyhow::Result<FuzzInput> {
        let mut rng = self.rng.lock();
        let mut strategies = LineStrategy::ALL;
        strategies.shuffle(&mut *rng);
        for strategy in strategies {
            if let Some(source) = Self::apply(strategy, input.source_code(), &mut *rng) {
                return Ok(FuzzInput::child_of(input, source, [strategy.tag()]));
            }
        }
        debug!(input_id = input.id(), "No line strategy applied, returning input unchanged");
        Ok(input.clone())
    }

    fn can_mutate(&self, input: &FuzzInput) -> bool {
        !input.source_code().trim().is_empty() && input.len() < MAX_MUTATABLE_BYTES
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        debug!("LineMutator initialized");
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        debug!("LineMutator shut down");
        Ok(())
    }

    fn info(&self) -> MutatorInfo {
        MutatorInfo {
            name: "LineMutator".to_string(),
            description: "Deletes, duplicates, swaps and inserts lines and perturbs numeric literals"
                .to_string(),
            priority: 5,
            complexity: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROGRAM: &str = "fun main() {\n    val x1 = 42\n    println(x1 + 7)\n}";

    fn rng(seed: u8) -> ChaCha8Rng {
        ChaCha8Rng::from_seed([seed; 32])
    }

    #[test]
    fn finds_standalone_numeric_literals() {
        let ranges = numeric_literals(PROGRAM);
        let found: Vec<&str> = ranges.iter().map(|&(s, e)| &PROGRAM[s..e]).collect();
        assert_eq!(found, vec!["42", "7"]);
        assert!(numeric_literals("val abc = x").is_empty());
    }

    #[test]
    fn delete_and_swap_need_two_lines() {
        let mut rng = rng(1);
        assert_eq!(
            LineMutator::apply(LineStrategy::DeleteLine, "one line", &mut rng),
            None
        );
        assert_eq!(
            LineMutator::apply(LineStrategy::SwapLines, "one line", &mut rng),
            None
        );
        let deleted = LineMutator::apply(LineStrategy::DeleteLine, PROGRAM, &mut rng).unwrap();
        assert_eq!(deleted.lines().count(), 3);
    }

    #[test]
    fn duplicate_and_insert_add_one_line() {
        let mut rng = rng(2);
        let duplicated =
            LineMutator::apply(LineStrategy::DuplicateLine, PROGRAM, &mut rng).unwrap();
        assert_eq!(duplicated.lines().count(), 5);

        let inserted =
            LineMutator::apply(LineStrategy::InsertStatement, PROGRAM, &mut rng).unwrap();
        assert_eq!(inserted.lines().count(), 5);
        assert!(!inserted.contains('#'));

        let into_empty = LineMutator::apply(LineStrategy::InsertStatement, "", &mut rng).unwrap();
        assert_eq!(into_empty.lines().count(), 1);
    }

    #[test]
    fn literal_perturbation_only_touches_digits() {
        let mut rng = rng(3);
        for _ in 0..50 {
            let mutated =
                LineMutator::apply(LineStrategy::PerturbLiteral, PROGRAM, &mut rng).unwrap();
            assert!(mutated.starts_with("fun main() {\n    val x1 = "));
            assert!(mutated.ends_with('}'));
        }
        assert_eq!(
            LineMutator::apply(LineStrategy::PerturbLiteral, "fun f() = x", &mut rng),
            None
        );
    }

    #[tokio::test]
    async fn mutate_produces_children() {
        let mutator = LineMutator::with_seed(7);
        let parent = FuzzInput::new(PROGRAM).with_tags(["seed"]);
        for _ in 0..100 {
            let child = mutator.mutate(&parent).await.unwrap();
            assert_eq!(child.generation(), 1);
            assert_eq!(child.parent_id(), Some(parent.id()));
            assert!(child.tags().contains("seed"));
            assert!(child.tags().iter().any(|t| t.starts_with("line:")));
        }
    }

    #[tokio::test]
    async fn seeded_mutators_agree() {
        let a = LineMutator::with_seed(99);
        let b = LineMutator::with_seed(99);
        let parent = FuzzInput::new(PROGRAM);
        for _ in 0..20 {
            let ca = a.mutate(&parent).await.unwrap();
            let cb = b.mutate(&parent).await.unwrap();
            assert_eq!(ca.source_code(), cb.source_code());
        }
    }

    #[test]
    fn can_mutate_rejects_blank_and_oversized_sources() {
        let mutator = LineMutator::with_seed(0);
        assert!(mutator.can_mutate(&FuzzInput::new(PROGRAM)));
        assert!(!mutator.can_mutate(&FuzzInput::new("  \n\t")));
        assert!(!mutator.can_mutate(&FuzzInput::new("x".repeat(MAX_MUTATABLE_BYTES))));
        assert!(mutator.can_mutate(&FuzzInput::new("x".repeat(MAX_MUTATABLE_BYTES - 1))));
    }

    #[test]
    fn info_is_within_bounds() {
        let info = LineMutator::with_seed(0).info();
        assert_eq!(info.name, "LineMutator");
        assert!((1..=10).contains(&info.priority));
        assert!((1..=10).contains(&info.complexity));
    }
}
