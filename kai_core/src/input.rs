use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A candidate program under test, plus the lineage metadata the evolutionary
/// loop needs.
///
/// Inputs are never changed after construction. A mutated variant is a new
/// `FuzzInput` built with [`FuzzInput::child_of`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FuzzInput {
    source_code: String,
    id: String,
    generation: u32,
    parent_id: Option<String>,
    tags: BTreeSet<String>,
    created_at: DateTime<Utc>,
}

impl FuzzInput {
    /// Creates a generation-0 seed input with a fresh id.
    pub fn new(source_code: impl Into<String>) -> Self {
        Self {
            source_code: source_code.into(),
            id: Self::generate_id(),
            generation: 0,
            parent_id: None,
            tags: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    /// Creates a mutated child of `parent`. The child's generation is always
    /// `parent.generation() + 1` and it inherits the parent's tags.
    pub fn child_of<I, S>(parent: &FuzzInput, source_code: impl Into<String>, extra_tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tags = parent.tags.clone();
        tags.extend(extra_tags.into_iter().map(Into::into));
        Self {
            source_code: source_code.into(),
            id: Self::generate_id(),
            generation: parent.generation + 1,
            parent_id: Some(parent.id.clone()),
            tags,
            created_at: Utc::now(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Overrides the creation time. Pruning orders by this value, so loaders
    /// and tests use it to pin the evolutionary age of an input.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    fn generate_id() -> String {
        format!("fuzz_{}", uuid::Uuid::new_v4())
    }

    pub fn source_code(&self) -> &str {
        &self.source_code
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.source_code.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.source_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source_code.is_empty()
    }

    /// Lower-case hex MD5 of the source. Two inputs with the same source share
    /// a hash regardless of id or lineage.
    pub fn content_hash(&self) -> String {
        content_hash(&self.source_code)
    }
}

pub(crate) fn content_hash(source: &str) -> String {
    format!("{:x}", md5::compute(source.as_bytes()))
}
