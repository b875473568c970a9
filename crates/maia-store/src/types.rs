//! Record and input types persisted by [`crate::Store`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Category of a stored memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Facts, profiles, structured knowledge.
    #[default]
    Semantic,
    /// Conversations and experiences.
    Episodic,
    /// Current session state.
    Working,
    /// Workflows and how-to knowledge.
    Procedural,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Semantic => "semantic",
            Self::Episodic => "episodic",
            Self::Working => "working",
            Self::Procedural => "procedural",
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "semantic" => Ok(Self::Semantic),
            "episodic" => Ok(Self::Episodic),
            "working" => Ok(Self::Working),
            "procedural" => Ok(Self::Procedural),
            _ => Err(format!("unknown memory type: {s}")),
        }
    }
}

/// How a memory entered the store. Free-form; `user` when unspecified.
pub const DEFAULT_SOURCE: &str = "user";

/// Edge from one memory to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub target_id: String,
    #[serde(rename = "type")]
    pub relation_type: String,
    pub weight: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// A single stored memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    /// UUID v7; lexical order follows creation order.
    pub id: String,
    pub namespace: String,
    pub content: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub accessed_at: OffsetDateTime,
    pub access_count: u64,
    /// In `[0.0, 1.0]`.
    pub confidence: f64,
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relations: Vec<Relation>,
}

/// Budget and retention settings for a namespace.
///
/// `inherit_from_parent` is stored but not applied anywhere.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NamespaceConfig {
    #[serde(default)]
    pub token_budget: u32,
    #[serde(default)]
    pub max_memories: u64,
    #[serde(default)]
    pub retention_days: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_types: Vec<MemoryType>,
    #[serde(default)]
    pub inherit_from_parent: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_scoring: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub id: String,
    /// Unique across the store.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    pub config: NamespaceConfig,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default)]
pub struct CreateMemoryInput {
    pub namespace: String,
    pub content: String,
    /// Defaults to [`MemoryType::Semantic`].
    pub memory_type: Option<MemoryType>,
    pub embedding: Option<Vec<f32>>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub tags: Vec<String>,
    /// Defaults to `1.0`.
    pub confidence: Option<f64>,
    /// Defaults to [`DEFAULT_SOURCE`].
    pub source: Option<String>,
    pub relations: Vec<Relation>,
}

impl CreateMemoryInput {
    pub fn new(namespace: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = Some(memory_type);
        self
    }
}

/// Partial update; `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct UpdateMemoryInput {
    pub content: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
    pub tags: Option<Vec<String>>,
    pub confidence: Option<f64>,
    pub relations: Option<Vec<Relation>>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateNamespaceInput {
    pub name: String,
    pub parent: Option<String>,
    pub template: Option<String>,
    pub config: NamespaceConfig,
}

impl CreateNamespaceInput {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

pub const DEFAULT_LIST_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct ListOptions {
    pub limit: usize,
    pub offset: usize,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
        }
    }
}

impl ListOptions {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }

    pub(crate) fn effective_limit(&self) -> usize {
        if self.limit == 0 {
            DEFAULT_LIST_LIMIT
        } else {
            self.limit
        }
    }
}

/// Inclusive creation-time window; an absent bound is open.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeRange {
    pub start: Option<OffsetDateTime>,
    pub end: Option<OffsetDateTime>,
}

impl TimeRange {
    pub fn contains(&self, at: OffsetDateTime) -> bool {
        if let Some(start) = self.start
            && at < start
        {
            return false;
        }
        if let Some(end) = self.end
            && at > end
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Scan only this namespace through its membership index.
    pub namespace: Option<String>,
    /// Any listed type matches.
    pub types: Vec<MemoryType>,
    /// Every listed tag must be present.
    pub tags: Vec<String>,
    pub time_range: Option<TimeRange>,
    pub limit: usize,
    pub offset: usize,
}

impl SearchOptions {
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    pub(crate) fn matches(&self, mem: &Memory) -> bool {
        if !self.types.is_empty() && !self.types.contains(&mem.memory_type) {
            return false;
        }
        if !self.tags.iter().all(|t| mem.tags.contains(t)) {
            return false;
        }
        match &self.time_range {
            Some(range) => range.contains(mem.created_at),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub memory: Memory,
    /// Always `1.0`; search is a filtered listing, not a ranking.
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub total_memories: u64,
    pub total_namespaces: u64,
    pub storage_size_bytes: u64,
}
