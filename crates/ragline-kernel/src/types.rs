//! Domain data types flowing through RAG pipelines.

use crate::error::ItemFailure;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Metadata attached to documents, fragments and search results.
pub type Metadata = HashMap<String, Value>;

// ============================================================================
// Item-level outcomes
// ============================================================================

/// An item that either made it through a stage, failed on its own, or was
/// deliberately skipped.
///
/// Downstream consumers must check the tag before treating an item as a
/// success. Failed and skipped items are passed through untouched by every
/// later stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Processed<T> {
    Success { item: T },
    Failed { failure: ItemFailure },
    Skipped { item_id: String, reason: String },
}

impl<T> Processed<T> {
    pub fn success(item: T) -> Self {
        Self::Success { item }
    }

    pub fn failed(failure: ItemFailure) -> Self {
        Self::Failed { failure }
    }

    pub fn skipped(item_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Skipped {
            item_id: item_id.into(),
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn as_success(&self) -> Option<&T> {
        match self {
            Self::Success { item } => Some(item),
            _ => None,
        }
    }

    pub fn into_success(self) -> Option<T> {
        match self {
            Self::Success { item } => Some(item),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&ItemFailure> {
        match self {
            Self::Failed { failure } => Some(failure),
            _ => None,
        }
    }

    /// Transform the success payload, passing failures and skips through.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Processed<U> {
        match self {
            Self::Success { item } => Processed::Success { item: f(item) },
            Self::Failed { failure } => Processed::Failed { failure },
            Self::Skipped { item_id, reason } => Processed::Skipped { item_id, reason },
        }
    }

    /// Re-tag a non-success outcome for a different payload type.
    ///
    /// Returns `Err(item)` for a success so the caller can process it.
    pub fn pass_through<U>(self) -> Result<Processed<U>, T> {
        match self {
            Self::Success { item } => Err(item),
            Self::Failed { failure } => Ok(Processed::Failed { failure }),
            Self::Skipped { item_id, reason } => Ok(Processed::Skipped { item_id, reason }),
        }
    }
}

// ============================================================================
// Ingestion
// ============================================================================

/// Items that belong to exactly one source document.
pub trait DocumentScoped {
    fn document_id(&self) -> &str;
}

macro_rules! document_scoped {
    ($($ty:ty => $($field:ident).+;)*) => {
        $(impl DocumentScoped for $ty {
            fn document_id(&self) -> &str {
                &self.$($field).+
            }
        })*
    };
}

document_scoped! {
    Document => id;
    Extraction => document_id;
    Fragment => document_id;
    EmbeddedFragment => fragment.document_id;
    StoredFragment => document_id;
    KgExtraction => document_id;
    StoredGraph => document_id;
}

/// A raw document submitted for ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// MIME type or file extension, used by parsers to pick an extractor
    pub format: String,
    pub data: Vec<u8>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Document {
    pub fn new(id: impl Into<String>, format: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            format: format.into(),
            data: data.into(),
            metadata: Metadata::new(),
        }
    }

    /// Plain-text document.
    pub fn text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(id, "txt", text.into().into_bytes())
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Text extracted from (part of) a document by a parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub id: String,
    pub document_id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Extraction {
    pub fn new(id: impl Into<String>, document_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            document_id: document_id.into(),
            text: text.into(),
            metadata: Metadata::new(),
        }
    }
}

/// A chunk of extracted text; the unit that gets embedded and stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub id: String,
    pub document_id: String,
    pub extraction_id: String,
    /// Position of the fragment within its extraction
    pub index: usize,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// A fragment together with its embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedFragment {
    pub fragment: Fragment,
    pub vector: Vec<f32>,
}

/// Receipt of a fragment persisted in a vector store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFragment {
    pub fragment_id: String,
    pub document_id: String,
}

/// Entity found by knowledge-graph extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Subject / predicate / object relation between entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Triple {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

/// Knowledge-graph extraction result for one fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KgExtraction {
    pub fragment_id: String,
    pub document_id: String,
    pub entities: Vec<Entity>,
    pub triples: Vec<Triple>,
}

/// Receipt of a knowledge-graph extraction persisted in a graph store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredGraph {
    pub fragment_id: String,
    pub document_id: String,
    pub entity_count: usize,
    pub triple_count: usize,
}

// ============================================================================
// Search
// ============================================================================

/// A ranked search hit.
///
/// Results compare by `score`; callers sorting them must break ties by
/// input order (stable sort).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedItem {
    pub id: String,
    pub score: f32,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// The query that produced this hit
    #[serde(default)]
    pub associated_query: String,
}

impl RankedItem {
    pub fn new(id: impl Into<String>, text: impl Into<String>, score: f32) -> Self {
        Self {
            id: id.into(),
            score,
            text: text.into(),
            metadata: Metadata::new(),
            associated_query: String::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.associated_query = query.into();
        self
    }

    /// Descending-score comparator with a total order (NaN sorts last).
    pub fn cmp_by_score_desc(a: &Self, b: &Self) -> std::cmp::Ordering {
        b.score.total_cmp(&a.score)
    }
}

/// Equality filters applied by stores, keyed by metadata field.
pub type Filters = HashMap<String, Value>;

/// Per-request search settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub use_vector_search: bool,
    pub use_kg_search: bool,
    /// Use the store's hybrid (vector + full text) search when available
    pub use_hybrid_search: bool,
    pub limit: usize,
    pub filters: Filters,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            use_vector_search: true,
            use_kg_search: false,
            use_hybrid_search: false,
            limit: 10,
            filters: Filters::new(),
        }
    }
}

/// A query with the settings to run it under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub settings: SearchSettings,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, settings: SearchSettings) -> Self {
        Self {
            query: query.into(),
            settings,
        }
    }

    /// Same settings, different query text.
    pub fn with_query(&self, query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            settings: self.settings.clone(),
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.settings.limit = limit;
        self
    }
}

/// Joined result of a branching search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub vector_results: Vec<RankedItem>,
    pub graph_results: Vec<RankedItem>,
}

impl AggregateResult {
    pub fn new(vector_results: Vec<RankedItem>, graph_results: Vec<RankedItem>) -> Self {
        Self {
            vector_results,
            graph_results,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.vector_results.is_empty() && self.graph_results.is_empty()
    }

    pub fn len(&self) -> usize {
        self.vector_results.len() + self.graph_results.len()
    }
}

// ============================================================================
// Generation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Completion request settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Stream completion chunks instead of returning one completion
    pub stream: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            temperature: 0.1,
            max_tokens: None,
            stream: false,
        }
    }
}

/// A complete, non-streamed completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// One increment of a streamed completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChunk {
    pub delta: String,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

impl CompletionChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: delta.into(),
            finish_reason: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.finish_reason.is_some()
    }
}

impl From<Completion> for CompletionChunk {
    fn from(completion: Completion) -> Self {
        Self {
            delta: completion.content,
            finish_reason: completion.finish_reason.or_else(|| Some("stop".to_string())),
        }
    }
}

/// Input of the generation stage: the user query and its retrieved context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagInput {
    pub query: String,
    pub context: AggregateResult,
}
