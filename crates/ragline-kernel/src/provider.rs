//! Provider traits
//!
//! External collaborators consumed by the concrete stages: document parsers,
//! chunkers, embedding and completion models, vector and graph stores and
//! knowledge extractors. Implementations own their transport; stages only
//! see these async contracts.

use crate::error::PipelineResult;
use crate::stream::ItemStream;
use crate::types::{
    Completion, CompletionChunk, Document, EmbeddedFragment, Extraction, Filters, Fragment,
    GenerationConfig, KgExtraction, Message, RankedItem, StoredFragment, StoredGraph,
};
use async_trait::async_trait;

/// Extracts text from raw documents.
#[async_trait]
pub trait DocumentParser: Send + Sync {
    /// Parse `document` into a stream of extractions.
    ///
    /// Errors attributable to this document must be
    /// [`crate::error::PipelineError::Parsing`] so the stage can report them
    /// per item instead of aborting the run.
    async fn parse(&self, document: Document) -> PipelineResult<ItemStream<Extraction>>;
}

/// Splits extracted text into fragments.
#[async_trait]
pub trait Chunker: Send + Sync {
    async fn chunk(&self, extraction: Extraction) -> PipelineResult<ItemStream<Fragment>>;
}

/// Batched text embedding.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Embed `texts`, returning one vector per text in the same order.
    async fn embed(&self, texts: &[String]) -> PipelineResult<Vec<Vec<f32>>>;
}

/// Either a finished completion or a stream of chunks.
pub enum CompletionResponse {
    Full(Completion),
    Stream(ItemStream<CompletionChunk>),
}

impl std::fmt::Debug for CompletionResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full(completion) => f.debug_tuple("Full").field(completion).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Chat-completion model.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        messages: &[Message],
        config: &GenerationConfig,
    ) -> PipelineResult<Completion>;

    async fn complete_stream(
        &self,
        messages: &[Message],
        config: &GenerationConfig,
    ) -> PipelineResult<ItemStream<CompletionChunk>>;

    /// Dispatch on [`GenerationConfig::stream`].
    async fn generate(
        &self,
        messages: &[Message],
        config: &GenerationConfig,
    ) -> PipelineResult<CompletionResponse> {
        if config.stream {
            self.complete_stream(messages, config)
                .await
                .map(CompletionResponse::Stream)
        } else {
            self.complete(messages, config)
                .await
                .map(CompletionResponse::Full)
        }
    }
}

/// Vector database.
#[async_trait]
pub trait VectorStore: Send + Sync {
    fn name(&self) -> &str;

    async fn upsert(&self, entries: &[EmbeddedFragment]) -> PipelineResult<Vec<StoredFragment>>;

    async fn search(
        &self,
        query_vector: &[f32],
        filters: &Filters,
        limit: usize,
    ) -> PipelineResult<Vec<RankedItem>>;

    /// Combined vector and full-text search.
    ///
    /// Stores without a text index fall back to plain vector search.
    async fn hybrid_search(
        &self,
        query_text: &str,
        query_vector: &[f32],
        filters: &Filters,
        limit: usize,
    ) -> PipelineResult<Vec<RankedItem>> {
        let _ = query_text;
        self.search(query_vector, filters, limit).await
    }
}

/// Knowledge-graph database.
#[async_trait]
pub trait GraphStore: Send + Sync {
    fn name(&self) -> &str;

    async fn upsert(&self, extraction: &KgExtraction) -> PipelineResult<StoredGraph>;

    async fn search(
        &self,
        query: &str,
        filters: &Filters,
        limit: usize,
    ) -> PipelineResult<Vec<RankedItem>>;
}

/// Entity and relation extraction over a fragment.
#[async_trait]
pub trait KnowledgeExtractor: Send + Sync {
    fn name(&self) -> &str;

    async fn extract(&self, fragment: &Fragment) -> PipelineResult<KgExtraction>;
}
