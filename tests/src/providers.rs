//! In-memory provider doubles that record how they were called.

use async_trait::async_trait;
use parking_lot::Mutex;
use ragline_kernel::error::{PipelineError, PipelineResult};
use ragline_kernel::provider::{
    CompletionProvider, DocumentParser, EmbeddingProvider, GraphStore, KnowledgeExtractor,
    VectorStore,
};
use ragline_kernel::stream::{self, ItemStream};
use ragline_kernel::types::{
    Completion, CompletionChunk, Document, EmbeddedFragment, Entity, Extraction, Filters,
    Fragment, GenerationConfig, KgExtraction, Message, RankedItem, StoredFragment, StoredGraph,
    Triple,
};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

/// UTF-8 parser producing one extraction per document.
///
/// Documents listed with [`MockParser::failing`] are rejected with a parsing
/// error attributed to them.
#[derive(Debug, Default)]
pub struct MockParser {
    failing: HashSet<String>,
    calls: AtomicUsize,
}

impl MockParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            failing: ids.into_iter().map(Into::into).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentParser for MockParser {
    async fn parse(&self, document: Document) -> PipelineResult<ItemStream<Extraction>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(&document.id) {
            return Err(PipelineError::parsing(document.id, "corrupt document"));
        }
        let text = String::from_utf8(document.data)
            .map_err(|_| PipelineError::parsing(document.id.clone(), "not utf-8"))?;
        Ok(stream::once(Extraction::new(
            format!("{}-x", document.id),
            document.id,
            text,
        )))
    }
}

/// Embeds text as `[chars, words]` and records every batch size.
#[derive(Debug, Default)]
pub struct MockEmbedder {
    batches: Mutex<Vec<usize>>,
}

impl MockEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<usize> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    fn name(&self) -> &str {
        "mock-embedder"
    }

    async fn embed(&self, texts: &[String]) -> PipelineResult<Vec<Vec<f32>>> {
        self.batches.lock().push(texts.len());
        Ok(texts
            .iter()
            .map(|t| vec![t.chars().count() as f32, t.split_whitespace().count() as f32])
            .collect())
    }
}

/// Keeps upserted fragments in memory.
///
/// Searches return the canned results set with
/// [`MockVectorStore::with_results`], or else the stored fragments in
/// insertion order with scores `1, 1/2, 1/3, ...`. Every requested limit is
/// recorded.
#[derive(Debug, Default)]
pub struct MockVectorStore {
    entries: Mutex<Vec<EmbeddedFragment>>,
    results: Option<Vec<RankedItem>>,
    limits: Mutex<Vec<usize>>,
}

impl MockVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_results(mut self, results: Vec<RankedItem>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn entries(&self) -> Vec<EmbeddedFragment> {
        self.entries.lock().clone()
    }

    pub fn limits(&self) -> Vec<usize> {
        self.limits.lock().clone()
    }
}

#[async_trait]
impl VectorStore for MockVectorStore {
    fn name(&self) -> &str {
        "mock-vector-store"
    }

    async fn upsert(&self, entries: &[EmbeddedFragment]) -> PipelineResult<Vec<StoredFragment>> {
        self.entries.lock().extend_from_slice(entries);
        Ok(entries
            .iter()
            .map(|e| StoredFragment {
                fragment_id: e.fragment.id.clone(),
                document_id: e.fragment.document_id.clone(),
            })
            .collect())
    }

    async fn search(
        &self,
        _query_vector: &[f32],
        _filters: &Filters,
        limit: usize,
    ) -> PipelineResult<Vec<RankedItem>> {
        self.limits.lock().push(limit);
        if let Some(results) = &self.results {
            return Ok(results.iter().take(limit).cloned().collect());
        }
        Ok(self
            .entries
            .lock()
            .iter()
            .take(limit)
            .enumerate()
            .map(|(i, e)| {
                RankedItem::new(e.fragment.id.clone(), e.fragment.text.clone(), 1.0 / (i + 1) as f32)
            })
            .collect())
    }
}

/// Records upserted extractions and answers searches with canned results.
#[derive(Debug, Default)]
pub struct MockGraphStore {
    upserts: Mutex<Vec<KgExtraction>>,
    results: Vec<RankedItem>,
}

impl MockGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_results(mut self, results: Vec<RankedItem>) -> Self {
        self.results = results;
        self
    }

    pub fn upserts(&self) -> Vec<KgExtraction> {
        self.upserts.lock().clone()
    }
}

#[async_trait]
impl GraphStore for MockGraphStore {
    fn name(&self) -> &str {
        "mock-graph-store"
    }

    async fn upsert(&self, extraction: &KgExtraction) -> PipelineResult<StoredGraph> {
        self.upserts.lock().push(extraction.clone());
        Ok(StoredGraph {
            fragment_id: extraction.fragment_id.clone(),
            document_id: extraction.document_id.clone(),
            entity_count: extraction.entities.len(),
            triple_count: extraction.triples.len(),
        })
    }

    async fn search(&self, _query: &str, _filters: &Filters, limit: usize) -> PipelineResult<Vec<RankedItem>> {
        Ok(self.results.iter().take(limit).cloned().collect())
    }
}

/// Takes capitalised words as entities and links neighbours with `next_to`.
#[derive(Debug, Default)]
pub struct MockExtractor;

#[async_trait]
impl KnowledgeExtractor for MockExtractor {
    fn name(&self) -> &str {
        "mock-extractor"
    }

    async fn extract(&self, fragment: &Fragment) -> PipelineResult<KgExtraction> {
        let entities: Vec<Entity> = fragment
            .text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.chars().next().is_some_and(char::is_uppercase))
            .map(|w| Entity {
                name: w.to_string(),
                category: "unknown".to_string(),
                description: None,
            })
            .collect();
        let triples = entities
            .windows(2)
            .map(|pair| Triple {
                subject: pair[0].name.clone(),
                predicate: "next_to".to_string(),
                object: pair[1].name.clone(),
            })
            .collect();
        Ok(KgExtraction {
            fragment_id: fragment.id.clone(),
            document_id: fragment.document_id.clone(),
            entities,
            triples,
        })
    }
}

/// Completion model answering from a script.
///
/// Scripted answers are consumed in order; once exhausted the fallback
/// answer is repeated. Streams split the answer on spaces, keeping the
/// separators, and close with a `stop` chunk.
#[derive(Debug)]
pub struct MockCompletion {
    script: Mutex<VecDeque<String>>,
    fallback: String,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl MockCompletion {
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: fallback.into(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn scripted<I, S>(answers: I, fallback: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mock = Self::new(fallback);
        mock.script.lock().extend(answers.into_iter().map(Into::into));
        mock
    }

    /// Messages of every request, in call order.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().clone()
    }

    fn answer(&self, messages: &[Message]) -> String {
        self.requests.lock().push(messages.to_vec());
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl CompletionProvider for MockCompletion {
    fn name(&self) -> &str {
        "mock-completion"
    }

    async fn complete(&self, messages: &[Message], _config: &GenerationConfig) -> PipelineResult<Completion> {
        Ok(Completion {
            content: self.answer(messages),
            finish_reason: Some("stop".to_string()),
        })
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        _config: &GenerationConfig,
    ) -> PipelineResult<ItemStream<CompletionChunk>> {
        let answer = self.answer(messages);
        let mut chunks: Vec<CompletionChunk> = answer
            .split_inclusive(' ')
            .map(|word| CompletionChunk::text(word))
            .collect();
        chunks.push(CompletionChunk::from(Completion {
            content: String::new(),
            finish_reason: Some("stop".to_string()),
        }));
        Ok(stream::from_iter(chunks))
    }
}
