//! Text chunking stage and a character-window chunker.

use async_trait::async_trait;
use futures::StreamExt;
use ragline_kernel::error::PipelineResult;
use ragline_kernel::provider::Chunker;
use ragline_kernel::stage::{Stage, StageConfig, StageContext, StageInput};
use ragline_kernel::stream::{self, ItemStream};
use ragline_kernel::types::{Extraction, Fragment, Processed};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Configuration for text chunking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Maximum number of characters per chunk
    pub chunk_size: usize,
    /// Number of characters shared by consecutive chunks
    pub chunk_overlap: usize,
}

impl ChunkConfig {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
        }
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 64,
        }
    }
}

/// Splits text into overlapping windows of at most `chunk_size` characters.
#[derive(Debug, Clone, Default)]
pub struct TextChunker {
    config: ChunkConfig,
}

impl TextChunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    /// Split `text` by character count; consecutive windows overlap by
    /// `chunk_overlap` characters.
    pub fn split(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        let chars: Vec<char> = text.chars().collect();
        let size = self.config.chunk_size.max(1);
        if chars.len() <= size {
            return vec![text.to_string()];
        }

        let step = size.saturating_sub(self.config.chunk_overlap).max(1);
        let mut chunks: Vec<String> = Vec::new();
        let mut start = 0;
        while start < chars.len() {
            let end = (start + size).min(chars.len());
            chunks.push(chars[start..end].iter().collect());
            if end == chars.len() {
                break;
            }
            start += step;
        }
        chunks
    }
}

#[async_trait]
impl Chunker for TextChunker {
    async fn chunk(&self, extraction: Extraction) -> PipelineResult<ItemStream<Fragment>> {
        let fragments: Vec<Fragment> = self
            .split(&extraction.text)
            .into_iter()
            .enumerate()
            .map(|(index, text)| Fragment {
                id: format!("{}:{index}", extraction.id),
                document_id: extraction.document_id.clone(),
                extraction_id: extraction.id.clone(),
                index,
                text,
                metadata: extraction.metadata.clone(),
            })
            .collect();
        Ok(stream::from_iter(fragments))
    }
}

/// Splits every successful extraction into fragments.
pub struct ChunkingStage {
    config: StageConfig,
    chunker: Arc<dyn Chunker>,
}

impl ChunkingStage {
    pub fn new(name: impl Into<String>, chunker: Arc<dyn Chunker>) -> Self {
        Self {
            config: StageConfig::new(name),
            chunker,
        }
    }

    /// Chunking stage backed by a [`TextChunker`].
    pub fn text(name: impl Into<String>, config: ChunkConfig) -> Self {
        Self::new(name, Arc::new(TextChunker::new(config)))
    }
}

#[async_trait]
impl Stage for ChunkingStage {
    type Input = Processed<Extraction>;
    type Output = Processed<Fragment>;

    fn config(&self) -> &StageConfig {
        &self.config
    }

    async fn run(
        &self,
        input: StageInput<Processed<Extraction>>,
        ctx: StageContext,
    ) -> PipelineResult<ItemStream<Processed<Fragment>>> {
        let chunker = Arc::clone(&self.chunker);
        let output = input
            .message
            .then(move |item| {
                let chunker = Arc::clone(&chunker);
                let ctx = ctx.clone();
                async move {
                    let extraction = match item?.pass_through() {
                        Ok(other) => return Ok(stream::once(other)),
                        Err(extraction) => extraction,
                    };
                    let extraction_id = extraction.id.clone();
                    let fragments = chunker.chunk(extraction).await?;
                    ctx.log("chunked", json!({ "extraction_id": extraction_id }));
                    PipelineResult::Ok(stream::boxed(
                        fragments.map(|fragment| fragment.map(Processed::success)),
                    ))
                }
            })
            .flat_map(|chunked: PipelineResult<ItemStream<Processed<Fragment>>>| match chunked {
                Ok(fragments) => fragments,
                Err(error) => stream::failed(error),
            });
        Ok(stream::boxed(output))
    }
}
