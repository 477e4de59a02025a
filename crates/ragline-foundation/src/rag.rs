//! Retrieval-augmented generation: search, then generate from the results.

use crate::pipeline::{Pipeline, RunOptions, RunStream};
use crate::search::{RetrievalStage, SearchPipeline};
use crate::stages::GenerationStage;
use futures::StreamExt;
use ragline_kernel::error::{PipelineError, PipelineResult};
use ragline_kernel::run::{PipelineType, RunOutcome};
use ragline_kernel::stream;
use ragline_kernel::types::{Completion, CompletionChunk, SearchRequest};

/// Name of the retrieval stage in a [`RagPipeline`].
pub const RETRIEVAL_STAGE: &str = "retrieval";
/// Name of the generation stage in a [`RagPipeline`].
pub const GENERATION_STAGE: &str = "generation";

/// Retrieval followed by generation, as one `Rag` run.
#[derive(Debug, Clone)]
pub struct RagPipeline {
    pipeline: Pipeline<SearchRequest, CompletionChunk>,
}

impl RagPipeline {
    pub fn new(search: SearchPipeline, generation: GenerationStage) -> PipelineResult<Self> {
        let pipeline = Pipeline::new("rag", PipelineType::Rag)
            .then(RetrievalStage::new(RETRIEVAL_STAGE, search))?
            .then(generation)?;
        Ok(Self { pipeline })
    }

    pub fn pipeline(&self) -> &Pipeline<SearchRequest, CompletionChunk> {
        &self.pipeline
    }

    /// Answer `request`, streaming completion chunks as they are produced.
    pub async fn run(
        &self,
        request: SearchRequest,
        options: RunOptions,
    ) -> PipelineResult<RunStream<CompletionChunk>> {
        self.pipeline.run(stream::once(request), options).await
    }

    /// Answer `request` and join the chunks into one completion.
    pub async fn run_to_end(
        &self,
        request: SearchRequest,
        options: RunOptions,
    ) -> PipelineResult<Completion> {
        let mut run = self.run(request, options).await?;
        let mut completion = Completion {
            content: String::new(),
            finish_reason: None,
        };
        while let Some(chunk) = run.next().await {
            let chunk = chunk?;
            completion.content.push_str(&chunk.delta);
            if chunk.finish_reason.is_some() {
                completion.finish_reason = chunk.finish_reason;
            }
        }
        run.terminated().await;
        if matches!(run.outcome(), Some(RunOutcome::Cancelled)) {
            return Err(PipelineError::Cancelled);
        }
        Ok(completion)
    }
}
