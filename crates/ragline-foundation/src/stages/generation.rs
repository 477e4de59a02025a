//! Answer generation stage.

use crate::retry::RetryPolicy;
use async_trait::async_trait;
use futures::StreamExt;
use ragline_kernel::error::PipelineResult;
use ragline_kernel::provider::{CompletionProvider, CompletionResponse};
use ragline_kernel::stage::{Stage, StageConfig, StageContext, StageInput};
use ragline_kernel::stream::{self, ItemStream};
use ragline_kernel::types::{AggregateResult, CompletionChunk, GenerationConfig, Message, RagInput};
use serde_json::json;
use std::fmt::Write as _;
use std::sync::Arc;

const SYSTEM_PROMPT: &str = "Answer the question using only the numbered context below. \
Cite the context entries you use as [n]. If the context does not contain the answer, say so.";

/// Render the retrieved context as numbered entries, vector results first.
pub fn render_context(context: &AggregateResult) -> String {
    let mut rendered = String::new();
    let entries = context
        .vector_results
        .iter()
        .chain(context.graph_results.iter());
    for (n, item) in entries.enumerate() {
        let _ = writeln!(rendered, "[{}] {}", n + 1, item.text.trim());
    }
    rendered
}

fn messages(input: &RagInput) -> Vec<Message> {
    let context = render_context(&input.context);
    vec![
        Message::system(format!("{SYSTEM_PROMPT}\n\nContext:\n{context}")),
        Message::user(input.query.clone()),
    ]
}

/// Generates an answer for each query from its retrieved context.
///
/// With `stream` set in the generation config the provider's chunks are
/// forwarded as they arrive; otherwise the full completion is emitted as a
/// single final chunk.
pub struct GenerationStage {
    config: StageConfig,
    provider: Arc<dyn CompletionProvider>,
    generation: GenerationConfig,
    retry: RetryPolicy,
}

impl GenerationStage {
    pub fn new(
        name: impl Into<String>,
        provider: Arc<dyn CompletionProvider>,
        generation: GenerationConfig,
    ) -> Self {
        Self {
            config: StageConfig::new(name),
            provider,
            generation,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl Stage for GenerationStage {
    type Input = RagInput;
    type Output = CompletionChunk;

    fn config(&self) -> &StageConfig {
        &self.config
    }

    async fn run(
        &self,
        input: StageInput<RagInput>,
        ctx: StageContext,
    ) -> PipelineResult<ItemStream<CompletionChunk>> {
        let provider = Arc::clone(&self.provider);
        let generation = self.generation.clone();
        let retry = self.retry.clone();
        let output = input
            .message
            .then(move |rag_input| {
                let provider = Arc::clone(&provider);
                let generation = generation.clone();
                let retry = retry.clone();
                let ctx = ctx.clone();
                async move {
                    let rag_input = match rag_input {
                        Ok(rag_input) => rag_input,
                        Err(error) => return stream::failed(error),
                    };
                    let messages = messages(&rag_input);
                    ctx.log(
                        "generate",
                        json!({
                            "query": rag_input.query,
                            "context_items": rag_input.context.len(),
                            "model": generation.model,
                            "stream": generation.stream,
                        }),
                    );
                    let response = retry
                        .run("generate", || provider.generate(&messages, &generation))
                        .await;
                    match response {
                        Ok(CompletionResponse::Full(completion)) => {
                            stream::once(CompletionChunk::from(completion))
                        }
                        Ok(CompletionResponse::Stream(chunks)) => chunks,
                        Err(error) => stream::failed(error),
                    }
                }
            })
            .flatten();
        Ok(stream::boxed(output))
    }
}
