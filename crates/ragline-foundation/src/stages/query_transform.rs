//! Query expansion stage.

use crate::retry::RetryPolicy;
use async_trait::async_trait;
use futures::StreamExt;
use ragline_kernel::error::PipelineResult;
use ragline_kernel::provider::CompletionProvider;
use ragline_kernel::stage::{Stage, StageConfig, StageContext, StageInput};
use ragline_kernel::stream::{self, ItemStream};
use ragline_kernel::types::{GenerationConfig, Message};
use serde_json::json;
use std::sync::Arc;

const SYSTEM_PROMPT: &str = "You rewrite search queries. Answer with one query per line and nothing else.";

/// Asks a completion model for `num_variants` rewrites of each query.
///
/// Emits one item per non-empty line of the answer, with list markers
/// removed, or the original query when the answer has none.
pub struct QueryTransformStage {
    config: StageConfig,
    provider: Arc<dyn CompletionProvider>,
    generation: GenerationConfig,
    retry: RetryPolicy,
    num_variants: usize,
}

impl QueryTransformStage {
    pub fn new(name: impl Into<String>, provider: Arc<dyn CompletionProvider>, num_variants: usize) -> Self {
        Self {
            config: StageConfig::new(name),
            provider,
            generation: GenerationConfig::default(),
            retry: RetryPolicy::default(),
            num_variants: num_variants.max(1),
        }
    }

    pub fn with_generation_config(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

fn prompt(query: &str, num_variants: usize) -> Vec<Message> {
    vec![
        Message::system(SYSTEM_PROMPT),
        Message::user(format!(
            "Write {num_variants} different search queries that would find information answering:\n{query}"
        )),
    ]
}

/// Split a model answer into queries.
pub(crate) fn parse_variants(answer: &str, limit: usize) -> Vec<String> {
    answer
        .lines()
        .map(|line| strip_list_marker(line.trim()).to_string())
        .filter(|line| !line.is_empty())
        .take(limit)
        .collect()
}

fn strip_list_marker(line: &str) -> &str {
    if let Some(rest) = line.strip_prefix(['-', '*']) {
        return rest.trim_start();
    }
    let digits = line.trim_start_matches(|c: char| c.is_ascii_digit());
    if digits.len() < line.len() {
        if let Some(rest) = digits.strip_prefix(['.', ')']) {
            return rest.trim_start();
        }
    }
    line
}

#[async_trait]
impl Stage for QueryTransformStage {
    type Input = String;
    type Output = String;

    fn config(&self) -> &StageConfig {
        &self.config
    }

    async fn run(
        &self,
        input: StageInput<String>,
        ctx: StageContext,
    ) -> PipelineResult<ItemStream<String>> {
        let provider = Arc::clone(&self.provider);
        let retry = self.retry.clone();
        let num_variants = self.num_variants;
        // variants are complete queries, never streamed
        let generation = GenerationConfig {
            stream: false,
            ..self.generation.clone()
        };
        let output = input
            .message
            .then(move |query| {
                let provider = Arc::clone(&provider);
                let retry = retry.clone();
                let generation = generation.clone();
                let ctx = ctx.clone();
                async move {
                    let query = match query {
                        Ok(query) => query,
                        Err(error) => return stream::failed(error),
                    };
                    let messages = prompt(&query, num_variants);
                    let completion = retry
                        .run("query_transform", || provider.complete(&messages, &generation))
                        .await;
                    let mut variants = match completion {
                        Ok(completion) => parse_variants(&completion.content, num_variants),
                        Err(error) => return stream::failed(error),
                    };
                    if variants.is_empty() {
                        variants.push(query.clone());
                    }
                    ctx.publish("variants", json!(variants));
                    stream::from_iter(variants)
                }
            })
            .flatten();
        Ok(stream::boxed(output))
    }
}
