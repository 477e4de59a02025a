//! Batched embedding stage.

use super::process_batch;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use futures::StreamExt;
use ragline_kernel::config::EmbeddingConfig;
use ragline_kernel::error::{PipelineError, PipelineResult};
use ragline_kernel::provider::EmbeddingProvider;
use ragline_kernel::stage::{Stage, StageConfig, StageContext, StageInput};
use ragline_kernel::stream::{self, ItemStream};
use ragline_kernel::types::{EmbeddedFragment, Fragment, Processed};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

/// Embeds fragments in batches of at most `batch_size`.
///
/// A batch is cut from whatever fragments are already waiting, so a slow
/// upstream never holds a partial batch back.
/// Batches are embedded concurrently, at most `max_concurrency` requests at
/// a time across every run sharing this stage, and emitted in input order.
/// A batch whose request is rejected, or still fails after its retries, turns
/// into one failure per fragment.
pub struct EmbeddingStage {
    config: StageConfig,
    provider: Arc<dyn EmbeddingProvider>,
    retry: RetryPolicy,
    batch_size: usize,
    max_concurrency: usize,
    permits: Arc<Semaphore>,
}

impl EmbeddingStage {
    pub fn new(name: impl Into<String>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        let defaults = EmbeddingConfig::default();
        Self {
            config: StageConfig::new(name),
            provider,
            retry: RetryPolicy::default(),
            batch_size: defaults.batch_size,
            max_concurrency: defaults.max_concurrency,
            permits: Arc::new(Semaphore::new(defaults.max_concurrency)),
        }
    }

    pub fn with_config(mut self, config: &EmbeddingConfig) -> Self {
        self.batch_size = config.batch_size.max(1);
        self.max_concurrency = config.max_concurrency.max(1);
        self.permits = Arc::new(Semaphore::new(self.max_concurrency));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

struct Embedder {
    stage: String,
    provider: Arc<dyn EmbeddingProvider>,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl Embedder {
    async fn embed(&self, fragments: Vec<Fragment>) -> PipelineResult<Vec<EmbeddedFragment>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| PipelineError::Cancelled)?;
        let texts: Vec<String> = fragments.iter().map(|f| f.text.clone()).collect();
        let vectors = self
            .retry
            .run("embed", || self.provider.embed(&texts))
            .await?;
        if vectors.len() != fragments.len() {
            return Err(PipelineError::permanent(
                self.provider.name(),
                format!("returned {} vectors for {} texts", vectors.len(), texts.len()),
            ));
        }
        debug!(stage = %self.stage, count = vectors.len(), "embedded batch");
        Ok(fragments
            .into_iter()
            .zip(vectors)
            .map(|(fragment, vector)| EmbeddedFragment { fragment, vector })
            .collect())
    }
}

#[async_trait]
impl Stage for EmbeddingStage {
    type Input = Processed<Fragment>;
    type Output = Processed<EmbeddedFragment>;

    fn config(&self) -> &StageConfig {
        &self.config
    }

    async fn run(
        &self,
        input: StageInput<Processed<Fragment>>,
        ctx: StageContext,
    ) -> PipelineResult<ItemStream<Processed<EmbeddedFragment>>> {
        let embedder = Arc::new(Embedder {
            stage: self.name().to_string(),
            provider: Arc::clone(&self.provider),
            retry: self.retry.clone(),
            permits: Arc::clone(&self.permits),
        });
        let output = input
            .message
            .ready_chunks(self.batch_size)
            .map(move |batch| {
                let embedder = Arc::clone(&embedder);
                let ctx = ctx.clone();
                async move {
                    let output = process_batch(&embedder.stage, batch, |fragments| {
                        embedder.embed(fragments)
                    })
                    .await;
                    ctx.log("batch", json!({ "items": output.len() }));
                    futures::stream::iter(output)
                }
            })
            .buffered(self.max_concurrency)
            .flatten();
        Ok(stream::boxed(output))
    }
}
