//! Knowledge-graph extraction and storage stages.

use super::{is_item_level, map_success, process_batch};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use futures::StreamExt;
use ragline_kernel::config::ExtractionConfig;
use ragline_kernel::error::{ItemFailure, PipelineError, PipelineResult};
use ragline_kernel::provider::{GraphStore, KnowledgeExtractor};
use ragline_kernel::stage::{Stage, StageConfig, StageContext, StageInput};
use ragline_kernel::stream::{self, ItemStream};
use ragline_kernel::types::{Fragment, KgExtraction, Processed, StoredGraph};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Extracts entities and triples from every fragment, `max_concurrency`
/// fragments at a time, in input order.
pub struct KgExtractionStage {
    config: StageConfig,
    extractor: Arc<dyn KnowledgeExtractor>,
    retry: RetryPolicy,
    max_concurrency: usize,
    permits: Arc<Semaphore>,
}

impl KgExtractionStage {
    pub fn new(name: impl Into<String>, extractor: Arc<dyn KnowledgeExtractor>) -> Self {
        let max_concurrency = ExtractionConfig::default().max_concurrency;
        Self {
            config: StageConfig::new(name),
            extractor,
            retry: RetryPolicy::default(),
            max_concurrency,
            permits: Arc::new(Semaphore::new(max_concurrency)),
        }
    }

    pub fn with_config(mut self, config: &ExtractionConfig) -> Self {
        self.max_concurrency = config.max_concurrency.max(1);
        self.permits = Arc::new(Semaphore::new(self.max_concurrency));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

async fn extract(
    extractor: &dyn KnowledgeExtractor,
    retry: &RetryPolicy,
    permits: &Semaphore,
    fragments: Vec<Fragment>,
) -> PipelineResult<Vec<KgExtraction>> {
    let _permit = permits.acquire().await.map_err(|_| PipelineError::Cancelled)?;
    let mut extractions = Vec::with_capacity(fragments.len());
    for fragment in &fragments {
        extractions.push(retry.run("extract", || extractor.extract(fragment)).await?);
    }
    Ok(extractions)
}

#[async_trait]
impl Stage for KgExtractionStage {
    type Input = Processed<Fragment>;
    type Output = Processed<KgExtraction>;

    fn config(&self) -> &StageConfig {
        &self.config
    }

    async fn run(
        &self,
        input: StageInput<Processed<Fragment>>,
        ctx: StageContext,
    ) -> PipelineResult<ItemStream<Processed<KgExtraction>>> {
        let extractor = Arc::clone(&self.extractor);
        let retry = self.retry.clone();
        let permits = Arc::clone(&self.permits);
        let output = input
            .message
            .map(move |item| {
                let extractor = Arc::clone(&extractor);
                let retry = retry.clone();
                let permits = Arc::clone(&permits);
                let ctx = ctx.clone();
                async move {
                    let output = process_batch(&ctx.stage_name, vec![item], |fragments| {
                        extract(extractor.as_ref(), &retry, &permits, fragments)
                    })
                    .await;
                    for extraction in output.iter().filter_map(|p| p.as_ref().ok()?.as_success()) {
                        ctx.log(
                            "extracted",
                            json!({
                                "fragment_id": extraction.fragment_id,
                                "entities": extraction.entities.len(),
                                "triples": extraction.triples.len(),
                            }),
                        );
                    }
                    futures::stream::iter(output)
                }
            })
            .buffered(self.max_concurrency)
            .flatten();
        Ok(stream::boxed(output))
    }
}

/// Writes extracted entities and triples to a [`GraphStore`].
pub struct KgStorageStage {
    config: StageConfig,
    store: Arc<dyn GraphStore>,
    retry: RetryPolicy,
}

impl KgStorageStage {
    pub fn new(name: impl Into<String>, store: Arc<dyn GraphStore>) -> Self {
        Self {
            config: StageConfig::new(name),
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl Stage for KgStorageStage {
    type Input = Processed<KgExtraction>;
    type Output = Processed<StoredGraph>;

    fn config(&self) -> &StageConfig {
        &self.config
    }

    async fn run(
        &self,
        input: StageInput<Processed<KgExtraction>>,
        _ctx: StageContext,
    ) -> PipelineResult<ItemStream<Processed<StoredGraph>>> {
        let store = Arc::clone(&self.store);
        let retry = self.retry.clone();
        Ok(map_success(input.message, move |extraction: KgExtraction| {
            let store = Arc::clone(&store);
            let retry = retry.clone();
            async move {
                match retry.run("graph_upsert", || store.upsert(&extraction)).await {
                    Ok(stored) => Ok(Processed::success(stored)),
                    Err(error) if is_item_level(&error) => Ok(Processed::failed(
                        ItemFailure::from_error(extraction.document_id.clone(), &error),
                    )),
                    Err(error) => Err(error),
                }
            }
        }))
    }
}
