//! Vector storage stage.

use super::process_batch;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use futures::StreamExt;
use ragline_kernel::config::StorageConfig;
use ragline_kernel::error::{PipelineError, PipelineResult};
use ragline_kernel::provider::VectorStore;
use ragline_kernel::stage::{Stage, StageConfig, StageContext, StageInput};
use ragline_kernel::stream::{self, ItemStream};
use ragline_kernel::types::{EmbeddedFragment, Processed, StoredFragment};
use serde_json::json;
use std::sync::Arc;

/// Upserts embedded fragments into a [`VectorStore`], `batch_size` at a time.
pub struct VectorStorageStage {
    config: StageConfig,
    store: Arc<dyn VectorStore>,
    retry: RetryPolicy,
    batch_size: usize,
}

impl VectorStorageStage {
    pub fn new(name: impl Into<String>, store: Arc<dyn VectorStore>) -> Self {
        Self {
            config: StageConfig::new(name),
            store,
            retry: RetryPolicy::default(),
            batch_size: StorageConfig::default().batch_size,
        }
    }

    pub fn with_config(mut self, config: &StorageConfig) -> Self {
        self.batch_size = config.batch_size.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

async fn upsert(
    store: &dyn VectorStore,
    retry: &RetryPolicy,
    entries: Vec<EmbeddedFragment>,
) -> PipelineResult<Vec<StoredFragment>> {
    let stored = retry.run("upsert", || store.upsert(&entries)).await?;
    if stored.len() != entries.len() {
        return Err(PipelineError::permanent(
            store.name(),
            format!("stored {} of {} entries", stored.len(), entries.len()),
        ));
    }
    Ok(stored)
}

#[async_trait]
impl Stage for VectorStorageStage {
    type Input = Processed<EmbeddedFragment>;
    type Output = Processed<StoredFragment>;

    fn config(&self) -> &StageConfig {
        &self.config
    }

    async fn run(
        &self,
        input: StageInput<Processed<EmbeddedFragment>>,
        ctx: StageContext,
    ) -> PipelineResult<ItemStream<Processed<StoredFragment>>> {
        let store = Arc::clone(&self.store);
        let retry = self.retry.clone();
        let output = input
            .message
            .chunks(self.batch_size)
            .then(move |batch| {
                let store = Arc::clone(&store);
                let retry = retry.clone();
                let ctx = ctx.clone();
                async move {
                    let output = process_batch(&ctx.stage_name, batch, |entries| {
                        upsert(store.as_ref(), &retry, entries)
                    })
                    .await;
                    let stored = output
                        .iter()
                        .filter(|item| matches!(item, Ok(p) if p.is_success()))
                        .count();
                    ctx.log("stored", json!({ "count": stored }));
                    futures::stream::iter(output)
                }
            })
            .flatten();
        Ok(stream::boxed(output))
    }
}
