//! Vector and knowledge-graph search stages.

use crate::retry::RetryPolicy;
use async_trait::async_trait;
use futures::StreamExt;
use ragline_kernel::error::{PipelineError, PipelineResult};
use ragline_kernel::provider::{EmbeddingProvider, GraphStore, VectorStore};
use ragline_kernel::stage::{Stage, StageConfig, StageContext, StageInput};
use ragline_kernel::stream::{self, ItemStream};
use ragline_kernel::types::{RankedItem, SearchRequest};
use serde_json::json;
use std::sync::Arc;

/// Emit `results` for one request, publishing each one under
/// `search_results`.
fn emit(
    results: PipelineResult<Vec<RankedItem>>,
    query: &str,
    ctx: &StageContext,
) -> ItemStream<RankedItem> {
    match results {
        Ok(results) => {
            let results: Vec<RankedItem> = results
                .into_iter()
                .map(|item| item.with_query(query))
                .collect();
            for item in &results {
                ctx.publish_item("search_results", json!(item));
            }
            stream::from_iter(results)
        }
        Err(error) => stream::failed(error),
    }
}

/// Embeds the query and searches a [`VectorStore`].
///
/// Uses the store's hybrid search when the request asks for it.
pub struct VectorSearchStage {
    config: StageConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    retry: RetryPolicy,
}

impl VectorSearchStage {
    pub fn new(
        name: impl Into<String>,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            config: StageConfig::new(name),
            embedder,
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn search(&self, request: &SearchRequest) -> PipelineResult<Vec<RankedItem>> {
        let texts = [request.query.clone()];
        let vector = self
            .retry
            .run("embed_query", || self.embedder.embed(&texts))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                PipelineError::permanent(self.embedder.name(), "no vector returned for query")
            })?;
        let settings = &request.settings;
        if settings.use_hybrid_search {
            self.retry
                .run("hybrid_search", || {
                    self.store
                        .hybrid_search(&request.query, &vector, &settings.filters, settings.limit)
                })
                .await
        } else {
            self.retry
                .run("vector_search", || {
                    self.store.search(&vector, &settings.filters, settings.limit)
                })
                .await
        }
    }
}

#[async_trait]
impl Stage for VectorSearchStage {
    type Input = SearchRequest;
    type Output = RankedItem;

    fn config(&self) -> &StageConfig {
        &self.config
    }

    async fn run(
        &self,
        input: StageInput<SearchRequest>,
        ctx: StageContext,
    ) -> PipelineResult<ItemStream<RankedItem>> {
        let stage = Arc::new(Self {
            config: self.config.clone(),
            embedder: Arc::clone(&self.embedder),
            store: Arc::clone(&self.store),
            retry: self.retry.clone(),
        });
        let output = input
            .message
            .then(move |request| {
                let stage = Arc::clone(&stage);
                let ctx = ctx.clone();
                async move {
                    let request = match request {
                        Ok(request) => request,
                        Err(error) => return stream::failed(error),
                    };
                    let results = stage.search(&request).await;
                    emit(results, &request.query, &ctx)
                }
            })
            .flatten();
        Ok(stream::boxed(output))
    }
}

/// Searches a [`GraphStore`] with the query text.
pub struct GraphSearchStage {
    config: StageConfig,
    store: Arc<dyn GraphStore>,
    retry: RetryPolicy,
}

impl GraphSearchStage {
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
impl Stage for GraphSearchStage {
    type Input = SearchRequest;
    type Output = RankedItem;

    fn config(&self) -> &StageConfig {
        &self.config
    }

    async fn run(
        &self,
        input: StageInput<SearchRequest>,
        ctx: StageContext,
    ) -> PipelineResult<ItemStream<RankedItem>> {
        let store = Arc::clone(&self.store);
        let retry = self.retry.clone();
        let output = input
            .message
            .then(move |request| {
                let store = Arc::clone(&store);
                let retry = retry.clone();
                let ctx = ctx.clone();
                async move {
                    let request = match request {
                        Ok(request) => request,
                        Err(error) => return stream::failed(error),
                    };
                    let settings = &request.settings;
                    let results = retry
                        .run("graph_search", || {
                            store.search(&request.query, &settings.filters, settings.limit)
                        })
                        .await;
                    emit(results, &request.query, &ctx)
                }
            })
            .flatten();
        Ok(stream::boxed(output))
    }
}
