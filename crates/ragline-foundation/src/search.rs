//! Branching search pipeline and the retrieval stage built on it.

use crate::branch::{BranchPhase, BranchRun, DEFAULT_QUEUE_CAPACITY};
use crate::pipeline::{Pipeline, RunOptions};
use async_trait::async_trait;
use futures::StreamExt;
use ragline_kernel::error::PipelineResult;
use ragline_kernel::run::PipelineType;
use ragline_kernel::stage::{Stage, StageConfig, StageContext, StageInput};
use ragline_kernel::stream::{self, ItemStream};
use ragline_kernel::types::{AggregateResult, RagInput, RankedItem, SearchRequest};
use serde_json::json;
use tracing::debug;

/// Vector and knowledge-graph search run concurrently over one request.
#[derive(Debug, Clone)]
pub struct SearchPipeline {
    name: String,
    vector: Option<Pipeline<SearchRequest, RankedItem>>,
    graph: Option<Pipeline<SearchRequest, RankedItem>>,
    queue_capacity: usize,
}

impl Default for SearchPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchPipeline {
    pub fn new() -> Self {
        Self {
            name: "search".to_string(),
            vector: None,
            graph: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_vector(mut self, pipeline: Pipeline<SearchRequest, RankedItem>) -> Self {
        self.vector = Some(pipeline);
        self
    }

    pub fn with_graph(mut self, pipeline: Pipeline<SearchRequest, RankedItem>) -> Self {
        self.graph = Some(pipeline);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Search with every branch the request's settings enable.
    ///
    /// A disabled or unconfigured branch contributes an empty result list.
    pub async fn run(
        &self,
        request: SearchRequest,
        options: RunOptions,
    ) -> PipelineResult<AggregateResult> {
        let run = BranchRun::start(&self.name, PipelineType::Search, &options, self.queue_capacity);
        let result = self.execute(&run, request).await;
        run.finish(result).await
    }

    async fn execute(&self, run: &BranchRun, request: SearchRequest) -> PipelineResult<AggregateResult> {
        run.log_phase(BranchPhase::Enqueueing);
        let settings = &request.settings;
        let mut senders = Vec::new();
        let vector_queue = run.queue(
            "vector",
            settings.use_vector_search && self.vector.is_some(),
            &mut senders,
        );
        let graph_queue = run.queue(
            "graph",
            settings.use_kg_search && self.graph.is_some(),
            &mut senders,
        );
        run.fan_out(stream::once(request), senders);

        run.log_phase(BranchPhase::Running);
        let vector = match &self.vector {
            Some(pipeline) => run.spawn_branch("vector", pipeline, vector_queue),
            None => None,
        };
        let graph = match &self.graph {
            Some(pipeline) => run.spawn_branch("graph", pipeline, graph_queue),
            None => None,
        };

        let vector = run.join(vector).await;
        let graph = run.join(graph).await;
        if let Some(error) = run.first_error() {
            return Err(error);
        }
        let aggregate = AggregateResult::new(vector?.unwrap_or_default(), graph?.unwrap_or_default());
        run.log_phase(BranchPhase::Joined);
        debug!(
            run_id = %run.handle().run_id,
            vector = aggregate.vector_results.len(),
            graph = aggregate.graph_results.len(),
            "search joined"
        );
        Ok(aggregate)
    }
}

/// Runs a [`SearchPipeline`] for every incoming request and emits the query
/// together with its retrieved context.
///
/// Publishes each aggregate under `search_results`.
pub struct RetrievalStage {
    config: StageConfig,
    search: SearchPipeline,
}

impl RetrievalStage {
    pub fn new(name: impl Into<String>, search: SearchPipeline) -> Self {
        Self {
            config: StageConfig::new(name),
            search,
        }
    }
}

#[async_trait]
impl Stage for RetrievalStage {
    type Input = SearchRequest;
    type Output = RagInput;

    fn config(&self) -> &StageConfig {
        &self.config
    }

    async fn run(
        &self,
        input: StageInput<SearchRequest>,
        ctx: StageContext,
    ) -> PipelineResult<ItemStream<RagInput>> {
        let search = self.search.clone();
        let output = input.message.then(move |request| {
            let search = search.clone();
            let ctx = ctx.clone();
            async move {
                let request = request?;
                let query = request.query.clone();
                let options = RunOptions::within(&ctx, PipelineType::Search)
                    .with_run_state(ctx.state.clone());
                let context = search.run(request, options).await?;
                ctx.publish("search_results", json!(context));
                ctx.log(
                    "retrieved",
                    json!({ "query": query, "results": context.len() }),
                );
                PipelineResult::Ok(RagInput { query, context })
            }
        });
        Ok(stream::boxed(output))
    }
}
