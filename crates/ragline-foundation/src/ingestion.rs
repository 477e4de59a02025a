//! Branching ingestion pipeline.
//!
//! Documents go through an upstream pipeline (parse, chunk) whose output is
//! fanned out to an embedding branch and a knowledge-graph branch running
//! concurrently.

use crate::branch::{BranchPhase, BranchRun, DEFAULT_QUEUE_CAPACITY};
use crate::pipeline::{Pipeline, RunOptions};
use ragline_kernel::error::{ItemFailure, PipelineResult};
use ragline_kernel::run::PipelineType;
use ragline_kernel::stream::{self, ItemStream};
use ragline_kernel::types::{DocumentScoped, Processed};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::info;

/// Which ingestion branches a run activates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionSettings {
    pub use_embedding: bool,
    pub use_knowledge_graph: bool,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            use_embedding: true,
            use_knowledge_graph: true,
        }
    }
}

/// Joined output of an ingestion run. An inactive branch is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionOutput<E, K> {
    pub embedding: Option<Vec<E>>,
    pub knowledge_graph: Option<Vec<K>>,
}

/// Per-document summary of an ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionReport {
    /// Documents with at least one stored item and no failure
    pub processed: Vec<String>,
    /// First failure of every failed document
    pub failed: Vec<ItemFailure>,
    /// Documents skipped without error
    pub skipped: Vec<String>,
}

impl IngestionReport {
    /// Build a report from item outcomes, grouped by document in first-seen
    /// order. A document that failed anywhere is reported as failed only.
    pub fn from_items<'a, T, I>(items: I) -> Self
    where
        T: DocumentScoped + 'a,
        I: IntoIterator<Item = &'a Processed<T>>,
    {
        let mut succeeded = Vec::new();
        let mut skipped = Vec::new();
        let mut failed: Vec<ItemFailure> = Vec::new();
        for item in items {
            match item {
                Processed::Success { item } => {
                    push_unique(&mut succeeded, item.document_id());
                }
                Processed::Failed { failure } => {
                    if !failed.iter().any(|f| f.item_id == failure.item_id) {
                        failed.push(failure.clone());
                    }
                }
                Processed::Skipped { item_id, .. } => push_unique(&mut skipped, item_id),
            }
        }

        let failed_ids: HashSet<&str> = failed.iter().map(|f| f.item_id.as_str()).collect();
        succeeded.retain(|id| !failed_ids.contains(id.as_str()));
        skipped.retain(|id| !failed_ids.contains(id.as_str()) && !succeeded.contains(id));
        Self {
            processed: succeeded,
            failed,
            skipped,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

fn push_unique(ids: &mut Vec<String>, id: &str) {
    if !ids.iter().any(|known| known == id) {
        ids.push(id.to_string());
    }
}

impl<E, K> IngestionOutput<Processed<E>, Processed<K>>
where
    E: DocumentScoped,
    K: DocumentScoped,
{
    /// Summarise both branches into one report.
    pub fn report(&self) -> IngestionReport {
        let mut by_branch = Vec::new();
        if let Some(items) = &self.embedding {
            by_branch.push(IngestionReport::from_items(items));
        }
        if let Some(items) = &self.knowledge_graph {
            by_branch.push(IngestionReport::from_items(items));
        }

        let mut report = IngestionReport::default();
        for branch in &by_branch {
            for failure in &branch.failed {
                if !report.failed.iter().any(|f| f.item_id == failure.item_id) {
                    report.failed.push(failure.clone());
                }
            }
        }
        let failed: HashSet<String> = report.failed.iter().map(|f| f.item_id.clone()).collect();
        for branch in &by_branch {
            for id in &branch.processed {
                if !failed.contains(id) {
                    push_unique(&mut report.processed, id);
                }
            }
        }
        for branch in &by_branch {
            for id in &branch.skipped {
                if !failed.contains(id) && !report.processed.contains(id) {
                    push_unique(&mut report.skipped, id);
                }
            }
        }
        report
    }
}

/// Upstream pipeline fanned out to embedding and knowledge-graph branches.
///
/// `D` documents are turned into `F` fragments upstream; the embedding
/// branch maps fragments to `E`, the knowledge-graph branch to `K`.
pub struct IngestionPipeline<D, F, E, K> {
    name: String,
    upstream: Pipeline<D, F>,
    embedding: Option<Pipeline<F, E>>,
    knowledge_graph: Option<Pipeline<F, K>>,
    queue_capacity: usize,
}

impl<D, F, E, K> IngestionPipeline<D, F, E, K>
where
    D: Send + 'static,
    F: Clone + Send + 'static,
    E: Send + 'static,
    K: Send + 'static,
{
    pub fn new(upstream: Pipeline<D, F>) -> Self {
        Self {
            name: "ingestion".to_string(),
            upstream,
            embedding: None,
            knowledge_graph: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_embedding(mut self, pipeline: Pipeline<F, E>) -> Self {
        self.embedding = Some(pipeline);
        self
    }

    pub fn with_knowledge_graph(mut self, pipeline: Pipeline<F, K>) -> Self {
        self.knowledge_graph = Some(pipeline);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Ingest `documents`, returning the joined branch outputs.
    ///
    /// A branch that is disabled by `settings` or not configured joins as
    /// `None`. The first fatal error of any branch cancels the others and is
    /// returned after all of them have stopped.
    pub async fn run(
        &self,
        documents: ItemStream<D>,
        settings: IngestionSettings,
        options: RunOptions,
    ) -> PipelineResult<IngestionOutput<E, K>> {
        let run = BranchRun::start(
            &self.name,
            PipelineType::Ingestion,
            &options,
            self.queue_capacity,
        );
        let result = self.execute(&run, documents, settings).await;
        run.finish(result).await
    }

    async fn execute(
        &self,
        run: &BranchRun,
        documents: ItemStream<D>,
        settings: IngestionSettings,
    ) -> PipelineResult<IngestionOutput<E, K>> {
        run.log_phase(BranchPhase::Enqueueing);
        let upstream = self.upstream.run(documents, run.nested_options()).await?;

        let mut senders = Vec::new();
        let embedding_queue = run.queue(
            "embedding",
            settings.use_embedding && self.embedding.is_some(),
            &mut senders,
        );
        let kg_queue = run.queue(
            "knowledge_graph",
            settings.use_knowledge_graph && self.knowledge_graph.is_some(),
            &mut senders,
        );
        run.fan_out(stream::boxed(upstream), senders);

        run.log_phase(BranchPhase::Running);
        let embedding = match &self.embedding {
            Some(pipeline) => run.spawn_branch("embedding", pipeline, embedding_queue),
            None => None,
        };
        let knowledge_graph = match &self.knowledge_graph {
            Some(pipeline) => run.spawn_branch("knowledge_graph", pipeline, kg_queue),
            None => None,
        };

        let embedding = run.join(embedding).await;
        let knowledge_graph = run.join(knowledge_graph).await;
        if let Some(error) = run.first_error() {
            return Err(error);
        }
        let output = IngestionOutput {
            embedding: embedding?,
            knowledge_graph: knowledge_graph?,
        };
        run.log_phase(BranchPhase::Joined);
        info!(
            run_id = %run.handle().run_id,
            embedded = output.embedding.as_ref().map(Vec::len),
            extracted = output.knowledge_graph.as_ref().map(Vec::len),
            "ingestion joined"
        );
        Ok(output)
    }
}
