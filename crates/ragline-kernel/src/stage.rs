//! Stage contract.
//!
//! A stage consumes a single-consume stream of typed inputs and produces a
//! lazy stream of typed outputs. Concrete stages live in
//! `ragline-foundation`; the pipeline drives them as cancellable tasks.

use crate::error::PipelineResult;
use crate::run::{RunLogEntry, RunLogSink};
use crate::state::RunState;
use crate::stream::ItemStream;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Immutable stage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Unique name within a pipeline; also the namespace of its run-state keys
    pub name: String,
    /// Stage-specific options
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl StageConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: Map::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    pub fn option(&self, key: &str) -> Option<&Value> {
        self.options.get(key)
    }
}

/// A declared dependency on a named output of an earlier, possibly
/// non-adjacent, stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrossReference {
    /// Field of the consuming stage's input that receives the value
    pub input_field: String,
    /// Name of the producing stage
    pub prev_stage_name: String,
    /// Run-state key published by the producing stage
    pub prev_output_field: String,
}

impl CrossReference {
    pub fn new(
        input_field: impl Into<String>,
        prev_stage_name: impl Into<String>,
        prev_output_field: impl Into<String>,
    ) -> Self {
        Self {
            input_field: input_field.into(),
            prev_stage_name: prev_stage_name.into(),
            prev_output_field: prev_output_field.into(),
        }
    }
}

/// Input handed to [`Stage::run`].
pub struct StageInput<T> {
    /// Primary input: the previous stage's output, or the pipeline input
    pub message: ItemStream<T>,
    /// Resolved cross references, keyed by `input_field`
    pub references: HashMap<String, Value>,
}

impl<T> StageInput<T> {
    pub fn new(message: ItemStream<T>) -> Self {
        Self {
            message,
            references: HashMap::new(),
        }
    }

    pub fn with_references(message: ItemStream<T>, references: HashMap<String, Value>) -> Self {
        Self {
            message,
            references,
        }
    }

    pub fn reference(&self, input_field: &str) -> Option<&Value> {
        self.references.get(input_field)
    }
}

impl<T> fmt::Debug for StageInput<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageInput")
            .field("references", &self.references)
            .finish_non_exhaustive()
    }
}

/// Terminal status of a stage task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not finished yet
    Pending,
    /// Output stream exhausted and fully forwarded
    Completed,
    /// A fatal error was produced
    Failed,
    /// The run was cancelled
    Cancelled,
    /// Downstream stopped consuming before the stream ended
    Abandoned,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Per-run handles passed to a stage.
#[derive(Clone)]
pub struct StageContext {
    pub run_id: Uuid,
    pub stage_name: String,
    pub state: Arc<RunState>,
    pub sink: Arc<dyn RunLogSink>,
    pub cancel: CancellationToken,
}

impl StageContext {
    pub fn new(
        run_id: Uuid,
        stage_name: impl Into<String>,
        state: Arc<RunState>,
        sink: Arc<dyn RunLogSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            stage_name: stage_name.into(),
            state,
            sink,
            cancel,
        }
    }

    /// Enqueue a run-log entry namespaced by this stage. Never blocks.
    pub fn log(&self, key: &str, value: Value) {
        self.sink.enqueue_log(RunLogEntry::new(
            self.run_id,
            format!("{}.{}", self.stage_name, key),
            value,
        ));
    }

    /// Publish `value` under this stage's name in the run state.
    pub fn publish(&self, key: &str, value: Value) {
        self.state.set(&self.stage_name, key, value);
    }

    /// Append `value` to the array this stage publishes under `key`.
    pub fn publish_item(&self, key: &str, value: Value) {
        self.state.append(&self.stage_name, key, value);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl fmt::Debug for StageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("run_id", &self.run_id)
            .field("stage_name", &self.stage_name)
            .finish_non_exhaustive()
    }
}

/// A single unit of asynchronous, streaming work.
///
/// Implementations must consume `input.message` at most once, keep arrival
/// order unless they document otherwise, and hold no mutable state shared
/// across runs outside what is passed in.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn config(&self) -> &StageConfig;

    fn name(&self) -> &str {
        &self.config().name
    }

    /// Build the lazy output stream for one run.
    async fn run(
        &self,
        input: StageInput<Self::Input>,
        ctx: StageContext,
    ) -> PipelineResult<ItemStream<Self::Output>>;

    /// Called by the pipeline before [`Stage::run`].
    fn before_run(&self, ctx: &StageContext) {
        ctx.log("started", json!({ "stage": self.name() }));
    }

    /// Called by the pipeline once the stage task has terminated.
    fn after_run(&self, ctx: &StageContext, status: StageStatus) {
        ctx.log("finished", json!({ "stage": self.name(), "status": status }));
    }
}
