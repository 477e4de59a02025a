//! Pipeline composition and execution
//!
//! A [`Pipeline`] is an ordered list of stages. Adding a stage composes it
//! onto the previous output type, so a `Pipeline<I, O>` always maps a stream
//! of `I` to a stream of `O`.
//!
//! At run time every stage is spawned as its own cancellable task that
//! forwards its output into a bounded channel; the receiving end becomes the
//! next stage's input. Each task also publishes a completion handle under its
//! stage name so that stages declaring a [`CrossReference`] can wait for the
//! producer before reading its published field from the [`RunState`].
//!
//! # Cross references
//!
//! A stage with references first drains its whole primary input, then
//! resolves its references starting with the latest producer in pipeline
//! order, then receives the drained items replayed as a fresh stream. Every
//! producer it waits on is upstream of its input, so the drain guarantees
//! that producer has finished and the wait cannot deadlock. References expose
//! only the producer's published field, never its raw item stream.

use crate::run_manager::{RunGuard, RunManager, outcome_for};
use dashmap::DashMap;
use futures::stream::{Stream, StreamExt};
use ragline_kernel::error::{PipelineError, PipelineResult};
use ragline_kernel::run::{NoopRunLogSink, PipelineType, RunHandle, RunLogSink, RunOutcome};
use ragline_kernel::stage::{CrossReference, Stage, StageContext, StageInput, StageStatus};
use ragline_kernel::state::RunState;
use ragline_kernel::stream::{self, ItemStream, Materialized};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, warn};
use uuid::Uuid;

/// Default capacity of the channel between two stages.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

type SpawnFn<I, O> = Arc<dyn Fn(ItemStream<I>, &Arc<RunScope>) -> ItemStream<O> + Send + Sync>;

#[derive(Debug, Clone)]
struct StageEntry {
    name: String,
    references: Vec<CrossReference>,
}

/// Ordered composition of stages mapping a stream of `I` to a stream of `O`.
pub struct Pipeline<I, O> {
    name: String,
    pipeline_type: PipelineType,
    channel_capacity: usize,
    stages: Vec<StageEntry>,
    spawn: SpawnFn<I, O>,
}

impl<I, O> Clone for Pipeline<I, O> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            pipeline_type: self.pipeline_type,
            channel_capacity: self.channel_capacity,
            stages: self.stages.clone(),
            spawn: Arc::clone(&self.spawn),
        }
    }
}

impl<I, O> fmt::Debug for Pipeline<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("pipeline_type", &self.pipeline_type)
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl<I: Send + 'static> Pipeline<I, I> {
    /// Create an empty pipeline. Running it forwards its input unchanged.
    pub fn new(name: impl Into<String>, pipeline_type: PipelineType) -> Self {
        Self {
            name: name.into(),
            pipeline_type,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            stages: Vec::new(),
            spawn: Arc::new(|input: ItemStream<I>, _scope: &Arc<RunScope>| input),
        }
    }
}

impl<I, O> Pipeline<I, O> {
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pipeline_type(&self) -> PipelineType {
        self.pipeline_type
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn references_of(&self, stage: &str) -> Option<&[CrossReference]> {
        self.stages
            .iter()
            .find(|s| s.name == stage)
            .map(|s| s.references.as_slice())
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    fn position(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == stage)
    }
}

impl<I, O> Pipeline<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{

    /// Append `stage` with its declared cross references.
    ///
    /// Fails synchronously when the stage name is empty or already taken,
    /// when a reference field is empty, or when a reference targets a stage
    /// that is not already in this pipeline.
    pub fn add_stage<S>(
        mut self,
        stage: S,
        references: Vec<CrossReference>,
    ) -> PipelineResult<Pipeline<I, S::Output>>
    where
        S: Stage<Input = O>,
    {
        let name = stage.name().to_string();
        if name.trim().is_empty() {
            return Err(PipelineError::Configuration(format!(
                "pipeline '{}': stage name must not be empty",
                self.name
            )));
        }
        if self.position(&name).is_some() {
            return Err(PipelineError::DuplicateStage(name));
        }
        for reference in &references {
            if reference.input_field.is_empty() || reference.prev_output_field.is_empty() {
                return Err(PipelineError::Configuration(format!(
                    "stage '{name}': cross reference to '{}' has an empty field name",
                    reference.prev_stage_name
                )));
            }
            if self.position(&reference.prev_stage_name).is_none() {
                return Err(PipelineError::UnknownReference {
                    stage: name,
                    target: reference.prev_stage_name.clone(),
                });
            }
        }

        let mut ordered = references.clone();
        ordered.sort_by_key(|r| Reverse(self.position(&r.prev_stage_name)));
        let ordered = Arc::new(ordered);
        let stage = Arc::new(stage);
        let upstream = self.spawn;
        let spawn: SpawnFn<I, S::Output> = Arc::new(move |input: ItemStream<I>, scope: &Arc<RunScope>| {
            let input = upstream(input, scope);
            scope.spawn_stage(Arc::clone(&stage), input, Arc::clone(&ordered))
        });

        self.stages.push(StageEntry { name, references });
        Ok(Pipeline {
            name: self.name,
            pipeline_type: self.pipeline_type,
            channel_capacity: self.channel_capacity,
            stages: self.stages,
            spawn,
        })
    }

    /// Append `stage` with no cross references.
    pub fn then<S>(self, stage: S) -> PipelineResult<Pipeline<I, S::Output>>
    where
        S: Stage<Input = O>,
    {
        self.add_stage(stage, Vec::new())
    }

    /// Start a run and return the live output stream.
    pub async fn run(
        &self,
        input: ItemStream<I>,
        options: RunOptions,
    ) -> PipelineResult<RunStream<O>> {
        let (output, control) = self.launch(input, options, None);
        Ok(RunStream::new(output, control))
    }

    /// Run to completion and return every output item in order.
    pub async fn run_to_end(
        &self,
        input: ItemStream<I>,
        options: RunOptions,
    ) -> PipelineResult<Materialized<O>> {
        self.run(input, options).await?.materialize().await
    }

    /// Start a run whose lifecycle is owned by an already acquired guard.
    pub(crate) fn run_guarded(
        &self,
        input: ItemStream<I>,
        options: RunOptions,
        guard: RunGuard,
    ) -> RunStream<O> {
        let (output, control) = self.launch(input, options, Some(guard));
        RunStream::new(output, control)
    }

    fn launch(
        &self,
        input: ItemStream<I>,
        options: RunOptions,
        guard: Option<RunGuard>,
    ) -> (ItemStream<O>, RunControl) {
        let RunOptions {
            run_state,
            run_manager,
            run_handle,
            cancel,
            sink,
        } = options;

        let (handle, guard) = match (guard, run_handle, &run_manager) {
            (Some(guard), _, _) => (guard.handle(), Some(guard)),
            (None, Some(handle), _) => (handle, None),
            (None, None, Some(manager)) => {
                let guard = manager.start_run(self.pipeline_type);
                (guard.handle(), Some(guard))
            }
            (None, None, None) => (RunHandle::new(self.pipeline_type), None),
        };
        let sink = sink
            .or_else(|| run_manager.as_ref().map(RunManager::sink))
            .unwrap_or_else(|| Arc::new(NoopRunLogSink));
        let cancel = cancel.map(|c| c.child_token()).unwrap_or_default();

        let scope = Arc::new(RunScope::new(
            handle.run_id,
            run_state.unwrap_or_default(),
            sink,
            cancel,
            self.channel_capacity,
        ));
        debug!(
            pipeline = %self.name,
            run_id = %handle.run_id,
            stages = self.stages.len(),
            "starting pipeline run"
        );
        let output = (self.spawn)(input, &scope);
        scope.tracker.close();

        let control = RunControl {
            pipeline: self.name.clone(),
            handle,
            guard,
            scope,
        };
        (output, control)
    }
}

impl<I, T> Pipeline<I, ItemStream<T>>
where
    I: Send + 'static,
    T: Send + 'static,
{
    /// Run to completion, draining each output item's nested stream in order.
    pub async fn run_flattened(
        &self,
        input: ItemStream<I>,
        options: RunOptions,
    ) -> PipelineResult<Materialized<T>> {
        let (output, control) = self.launch(input, options, None);
        let flat = output.flat_map(|item| match item {
            Ok(inner) => inner,
            Err(error) => stream::failed(error),
        });
        RunStream::new(stream::boxed(flat), control)
            .materialize()
            .await
    }
}

// ============================================================================
// Run options
// ============================================================================

/// Per-run collaborators.
///
/// All fields are optional. A run with a `run_manager` and no `run_handle`
/// is a top-level run: it acquires its own handle and ends it. Passing a
/// `run_handle` makes the run nested inside an existing one; the owner of
/// that handle records its end.
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Shared state to use instead of a fresh one
    pub run_state: Option<Arc<RunState>>,
    pub run_manager: Option<RunManager>,
    pub run_handle: Option<RunHandle>,
    /// Parent cancellation; the run uses a child token of it
    pub cancel: Option<CancellationToken>,
    /// Run-log sink; defaults to the run manager's sink
    pub sink: Option<Arc<dyn RunLogSink>>,
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("run_handle", &self.run_handle)
            .field("has_run_state", &self.run_state.is_some())
            .field("has_run_manager", &self.run_manager.is_some())
            .finish_non_exhaustive()
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for a run nested in `handle`, sharing its cancellation and sink.
    pub fn nested(
        handle: RunHandle,
        cancel: CancellationToken,
        sink: Arc<dyn RunLogSink>,
    ) -> Self {
        Self {
            run_handle: Some(handle),
            cancel: Some(cancel),
            sink: Some(sink),
            ..Self::default()
        }
    }

    /// Options for a run nested in the run a stage is executing in.
    pub fn within(ctx: &StageContext, pipeline_type: PipelineType) -> Self {
        let handle = RunHandle {
            run_id: ctx.run_id,
            pipeline_type,
        };
        Self::nested(handle, ctx.cancel.clone(), Arc::clone(&ctx.sink))
    }

    pub fn with_run_state(mut self, state: Arc<RunState>) -> Self {
        self.run_state = Some(state);
        self
    }

    pub fn with_run_manager(mut self, manager: RunManager) -> Self {
        self.run_manager = Some(manager);
        self
    }

    pub fn with_run_handle(mut self, handle: RunHandle) -> Self {
        self.run_handle = Some(handle);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn RunLogSink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

// ============================================================================
// Run scope and stage driver
// ============================================================================

/// Everything the stage tasks of one run share.
pub(crate) struct RunScope {
    pub(crate) run_id: Uuid,
    pub(crate) state: Arc<RunState>,
    pub(crate) sink: Arc<dyn RunLogSink>,
    pub(crate) cancel: CancellationToken,
    pub(crate) tracker: TaskTracker,
    channel_capacity: usize,
    completions: DashMap<String, watch::Receiver<StageStatus>>,
}

impl RunScope {
    pub(crate) fn new(
        run_id: Uuid,
        state: Arc<RunState>,
        sink: Arc<dyn RunLogSink>,
        cancel: CancellationToken,
        channel_capacity: usize,
    ) -> Self {
        Self {
            run_id,
            state,
            sink,
            cancel,
            tracker: TaskTracker::new(),
            channel_capacity: channel_capacity.max(1),
            completions: DashMap::new(),
        }
    }

    fn spawn_stage<S: Stage>(
        self: &Arc<Self>,
        stage: Arc<S>,
        input: ItemStream<S::Input>,
        references: Arc<Vec<CrossReference>>,
    ) -> ItemStream<S::Output> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let (done_tx, done_rx) = watch::channel(StageStatus::Pending);
        self.completions.insert(stage.name().to_string(), done_rx);

        let ctx = StageContext::new(
            self.run_id,
            stage.name(),
            Arc::clone(&self.state),
            Arc::clone(&self.sink),
            self.cancel.clone(),
        );
        let span = tracing::info_span!("ragline.stage", stage = %stage.name(), run_id = %self.run_id);
        let scope = Arc::clone(self);
        self.tracker.spawn(
            async move {
                drive_stage(stage.as_ref(), input, &references, ctx, &scope, tx, done_tx).await;
            }
            .instrument(span),
        );
        Box::pin(ReceiverStream::new(rx))
    }

    /// Wait until `stage` has terminated and return its final status.
    async fn wait_for(&self, stage: &str) -> Option<StageStatus> {
        let mut rx = self.completions.get(stage).map(|entry| entry.value().clone())?;
        let status = match rx.wait_for(StageStatus::is_terminal).await {
            Ok(status) => *status,
            // driver dropped without reporting: the task was torn down
            Err(_) => StageStatus::Cancelled,
        };
        Some(status)
    }
}

async fn drive_stage<S: Stage>(
    stage: &S,
    input: ItemStream<S::Input>,
    references: &[CrossReference],
    ctx: StageContext,
    scope: &RunScope,
    tx: mpsc::Sender<PipelineResult<S::Output>>,
    done: watch::Sender<StageStatus>,
) {
    stage.before_run(&ctx);
    let cancel = ctx.cancel.clone();
    let status = tokio::select! {
        biased;
        _ = cancel.cancelled() => StageStatus::Cancelled,
        status = forward(stage, input, references, &ctx, scope, &tx) => status,
    };
    done.send_replace(status);
    match status {
        StageStatus::Failed => warn!(stage = %stage.name(), "stage failed"),
        _ => debug!(stage = %stage.name(), ?status, "stage finished"),
    }
    stage.after_run(&ctx, status);
}

async fn forward<S: Stage>(
    stage: &S,
    input: ItemStream<S::Input>,
    references: &[CrossReference],
    ctx: &StageContext,
    scope: &RunScope,
    tx: &mpsc::Sender<PipelineResult<S::Output>>,
) -> StageStatus {
    let input = match resolve_input(input, references, ctx, scope).await {
        Ok(input) => input,
        Err(error) => return send_fatal(tx, error).await,
    };
    let mut output = match stage.run(input, ctx.clone()).await {
        Ok(output) => output,
        Err(error) => return send_fatal(tx, error).await,
    };
    while let Some(item) = output.next().await {
        let fatal = item.is_err();
        if tx.send(item).await.is_err() {
            return StageStatus::Abandoned;
        }
        if fatal {
            return StageStatus::Failed;
        }
    }
    StageStatus::Completed
}

async fn send_fatal<T>(tx: &mpsc::Sender<PipelineResult<T>>, error: PipelineError) -> StageStatus {
    let status = if error.is_cancelled() {
        StageStatus::Cancelled
    } else {
        StageStatus::Failed
    };
    let _ = tx.send(Err(error)).await;
    status
}

async fn resolve_input<T: Send + 'static>(
    input: ItemStream<T>,
    references: &[CrossReference],
    ctx: &StageContext,
    scope: &RunScope,
) -> PipelineResult<StageInput<T>> {
    if references.is_empty() {
        return Ok(StageInput::new(input));
    }

    let buffered = Materialized::collect(input).await?;
    let mut resolved = HashMap::with_capacity(references.len());
    for reference in references {
        let status = scope.wait_for(&reference.prev_stage_name).await;
        match ctx
            .state
            .get(&reference.prev_stage_name, &reference.prev_output_field)
        {
            Some(value) => {
                resolved.insert(reference.input_field.clone(), value);
            }
            None => debug!(
                stage = %ctx.stage_name,
                producer = %reference.prev_stage_name,
                field = %reference.prev_output_field,
                ?status,
                "cross reference not published"
            ),
        }
    }
    Ok(StageInput::with_references(buffered.into_stream(), resolved))
}

// ============================================================================
// RunStream
// ============================================================================

pub(crate) struct RunControl {
    pipeline: String,
    handle: RunHandle,
    guard: Option<RunGuard>,
    scope: Arc<RunScope>,
}

impl RunControl {
    fn end(&mut self, outcome: &RunOutcome) {
        if !matches!(outcome, RunOutcome::Completed) {
            self.scope.cancel.cancel();
        }
        debug!(pipeline = %self.pipeline, run_id = %self.handle.run_id, ?outcome, "pipeline run ended");
        if let Some(mut guard) = self.guard.take() {
            guard.end(outcome.clone());
        }
    }
}

/// Live output of a pipeline run.
///
/// The run ends when the stream is exhausted (completed), when it yields its
/// first error (failed), or when it is cancelled or dropped early
/// (cancelled). Nothing is yielded after cancellation.
pub struct RunStream<O> {
    inner: ItemStream<O>,
    control: RunControl,
    outcome: Option<RunOutcome>,
}

impl<O> fmt::Debug for RunStream<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunStream")
            .field("pipeline", &self.control.pipeline)
            .field("run_id", &self.control.handle.run_id)
            .field("outcome", &self.outcome)
            .finish()
    }
}

impl<O> RunStream<O> {
    pub(crate) fn new(inner: ItemStream<O>, control: RunControl) -> Self {
        Self {
            inner,
            control,
            outcome: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.control.handle.run_id
    }

    pub fn handle(&self) -> RunHandle {
        self.control.handle
    }

    /// The run's shared state.
    pub fn state(&self) -> Arc<RunState> {
        Arc::clone(&self.control.scope.state)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.control.scope.cancel.clone()
    }

    /// How the run ended, once it has.
    pub fn outcome(&self) -> Option<&RunOutcome> {
        self.outcome.as_ref()
    }

    /// Cancel the run. The stream yields nothing afterwards.
    pub fn cancel(&mut self) {
        self.finish(RunOutcome::Cancelled);
    }

    /// Wait until every stage task of this run has terminated.
    ///
    /// Only returns once the stream is exhausted, failed or cancelled. The
    /// returned future does not borrow the stream.
    pub fn terminated(&self) -> impl Future<Output = ()> + Send + 'static {
        let tracker = self.control.scope.tracker.clone();
        async move { tracker.wait().await }
    }

    /// Cancel the run and wait for its stage tasks to terminate.
    pub async fn cancel_and_wait(mut self) {
        self.cancel();
        self.terminated().await;
    }

    /// Drain the stream into an ordered list.
    ///
    /// Returns the first error after every stage task has terminated.
    pub async fn materialize(mut self) -> PipelineResult<Materialized<O>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            match item {
                Ok(item) => items.push(item),
                Err(error) => {
                    self.terminated().await;
                    return Err(error);
                }
            }
        }
        self.terminated().await;
        if matches!(self.outcome, Some(RunOutcome::Cancelled)) {
            return Err(PipelineError::Cancelled);
        }
        Ok(Materialized::new(items))
    }

    fn finish(&mut self, outcome: RunOutcome) {
        if self.outcome.is_none() {
            self.control.end(&outcome);
            self.outcome = Some(outcome);
        }
    }
}

impl<O> Stream for RunStream<O> {
    type Item = PipelineResult<O>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.outcome.is_some() {
            return Poll::Ready(None);
        }
        if this.control.scope.cancel.is_cancelled() {
            this.finish(RunOutcome::Cancelled);
            return Poll::Ready(None);
        }
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(Err(error))) if error.is_cancelled() => {
                this.finish(RunOutcome::Cancelled);
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(error))) => {
                this.finish(outcome_for(&error));
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                let outcome = if this.control.scope.cancel.is_cancelled() {
                    RunOutcome::Cancelled
                } else {
                    RunOutcome::Completed
                };
                this.finish(outcome);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<O> Drop for RunStream<O> {
    fn drop(&mut self) {
        self.finish(RunOutcome::Cancelled);
    }
}
