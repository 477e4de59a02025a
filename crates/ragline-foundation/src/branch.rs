//! Fan-out and fan-in for branching pipelines
//!
//! A branching run moves through three phases:
//!
//! ```text
//! Enqueueing -> (branch A running || branch B running) -> Joined
//! ```
//!
//! A producer task copies every upstream item into one bounded queue per
//! active branch and finishes each queue with an [`BranchMessage::End`]
//! sentinel. Each branch is a full [`Pipeline`] run concurrently over its
//! queue. The first fatal error of any branch cancels the others and is
//! returned once every task has terminated.

use crate::pipeline::{Pipeline, RunOptions};
use crate::run_manager::{RunGuard, RunManager, outcome_for};
use futures::StreamExt;
use parking_lot::Mutex;
use ragline_kernel::error::{PipelineError, PipelineResult};
use ragline_kernel::run::{
    NoopRunLogSink, PipelineType, RunHandle, RunLogEntry, RunLogSink, RunOutcome,
};
use ragline_kernel::state::RunState;
use ragline_kernel::stream::{ItemStream, Materialized};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug};

/// Default capacity of each branch queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Message carried by a branch queue.
#[derive(Debug, Clone, PartialEq)]
pub enum BranchMessage<T> {
    Item(PipelineResult<T>),
    /// End-of-stream sentinel
    End,
}

/// Producer half of a branch queue.
#[derive(Debug)]
pub struct BranchSender<T> {
    branch: String,
    tx: mpsc::Sender<BranchMessage<T>>,
}

impl<T> BranchSender<T> {
    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Enqueue an item, waiting while the queue is full.
    ///
    /// Returns `false` once the consuming branch has gone away.
    pub async fn send(&self, item: PipelineResult<T>) -> bool {
        self.tx.send(BranchMessage::Item(item)).await.is_ok()
    }

    /// Enqueue the end-of-stream sentinel.
    pub async fn end(&self) -> bool {
        self.tx.send(BranchMessage::End).await.is_ok()
    }
}

/// Create a bounded branch queue.
///
/// The consumer half is a stream that ends at the sentinel. A queue whose
/// producer goes away without sending the sentinel yields
/// [`PipelineError::UpstreamClosed`].
pub fn branch_queue<T: Send + 'static>(
    branch: impl Into<String>,
    capacity: usize,
) -> (BranchSender<T>, ItemStream<T>) {
    let branch = branch.into();
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let name = branch.clone();
    let stream = futures::stream::unfold(Some(rx), move |rx| {
        let name = name.clone();
        async move {
            let mut rx = rx?;
            match rx.recv().await {
                Some(BranchMessage::Item(Ok(item))) => Some((Ok(item), Some(rx))),
                Some(BranchMessage::Item(Err(error))) => Some((Err(error), None)),
                Some(BranchMessage::End) => None,
                None => Some((Err(PipelineError::UpstreamClosed(name)), None)),
            }
        }
    });
    (BranchSender { branch, tx }, Box::pin(stream))
}

/// Phase of a branching run, recorded in the run log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchPhase {
    Enqueueing,
    Running,
    Joined,
}

/// Lifecycle of one branching run: its handle, cancellation, tasks and the
/// first fatal error seen by any of them.
pub(crate) struct BranchRun {
    pipeline: String,
    handle: RunHandle,
    guard: Option<RunGuard>,
    sink: Arc<dyn RunLogSink>,
    state: Option<Arc<RunState>>,
    cancel: CancellationToken,
    cancel_on_drop: Option<DropGuard>,
    tracker: TaskTracker,
    first_error: Arc<Mutex<Option<PipelineError>>>,
    queue_capacity: usize,
}

impl BranchRun {
    /// Acquire the run described by `options`.
    ///
    /// Top-level runs (a run manager and no handle) are ended by
    /// [`finish`](Self::finish); nested runs leave that to their owner.
    pub(crate) fn start(
        pipeline: &str,
        pipeline_type: PipelineType,
        options: &RunOptions,
        queue_capacity: usize,
    ) -> Self {
        let (handle, guard) = match (options.run_handle, &options.run_manager) {
            (Some(handle), _) => (handle, None),
            (None, Some(manager)) => {
                let guard = manager.start_run(pipeline_type);
                (guard.handle(), Some(guard))
            }
            (None, None) => (RunHandle::new(pipeline_type), None),
        };
        let sink = options
            .sink
            .clone()
            .or_else(|| options.run_manager.as_ref().map(RunManager::sink))
            .unwrap_or_else(|| Arc::new(NoopRunLogSink));
        let cancel = options
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        debug!(pipeline, run_id = %handle.run_id, "starting branching run");

        Self {
            pipeline: pipeline.to_string(),
            handle,
            guard,
            sink,
            state: options.run_state.clone(),
            cancel_on_drop: Some(cancel.clone().drop_guard()),
            cancel,
            tracker: TaskTracker::new(),
            first_error: Arc::new(Mutex::new(None)),
            queue_capacity,
        }
    }

    pub(crate) fn handle(&self) -> RunHandle {
        self.handle
    }

    /// Options for a pipeline run nested in this one, sharing its run state
    /// when the caller supplied one.
    pub(crate) fn nested_options(&self) -> RunOptions {
        let options = RunOptions::nested(self.handle, self.cancel.clone(), Arc::clone(&self.sink));
        match &self.state {
            Some(state) => options.with_run_state(Arc::clone(state)),
            None => options,
        }
    }

    pub(crate) fn log_phase(&self, phase: BranchPhase) {
        debug!(pipeline = %self.pipeline, run_id = %self.handle.run_id, ?phase, "branch phase");
        self.sink.enqueue_log(RunLogEntry::new(
            self.handle.run_id,
            format!("{}.branch_phase", self.pipeline),
            json!(phase),
        ));
    }

    /// Open a queue for `branch` if it is active.
    pub(crate) fn queue<T: Send + 'static>(
        &self,
        branch: &str,
        active: bool,
        senders: &mut Vec<BranchSender<T>>,
    ) -> Option<ItemStream<T>> {
        if !active {
            debug!(pipeline = %self.pipeline, branch, "branch inactive");
            return None;
        }
        let (tx, rx) = branch_queue(format!("{}.{}", self.pipeline, branch), self.queue_capacity);
        senders.push(tx);
        Some(rx)
    }

    /// Spawn the producer copying `upstream` into every branch queue.
    pub(crate) fn fan_out<T>(&self, upstream: ItemStream<T>, senders: Vec<BranchSender<T>>)
    where
        T: Clone + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let first_error = Arc::clone(&self.first_error);
        let span = tracing::info_span!("ragline.fan_out", pipeline = %self.pipeline);
        self.tracker.spawn(
            async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => debug!("fan-out cancelled"),
                    _ = fan_out(upstream, senders, &first_error, &cancel) => {}
                }
            }
            .instrument(span),
        );
    }

    /// Spawn `pipeline` over `input` as a concurrently running branch.
    pub(crate) fn spawn_branch<T, R>(
        &self,
        branch: &str,
        pipeline: &Pipeline<T, R>,
        input: Option<ItemStream<T>>,
    ) -> Option<JoinHandle<PipelineResult<Materialized<R>>>>
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        let input = input?;
        let pipeline = pipeline.clone();
        let options = self.nested_options();
        let cancel = self.cancel.clone();
        let first_error = Arc::clone(&self.first_error);
        let span = tracing::info_span!("ragline.branch", branch = %branch, run_id = %self.handle.run_id);
        Some(
            self.tracker.spawn(
                async move {
                    let result = pipeline.run_to_end(input, options).await;
                    if let Err(error) = &result {
                        record(&first_error, &cancel, error);
                    }
                    result
                }
                .instrument(span),
            ),
        )
    }

    /// Await a branch; an inactive branch joins as `None`.
    pub(crate) async fn join<R>(
        &self,
        handle: Option<JoinHandle<PipelineResult<Materialized<R>>>>,
    ) -> PipelineResult<Option<Vec<R>>> {
        let Some(handle) = handle else {
            return Ok(None);
        };
        match handle.await {
            Ok(result) => result.map(|items| Some(items.into_inner())),
            Err(join_error) => {
                let error = PipelineError::TaskFailed(join_error.to_string());
                record(&self.first_error, &self.cancel, &error);
                Err(error)
            }
        }
    }

    /// The first fatal error recorded by any task of this run.
    pub(crate) fn first_error(&self) -> Option<PipelineError> {
        self.first_error.lock().clone()
    }

    /// Wait for every task, then end the run according to `result`.
    pub(crate) async fn finish<T>(mut self, result: PipelineResult<T>) -> PipelineResult<T> {
        if result.is_err() {
            self.cancel.cancel();
        }
        self.tracker.close();
        self.tracker.wait().await;
        if let Some(guard) = self.cancel_on_drop.take() {
            guard.disarm();
        }

        let outcome = match &result {
            Ok(_) => RunOutcome::Completed,
            Err(error) => outcome_for(error),
        };
        debug!(pipeline = %self.pipeline, run_id = %self.handle.run_id, ?outcome, "branching run ended");
        if let Some(guard) = self.guard.take() {
            match &result {
                Ok(_) => guard.finish(),
                Err(error) => guard.fail(error),
            }
        }
        result
    }
}

fn record(first_error: &Mutex<Option<PipelineError>>, cancel: &CancellationToken, error: &PipelineError) {
    if error.is_cancelled() {
        return;
    }
    first_error.lock().get_or_insert_with(|| error.clone());
    cancel.cancel();
}

async fn fan_out<T: Clone>(
    mut upstream: ItemStream<T>,
    mut senders: Vec<BranchSender<T>>,
    first_error: &Mutex<Option<PipelineError>>,
    cancel: &CancellationToken,
) {
    let had_branches = !senders.is_empty();
    while let Some(item) = upstream.next().await {
        if let Err(error) = &item {
            record(first_error, cancel, error);
        }
        let fatal = item.is_err();

        let mut open = Vec::with_capacity(senders.len());
        for sender in senders {
            if sender.send(item.clone()).await {
                open.push(sender);
            } else {
                debug!(branch = sender.branch(), "branch queue closed");
            }
        }
        senders = open;

        if fatal || (had_branches && senders.is_empty()) {
            return;
        }
    }
    for sender in &senders {
        sender.end().await;
    }
}
