//! Run lifecycle management.
//!
//! The [`RunManager`] issues run ids, keeps track of active runs and records
//! lifecycle entries (`run_started`, `run_completed`, `run_failed`,
//! `run_cancelled`) on its run-log sink. It is constructed explicitly and
//! passed to pipelines; there is no process-wide instance.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ragline_kernel::error::{PipelineError, PipelineResult};
use ragline_kernel::run::{
    NoopRunLogSink, PipelineType, RunHandle, RunLogEntry, RunLogSink, RunOutcome,
};
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bookkeeping for one active run.
#[derive(Debug, Clone)]
pub struct ActiveRun {
    pub handle: RunHandle,
    pub started_at: DateTime<Utc>,
}

struct Inner {
    sink: Arc<dyn RunLogSink>,
    active: DashMap<Uuid, ActiveRun>,
}

/// Issues runs and records their lifecycle. Cheap to clone.
#[derive(Clone)]
pub struct RunManager {
    inner: Arc<Inner>,
}

impl Default for RunManager {
    fn default() -> Self {
        Self::new(Arc::new(NoopRunLogSink))
    }
}

impl std::fmt::Debug for RunManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunManager")
            .field("active_runs", &self.inner.active.len())
            .finish()
    }
}

impl RunManager {
    pub fn new(sink: Arc<dyn RunLogSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                active: DashMap::new(),
            }),
        }
    }

    pub fn sink(&self) -> Arc<dyn RunLogSink> {
        Arc::clone(&self.inner.sink)
    }

    /// Start a run. The returned guard ends it on every exit path.
    pub fn start_run(&self, pipeline_type: PipelineType) -> RunGuard {
        let handle = RunHandle::new(pipeline_type);
        self.inner.active.insert(
            handle.run_id,
            ActiveRun {
                handle,
                started_at: Utc::now(),
            },
        );
        self.log_run_info(
            handle.run_id,
            "run_started",
            json!({ "pipeline_type": pipeline_type }),
        );
        info!(run_id = %handle.run_id, %pipeline_type, "run started");
        RunGuard {
            manager: self.clone(),
            handle,
            ended: false,
        }
    }

    /// Record an arbitrary key/value against a run. Never blocks.
    pub fn log_run_info(&self, run_id: Uuid, key: &str, value: Value) {
        self.inner
            .sink
            .enqueue_log(RunLogEntry::new(run_id, key, value));
    }

    /// End an active run.
    ///
    /// Returns `false` when the run was not active (already ended or never
    /// started here); nothing is recorded in that case.
    pub fn end_run(&self, run_id: Uuid, outcome: RunOutcome) -> bool {
        let Some((_, run)) = self.inner.active.remove(&run_id) else {
            debug!(%run_id, "end_run called for an inactive run");
            return false;
        };
        let elapsed_ms = (Utc::now() - run.started_at).num_milliseconds();
        let mut value = serde_json::to_value(&outcome).unwrap_or(Value::Null);
        if let Value::Object(fields) = &mut value {
            fields.insert("elapsed_ms".to_string(), json!(elapsed_ms));
        }
        self.log_run_info(run_id, outcome.log_key(), value);
        match &outcome {
            RunOutcome::Completed => info!(%run_id, elapsed_ms, "run completed"),
            RunOutcome::Failed { error } => warn!(%run_id, elapsed_ms, "run failed: {error}"),
            RunOutcome::Cancelled => info!(%run_id, elapsed_ms, "run cancelled"),
        }
        true
    }

    pub fn is_active(&self, run_id: Uuid) -> bool {
        self.inner.active.contains_key(&run_id)
    }

    pub fn active_runs(&self) -> Vec<ActiveRun> {
        self.inner
            .active
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Run `f` inside a run, ending it according to the result.
    ///
    /// If the returned future is dropped before completion the run is ended
    /// as cancelled.
    pub async fn scoped<F, Fut, T>(&self, pipeline_type: PipelineType, f: F) -> PipelineResult<T>
    where
        F: FnOnce(RunHandle) -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        let guard = self.start_run(pipeline_type);
        let result = f(guard.handle()).await;
        match &result {
            Ok(_) => guard.finish(),
            Err(e) => guard.fail(e),
        }
        result
    }
}

/// Scoped ownership of an active run.
///
/// Dropping the guard without calling [`finish`](Self::finish) or
/// [`fail`](Self::fail) ends the run as cancelled.
#[must_use = "dropping a RunGuard ends the run as cancelled"]
pub struct RunGuard {
    manager: RunManager,
    handle: RunHandle,
    ended: bool,
}

impl RunGuard {
    pub fn handle(&self) -> RunHandle {
        self.handle
    }

    pub fn run_id(&self) -> Uuid {
        self.handle.run_id
    }

    pub fn manager(&self) -> &RunManager {
        &self.manager
    }

    pub fn finish(mut self) {
        self.end(RunOutcome::Completed);
    }

    /// End the run as failed, or as cancelled for [`PipelineError::Cancelled`].
    pub fn fail(mut self, error: &PipelineError) {
        self.end(outcome_for(error));
    }

    pub fn cancel(mut self) {
        self.end(RunOutcome::Cancelled);
    }

    pub(crate) fn end(&mut self, outcome: RunOutcome) {
        if !self.ended {
            self.ended = true;
            self.manager.end_run(self.handle.run_id, outcome);
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.end(RunOutcome::Cancelled);
    }
}

pub(crate) fn outcome_for(error: &PipelineError) -> RunOutcome {
    if error.is_cancelled() {
        RunOutcome::Cancelled
    } else {
        RunOutcome::Failed {
            error: error.to_string(),
        }
    }
}
