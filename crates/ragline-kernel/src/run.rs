//! Run identity and the run-log side channel.
//!
//! The kernel only defines the data types and the [`RunLogSink`] trait;
//! the run manager and the channel-backed sink live in `ragline-foundation`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Kind of pipeline a run belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineType {
    Ingestion,
    Search,
    Rag,
    Eval,
    #[default]
    Other,
}

impl fmt::Display for PipelineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ingestion => "ingestion",
            Self::Search => "search",
            Self::Rag => "rag",
            Self::Eval => "eval",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Identity of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunHandle {
    pub run_id: Uuid,
    pub pipeline_type: PipelineType,
}

impl RunHandle {
    /// Create a handle with a fresh, globally unique run id.
    pub fn new(pipeline_type: PipelineType) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            pipeline_type,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed { error: String },
    Cancelled,
}

impl RunOutcome {
    /// Run-log key recorded for this outcome.
    pub fn log_key(&self) -> &'static str {
        match self {
            Self::Completed => "run_completed",
            Self::Failed { .. } => "run_failed",
            Self::Cancelled => "run_cancelled",
        }
    }
}

/// One entry of the run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub run_id: Uuid,
    pub key: String,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
}

impl RunLogEntry {
    pub fn new(run_id: Uuid, key: impl Into<String>, value: Value) -> Self {
        Self {
            run_id,
            key: key.into(),
            value,
            timestamp: Utc::now(),
        }
    }
}

/// Fire-and-forget destination for run-log entries.
///
/// `enqueue_log` must never block: stage failures must not wait on logging
/// I/O. Implementations hand the entry to a background drain.
pub trait RunLogSink: Send + Sync {
    fn enqueue_log(&self, entry: RunLogEntry);
}

/// Sink that discards every entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRunLogSink;

impl RunLogSink for NoopRunLogSink {
    fn enqueue_log(&self, _entry: RunLogEntry) {}
}
