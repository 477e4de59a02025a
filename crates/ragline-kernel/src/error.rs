//! Error types for `ragline-kernel`.
//!
//! Three classes of failure move through a pipeline run:
//!
//! - **item-level** failures, attributable to a single input item (one
//!   malformed document). They travel inline as [`ItemFailure`] values inside
//!   [`crate::types::Processed`] and never end a stream.
//! - **run-fatal** failures ([`PipelineError`] yielded as an `Err` item). The
//!   first one ends the stream and aborts the run.
//! - **configuration** failures, raised synchronously while a pipeline is
//!   being assembled.
//!
//! [`KernelError`] composes the sub-module errors together with
//! [`error_stack::Report`] for context-carrying propagation outside the
//! streaming hot path (configuration loading).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used by every stage and pipeline operation.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Pipeline error.
///
/// Payloads are plain strings so the error is `Clone`: a fatal upstream error
/// has to be delivered to every branch queue of a fan-out.
#[derive(Debug, Clone, Error, PartialEq)]
#[non_exhaustive]
pub enum PipelineError {
    /// Invalid pipeline or stage configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Two stages registered under the same name
    #[error("Stage '{0}' is already registered in this pipeline")]
    DuplicateStage(String),

    /// A cross reference names a stage that is not an earlier stage
    #[error("Stage '{stage}' references unknown upstream stage '{target}'")]
    UnknownReference { stage: String, target: String },

    /// A document could not be parsed
    #[error("Failed to parse document {document_id}: {message}")]
    Parsing { document_id: String, message: String },

    /// An external provider (embedding, LLM, store) failed
    #[error("Provider '{provider}' error: {message}")]
    Provider {
        provider: String,
        message: String,
        transient: bool,
    },

    /// A retried operation kept failing
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// A stage failed for a reason of its own
    #[error("Stage '{stage}' failed: {message}")]
    Stage { stage: String, message: String },

    /// Shared run state could not be read or written
    #[error("Run state error: {0}")]
    State(String),

    /// (De)serialization of a state value or provider payload failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A branch queue was closed before its end-of-stream marker arrived
    #[error("Upstream of '{0}' closed without an end-of-stream marker")]
    UpstreamClosed(String),

    /// The run was cancelled
    #[error("Pipeline run was cancelled")]
    Cancelled,

    /// A spawned task panicked or was aborted
    #[error("Task failed: {0}")]
    TaskFailed(String),
}

impl PipelineError {
    /// Create a provider error that may succeed on retry.
    pub fn transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            transient: true,
        }
    }

    /// Create a provider error that will not succeed on retry.
    pub fn permanent(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            transient: false,
        }
    }

    /// Create a stage-scoped error.
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Create a parsing error owned by `document_id`.
    pub fn parsing(document_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parsing {
            document_id: document_id.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Provider {
                transient: true,
                ..
            }
        )
    }

    /// The id of the single item this error can be attributed to, if any.
    pub fn item_id(&self) -> Option<&str> {
        match self {
            Self::Parsing { document_id, .. } => Some(document_id),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

/// An item-level failure carried inline in a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    /// Id of the offending input item (usually a document id)
    pub item_id: String,
    /// Rendered error message
    pub error: String,
}

impl ItemFailure {
    pub fn new(item_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            error: error.into(),
        }
    }

    /// Attribute `error` to `item_id`.
    pub fn from_error(item_id: impl Into<String>, error: &PipelineError) -> Self {
        Self::new(item_id, error.to_string())
    }
}

/// Crate-level error type for `ragline-kernel`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KernelError {
    /// An error raised by a pipeline.
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// A configuration-related error (requires the `config` feature).
    #[cfg(feature = "config")]
    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A low-level I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience result alias using [`error_stack::Report`].
pub type KernelResult<T> = Result<T, error_stack::Report<KernelError>>;
