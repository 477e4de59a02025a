//! Streaming pipeline engine for retrieval-augmented generation.
//!
//! Stages from `ragline-kernel` are composed into [`Pipeline`]s whose stages
//! run as concurrent tasks joined by bounded channels. On top of that sit the
//! branching [`IngestionPipeline`] and [`SearchPipeline`], multi-query
//! [`FusionStage`], [`RagPipeline`] and run bookkeeping through [`RunManager`].

// branch module - bounded fan-out queues with end-of-stream markers
pub mod branch;
pub use branch::{BranchMessage, BranchPhase, BranchSender, DEFAULT_QUEUE_CAPACITY, branch_queue};

// fusion module - multi-query search with reciprocal rank fusion
pub mod fusion;
pub use fusion::{FusionStage, reciprocal_rank_fusion};

// ingestion module
pub mod ingestion;
pub use ingestion::{IngestionOutput, IngestionPipeline, IngestionReport, IngestionSettings};

// log sink module - background run-log writer
pub mod log_sink;
pub use log_sink::{ChannelRunLogSink, InMemoryRunLogStore, RunLogStore, TracingRunLogStore};

// pipeline module - linear stage composition
pub mod pipeline;
pub use pipeline::{DEFAULT_CHANNEL_CAPACITY, Pipeline, RunOptions, RunStream};

// rag module
pub mod rag;
pub use rag::RagPipeline;

// retry module
pub mod retry;
pub use retry::{RetryBackoff, RetryPolicy};

// run manager module
pub mod run_manager;
pub use run_manager::{ActiveRun, RunGuard, RunManager};

// search module
pub mod search;
pub use search::{RetrievalStage, SearchPipeline};

// concrete stages
pub mod stages;
