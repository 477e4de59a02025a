//! Contracts of the ragline streaming pipeline engine.
//!
//! The kernel holds what every stage and pipeline agrees on: the error
//! taxonomy, single-consume item streams, the [`stage::Stage`] trait, per-run
//! shared state, run-log types, provider traits and engine configuration.
//! The engine itself lives in `ragline-foundation`.

// config module
pub mod config;

// error module
pub mod error;
pub use error::{ItemFailure, KernelError, KernelResult, PipelineError, PipelineResult};

// provider traits
pub mod provider;

// run identity and run log
pub mod run;
pub use run::{NoopRunLogSink, PipelineType, RunHandle, RunLogEntry, RunLogSink, RunOutcome};

// stage contract
pub mod stage;
pub use stage::{CrossReference, Stage, StageConfig, StageContext, StageInput, StageStatus};

// shared run state
pub mod state;
pub use state::RunState;

// streams
pub mod stream;
pub use stream::{ItemStream, Materialized};

// domain types
pub mod types;
pub use types::{DocumentScoped, Processed};
