//! Engine configuration
//!
//! [`EngineConfig`] sizes every bounded resource of the engine: stage
//! channels, branch queues, the run-log buffer, provider concurrency and
//! retry budgets. All sections default sensibly, so a config file only has
//! to name what it changes.
//!
//! With the `config` feature (default) the [`loader`] functions read it from
//! YAML, TOML, JSON, JSON5, INI or RON files with `${VAR}` substitution.

use crate::error::{PipelineError, PipelineResult};
use crate::types::SearchSettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(feature = "config")]
pub mod loader;

#[cfg(feature = "config")]
pub use loader::{
    ConfigError, ConfigResult, FileFormat, detect_format, from_str, load_config,
    load_engine_config, load_merged, load_with_env, merge_configs, substitute_env_vars,
};


/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of the channel between two consecutive stages
    pub stage_channel_capacity: usize,
    /// Capacity of each branch queue of a fan-out
    pub branch_queue_capacity: usize,
    /// Capacity of the run-log channel; entries beyond it are dropped
    pub log_buffer: usize,
    pub embedding: EmbeddingConfig,
    pub storage: StorageConfig,
    pub extraction: ExtractionConfig,
    pub retry: RetryConfig,
    pub fusion: FusionConfig,
    pub search: SearchConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stage_channel_capacity: 64,
            branch_queue_capacity: 32,
            log_buffer: 1024,
            embedding: EmbeddingConfig::default(),
            storage: StorageConfig::default(),
            extraction: ExtractionConfig::default(),
            retry: RetryConfig::default(),
            fusion: FusionConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Reject values that would stall or disable the engine.
    pub fn validate(&self) -> PipelineResult<()> {
        let positive = [
            ("stage_channel_capacity", self.stage_channel_capacity),
            ("branch_queue_capacity", self.branch_queue_capacity),
            ("log_buffer", self.log_buffer),
            ("embedding.batch_size", self.embedding.batch_size),
            ("embedding.max_concurrency", self.embedding.max_concurrency),
            ("storage.batch_size", self.storage.batch_size),
            ("extraction.max_concurrency", self.extraction.max_concurrency),
            ("fusion.expansion_factor", self.fusion.expansion_factor),
            ("fusion.num_variants", self.fusion.num_variants),
            ("search.limit", self.search.limit),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(PipelineError::Configuration(format!(
                "{field} must be greater than zero"
            )));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(PipelineError::Configuration(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        Ok(())
    }
}

/// Embedding stage sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Fragments per provider call
    pub batch_size: usize,
    /// Outstanding provider calls, shared by every run using the stage
    pub max_concurrency: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Fragments per vector-store upsert
    pub batch_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { batch_size: 64 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Outstanding knowledge-extraction calls
    pub max_concurrency: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self { max_concurrency: 4 }
    }
}

/// Retry budget for transient provider failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Multi-query fusion parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Re-rank with reciprocal rank fusion instead of concatenating results
    pub use_rrf: bool,
    /// RRF smoothing constant; larger values flatten the weight of rank
    pub rrf_k: u32,
    /// Multiplier applied to each variant's result limit when fusing
    pub expansion_factor: usize,
    /// Query variants requested from the expansion stage
    pub num_variants: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            use_rrf: true,
            rrf_k: 60,
            expansion_factor: 3,
            num_variants: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Result limit used when a request does not set one
    pub limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self { limit: 10 }
    }
}

impl SearchConfig {
    /// Vector-only search settings with the configured limit.
    pub fn settings(&self) -> SearchSettings {
        SearchSettings {
            limit: self.limit,
            ..SearchSettings::default()
        }
    }
}
