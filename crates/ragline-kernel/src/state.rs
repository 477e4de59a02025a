//! Per-run shared state.
//!
//! A [`RunState`] lives for exactly one pipeline run. Stages publish named
//! outputs under their own stage name; later stages (not necessarily the next
//! one) read them back through declared cross references.

use crate::error::{PipelineError, PipelineResult};
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StateKey {
    stage: String,
    key: String,
}

impl StateKey {
    fn new(stage: &str, key: &str) -> Self {
        Self {
            stage: stage.to_string(),
            key: key.to_string(),
        }
    }
}

/// Key/value store keyed by `(stage_name, key)`.
///
/// Each key is owned by the stage that writes it; a second write to the same
/// key overwrites the first.
#[derive(Debug, Default)]
pub struct RunState {
    values: DashMap<StateKey, Value>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `value` under `(stage, key)`.
    pub fn set(&self, stage: &str, key: &str, value: Value) {
        self.values.insert(StateKey::new(stage, key), value);
    }

    /// Serialize and publish `value` under `(stage, key)`.
    pub fn set_as<T: Serialize>(&self, stage: &str, key: &str, value: &T) -> PipelineResult<()> {
        let value = serde_json::to_value(value)?;
        self.set(stage, key, value);
        Ok(())
    }

    /// Append `value` to the array stored under `(stage, key)`.
    ///
    /// A missing key starts a new array; a non-array value is wrapped into one.
    pub fn append(&self, stage: &str, key: &str, value: Value) {
        let mut entry = self
            .values
            .entry(StateKey::new(stage, key))
            .or_insert_with(|| Value::Array(Vec::new()));
        match entry.value_mut() {
            Value::Array(items) => items.push(value),
            other => {
                let previous = other.take();
                *other = Value::Array(vec![previous, value]);
            }
        }
    }

    pub fn get(&self, stage: &str, key: &str) -> Option<Value> {
        self.values
            .get(&StateKey::new(stage, key))
            .map(|entry| entry.value().clone())
    }

    /// Read and deserialize `(stage, key)`.
    pub fn get_as<T: DeserializeOwned>(&self, stage: &str, key: &str) -> PipelineResult<Option<T>> {
        match self.get(stage, key) {
            Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
                PipelineError::State(format!("cannot decode '{stage}.{key}': {e}"))
            }),
            None => Ok(None),
        }
    }

    pub fn contains(&self, stage: &str, key: &str) -> bool {
        self.values.contains_key(&StateKey::new(stage, key))
    }

    /// Every key published by `stage`.
    pub fn stage_snapshot(&self, stage: &str) -> HashMap<String, Value> {
        self.values
            .iter()
            .filter(|entry| entry.key().stage == stage)
            .map(|entry| (entry.key().key.clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
