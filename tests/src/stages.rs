//! Scripted stages for driving pipelines in tests.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use ragline_kernel::error::{PipelineError, PipelineResult};
use ragline_kernel::stage::{Stage, StageConfig, StageContext, StageInput};
use ragline_kernel::stream::{self, ItemStream};
use ragline_kernel::types::{RankedItem, SearchRequest};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Maps every item with `f` and appends each output to the run state under
/// `outputs`.
pub struct FnStage<I, O, F> {
    config: StageConfig,
    f: Arc<F>,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O, F> FnStage<I, O, F>
where
    F: Fn(I) -> O,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            config: StageConfig::new(name),
            f: Arc::new(f),
            _types: PhantomData,
        }
    }
}

#[async_trait]
impl<I, O, F> Stage for FnStage<I, O, F>
where
    I: Send + 'static,
    O: Serialize + Send + 'static,
    F: Fn(I) -> O + Send + Sync + 'static,
{
    type Input = I;
    type Output = O;

    fn config(&self) -> &StageConfig {
        &self.config
    }

    async fn run(&self, input: StageInput<I>, ctx: StageContext) -> PipelineResult<ItemStream<O>> {
        let f = Arc::clone(&self.f);
        Ok(stream::boxed(input.message.map(move |item| {
            item.map(|item| {
                let output = f(item);
                ctx.publish_item("outputs", json!(output));
                output
            })
        })))
    }
}

/// Passes items through, pairing each with the cross references the stage
/// was given.
pub struct CollectReferences<T> {
    config: StageConfig,
    _item: PhantomData<fn(T)>,
}

impl<T> CollectReferences<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: StageConfig::new(name),
            _item: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Stage for CollectReferences<T> {
    type Input = T;
    type Output = (T, HashMap<String, Value>);

    fn config(&self) -> &StageConfig {
        &self.config
    }

    async fn run(
        &self,
        input: StageInput<T>,
        _ctx: StageContext,
    ) -> PipelineResult<ItemStream<(T, HashMap<String, Value>)>> {
        let references = input.references;
        Ok(stream::boxed(
            input
                .message
                .map(move |item| item.map(|item| (item, references.clone()))),
        ))
    }
}

/// Ignores its input and emits `0, 1, 2, ...` every `period`, forever.
///
/// The number of emitted items is shared through [`Ticker::emitted`].
pub struct Ticker<I> {
    config: StageConfig,
    period: Duration,
    emitted: Arc<AtomicU64>,
    _input: PhantomData<fn(I)>,
}

impl<I> Ticker<I> {
    pub fn new(name: impl Into<String>, period: Duration) -> Self {
        Self {
            config: StageConfig::new(name),
            period,
            emitted: Arc::new(AtomicU64::new(0)),
            _input: PhantomData,
        }
    }

    pub fn emitted(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.emitted)
    }
}

#[async_trait]
impl<I: Send + 'static> Stage for Ticker<I> {
    type Input = I;
    type Output = u64;

    fn config(&self) -> &StageConfig {
        &self.config
    }

    async fn run(&self, _input: StageInput<I>, _ctx: StageContext) -> PipelineResult<ItemStream<u64>> {
        let period = self.period;
        let emitted = Arc::clone(&self.emitted);
        let ticks = futures::stream::unfold(0u64, move |n| {
            let emitted = Arc::clone(&emitted);
            async move {
                tokio::time::sleep(period).await;
                emitted.fetch_add(1, Ordering::SeqCst);
                Some((PipelineResult::Ok(n), n + 1))
            }
        });
        Ok(stream::boxed(ticks))
    }
}

/// Passes items through until the `at`-th (1-based), which becomes a fatal
/// stage error.
pub struct FailAt<T> {
    config: StageConfig,
    at: usize,
    _item: PhantomData<fn(T)>,
}

impl<T> FailAt<T> {
    pub fn new(name: impl Into<String>, at: usize) -> Self {
        Self {
            config: StageConfig::new(name),
            at: at.max(1),
            _item: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Stage for FailAt<T> {
    type Input = T;
    type Output = T;

    fn config(&self) -> &StageConfig {
        &self.config
    }

    async fn run(&self, input: StageInput<T>, _ctx: StageContext) -> PipelineResult<ItemStream<T>> {
        let at = self.at;
        let name = self.name().to_string();
        Ok(stream::boxed(input.message.enumerate().map(move |(i, item)| {
            if i + 1 == at {
                Err(PipelineError::stage(name.clone(), "fatal"))
            } else {
                item
            }
        })))
    }
}

/// Passes items through, sleeping `delay` before each one.
///
/// The number of items let through is shared through [`Throttle::seen`].
pub struct Throttle<T> {
    config: StageConfig,
    delay: Duration,
    seen: Arc<AtomicU64>,
    _item: PhantomData<fn(T)>,
}

impl<T> Throttle<T> {
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            config: StageConfig::new(name),
            delay,
            seen: Arc::new(AtomicU64::new(0)),
            _item: PhantomData,
        }
    }

    pub fn seen(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.seen)
    }
}

#[async_trait]
impl<T: Send + 'static> Stage for Throttle<T> {
    type Input = T;
    type Output = T;

    fn config(&self) -> &StageConfig {
        &self.config
    }

    async fn run(&self, input: StageInput<T>, _ctx: StageContext) -> PipelineResult<ItemStream<T>> {
        let delay = self.delay;
        let seen = Arc::clone(&self.seen);
        Ok(stream::boxed(input.message.then(move |item| {
            let seen = Arc::clone(&seen);
            async move {
                tokio::time::sleep(delay).await;
                seen.fetch_add(1, Ordering::SeqCst);
                item
            }
        })))
    }
}

/// Search stage answering each query text from a fixed table.
///
/// Returns at most `settings.limit` hits per request and records every
/// request it receives.
pub struct ScriptedSearch {
    config: StageConfig,
    table: HashMap<String, Vec<RankedItem>>,
    requests: Arc<Mutex<Vec<SearchRequest>>>,
}

impl ScriptedSearch {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: StageConfig::new(name),
            table: HashMap::new(),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn answer(mut self, query: impl Into<String>, hits: Vec<RankedItem>) -> Self {
        self.table.insert(query.into(), hits);
        self
    }

    /// Shared log of every request received.
    pub fn requests(&self) -> Arc<Mutex<Vec<SearchRequest>>> {
        Arc::clone(&self.requests)
    }
}

#[async_trait]
impl Stage for ScriptedSearch {
    type Input = SearchRequest;
    type Output = RankedItem;

    fn config(&self) -> &StageConfig {
        &self.config
    }

    async fn run(
        &self,
        input: StageInput<SearchRequest>,
        _ctx: StageContext,
    ) -> PipelineResult<ItemStream<RankedItem>> {
        let table = self.table.clone();
        let requests = Arc::clone(&self.requests);
        let output = input.message.flat_map(move |request| {
            let hits: Vec<PipelineResult<RankedItem>> = match request {
                Ok(request) => {
                    let hits: Vec<RankedItem> = table
                        .get(&request.query)
                        .map(|hits| hits.iter().take(request.settings.limit).cloned().collect())
                        .unwrap_or_default();
                    requests.lock().push(request);
                    hits.into_iter().map(Ok).collect()
                }
                Err(error) => vec![Err(error)],
            };
            futures::stream::iter(hits)
        });
        Ok(stream::boxed(output))
    }
}
