//! Single-consume item streams and their explicit replay buffer.
//!
//! Stages never receive an in-memory collection: they get an [`ItemStream`],
//! which can be consumed exactly once, in order. When something needs to look
//! at the same items twice it has to materialize them first with
//! [`Materialized::collect`] and replay them through
//! [`Materialized::into_stream`].

use crate::error::{PipelineError, PipelineResult};
use futures::stream::{self, Stream, StreamExt};
use std::pin::Pin;

/// Type-erased, single-consume stream of pipeline items.
///
/// An `Err` item is run-fatal: producers stop after yielding one and
/// consumers must not expect further items.
pub type ItemStream<T> = Pin<Box<dyn Stream<Item = PipelineResult<T>> + Send>>;

/// Box any compatible stream into an [`ItemStream`].
pub fn boxed<T, S>(stream: S) -> ItemStream<T>
where
    S: Stream<Item = PipelineResult<T>> + Send + 'static,
{
    Box::pin(stream)
}

/// Stream that yields exactly one item.
pub fn once<T: Send + 'static>(item: T) -> ItemStream<T> {
    Box::pin(stream::once(async move { Ok(item) }))
}

/// Stream over an owned collection of items.
pub fn from_iter<T, I>(items: I) -> ItemStream<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = T>,
    I::IntoIter: Send + 'static,
{
    Box::pin(stream::iter(items.into_iter().map(Ok)))
}

/// Stream that fails immediately with `error`.
pub fn failed<T: Send + 'static>(error: PipelineError) -> ItemStream<T> {
    Box::pin(stream::once(async move { Err(error) }))
}

/// Empty stream.
pub fn empty<T: Send + 'static>() -> ItemStream<T> {
    Box::pin(stream::empty())
}

/// Replay a materialized list as a fresh stream.
pub fn to_stream<T: Send + 'static>(items: Materialized<T>) -> ItemStream<T> {
    items.into_stream()
}

/// Ordered, fully drained copy of a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Materialized<T> {
    items: Vec<T>,
}

impl<T> Materialized<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self { items }
    }

    /// Drain `stream` in order.
    ///
    /// Stops at, and returns, the first fatal error.
    pub async fn collect(mut stream: ItemStream<T>) -> PipelineResult<Self> {
        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item?);
        }
        Ok(Self { items })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn into_inner(self) -> Vec<T> {
        self.items
    }

    /// Replay the items as a fresh single-consume stream.
    pub fn into_stream(self) -> ItemStream<T>
    where
        T: Send + 'static,
    {
        from_iter(self.items)
    }
}

impl<T> Default for Materialized<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> IntoIterator for Materialized<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<T> From<Vec<T>> for Materialized<T> {
    fn from(items: Vec<T>) -> Self {
        Self { items }
    }
}
