//! Concrete RAG stages.
//!
//! Ingestion stages work on [`Processed`] items: failures and skips recorded
//! upstream are passed through untouched, and errors a stage can pin on one
//! document become [`Processed::Failed`] instead of ending the run.

use futures::future::{self, Either};
use futures::StreamExt;
use ragline_kernel::error::{ItemFailure, PipelineError, PipelineResult};
use ragline_kernel::stream::{self, ItemStream};
use ragline_kernel::types::{DocumentScoped, Processed};
use std::future::Future;
use tracing::warn;

pub mod chunking;
pub mod embedding;
pub mod generation;
pub mod kg;
pub mod parsing;
pub mod query_transform;
pub mod search;
pub mod storage;

pub use chunking::{ChunkConfig, ChunkingStage, TextChunker};
pub use embedding::EmbeddingStage;
pub use generation::GenerationStage;
pub use kg::{KgExtractionStage, KgStorageStage};
pub use parsing::ParsingStage;
pub use query_transform::QueryTransformStage;
pub use search::{GraphSearchStage, VectorSearchStage};
pub use storage::VectorStorageStage;

/// Whether an ingestion stage reports `error` against the items it was
/// processing rather than failing the run.
///
/// Provider rejections and exhausted retries concern the request that carried
/// those items; configuration, cancellation and engine errors do not.
pub(crate) fn is_item_level(error: &PipelineError) -> bool {
    matches!(
        error,
        PipelineError::Parsing { .. }
            | PipelineError::Provider { .. }
            | PipelineError::RetriesExhausted { .. }
    )
}

/// Run `f` once over the successful items of `batch`.
///
/// Failed and skipped items keep their position. When `f` fails with an
/// item-level error every item it was given becomes a failure of its
/// document; any other error ends the batch. A fatal error inside `batch`
/// ends it at that point.
pub(crate) async fn process_batch<T, U, F, Fut>(
    stage: &str,
    batch: Vec<PipelineResult<Processed<T>>>,
    f: F,
) -> Vec<PipelineResult<Processed<U>>>
where
    T: DocumentScoped,
    F: FnOnce(Vec<T>) -> Fut,
    Fut: Future<Output = PipelineResult<Vec<U>>>,
{
    let mut slots: Vec<Option<PipelineResult<Processed<U>>>> = Vec::with_capacity(batch.len());
    let mut pending: Vec<(usize, String)> = Vec::new();
    let mut items = Vec::new();
    let mut fatal = None;
    for item in batch {
        match item.map(Processed::pass_through) {
            Ok(Ok(other)) => slots.push(Some(Ok(other))),
            Ok(Err(item)) => {
                pending.push((slots.len(), item.document_id().to_string()));
                items.push(item);
                slots.push(None);
            }
            Err(error) => {
                fatal = Some(error);
                break;
            }
        }
    }

    if !items.is_empty() {
        match f(items).await {
            Ok(outputs) if outputs.len() == pending.len() => {
                for ((slot, _), output) in pending.iter().zip(outputs) {
                    slots[*slot] = Some(Ok(Processed::success(output)));
                }
            }
            Ok(outputs) => {
                slots.truncate(pending[0].0);
                fatal = Some(PipelineError::stage(
                    stage,
                    format!("expected {} results, got {}", pending.len(), outputs.len()),
                ));
            }
            Err(error) if is_item_level(&error) => {
                warn!(stage, items = pending.len(), %error, "batch failed");
                for (slot, document_id) in &pending {
                    let failure = ItemFailure::from_error(document_id.clone(), &error);
                    slots[*slot] = Some(Ok(Processed::failed(failure)));
                }
            }
            Err(error) => {
                slots.truncate(pending[0].0);
                fatal = Some(error);
            }
        }
    }

    let mut output: Vec<_> = slots.into_iter().flatten().collect();
    if let Some(error) = fatal {
        output.push(Err(error));
    }
    output
}

/// Apply `f` to every successful item in order, passing failed and skipped
/// items through.
pub(crate) fn map_success<T, U, F, Fut>(
    input: ItemStream<Processed<T>>,
    mut f: F,
) -> ItemStream<Processed<U>>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = PipelineResult<Processed<U>>> + Send + 'static,
{
    let output = input.then(move |item| match item.map(Processed::pass_through) {
        Ok(Ok(other)) => Either::Left(future::ready(Ok(other))),
        Ok(Err(success)) => Either::Right(f(success)),
        Err(error) => Either::Left(future::ready(Err(error))),
    });
    stream::boxed(output)
}
