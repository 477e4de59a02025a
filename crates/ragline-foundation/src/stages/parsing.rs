//! Document parsing stage.

use super::is_item_level;
use async_trait::async_trait;
use futures::StreamExt;
use futures::future;
use ragline_kernel::error::{ItemFailure, PipelineResult};
use ragline_kernel::provider::DocumentParser;
use ragline_kernel::stage::{Stage, StageConfig, StageContext, StageInput};
use ragline_kernel::stream::{self, ItemStream};
use ragline_kernel::types::{Document, Extraction, Processed};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

/// Parses raw documents into text extractions.
///
/// Empty documents are skipped. A parse error attributable to the document
/// ends that document's extractions with a [`Processed::Failed`] item; the
/// remaining documents are still parsed.
pub struct ParsingStage {
    config: StageConfig,
    parser: Arc<dyn DocumentParser>,
}

impl ParsingStage {
    pub fn new(name: impl Into<String>, parser: Arc<dyn DocumentParser>) -> Self {
        Self {
            config: StageConfig::new(name),
            parser,
        }
    }
}

#[async_trait]
impl Stage for ParsingStage {
    type Input = Document;
    type Output = Processed<Extraction>;

    fn config(&self) -> &StageConfig {
        &self.config
    }

    async fn run(
        &self,
        input: StageInput<Document>,
        ctx: StageContext,
    ) -> PipelineResult<ItemStream<Processed<Extraction>>> {
        let parser = Arc::clone(&self.parser);
        let output = input.message.then(move |document| {
            let parser = Arc::clone(&parser);
            let ctx = ctx.clone();
            async move {
                let document = document?;
                PipelineResult::Ok(parse_document(parser.as_ref(), document, &ctx).await)
            }
        });
        let output = output.flat_map(|parsed: PipelineResult<ItemStream<Processed<Extraction>>>| {
            match parsed {
                Ok(extractions) => extractions,
                Err(error) => stream::failed(error),
            }
        });
        Ok(stream::boxed(output))
    }
}

async fn parse_document(
    parser: &dyn DocumentParser,
    document: Document,
    ctx: &StageContext,
) -> ItemStream<Processed<Extraction>> {
    let document_id = document.id.clone();
    if document.data.is_empty() {
        ctx.log("skipped", json!({ "document_id": document_id, "reason": "empty document" }));
        return stream::once(Processed::skipped(document_id, "empty document"));
    }

    let extractions = match parser.parse(document).await {
        Ok(extractions) => extractions,
        Err(error) if is_item_level(&error) => {
            warn!(document_id = %document_id, %error, "document failed to parse");
            ctx.log("failed", json!({ "document_id": document_id, "error": error.to_string() }));
            return stream::once(Processed::failed(ItemFailure::from_error(document_id, &error)));
        }
        Err(error) => return stream::failed(error),
    };

    let log_ctx = ctx.clone();
    let output = extractions.scan(false, move |failed, item| {
        if *failed {
            return future::ready(None);
        }
        let item = match item {
            Ok(extraction) => Ok(Processed::success(extraction)),
            Err(error) if is_item_level(&error) => {
                *failed = true;
                log_ctx.log(
                    "failed",
                    json!({ "document_id": document_id, "error": error.to_string() }),
                );
                Ok(Processed::failed(ItemFailure::from_error(
                    document_id.clone(),
                    &error,
                )))
            }
            Err(error) => Err(error),
        };
        future::ready(Some(item))
    });
    stream::boxed(output)
}
