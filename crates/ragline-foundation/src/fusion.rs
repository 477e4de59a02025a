//! Multi-query search with reciprocal rank fusion.

use crate::pipeline::{Pipeline, RunOptions};
use async_trait::async_trait;
use futures::StreamExt;
use futures::future::try_join_all;
use ragline_kernel::config::FusionConfig;
use ragline_kernel::error::PipelineResult;
use ragline_kernel::run::PipelineType;
use ragline_kernel::stage::{Stage, StageConfig, StageContext, StageInput};
use ragline_kernel::stream::{self, ItemStream};
use ragline_kernel::types::{RankedItem, SearchRequest};
use serde_json::json;
use std::collections::HashMap;
use tracing::debug;

/// Fuse per-query ranked lists with reciprocal rank fusion.
///
/// Each occurrence of an id at 1-based rank `r` contributes `1 / (r + rrf_k)`.
/// Ids are ordered by fused score, ties keeping first appearance, and cut to
/// `limit`. Surviving items carry the fused value as `score`, and
/// `associated_queries` / `rrf_score` in their metadata; `associated_query`
/// is the first query that returned them.
pub fn reciprocal_rank_fusion(
    groups: Vec<(String, Vec<RankedItem>)>,
    rrf_k: u32,
    limit: usize,
) -> Vec<RankedItem> {
    struct Fused {
        item: RankedItem,
        score: f64,
        queries: Vec<String>,
    }

    let mut fused: Vec<Fused> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for (query, items) in groups {
        for (position, item) in items.into_iter().enumerate() {
            let contribution = 1.0 / ((position + 1) as f64 + f64::from(rrf_k));
            match index.get(&item.id) {
                Some(&slot) => {
                    let entry = &mut fused[slot];
                    entry.score += contribution;
                    if !entry.queries.contains(&query) {
                        entry.queries.push(query.clone());
                    }
                }
                None => {
                    index.insert(item.id.clone(), fused.len());
                    fused.push(Fused {
                        item,
                        score: contribution,
                        queries: vec![query.clone()],
                    });
                }
            }
        }
    }

    // sort_by is stable: equal scores keep first-appearance order
    fused.sort_by(|a, b| b.score.total_cmp(&a.score));
    fused.truncate(limit);
    fused
        .into_iter()
        .map(|Fused { mut item, score, queries }| {
            item.score = score as f32;
            item.associated_query = queries.first().cloned().unwrap_or_default();
            item.metadata
                .insert("associated_queries".to_string(), json!(queries));
            item.metadata.insert("rrf_score".to_string(), json!(score));
            item
        })
        .collect()
}

/// Expands each request into query variants, searches them concurrently
/// through an inner pipeline and merges the results.
///
/// With `use_rrf` the per-variant limit is widened by `expansion_factor` and
/// the lists are fused down to the requested limit. Without it every hit is
/// re-emitted in variant order, tagged with its query.
#[derive(Clone)]
pub struct FusionStage {
    config: StageConfig,
    expansion: Option<Pipeline<String, String>>,
    search: Pipeline<SearchRequest, RankedItem>,
    fusion: FusionConfig,
}

impl FusionStage {
    pub fn new(
        name: impl Into<String>,
        search: Pipeline<SearchRequest, RankedItem>,
        fusion: FusionConfig,
    ) -> Self {
        Self {
            config: StageConfig::new(name),
            expansion: None,
            search,
            fusion,
        }
    }

    pub fn with_expansion(mut self, expansion: Pipeline<String, String>) -> Self {
        self.expansion = Some(expansion);
        self
    }

    /// Search one request end to end.
    pub async fn fuse(&self, request: SearchRequest, ctx: &StageContext) -> PipelineResult<Vec<RankedItem>> {
        let variants = self.variants(&request.query, ctx).await?;
        let limit = request.settings.limit;
        let per_variant = if self.fusion.use_rrf {
            limit.saturating_mul(self.fusion.expansion_factor.max(1))
        } else {
            limit
        };
        ctx.publish("query_variants", json!(variants));

        let searches = variants.iter().map(|variant| {
            let search = self.search.clone();
            let variant_request = request.with_query(variant.clone()).with_limit(per_variant);
            let options = RunOptions::within(ctx, PipelineType::Search);
            async move {
                let hits = search
                    .run_to_end(stream::once(variant_request), options)
                    .await?
                    .into_inner();
                let hits = hits
                    .into_iter()
                    .map(|hit| hit.with_query(variant.clone()))
                    .collect::<Vec<_>>();
                PipelineResult::Ok((variant.clone(), hits))
            }
        });
        let groups = try_join_all(searches).await?;
        debug!(
            stage = %ctx.stage_name,
            variants = groups.len(),
            per_variant,
            use_rrf = self.fusion.use_rrf,
            "variant searches finished"
        );

        let results = if self.fusion.use_rrf {
            reciprocal_rank_fusion(groups, self.fusion.rrf_k, limit)
        } else {
            groups.into_iter().flat_map(|(_, hits)| hits).collect()
        };
        ctx.log(
            "fused",
            json!({ "query": request.query, "results": results.len() }),
        );
        Ok(results)
    }

    async fn variants(&self, query: &str, ctx: &StageContext) -> PipelineResult<Vec<String>> {
        let Some(expansion) = &self.expansion else {
            return Ok(vec![query.to_string()]);
        };
        let options = RunOptions::within(ctx, PipelineType::Other).with_run_state(ctx.state.clone());
        let expanded = expansion
            .run_to_end(stream::once(query.to_string()), options)
            .await?
            .into_inner();

        let mut variants: Vec<String> = Vec::with_capacity(expanded.len());
        for variant in expanded {
            let variant = variant.trim();
            if !variant.is_empty() && !variants.iter().any(|v| v == variant) {
                variants.push(variant.to_string());
            }
        }
        if variants.is_empty() {
            variants.push(query.to_string());
        }
        Ok(variants)
    }
}

#[async_trait]
impl Stage for FusionStage {
    type Input = SearchRequest;
    type Output = RankedItem;

    fn config(&self) -> &StageConfig {
        &self.config
    }

    async fn run(
        &self,
        input: StageInput<SearchRequest>,
        ctx: StageContext,
    ) -> PipelineResult<ItemStream<RankedItem>> {
        let stage = self.clone();
        let output = input
            .message
            .then(move |request| {
                let stage = stage.clone();
                let ctx = ctx.clone();
                async move {
                    let results = stage.fuse(request?, &ctx).await;
                    let items: Vec<PipelineResult<RankedItem>> = match results {
                        Ok(results) => results.into_iter().map(Ok).collect(),
                        Err(error) => vec![Err(error)],
                    };
                    PipelineResult::Ok(futures::stream::iter(items))
                }
            })
            .flat_map(|batch| match batch {
                Ok(items) => stream::boxed(items),
                Err(error) => stream::failed(error),
            });
        Ok(stream::boxed(output))
    }
}
