use ragline_foundation::stages::{GenerationStage, GraphSearchStage, QueryTransformStage, VectorSearchStage};
use ragline_foundation::{FusionStage, Pipeline, RagPipeline, RunOptions, SearchPipeline};
use ragline_kernel::config::FusionConfig;
use ragline_kernel::run::PipelineType;
use ragline_kernel::stream;
use ragline_kernel::types::{GenerationConfig, RankedItem, Role, SearchRequest, SearchSettings};
use ragline_testing::{
    MockCompletion, MockEmbedder, MockGraphStore, MockVectorStore, ScriptedSearch, assert_ids,
    init_tracing,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const QUESTION: &str = "what is the capital of France?";

fn hit(id: &str, score: f32) -> RankedItem {
    RankedItem::new(id, format!("text of {id}"), score)
}

fn settings(limit: usize) -> SearchSettings {
    SearchSettings {
        limit,
        ..SearchSettings::default()
    }
}

fn expansion(answer: &str) -> Pipeline<String, String> {
    let model = Arc::new(MockCompletion::scripted([answer], ""));
    Pipeline::new("expand", PipelineType::Other)
        .then(QueryTransformStage::new("query_transform", model, 3))
        .unwrap()
}

fn fused(search: ScriptedSearch, fusion: FusionConfig, expand: Option<&str>) -> Pipeline<SearchRequest, RankedItem> {
    let inner = Pipeline::new("variant_search", PipelineType::Search)
        .then(search)
        .unwrap();
    let mut stage = FusionStage::new("fusion", inner, fusion);
    if let Some(answer) = expand {
        stage = stage.with_expansion(expansion(answer));
    }
    Pipeline::new("fused_search", PipelineType::Search)
        .then(stage)
        .unwrap()
}

#[tokio::test]
async fn item_ranked_first_in_two_of_three_lists() {
    init_tracing();
    let search = ScriptedSearch::new("scripted")
        .answer("capital of France", vec![hit("A", 0.9), hit("B", 0.8)])
        .answer("French capital", vec![hit("A", 0.7), hit("C", 0.6)])
        .answer("Paris facts", vec![hit("D", 0.5)]);
    let pipeline = fused(
        search,
        FusionConfig::default(),
        Some("1. capital of France\n2. French capital\n3. Paris facts"),
    );

    let results = pipeline
        .run_to_end(
            stream::once(SearchRequest::new(QUESTION, settings(10))),
            RunOptions::new(),
        )
        .await
        .unwrap()
        .into_inner();

    assert_eq!(results[0].id, "A");
    assert!((results[0].score - 2.0 / 61.0).abs() < 1e-6);
    assert!((results[0].score - 0.03279).abs() < 1e-5);
    assert_eq!(
        results[0].metadata["associated_queries"],
        json!(["capital of France", "French capital"])
    );
    // B, C and D are each ranked once, B and C at 2 and D at 1
    assert_ids!(results, ["A", "D", "B", "C"]);
}

#[tokio::test]
async fn fused_results_respect_the_limit() {
    let variants = ["first variant", "second variant", "third variant"];
    let mut search = ScriptedSearch::new("scripted");
    for (v, query) in variants.iter().enumerate() {
        let hits = (0..20).map(|i| hit(&format!("{v}-{i}"), 1.0)).collect();
        search = search.answer(*query, hits);
    }
    let requests = search.requests();
    let fusion = FusionConfig {
        expansion_factor: 3,
        ..FusionConfig::default()
    };
    let answer = variants.join("\n");
    let pipeline = fused(search, fusion, Some(answer.as_str()));

    let results = pipeline
        .run_to_end(
            stream::once(SearchRequest::new(QUESTION, settings(5))),
            RunOptions::new(),
        )
        .await
        .unwrap()
        .into_inner();

    assert!(results.len() <= 5);
    let requests = requests.lock().clone();
    assert_eq!(requests.len(), 3);
    assert!(requests.iter().all(|r| r.settings.limit == 15));
    let mut queries: Vec<_> = requests.iter().map(|r| r.query.as_str()).collect();
    queries.sort_unstable();
    assert_eq!(queries, vec!["first variant", "second variant", "third variant"]);
}

#[tokio::test]
async fn without_rrf_results_pass_through_unchanged() {
    let search = ScriptedSearch::new("scripted").answer(QUESTION, vec![hit("A", 0.9), hit("B", 0.5)]);
    let fusion = FusionConfig {
        use_rrf: false,
        expansion_factor: 1,
        ..FusionConfig::default()
    };
    let pipeline = fused(search, fusion, None);

    let results = pipeline
        .run_to_end(
            stream::once(SearchRequest::new(QUESTION, settings(10))),
            RunOptions::new(),
        )
        .await
        .unwrap()
        .into_inner();

    assert_ids!(results, ["A", "B"]);
    assert_eq!(results[0].score, 0.9);
    assert_eq!(results[1].score, 0.5);
    assert!(results.iter().all(|r| r.associated_query == QUESTION));
}

fn vector_and_graph(vectors: Arc<MockVectorStore>, graph: Arc<MockGraphStore>) -> SearchPipeline {
    SearchPipeline::new()
        .with_vector(
            Pipeline::new("vector", PipelineType::Search)
                .then(VectorSearchStage::new("vector_search", Arc::new(MockEmbedder::new()), vectors))
                .unwrap(),
        )
        .with_graph(
            Pipeline::new("graph", PipelineType::Search)
                .then(GraphSearchStage::new("graph_search", graph))
                .unwrap(),
        )
}

#[tokio::test]
async fn search_joins_enabled_branches_only() {
    let vectors = Arc::new(MockVectorStore::new().with_results(vec![hit("v1", 0.9), hit("v2", 0.4)]));
    let graph = Arc::new(MockGraphStore::new().with_results(vec![hit("g1", 1.0)]));
    let search = vector_and_graph(vectors.clone(), graph);

    let only_vector = tokio::time::timeout(
        Duration::from_secs(5),
        search.run(SearchRequest::new(QUESTION, settings(1)), RunOptions::new()),
    )
    .await
    .expect("search did not finish")
    .unwrap();
    assert_ids!(only_vector.vector_results, ["v1"]);
    assert!(only_vector.graph_results.is_empty());
    assert_eq!(vectors.limits(), vec![1]);

    let both = SearchSettings {
        use_kg_search: true,
        ..settings(10)
    };
    let joined = search
        .run(SearchRequest::new(QUESTION, both), RunOptions::new())
        .await
        .unwrap();
    assert_eq!(joined.len(), 3);
    assert_ids!(joined.graph_results, ["g1"]);
}

#[tokio::test]
async fn rag_answers_from_search_results() {
    let vectors = Arc::new(MockVectorStore::new().with_results(vec![
        RankedItem::new("p1", "Paris is the capital of France.", 0.9),
    ]));
    let graph = Arc::new(MockGraphStore::new().with_results(vec![RankedItem::new(
        "g1",
        "Paris -capital_of-> France",
        1.0,
    )]));
    let model = Arc::new(MockCompletion::new("The capital of France is Paris [1]."));
    let generation = GenerationStage::new(
        "generation",
        model.clone(),
        GenerationConfig {
            stream: true,
            ..GenerationConfig::default()
        },
    );
    let rag = RagPipeline::new(vector_and_graph(vectors, graph), generation).unwrap();

    let request = SearchRequest::new(
        QUESTION,
        SearchSettings {
            use_kg_search: true,
            ..settings(5)
        },
    );
    let completion = rag.run_to_end(request, RunOptions::new()).await.unwrap();
    assert_eq!(completion.content, "The capital of France is Paris [1].");
    assert_eq!(completion.finish_reason.as_deref(), Some("stop"));

    let requests = model.requests();
    assert_eq!(requests.len(), 1);
    let system = &requests[0][0];
    assert_eq!(system.role, Role::System);
    assert!(system.content.contains("[1] Paris is the capital of France."));
    assert!(system.content.contains("[2] Paris -capital_of-> France"));
    assert_eq!(requests[0][1].content, QUESTION);
}
