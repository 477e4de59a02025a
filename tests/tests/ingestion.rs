use ragline_foundation::stages::{
    ChunkConfig, ChunkingStage, EmbeddingStage, KgExtractionStage, KgStorageStage, ParsingStage,
    VectorStorageStage,
};
use ragline_foundation::{
    ChannelRunLogSink, IngestionPipeline, IngestionSettings, InMemoryRunLogStore, Pipeline,
    RunManager, RunOptions,
};
use ragline_kernel::error::PipelineError;
use ragline_kernel::run::PipelineType;
use ragline_kernel::stream;
use ragline_kernel::types::{Document, Fragment, Processed, StoredFragment, StoredGraph};
use ragline_testing::{
    FailAt, FnStage, MockEmbedder, MockExtractor, MockGraphStore, MockParser, MockVectorStore,
    Throttle, Ticker, init_tracing,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type RagIngestion =
    IngestionPipeline<Document, Processed<Fragment>, Processed<StoredFragment>, Processed<StoredGraph>>;

struct Fixture {
    pipeline: RagIngestion,
    vectors: Arc<MockVectorStore>,
    graph: Arc<MockGraphStore>,
}

fn fixture(parser: MockParser) -> Fixture {
    let vectors = Arc::new(MockVectorStore::new());
    let graph = Arc::new(MockGraphStore::new());
    let upstream = Pipeline::new("prepare", PipelineType::Ingestion)
        .then(ParsingStage::new("parsing", Arc::new(parser)))
        .unwrap()
        .then(ChunkingStage::text("chunking", ChunkConfig::new(200, 0)))
        .unwrap();
    let embedding = Pipeline::new("embed", PipelineType::Ingestion)
        .then(EmbeddingStage::new("embedding", Arc::new(MockEmbedder::new())))
        .unwrap()
        .then(VectorStorageStage::new("vector_storage", vectors.clone()))
        .unwrap();
    let knowledge_graph = Pipeline::new("kg", PipelineType::Ingestion)
        .then(KgExtractionStage::new("kg_extraction", Arc::new(MockExtractor)))
        .unwrap()
        .then(KgStorageStage::new("kg_storage", graph.clone()))
        .unwrap();
    Fixture {
        pipeline: IngestionPipeline::new(upstream)
            .with_embedding(embedding)
            .with_knowledge_graph(knowledge_graph),
        vectors,
        graph,
    }
}

fn documents(n: usize) -> Vec<Document> {
    (1..=n)
        .map(|i| Document::text(format!("doc-{i}"), format!("Document {i} says Paris is in France.")))
        .collect()
}

#[tokio::test]
async fn failing_document_is_isolated() {
    init_tracing();
    let fixture = fixture(MockParser::failing(["doc-3"]));
    let output = fixture
        .pipeline
        .run(
            stream::from_iter(documents(5)),
            IngestionSettings::default(),
            RunOptions::new(),
        )
        .await
        .unwrap();

    let embedded = output.embedding.as_ref().unwrap();
    assert_eq!(embedded.len(), 5);
    assert_eq!(embedded.iter().filter(|p| p.is_success()).count(), 4);
    let failures: Vec<_> = embedded.iter().filter_map(Processed::failure).collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].item_id, "doc-3");

    let graphs = output.knowledge_graph.as_ref().unwrap();
    assert_eq!(graphs.iter().filter(|p| p.is_success()).count(), 4);

    let report = output.report();
    assert_eq!(report.processed, vec!["doc-1", "doc-2", "doc-4", "doc-5"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].item_id, "doc-3");

    assert_eq!(fixture.vectors.entries().len(), 4);
    let upserts = fixture.graph.upserts();
    assert_eq!(upserts.len(), 4);
    assert!(upserts.iter().all(|e| e.entities.len() == 3));
}

#[tokio::test]
async fn disabled_branch_joins_as_none() {
    let fixture = fixture(MockParser::new());
    let settings = IngestionSettings {
        use_embedding: true,
        use_knowledge_graph: false,
    };
    let output = tokio::time::timeout(
        Duration::from_secs(5),
        fixture
            .pipeline
            .run(stream::from_iter(documents(40)), settings, RunOptions::new()),
    )
    .await
    .expect("ingestion did not finish")
    .unwrap();

    assert!(output.knowledge_graph.is_none());
    assert_eq!(output.embedding.unwrap().len(), 40);
    assert!(fixture.graph.upserts().is_empty());
}

#[tokio::test]
async fn run_is_logged_through_the_manager() {
    let store = Arc::new(InMemoryRunLogStore::new());
    let sink = ChannelRunLogSink::spawn(store.clone(), 1024);
    let manager = RunManager::new(sink.clone());
    let fixture = fixture(MockParser::new());

    fixture
        .pipeline
        .run(
            stream::from_iter(documents(2)),
            IngestionSettings::default(),
            RunOptions::new().with_run_manager(manager.clone()),
        )
        .await
        .unwrap();
    assert!(manager.active_runs().is_empty());

    sink.shutdown().await;
    let entries = store.entries();
    let run_id = entries[0].run_id;
    let keys = store.keys_for(run_id);
    assert_eq!(keys[0], "run_started");
    assert!(keys.iter().any(|k| k == "ingestion.branch_phase"));
    assert!(keys.iter().any(|k| k == "embedding.started"));
    assert!(keys.iter().any(|k| k == "kg_storage.finished"));
    assert!(keys.iter().any(|k| k == "run_completed"));
}

#[tokio::test]
async fn cancellation_stops_both_branches() {
    let ticker = Ticker::new("ticker", Duration::from_millis(2));
    let emitted = ticker.emitted();
    let upstream = Pipeline::new("source", PipelineType::Ingestion)
        .then(ticker)
        .unwrap();
    let pipeline: IngestionPipeline<(), u64, u64, u64> = IngestionPipeline::new(upstream)
        .with_embedding(
            Pipeline::new("left", PipelineType::Ingestion)
                .then(FnStage::new("double", |n: u64| n * 2))
                .unwrap(),
        )
        .with_knowledge_graph(
            Pipeline::new("right", PipelineType::Ingestion)
                .then(FnStage::new("inc", |n: u64| n + 1))
                .unwrap(),
        );

    let cancel = CancellationToken::new();
    let options = RunOptions::new().with_cancel(cancel.clone());
    let run = tokio::spawn(async move {
        pipeline
            .run(stream::once(()), IngestionSettings::default(), options)
            .await
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(emitted.load(Ordering::SeqCst) > 0);
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("branches did not terminate")
        .unwrap();
    assert!(matches!(result, Err(PipelineError::Cancelled)));

    tokio::time::sleep(Duration::from_millis(20)).await;
    let settled = emitted.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(emitted.load(Ordering::SeqCst), settled);
}

#[tokio::test]
async fn branch_failure_cancels_its_sibling() {
    let ticker = Ticker::new("ticker", Duration::from_millis(2));
    let emitted = ticker.emitted();
    let slow = Throttle::new("slow", Duration::from_millis(50));
    let seen = slow.seen();
    let upstream = Pipeline::new("source", PipelineType::Ingestion)
        .then(ticker)
        .unwrap();
    let pipeline: IngestionPipeline<(), u64, u64, u64> = IngestionPipeline::new(upstream)
        .with_embedding(
            Pipeline::new("left", PipelineType::Ingestion)
                .then(FailAt::new("boom", 4))
                .unwrap(),
        )
        .with_knowledge_graph(
            Pipeline::new("right", PipelineType::Ingestion)
                .then(slow)
                .unwrap(),
        );

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        pipeline.run(stream::once(()), IngestionSettings::default(), RunOptions::new()),
    )
    .await
    .expect("sibling branch kept running");
    assert!(
        matches!(&result, Err(PipelineError::Stage { stage, .. }) if stage == "boom"),
        "unexpected result: {result:?}"
    );

    let settled_emitted = emitted.load(Ordering::SeqCst);
    let settled_seen = seen.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(emitted.load(Ordering::SeqCst), settled_emitted);
    assert_eq!(seen.load(Ordering::SeqCst), settled_seen);
}

#[tokio::test]
async fn slow_branch_holds_back_the_upstream() {
    let ticker = Ticker::new("ticker", Duration::from_millis(1));
    let emitted = ticker.emitted();
    let slow = Throttle::new("slow", Duration::from_millis(50));
    let seen = slow.seen();
    let upstream = Pipeline::new("source", PipelineType::Ingestion)
        .with_channel_capacity(1)
        .then(ticker)
        .unwrap();
    let pipeline: IngestionPipeline<(), u64, u64, ()> = IngestionPipeline::new(upstream)
        .with_embedding(
            Pipeline::new("slow_branch", PipelineType::Ingestion)
                .with_channel_capacity(1)
                .then(slow)
                .unwrap(),
        )
        .with_queue_capacity(2);

    let cancel = CancellationToken::new();
    let options = RunOptions::new().with_cancel(cancel.clone());
    let run = tokio::spawn(async move {
        pipeline
            .run(stream::once(()), IngestionSettings::default(), options)
            .await
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    let seen_now = seen.load(Ordering::SeqCst);
    let emitted_now = emitted.load(Ordering::SeqCst);
    assert!(seen_now >= 3, "slow branch made no progress: {seen_now}");
    // queue, channels and the items in hand bound the lead of the producer
    assert!(
        emitted_now <= seen_now + 12,
        "upstream ran ahead: emitted {emitted_now}, consumed {seen_now}"
    );

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("run did not stop")
        .unwrap();
    assert!(matches!(result, Err(PipelineError::Cancelled)));
}
