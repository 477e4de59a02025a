use futures::StreamExt;
use ragline_foundation::{ChannelRunLogSink, InMemoryRunLogStore, Pipeline, RunManager, RunOptions};
use ragline_kernel::error::PipelineError;
use ragline_kernel::run::PipelineType;
use ragline_kernel::stage::CrossReference;
use ragline_kernel::stream;
use ragline_testing::{CollectReferences, FnStage, Ticker, init_tracing};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn linear_pipeline_applies_stages_left_to_right() {
    init_tracing();
    let pipeline = Pipeline::new("linear", PipelineType::Other)
        .then(FnStage::new("add_one", |n: i64| n + 1))
        .unwrap()
        .then(FnStage::new("double", |n: i64| n * 2))
        .unwrap()
        .then(FnStage::new("describe", |n: i64| format!("n={n}")))
        .unwrap();

    let single = pipeline
        .run_to_end(stream::once(3), RunOptions::new())
        .await
        .unwrap()
        .into_inner();
    assert_eq!(single, vec!["n=8"]);

    let many = pipeline
        .run_to_end(stream::from_iter(0..50), RunOptions::new())
        .await
        .unwrap()
        .into_inner();
    let expected: Vec<String> = (0..50).map(|n| format!("n={}", (n + 1) * 2)).collect();
    assert_eq!(many, expected);
}

#[tokio::test]
async fn third_stage_reads_first_stage_output() {
    let pipeline = Pipeline::new("refs", PipelineType::Other)
        .then(FnStage::new("tokenize", |s: String| s.len()))
        .unwrap()
        .then(FnStage::new("square", |n: usize| n * n))
        .unwrap()
        .add_stage(
            CollectReferences::new("collect"),
            vec![CrossReference::new("lengths", "tokenize", "outputs")],
        )
        .unwrap();

    let input = stream::from_iter(vec!["ab".to_string(), "abcd".to_string()]);
    let run = pipeline.run(input, RunOptions::new()).await.unwrap();
    let state = run.state();
    let out = run.materialize().await.unwrap().into_inner();

    assert_eq!(out.len(), 2);
    assert_eq!(out[0].0, 4);
    assert_eq!(out[1].0, 16);
    for (_, references) in &out {
        assert_eq!(references["lengths"], json!([2, 4]));
    }
    assert_eq!(state.get("tokenize", "outputs"), Some(json!([2, 4])));
    assert_eq!(state.get("square", "outputs"), Some(json!([4, 16])));
}

#[tokio::test]
async fn wiring_errors_are_raised_before_running() {
    let duplicate = Pipeline::new("dup", PipelineType::Other)
        .then(FnStage::new("same", |n: u8| n))
        .unwrap()
        .then(FnStage::new("same", |n: u8| n));
    assert!(matches!(duplicate, Err(PipelineError::DuplicateStage(name)) if name == "same"));

    let unknown = Pipeline::new("unknown", PipelineType::Other)
        .then(FnStage::new("first", |n: u8| n))
        .unwrap()
        .add_stage(
            CollectReferences::new("second"),
            vec![CrossReference::new("x", "later", "outputs")],
        );
    assert!(matches!(unknown, Err(PipelineError::UnknownReference { .. })));
}

#[tokio::test]
async fn run_manager_records_run_lifecycle() {
    let store = Arc::new(InMemoryRunLogStore::new());
    let sink = ChannelRunLogSink::spawn(store.clone(), 256);
    let manager = RunManager::new(sink.clone());

    let pipeline = Pipeline::new("managed", PipelineType::Ingestion)
        .then(FnStage::new("noop", |n: u32| n))
        .unwrap();
    let run = pipeline
        .run(stream::from_iter(vec![1, 2, 3]), RunOptions::new().with_run_manager(manager.clone()))
        .await
        .unwrap();
    let run_id = run.run_id();
    assert!(manager.is_active(run_id));
    assert_eq!(run.materialize().await.unwrap().len(), 3);
    assert!(!manager.is_active(run_id));

    sink.shutdown().await;
    let keys = store.keys_for(run_id);
    assert_eq!(keys.first().map(String::as_str), Some("run_started"));
    assert!(keys.iter().any(|k| k == "noop.started"));
    assert!(keys.iter().any(|k| k == "run_completed"));
}

#[tokio::test]
async fn cancelled_run_stops_emitting() {
    let ticker = Ticker::new("ticker", Duration::from_millis(5));
    let emitted = ticker.emitted();
    let pipeline = Pipeline::new("endless", PipelineType::Other)
        .then(ticker)
        .unwrap()
        .then(FnStage::new("inc", |n: u64| n + 1))
        .unwrap();

    let store = Arc::new(InMemoryRunLogStore::new());
    let sink = ChannelRunLogSink::spawn(store.clone(), 256);
    let manager = RunManager::new(sink.clone());
    let mut run = pipeline
        .run(stream::once(()), RunOptions::new().with_run_manager(manager))
        .await
        .unwrap();
    let run_id = run.run_id();

    let first: Vec<_> = (&mut run).take(3).collect().await;
    assert_eq!(first.len(), 3);

    run.cancel();
    assert!(run.next().await.is_none());
    tokio::time::timeout(Duration::from_secs(2), run.terminated())
        .await
        .expect("stage tasks did not terminate");

    let settled = emitted.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(emitted.load(Ordering::SeqCst), settled);

    sink.shutdown().await;
    assert!(store.keys_for(run_id).iter().any(|k| k == "run_cancelled"));
}
