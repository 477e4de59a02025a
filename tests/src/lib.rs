//! Ragline Testing
//!
//! Mock providers and scripted stages for exercising ragline pipelines
//! without live models or stores.

pub mod providers;
pub mod stages;

pub use providers::{
    MockCompletion, MockEmbedder, MockExtractor, MockGraphStore, MockParser, MockVectorStore,
};
pub use stages::{CollectReferences, FailAt, FnStage, ScriptedSearch, Throttle, Ticker};

use tracing_subscriber::EnvFilter;

/// Install a test subscriber honouring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

/// Assert the ids of ranked results, in order.
#[macro_export]
macro_rules! assert_ids {
    ($results:expr, [$($id:expr),* $(,)?]) => {
        let ids: Vec<&str> = $results.iter().map(|r| r.id.as_str()).collect();
        let expected: Vec<&str> = vec![$($id),*];
        assert_eq!(ids, expected, "unexpected result ids");
    };
}
