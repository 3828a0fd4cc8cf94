use std::sync::Arc;
use std::time::Duration;

use resource_loader_service::config::ExperimentConfig;
use resource_loader_service::experiment::ExperimentHarness;
use resource_loader_service::storage::{FsStateStore, MemoryStateStore, StateStore};
use resource_loader_service::strategy::{
    BatchOutcome, ConcurrencyContext, builtin_strategies,
};
use resource_loader_service::types::LoadOptions;
use resource_loader_test as test;

use crate::{HitCounter, setup_builder};

fn harness(store: Arc<dyn StateStore>) -> ExperimentHarness {
    let harness = ExperimentHarness::new(ExperimentConfig::default(), store);
    assert!(harness.add_strategies(builtin_strategies()));
    harness
}

fn outcome(success: usize, failure: usize, millis: u64) -> BatchOutcome {
    BatchOutcome {
        concurrency_used: 4,
        total_time: Duration::from_millis(millis),
        resource_count: success + failure,
        success_count: success,
        failure_count: failure,
        context: ConcurrencyContext::default(),
    }
}

#[tokio::test]
async fn test_assignment_survives_restart() {
    test::setup();
    let state_dir = test::tempdir();

    let first = harness(Arc::new(FsStateStore::new(state_dir.path())));
    let assigned = first.init_test().unwrap();
    first.flush().await;
    drop(first);

    for _ in 0..5 {
        let harness = harness(Arc::new(FsStateStore::new(state_dir.path())));
        assert_eq!(harness.init_test().as_deref(), Some(assigned.as_str()));
    }
}

#[tokio::test]
async fn test_loader_reports_batches_to_experiment() {
    let state_dir = test::tempdir();
    let server = HitCounter::new();

    let harness = Arc::new(harness(Arc::new(FsStateStore::new(state_dir.path()))));
    assert!(harness.assign_strategy("fixed-4"));

    let loader = setup_builder(|config| config.use_ab_testing = true)
        .concurrency_source(harness.clone())
        .build(tokio::runtime::Handle::current())
        .await;

    let urls: Vec<String> = (0..10)
        .map(|i| server.url(&format!("/files/{i}.json")).to_string())
        .collect();
    let results = loader.load_batch(&urls, LoadOptions::default()).await;
    assert!(results.iter().all(Option::is_some));
    assert_eq!(loader.stats().batches, 3);

    let results = harness.get_test_results();
    assert_eq!(results.active_strategy_id.as_deref(), Some("fixed-4"));
    let fixed = results.get("fixed-4").unwrap();
    assert_eq!(fixed.sample_count, 3);
    assert_eq!(fixed.avg_success_rate, 1.0);
    harness.flush().await;

    // samples are persisted with the assignment
    let restarted = ExperimentHarness::new(
        ExperimentConfig::default(),
        Arc::new(FsStateStore::new(state_dir.path())),
    );
    restarted.add_strategies(builtin_strategies());
    assert_eq!(restarted.init_test().as_deref(), Some("fixed-4"));
    assert_eq!(restarted.get_test_results().get("fixed-4").unwrap().sample_count, 3);
}

#[tokio::test]
async fn test_reset_draws_again() {
    test::setup();
    let harness = harness(Arc::new(MemoryStateStore::default()));
    assert!(harness.assign_strategy("fixed-8"));

    let drawn = harness.reset_test(true).unwrap();
    assert!(builtin_strategies()
        .iter()
        .any(|strategy| strategy.id.as_deref() == Some(drawn.as_str())));
    assert!(harness.get_test_results().strategies.is_empty());
}

#[tokio::test]
async fn test_monitor_promotes_better_strategy() {
    let state_dir = test::tempdir();
    let harness = Arc::new(harness(Arc::new(FsStateStore::new(state_dir.path()))));

    assert!(harness.assign_strategy("fixed-8"));
    for _ in 0..12 {
        harness.record_result(&outcome(4, 0, 10));
    }
    assert!(harness.assign_strategy("fixed-4"));
    for _ in 0..12 {
        harness.record_result(&outcome(2, 2, 1000));
    }

    let loader = setup_builder(|config| {
        config.use_ab_testing = true;
        config.monitor_interval = Duration::from_millis(20);
    })
    .concurrency_source(harness.clone())
    .build(tokio::runtime::Handle::current())
    .await;

    for _ in 0..100 {
        if harness.active_strategy().as_deref() == Some("fixed-8") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(harness.active_strategy().as_deref(), Some("fixed-8"));
    assert_eq!(loader.current_batch_size(), 8);

    // the promotion is persisted
    harness.flush().await;
    let restarted = ExperimentHarness::new(
        ExperimentConfig::default(),
        Arc::new(FsStateStore::new(state_dir.path())),
    );
    restarted.add_strategies(builtin_strategies());
    assert_eq!(restarted.init_test().as_deref(), Some("fixed-8"));
    loader.destroy();
}
