use std::sync::Arc;
use std::time::Duration;

use resource_loader_service::auth::StaticTokenStore;
use resource_loader_service::error::LoadError;
use resource_loader_service::loader::LoaderEvent;
use resource_loader_service::memory::MemoryTier;
use resource_loader_service::network::ManualNetworkMonitor;
use resource_loader_service::priority::PriorityScorer;
use resource_loader_service::types::{
    LoadOptions, NetworkStatus, NetworkStatusChange, ResourceData, ResponseKind,
};

use crate::{
    HitCounter, setup_builder, setup_loader, spawn_load, wait_for_active, wait_until,
};

/// Drains the urls of the `LoadStarted` events received so far.
fn started_urls(events: &mut tokio::sync::broadcast::Receiver<LoaderEvent>) -> Vec<String> {
    let mut started = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let LoaderEvent::LoadStarted { url, .. } = event {
            started.push(url);
        }
    }
    started
}

#[tokio::test]
async fn test_concurrent_loads_are_merged() {
    let loader = setup_loader(|_| {}).await;
    let server = HitCounter::new();

    let url = server.url("/delay/200ms/files/merged.json");
    let options = LoadOptions::default().with_response_kind(ResponseKind::Json);
    let (first, second) = tokio::join!(
        loader.load(url.as_str(), options.clone()),
        loader.load(url.as_str(), options),
    );

    let first = first.unwrap();
    assert_eq!(first, second.unwrap());
    assert!(!first.from_cache);
    assert!(matches!(first.data, ResourceData::Json(_)));

    assert_eq!(server.accesses(), 1);
    let stats = loader.stats();
    assert_eq!(stats.merged, 1);
    assert_eq!(stats.loaded, 2);
}

#[tokio::test]
async fn test_many_callers_share_one_request() {
    let loader = setup_loader(|_| {}).await;
    let server = HitCounter::new();

    let url = server.url("/delay/200ms/files/popular.json");
    let results = futures::future::join_all(
        (0..10).map(|_| loader.load(url.as_str(), LoadOptions::default())),
    )
    .await;

    let first = results[0].as_ref().unwrap();
    assert!(results.iter().all(|result| result.as_ref() == Ok(first)));
    assert_eq!(server.accesses(), 1);
    let stats = loader.stats();
    assert_eq!(stats.merged, 9);
    assert_eq!(stats.loaded, 10);
}

#[tokio::test]
async fn test_unmerged_loads_dispatch_every_call() {
    let loader = setup_loader(|config| {
        config.enable_request_merging = false;
        config.enable_cache = false;
    })
    .await;
    let server = HitCounter::new();

    let url = server.url("/delay/100ms/files/unmerged.json");
    let results = futures::future::join_all(
        (0..3).map(|_| loader.load(url.as_str(), LoadOptions::default())),
    )
    .await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(server.accesses(), 3);
    let stats = loader.stats();
    assert_eq!(stats.merged, 0);
    assert_eq!(stats.loaded, 3);
}

#[tokio::test]
async fn test_active_requests_are_limited_to_batch_size() {
    let loader = setup_loader(|config| {
        config.max_concurrent_loads = 4;
        config.batch_size = Some(4);
    })
    .await;
    let server = HitCounter::new();
    assert_eq!(loader.current_batch_size(), 4);

    let loads: Vec<_> = (0..20)
        .map(|i| {
            let url = server.url(&format!("/delay/1h/files/{i}.png"));
            spawn_load(&loader, url, LoadOptions::default())
        })
        .collect();
    wait_until(|| loader.queued_requests() == 16, "16 queued requests").await;
    assert_eq!(loader.active_requests().len(), 4);

    // no further attempt is admitted while every slot is taken
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(loader.active_requests().len() <= loader.current_batch_size());
    assert_eq!(loader.queued_requests(), 16);
    assert!(server.accesses() <= 4);

    loader.destroy();
    for load in loads {
        assert_eq!(load.await.unwrap(), Err(LoadError::Cancelled));
    }
    assert_eq!(loader.queued_requests(), 0);
}

#[tokio::test]
async fn test_concurrent_batches_count_all_queued_urls() {
    let loader = setup_loader(|config| config.batch_size = Some(2)).await;
    let server = HitCounter::new();

    let batches: Vec<_> = ["first", "second"]
        .into_iter()
        .map(|name| {
            let loader = loader.clone();
            let urls: Vec<String> = (0..4)
                .map(|i| server.url(&format!("/delay/1h/files/{name}-{i}.png")).to_string())
                .collect();
            tokio::spawn(async move { loader.load_batch(&urls, LoadOptions::default()).await })
        })
        .collect();

    // two attempts wait for a slot, each batch holds back two urls
    wait_until(|| loader.queued_requests() == 6, "6 queued requests").await;
    assert_eq!(loader.active_requests().len(), 2);

    loader.destroy();
    for batch in batches {
        assert!(batch.await.unwrap().iter().all(Option::is_none));
    }
    assert_eq!(loader.queued_requests(), 0);
}

#[tokio::test]
async fn test_queue_admits_higher_priority_first() {
    let loader = setup_loader(|config| config.max_concurrent_loads = 2).await;
    let server = HitCounter::new();
    let mut events = loader.subscribe();

    let blocked = spawn_load(
        &loader,
        server.url("/delay/1h/files/blocked.js"),
        LoadOptions::default(),
    );
    let short = spawn_load(
        &loader,
        server.url("/delay/300ms/files/short.js"),
        LoadOptions::default(),
    );
    wait_for_active(&loader, 2).await;

    let low = spawn_load(
        &loader,
        server.url("/files/low.png"),
        LoadOptions::default().with_priority(1),
    );
    wait_until(|| loader.queued_requests() == 1, "the low priority load to queue").await;
    let high = spawn_load(
        &loader,
        server.url("/files/high.png"),
        LoadOptions::default().with_priority(9),
    );
    wait_until(|| loader.queued_requests() == 2, "the high priority load to queue").await;

    short.await.unwrap().unwrap();
    high.await.unwrap().unwrap();
    low.await.unwrap().unwrap();

    let started = started_urls(&mut events);
    let position = |name: &str| started.iter().position(|url| url.ends_with(name)).unwrap();
    assert!(position("high.png") < position("low.png"));

    loader.destroy();
    assert_eq!(blocked.await.unwrap(), Err(LoadError::Cancelled));
}

#[tokio::test]
async fn test_joining_caller_raises_priority() {
    let loader = setup_loader(|_| {}).await;
    let server = HitCounter::new();
    let url = server.url("/delay/1h/files/shared.png").to_string();

    let low = spawn_load(&loader, url.clone(), LoadOptions::default().with_priority(1));
    wait_for_active(&loader, 1).await;
    assert_eq!(loader.active_requests()[0].priority, 1);

    let high = spawn_load(&loader, url, LoadOptions::default().with_priority(9));
    wait_until(|| loader.stats().merged == 1, "the second load to join").await;
    assert_eq!(loader.active_requests()[0].priority, 9);

    // the shared request is no longer low priority
    assert_eq!(
        loader.handle_memory_pressure(0.9).await,
        MemoryTier::Critical
    );
    assert_eq!(loader.stats().cancelled, 0);
    assert_eq!(loader.active_requests().len(), 1);

    loader.destroy();
    assert_eq!(low.await.unwrap(), Err(LoadError::Cancelled));
    assert_eq!(high.await.unwrap(), Err(LoadError::Cancelled));
}

#[tokio::test]
async fn test_batch_keeps_order_and_isolates_failures() {
    let loader = setup_loader(|_| {}).await;
    let server = HitCounter::new();

    let urls = vec![
        server.url("/files/app.js").to_string(),
        server.url("/respond_statuscode/404/missing.css").to_string(),
        server.url("/files/data.json").to_string(),
        server.url("/files/app.js").to_string(),
        String::new(),
    ];
    let results = loader
        .load_batch(&urls, LoadOptions::default().with_retry_count(0))
        .await;

    assert_eq!(results.len(), urls.len());
    assert_eq!(results[0].as_ref().unwrap().url, urls[0]);
    assert!(results[1].is_none());
    assert_eq!(results[2].as_ref().unwrap().url, urls[2]);
    assert_eq!(results[3], results[0]);
    assert!(results[4].is_none());

    // one request per unique url
    assert_eq!(server.accesses(), 3);
    let stats = loader.stats();
    assert_eq!(stats.loaded, 2);
    assert_eq!(stats.failed, 1);
    assert!(stats.batches >= 1);
}

#[tokio::test]
async fn test_batch_events() {
    let loader = setup_loader(|config| config.batch_size = Some(2)).await;
    let server = HitCounter::new();
    let mut events = loader.subscribe();

    let urls: Vec<String> = (0..5)
        .map(|i| server.url(&format!("/files/{i}.png")).to_string())
        .collect();
    let results = loader.load_batch(&urls, LoadOptions::default()).await;
    assert!(results.iter().all(Option::is_some));

    let mut sizes = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let LoaderEvent::BatchCompleted {
            size,
            success_count,
            failure_count,
            ..
        } = event
        {
            assert_eq!(success_count, size);
            assert_eq!(failure_count, 0);
            sizes.push(size);
        }
    }
    assert_eq!(sizes, vec![2, 2, 1]);
    assert_eq!(loader.stats().batches, 3);
}

#[derive(Debug)]
struct ImagesFirst;

impl PriorityScorer for ImagesFirst {
    fn factor(&self, url: &str) -> f64 {
        if url.ends_with(".png") { 10.0 } else { 1.0 }
    }
}

/// Loads two images and two scripts in batches of two and returns the urls of the
/// first batch.
async fn first_batch(grouping_threshold: usize) -> Vec<String> {
    let server = HitCounter::new();
    let loader = setup_builder(|config| {
        config.batch_size = Some(2);
        config.batch_grouping_threshold = grouping_threshold;
    })
    .priority_scorer(Arc::new(ImagesFirst))
    .build(tokio::runtime::Handle::current())
    .await;
    let mut events = loader.subscribe();

    let urls = ["a.png", "b.js", "c.png", "d.js"]
        .map(|name| server.url(&format!("/files/{name}")).to_string());
    let results = loader.load_batch(&urls, LoadOptions::default()).await;
    assert!(results.iter().all(Option::is_some));
    assert_eq!(loader.stats().batches, 2);

    let mut started = started_urls(&mut events);
    started.truncate(2);
    started
}

#[tokio::test]
async fn test_large_batch_loads_critical_types_first() {
    let started = first_batch(3).await;
    assert_eq!(started.len(), 2);
    assert!(started.iter().all(|url| url.ends_with(".js")), "{started:?}");

    // small batches keep the scored order
    let started = first_batch(10).await;
    assert_eq!(started.len(), 2);
    assert!(started.iter().all(|url| url.ends_with(".png")), "{started:?}");
}

#[tokio::test]
async fn test_flaky_resource_is_retried() {
    let loader = setup_loader(|_| {}).await;
    let server = HitCounter::new();

    let url = server.url("/flaky/2/files/flaky.json");
    let resource = loader
        .load(url.as_str(), LoadOptions::default())
        .await
        .unwrap();
    assert!(!resource.is_empty());

    assert_eq!(server.accesses(), 3);
    assert_eq!(loader.stats().retried, 2);
}

#[tokio::test]
async fn test_retries_are_exhausted() {
    let loader = setup_loader(|_| {}).await;
    let server = HitCounter::new();

    let url = server.url("/respond_statuscode/503/gone.js");
    let error = loader
        .load(url.as_str(), LoadOptions::default().with_retry_count(2))
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        LoadError::Transport {
            status: Some(503),
            ..
        }
    ));
    assert_eq!(server.accesses(), 3);
    assert_eq!(loader.stats().failed, 1);
}

#[tokio::test]
async fn test_attempt_timeout() {
    let loader = setup_loader(|_| {}).await;
    let server = HitCounter::new();

    let url = server.url("/delay/1h/files/slow.js");
    let options = LoadOptions::default()
        .with_timeout(Duration::from_millis(100))
        .with_retry_count(0);
    let error = loader.load(url.as_str(), options).await.unwrap_err();

    assert_eq!(error, LoadError::Timeout(Duration::from_millis(100)));
    assert!(loader.active_requests().is_empty());
}

#[tokio::test]
async fn test_cache_hits() {
    let loader = setup_loader(|_| {}).await;
    let server = HitCounter::new();

    let url = server.url("/files/style.css");
    let first = loader
        .load(url.as_str(), LoadOptions::default())
        .await
        .unwrap();
    let second = loader
        .load(url.as_str(), LoadOptions::default())
        .await
        .unwrap();
    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(first.data, second.data);
    assert_eq!(server.accesses(), 1);
    assert_eq!(loader.stats().cache_hits, 1);

    assert!(loader.get_from_cache(url.as_str()).await.is_some());

    // bypassing the cache always goes to the network
    loader
        .load(url.as_str(), LoadOptions::default().bypassing_cache())
        .await
        .unwrap();
    assert_eq!(server.accesses(), 1);

    let mut events = loader.subscribe();
    // stylesheets are essential
    assert_eq!(loader.clear_cache(true).await, 0);
    assert!(loader.get_from_cache(url.as_str()).await.is_some());
    assert_eq!(loader.clear_cache(false).await, 1);
    assert!(loader.get_from_cache(url.as_str()).await.is_none());

    let mut removed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let LoaderEvent::CacheCleared {
            preserve_essential,
            removed: count,
        } = event
        {
            removed.push((preserve_essential, count));
        }
    }
    assert_eq!(removed, vec![(true, 0), (false, 1)]);
}

#[tokio::test]
async fn test_offline_serves_only_cached() {
    let loader = setup_loader(|_| {}).await;
    let server = HitCounter::new();

    let cached = server.url("/files/cached.css");
    loader
        .load(cached.as_str(), LoadOptions::default())
        .await
        .unwrap();
    assert_eq!(server.accesses(), 1);

    loader.handle_network_change(NetworkStatusChange {
        status: NetworkStatus::Offline,
        previous_status: NetworkStatus::Good,
    });
    assert_eq!(loader.network_status(), NetworkStatus::Offline);

    let resource = loader
        .load(cached.as_str(), LoadOptions::default())
        .await
        .unwrap();
    assert!(resource.from_cache);

    let missing = server.url("/files/missing.css");
    let error = loader
        .load(missing.as_str(), LoadOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(error, LoadError::NetworkUnavailable(_)));
    assert_eq!(server.accesses(), 0);
}

#[tokio::test]
async fn test_flapping_network_keeps_worse_status() {
    let loader = setup_loader(|_| {}).await;
    let mut events = loader.subscribe();

    let reports = [
        (NetworkStatus::Good, NetworkStatus::Good),
        (NetworkStatus::Poor, NetworkStatus::Poor),
        (NetworkStatus::Good, NetworkStatus::Poor),
    ];
    let mut previous_status = NetworkStatus::Good;
    for (status, expected) in reports {
        let effective = loader.handle_network_change(NetworkStatusChange {
            status,
            previous_status,
        });
        assert_eq!(effective, expected);
        previous_status = status;
    }
    assert_eq!(loader.network_status(), NetworkStatus::Poor);

    let mut changes = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let LoaderEvent::NetworkStatusChanged(change) = event {
            changes.push(change.status);
        }
    }
    assert_eq!(changes, vec![NetworkStatus::Poor]);
}

#[tokio::test]
async fn test_network_monitor_subscription() {
    let monitor = Arc::new(ManualNetworkMonitor::new(NetworkStatus::Good));
    let loader = setup_builder(|_| {})
        .network_monitor(monitor.clone())
        .build(tokio::runtime::Handle::current())
        .await;
    assert_eq!(loader.network_status(), NetworkStatus::Good);

    monitor.report(NetworkStatus::Fair);
    for _ in 0..100 {
        if loader.network_status() == NetworkStatus::Fair {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(loader.network_status(), NetworkStatus::Fair);
}

#[tokio::test]
async fn test_memory_pressure_shrinks_batches() {
    let loader = setup_loader(|_| {}).await;

    let mut previous = usize::MAX;
    for ratio in [0.3, 0.6, 0.75, 0.9] {
        loader.handle_memory_pressure(ratio).await;
        let size = loader.current_batch_size();
        assert!(size <= previous, "{size} > {previous} at {ratio}");
        previous = size;
    }
    assert_eq!(loader.memory_tier(), MemoryTier::Critical);
    assert_eq!(previous, 2);
}

#[tokio::test]
async fn test_critical_memory_cancels_low_priority() {
    let loader = setup_loader(|_| {}).await;
    let server = HitCounter::new();

    let low = tokio::spawn({
        let loader = loader.clone();
        let url = server.url("/delay/1h/files/low.png").to_string();
        async move {
            loader
                .load(&url, LoadOptions::default().with_priority(3))
                .await
        }
    });
    let high = tokio::spawn({
        let loader = loader.clone();
        let url = server.url("/delay/1h/files/high.js").to_string();
        async move {
            loader
                .load(&url, LoadOptions::default().with_priority(8))
                .await
        }
    });
    wait_for_active(&loader, 2).await;

    assert_eq!(
        loader.handle_memory_pressure(0.9).await,
        MemoryTier::Critical
    );
    assert_eq!(low.await.unwrap(), Err(LoadError::Cancelled));

    let active = loader.active_requests();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].priority, 8);
    assert_eq!(loader.stats().cancelled, 1);
    assert_eq!(loader.stats().failed, 0);

    loader.destroy();
    assert_eq!(high.await.unwrap(), Err(LoadError::Cancelled));
}

#[tokio::test]
async fn test_destroy() {
    let loader = setup_loader(|_| {}).await;
    let server = HitCounter::new();
    let mut events = loader.subscribe();

    loader
        .load(
            server.url("/files/done.json").as_str(),
            LoadOptions::default(),
        )
        .await
        .unwrap();

    let pending = tokio::spawn({
        let loader = loader.clone();
        let url = server.url("/delay/1h/files/pending.js").to_string();
        async move { loader.load(&url, LoadOptions::default()).await }
    });
    wait_for_active(&loader, 1).await;

    loader.destroy();
    assert_eq!(pending.await.unwrap(), Err(LoadError::Cancelled));
    assert!(loader.is_destroyed());
    assert!(loader.active_requests().is_empty());
    assert_eq!(loader.stats(), Default::default());

    // idempotent
    loader.destroy();

    let error = loader
        .load(
            server.url("/files/late.json").as_str(),
            LoadOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(error, LoadError::Cancelled);

    let mut destroyed = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, LoaderEvent::Destroyed) {
            destroyed += 1;
        }
    }
    assert_eq!(destroyed, 1);
}

#[tokio::test]
async fn test_bearer_token() {
    let server = HitCounter::new();
    let url = server.url("/auth/private.txt");
    let options = LoadOptions::default()
        .with_response_kind(ResponseKind::Text)
        .with_retry_count(0);

    let loader = setup_builder(|config| config.enterprise_mode = true)
        .token_store(Arc::new(StaticTokenStore::new("secret")))
        .build(tokio::runtime::Handle::current())
        .await;
    let resource = loader.load(url.as_str(), options.clone()).await.unwrap();
    assert_eq!(resource.data, ResourceData::Text("secret".into()));

    // tokens are only attached in enterprise mode
    let loader = setup_builder(|_| {})
        .token_store(Arc::new(StaticTokenStore::new("secret")))
        .build(tokio::runtime::Handle::current())
        .await;
    let error = loader.load(url.as_str(), options).await.unwrap_err();
    assert!(matches!(
        error,
        LoadError::Transport {
            status: Some(401),
            ..
        }
    ));
}

#[tokio::test]
async fn test_preload() {
    let loader = setup_loader(|_| {}).await;
    let server = HitCounter::new();
    let mut events = loader.subscribe();

    let urls = vec![
        server.url("/files/next.css").to_string(),
        server.url("/respond_statuscode/500/broken.js").to_string(),
    ];
    loader.preload(&urls, Some(LoadOptions::default().with_priority(1).with_retry_count(0)));

    let (requested, loaded) = loop {
        match events.recv().await.unwrap() {
            LoaderEvent::PreloadCompleted { requested, loaded } => break (requested, loaded),
            _ => continue,
        }
    };
    assert_eq!((requested, loaded), (2, 1));
    assert!(loader.get_from_cache(&urls[0]).await.is_some());
}
