//! End-to-end behaviour of the request path: network first, backup fallback,
//! refresh scheduling.


use std::sync::Arc;
use std::time::{Duration, Instant};

use ics_pantry::mocking::MockFetcher;
use ics_pantry::{EventSource, FetchFailure, RefreshConfig, ResolveReason};

#[tokio::test]
async fn a_successful_fetch_is_served_fresh_and_backed_up() {
    scenarii::init_logging();
    let (_dir, store) = scenarii::open_store();
    let planning = scenarii::planning("a", "Maths");
    store.upsert_planning(&planning).unwrap();

    let events = vec![scenarii::event("1", "Algebra"), scenarii::event("2", "Analysis")];
    let resolver = scenarii::resolver(&store, Arc::new(MockFetcher::ok(events.clone())));

    let resolution = resolver.resolve_events(&planning, false).await.unwrap();
    assert_eq!(resolution.source, EventSource::Network);
    assert_eq!(resolution.reason, ResolveReason::Ok);
    assert_eq!(resolution.events.as_deref(), Some(events.as_slice()));
    assert!(resolution.refreshed_at.is_some());
    assert!(resolution.network_failed == false);
    assert!(resolution.network_failure.is_none());

    let backup = scenarii::wait_for_backup(&store, "a").await;
    assert_eq!(backup.events, events);
    // A successful fetch needs no background refresh
    assert_eq!(store.queue_stats().unwrap().depth, 0);
}

#[tokio::test]
async fn a_transient_failure_falls_back_to_the_backup_and_queues_a_refresh() {
    scenarii::init_logging();
    let (_dir, store) = scenarii::open_store();
    let planning = scenarii::planning("a", "Maths");
    store.upsert_planning(&planning).unwrap();
    let cached = vec![scenarii::event("1", "Algebra")];
    store.upsert_backup("a", &cached).unwrap();
    let backup = store.read_backup("a").unwrap().unwrap();

    let resolver = scenarii::resolver(
        &store,
        Arc::new(MockFetcher::failing(FetchFailure::Http5xx { status: 503 })),
    );
    let resolution = resolver.resolve_events(&planning, false).await.unwrap();

    assert_eq!(resolution.source, EventSource::Db);
    assert_eq!(resolution.reason, ResolveReason::NetworkErrorFallbackDb);
    assert_eq!(resolution.events.as_deref(), Some(cached.as_slice()));
    // Cache answers carry the backup's write time, not the request time
    assert_eq!(resolution.refreshed_at, Some(backup.updated_at));
    assert_eq!(resolution.backup_updated_at, Some(backup.updated_at));
    assert!(resolution.network_failed);
    assert_eq!(
        resolution.network_failure,
        Some(FetchFailure::Http5xx { status: 503 })
    );

    let stats = store.queue_stats().unwrap();
    assert_eq!(stats.depth, 1);
    assert_eq!(
        stats.max_pending_priority,
        Some(RefreshConfig::default().enqueue_priority)
    );
}

#[tokio::test]
async fn a_permanent_failure_is_not_queued_for_retry() {
    scenarii::init_logging();
    let (_dir, store) = scenarii::open_store();
    let planning = scenarii::planning("a", "Maths");
    store.upsert_planning(&planning).unwrap();
    store.upsert_backup("a", &[scenarii::event("1", "Algebra")]).unwrap();

    let resolver = scenarii::resolver(
        &store,
        Arc::new(MockFetcher::failing(FetchFailure::Http4xx { status: 404 })),
    );
    let resolution = resolver.resolve_events(&planning, false).await.unwrap();

    assert_eq!(resolution.source, EventSource::Db);
    assert_eq!(resolution.reason, ResolveReason::NetworkErrorFallbackDb);
    assert_eq!(store.queue_stats().unwrap().depth, 0);
}

#[tokio::test]
async fn a_failure_without_a_backup_yields_no_events() {
    scenarii::init_logging();
    let (_dir, store) = scenarii::open_store();
    let planning = scenarii::planning("a", "Maths");
    store.upsert_planning(&planning).unwrap();

    let resolver = scenarii::resolver(
        &store,
        Arc::new(MockFetcher::failing(FetchFailure::Timeout)),
    );
    let resolution = resolver.resolve_events(&planning, false).await.unwrap();

    assert_eq!(resolution.source, EventSource::None);
    assert_eq!(resolution.reason, ResolveReason::NetworkErrorNoCache);
    assert!(resolution.events.is_none());
    assert!(resolution.refreshed_at.is_none());
    assert!(resolution.network_failed);
    assert_eq!(store.queue_stats().unwrap().depth, 1);
}

#[tokio::test]
async fn only_db_never_touches_the_network() {
    scenarii::init_logging();
    let (_dir, store) = scenarii::open_store();
    let planning = scenarii::planning("a", "Maths");
    store.upsert_planning(&planning).unwrap();

    let fetcher = Arc::new(MockFetcher::ok(vec![scenarii::event("1", "Algebra")]));
    let resolver = scenarii::resolver(&store, fetcher.clone());

    let resolution = resolver.resolve_events(&planning, true).await.unwrap();
    assert_eq!(resolution.source, EventSource::None);
    assert_eq!(resolution.reason, ResolveReason::DbNotFound);
    assert!(resolution.network_failed == false);
    assert_eq!(fetcher.calls(), 0);

    store.upsert_backup("a", &[scenarii::event("1", "Algebra")]).unwrap();
    let resolution = resolver.resolve_events(&planning, true).await.unwrap();
    assert_eq!(resolution.source, EventSource::Db);
    assert_eq!(resolution.reason, ResolveReason::Ok);
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn a_planning_without_a_url_is_answered_from_the_backup_only() {
    scenarii::init_logging();
    let (_dir, store) = scenarii::open_store();
    let planning = scenarii::planning_without_url("a", "Maths");
    store.upsert_planning(&planning).unwrap();
    store.upsert_backup("a", &[scenarii::event("1", "Algebra")]).unwrap();

    let fetcher = Arc::new(MockFetcher::ok(vec![]));
    let resolver = scenarii::resolver(&store, fetcher.clone());

    let resolution = resolver.resolve_events(&planning, false).await.unwrap();
    assert_eq!(resolution.source, EventSource::Db);
    assert_eq!(resolution.reason, ResolveReason::Ok);
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn a_slow_upstream_counts_as_a_timeout() {
    scenarii::init_logging();
    let (_dir, store) = scenarii::open_store();
    let planning = scenarii::planning("a", "Maths");
    store.upsert_planning(&planning).unwrap();

    let fetcher = MockFetcher::ok(vec![scenarii::event("1", "Algebra")])
        .slowed_by(Duration::from_millis(300));
    let config = RefreshConfig {
        fetch_timeout: Duration::from_millis(50),
        ..RefreshConfig::default()
    };
    let resolver = scenarii::resolver_with_config(&store, Arc::new(fetcher), config);

    let resolution = resolver.resolve_events(&planning, false).await.unwrap();
    assert_eq!(resolution.network_failure, Some(FetchFailure::Timeout));
    assert_eq!(resolution.source, EventSource::None);
    assert_eq!(store.queue_stats().unwrap().depth, 1);
}

#[tokio::test]
async fn concurrent_requests_for_one_planning_fetch_one_at_a_time() {
    scenarii::init_logging();
    let (_dir, store) = scenarii::open_store();
    let planning = scenarii::planning("a", "Maths");
    store.upsert_planning(&planning).unwrap();

    let fetcher = Arc::new(
        MockFetcher::ok(vec![scenarii::event("1", "Algebra")])
            .slowed_by(Duration::from_millis(100)),
    );
    let resolver = scenarii::resolver(&store, fetcher.clone());

    let started = Instant::now();
    let (first, second) = tokio::join!(
        resolver.resolve_events(&planning, false),
        resolver.resolve_events(&planning, false),
    );
    assert_eq!(first.unwrap().source, EventSource::Network);
    assert_eq!(second.unwrap().source, EventSource::Network);
    assert_eq!(fetcher.calls(), 2);
    // With one fetch slot per planning the two calls cannot overlap
    assert!(started.elapsed() >= Duration::from_millis(180));
}

#[tokio::test]
async fn a_resolution_serializes_with_camel_case_keys() {
    scenarii::init_logging();
    let (_dir, store) = scenarii::open_store();
    let planning = scenarii::planning("a", "Maths");
    store.upsert_planning(&planning).unwrap();

    let resolver = scenarii::resolver(
        &store,
        Arc::new(MockFetcher::failing(FetchFailure::DnsError {
            detail: "no such host".to_string(),
        })),
    );
    let resolution = resolver.resolve_events(&planning, false).await.unwrap();
    let json = serde_json::to_value(&resolution).unwrap();

    assert_eq!(json["source"], "none");
    assert_eq!(json["reason"], "network_error_no_cache");
    assert_eq!(json["networkFailed"], true);
    assert_eq!(json["networkFailure"]["kind"], "dns_error");
    // Absent timestamps are omitted, not null
    assert!(json.get("refreshedAt").is_none());
}
