//! Disable drain tests
//!
//! Requests admitted before a disable run to completion; new ones are
//! refused as soon as the module leaves the live tables.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use basalt_core::extension::ModuleStatus;
use basalt_core::RuntimeConfig;
use common::{get, install, registry, registry_with, wait_until, TestModule};

fn slow_module(started: Arc<AtomicUsize>, finished: Arc<AtomicUsize>, delay: Duration) -> TestModule {
    TestModule::new("analytics").with_routes(move |r| {
        let (started, finished) = (started.clone(), finished.clone());
        r.get("/slow", move |_req| {
            let (started, finished) = (started.clone(), finished.clone());
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok("done")
            }
        });
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disable_waits_for_in_flight_requests() {
    let registry = registry();
    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let module = install(
        &registry,
        slow_module(started.clone(), finished.clone(), Duration::from_millis(200)),
    )
    .await;

    let requests: Vec<_> = (0..100)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .dispatch_route(get("/ext/analytics/slow"))
                    .await
                    .status()
            })
        })
        .collect();
    wait_until(|| started.load(Ordering::SeqCst) == 100).await;

    registry.disable("analytics").await.unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 100);
    assert_eq!(module.stops.load(Ordering::SeqCst), 1);

    for request in requests {
        assert_eq!(request.await.unwrap(), StatusCode::OK);
    }
    assert_eq!(
        registry.dispatch_route(get("/ext/analytics/slow")).await.status(),
        StatusCode::NOT_FOUND
    );
    assert_eq!(registry.metrics("analytics").unwrap().requests, 100);
}

#[tokio::test]
async fn test_drain_timeout_bounds_disable() {
    let registry = registry_with(RuntimeConfig {
        drain_timeout_ms: 50,
        ..Default::default()
    });
    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    install(
        &registry,
        slow_module(started.clone(), finished.clone(), Duration::from_secs(2)),
    )
    .await;

    let request = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.dispatch_route(get("/ext/analytics/slow")).await })
    };
    wait_until(|| started.load(Ordering::SeqCst) == 1).await;

    let begin = Instant::now();
    registry.disable("analytics").await.unwrap();
    assert!(begin.elapsed() < Duration::from_secs(1));
    assert_eq!(registry.status("analytics"), Some(ModuleStatus::Disabled));
    assert_eq!(finished.load(Ordering::SeqCst), 0);
    request.abort();
}

#[tokio::test]
async fn test_requests_after_disable_are_refused() {
    let registry = registry();
    install(
        &registry,
        TestModule::new("analytics").with_routes(|r| {
            r.get("/ping", |_req| async { Ok("pong") });
        }),
    )
    .await;

    registry.disable("analytics").await.unwrap();
    for _ in 0..10 {
        assert_eq!(
            registry.dispatch_route(get("/ext/analytics/ping")).await.status(),
            StatusCode::NOT_FOUND
        );
    }
    // Refused requests are not counted.
    assert_eq!(registry.metrics("analytics").unwrap().requests, 0);
}
