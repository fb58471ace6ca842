//! Fault isolation tests
//!
//! A panicking module is pulled out of every live table while the host and
//! the other modules keep serving. Timeouts and health failures are
//! recorded without disabling anything.

mod common;

use std::sync::atomic::Ordering;

use axum::http::StatusCode;
use basalt_core::config::IsolationPolicy;
use basalt_core::extension::{
    ChainPolicy, ExtensionError, FaultKind, HealthState, HookFailureKind, HookInput, HookPoint,
    ModuleStatus, Next, Response,
};
use basalt_core::RuntimeConfig;
use common::{
    body_string, call_log, explode, get, install, linger, registry, registry_with, wait_until,
    Behavior, CallLog, TestModule,
};

fn logging_module(name: &'static str, priority: i32, log: &CallLog) -> TestModule {
    let log = log.clone();
    TestModule::new(name).with_hooks(move |h| {
        let log = log.clone();
        h.on(HookPoint::PostRequest, priority, move |_ctx| {
            let log = log.clone();
            async move {
                log.lock().push(name.to_string());
                Ok(())
            }
        });
    })
}

fn panicking_hook_module(name: &str, priority: i32) -> TestModule {
    TestModule::new(name).with_hooks(move |h| {
        h.on(HookPoint::PostRequest, priority, |_ctx| explode::<()>("hook"));
    })
}

fn short_timeouts() -> RuntimeConfig {
    RuntimeConfig {
        handler_timeout_ms: 50,
        health_timeout_ms: 50,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_hook_panic_disables_module_and_chain_continues() {
    let registry = registry();
    let log = call_log();
    install(&registry, logging_module("a", 10, &log)).await;
    let b = install(&registry, panicking_hook_module("b", 20)).await;
    install(&registry, logging_module("c", 30, &log)).await;

    let outcome = registry
        .dispatch_hook(HookPoint::PostRequest, HookInput::new())
        .await;
    assert_eq!(outcome.invoked, 3);
    assert!(!outcome.aborted);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].module, "b");
    assert_eq!(outcome.failures[0].kind, HookFailureKind::Panic);
    assert_eq!(*log.lock(), ["a", "c"]);

    // Out of the live tables before the dispatch returned.
    assert_eq!(registry.status("b"), Some(ModuleStatus::Failed));
    let outcome = registry
        .dispatch_hook(HookPoint::PostRequest, HookInput::new())
        .await;
    assert_eq!(outcome.invoked, 2);
    assert!(outcome.is_ok());

    wait_until(|| b.services().is_revoked()).await;
    assert_eq!(b.stops.load(Ordering::SeqCst), 1);
    let faults = registry.faults("b");
    assert_eq!(faults[0].kind, FaultKind::Panic);
    assert!(faults[0].message.contains("hook exploded"));
    assert!(faults[0].context.contains("post_request"));
    assert_eq!(registry.status("a"), Some(ModuleStatus::Enabled));
    assert_eq!(registry.status("c"), Some(ModuleStatus::Enabled));
}

#[tokio::test]
async fn test_abort_policy_stops_at_panicking_handler() {
    let registry = registry_with(RuntimeConfig {
        hook_policy: ChainPolicy::AbortOnError,
        ..Default::default()
    });
    let log = call_log();
    install(&registry, logging_module("a", 10, &log)).await;
    install(&registry, panicking_hook_module("b", 20)).await;
    install(&registry, logging_module("c", 30, &log)).await;

    let outcome = registry
        .dispatch_hook(HookPoint::PostRequest, HookInput::new())
        .await;
    assert!(outcome.aborted);
    assert_eq!(outcome.invoked, 2);
    assert_eq!(*log.lock(), ["a"]);
}

#[tokio::test]
async fn test_route_panic_returns_generic_error_and_disables_module() {
    let registry = registry();
    install(
        &registry,
        TestModule::new("reports").with_routes(|r| {
            r.get("/ping", |_req| async { Ok("pong") });
        }),
    )
    .await;
    let module = install(
        &registry,
        TestModule::new("analytics").with_routes(|r| {
            r.get("/crash", |_req| explode::<&'static str>("handler"));
        }),
    )
    .await;

    let response = registry.dispatch_route(get("/ext/analytics/crash")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_string(response).await;
    assert!(!body.contains("exploded"), "{body}");

    assert_eq!(
        registry.dispatch_route(get("/ext/analytics/crash")).await.status(),
        StatusCode::NOT_FOUND
    );
    assert_eq!(registry.metrics("analytics").unwrap().panics, 1);
    assert_eq!(
        registry.dispatch_route(get("/ext/reports/ping")).await.status(),
        StatusCode::OK
    );

    wait_until(|| module.stops.load(Ordering::SeqCst) == 1).await;
    let info = registry.get("analytics").unwrap();
    assert_eq!(info.status, ModuleStatus::Failed);
    assert!(info.routes.is_empty());
    assert_eq!(info.last_error.as_deref(), Some("disabled after a fault"));
}

#[tokio::test]
async fn test_quarantined_module_can_be_enabled_again() {
    let registry = registry();
    let module = install(
        &registry,
        TestModule::new("analytics").with_routes(|r| {
            r.get("/crash", |_req| explode::<&'static str>("handler"));
            r.get("/ping", |_req| async { Ok("pong") });
        }),
    )
    .await;

    registry.dispatch_route(get("/ext/analytics/crash")).await;
    wait_until(|| module.stops.load(Ordering::SeqCst) == 1).await;

    registry.enable("analytics").await.unwrap();
    assert_eq!(
        registry.dispatch_route(get("/ext/analytics/ping")).await.status(),
        StatusCode::OK
    );
}

#[tokio::test]
async fn test_middleware_panic_disables_module() {
    let registry = registry();
    install(
        &registry,
        TestModule::new("analytics").with_routes(|r| {
            r.layer(|_req, _next: Next| explode::<Response>("middleware"));
            r.get("/ping", |_req| async { Ok("pong") });
        }),
    )
    .await;

    let response = registry.dispatch_route(get("/ext/analytics/ping")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(registry.status("analytics"), Some(ModuleStatus::Failed));
    assert!(registry.faults("analytics")[0]
        .message
        .contains("middleware exploded"));
}

#[tokio::test]
async fn test_route_timeout_keeps_module_enabled() {
    let registry = registry_with(short_timeouts());
    install(
        &registry,
        TestModule::new("analytics").with_routes(|r| {
            r.get("/slow", |_req| linger("late"));
            r.get("/ping", |_req| async { Ok("pong") });
        }),
    )
    .await;

    let response = registry.dispatch_route(get("/ext/analytics/slow")).await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(body_string(response).await.contains("TIMEOUT"));

    assert_eq!(registry.status("analytics"), Some(ModuleStatus::Enabled));
    assert_eq!(
        registry.dispatch_route(get("/ext/analytics/ping")).await.status(),
        StatusCode::OK
    );
    let metrics = registry.metrics("analytics").unwrap();
    assert_eq!(metrics.timeouts, 1);
    assert_eq!(metrics.requests, 2);
    assert_eq!(metrics.errors, 1);
    assert_eq!(registry.faults("analytics")[0].kind, FaultKind::Timeout);
}

#[tokio::test]
async fn test_hook_timeout_keeps_module_enabled() {
    let registry = registry_with(short_timeouts());
    install(
        &registry,
        TestModule::new("audit").with_hooks(|h| {
            h.on(HookPoint::PostRequest, 0, |_ctx| linger(()));
        }),
    )
    .await;

    let outcome = registry
        .dispatch_hook(HookPoint::PostRequest, HookInput::new())
        .await;
    assert_eq!(outcome.failures[0].kind, HookFailureKind::Timeout);
    assert_eq!(registry.status("audit"), Some(ModuleStatus::Enabled));
    assert_eq!(registry.metrics("audit").unwrap().timeouts, 1);
}

#[tokio::test]
async fn test_log_only_policy_keeps_module_enabled() {
    let registry = registry_with(RuntimeConfig {
        isolation_policy: IsolationPolicy::LogOnly,
        ..Default::default()
    });
    install(
        &registry,
        TestModule::new("analytics").with_routes(|r| {
            r.get("/crash", |_req| explode::<&'static str>("handler"));
        }),
    )
    .await;

    for _ in 0..2 {
        let response = registry.dispatch_route(get("/ext/analytics/crash")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
    assert_eq!(registry.status("analytics"), Some(ModuleStatus::Enabled));
    assert_eq!(registry.faults("analytics").len(), 2);
}

#[tokio::test]
async fn test_health_panic_is_recorded_not_acted_on() {
    let registry = registry();
    let module = install(&registry, TestModule::new("analytics")).await;

    let health = registry.check_health("analytics").await.unwrap();
    assert_eq!(health.state, HealthState::Healthy);

    module.set_health(Behavior::Panic);
    let health = registry.check_health("analytics").await.unwrap();
    assert_eq!(health.state, HealthState::Degraded);
    assert_eq!(health.consecutive_failures, 1);
    assert!(health.message.unwrap().contains("health exploded"));

    assert_eq!(registry.status("analytics"), Some(ModuleStatus::Enabled));
    assert_eq!(registry.faults("analytics")[0].kind, FaultKind::HealthCheck);
    assert_eq!(registry.get("analytics").unwrap().health, HealthState::Degraded);
}

#[tokio::test]
async fn test_health_reaches_unhealthy_after_threshold() {
    let registry = registry();
    let module = install(&registry, TestModule::new("analytics")).await;
    module.set_health(Behavior::Fail);

    let mut last = None;
    for _ in 0..3 {
        last = Some(registry.check_health("analytics").await.unwrap());
    }
    assert_eq!(last.unwrap().state, HealthState::Unhealthy);
    assert_eq!(registry.status("analytics"), Some(ModuleStatus::Enabled));

    module.set_health(Behavior::Succeed);
    let health = registry.check_health("analytics").await.unwrap();
    assert_eq!(health.state, HealthState::Healthy);
    assert_eq!(health.consecutive_failures, 0);
}

#[tokio::test]
async fn test_failing_health_checks_keep_metrics() {
    let registry = registry();
    let module = install(
        &registry,
        TestModule::new("analytics").with_routes(|r| {
            r.get("/ok", |_req| async { Ok("ok") });
            r.get("/bad", |_req| async {
                Err::<&str, _>(ExtensionError::ExecutionFailed("nope".into()))
            });
        }),
    )
    .await;

    for _ in 0..3 {
        let response = registry.dispatch_route(get("/ext/analytics/ok")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    for _ in 0..2 {
        registry.dispatch_route(get("/ext/analytics/bad")).await;
    }
    let before = registry.metrics("analytics").unwrap();
    assert_eq!((before.requests, before.errors), (5, 2));

    module.set_health(Behavior::Fail);
    for _ in 0..5 {
        registry.check_health("analytics").await.unwrap();
    }
    assert_eq!(
        registry.health("analytics").unwrap().state,
        HealthState::Unhealthy
    );

    let after = registry.metrics("analytics").unwrap();
    assert_eq!(after.requests, before.requests);
    assert_eq!(after.errors, before.errors);
    assert_eq!(after.enabled_at, before.enabled_at);
    assert_eq!(registry.status("analytics"), Some(ModuleStatus::Enabled));
}

#[tokio::test]
async fn test_health_monitor_polls_on_interval() {
    let registry = registry_with(RuntimeConfig {
        health_interval_secs: 10,
        ..Default::default()
    });
    let module = install(&registry, TestModule::new("analytics")).await;
    module.set_health(Behavior::Fail);

    tokio::time::pause();
    let monitor = registry.spawn_health_monitor();
    tokio::task::yield_now().await;
    assert!(registry.health("analytics").is_none());

    tokio::time::advance(std::time::Duration::from_secs(11)).await;
    wait_until(|| registry.health("analytics").is_some()).await;
    let health = registry.health("analytics").unwrap();
    assert_eq!(health.state, HealthState::Degraded);
    assert!(health.consecutive_failures >= 1);
    assert_eq!(registry.status("analytics"), Some(ModuleStatus::Enabled));
    monitor.abort();
}

#[tokio::test]
async fn test_health_check_requires_enabled_module() {
    let registry = registry();
    registry
        .register(std::sync::Arc::new(TestModule::new("analytics")))
        .await
        .unwrap();
    assert!(registry.check_health("analytics").await.is_err());
    assert!(registry.check_health("ghost").await.is_err());
}
