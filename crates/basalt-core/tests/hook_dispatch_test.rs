//! Hook dispatch tests
//!
//! Ordering by `(priority, registration sequence)`, chain policies and the
//! shared data map handlers use to talk to each other.

mod common;

use basalt_core::extension::{
    ChainPolicy, ExtensionError, HookFailureKind, HookInput, HookPoint, RequestInfo,
    ResponseInfo,
};
use basalt_core::RuntimeConfig;
use common::{call_log, install, registry, registry_with, CallLog, TestModule};
use serde_json::json;

fn recorder(name: &'static str, point: HookPoint, priority: i32, log: &CallLog) -> TestModule {
    let log = log.clone();
    TestModule::new(name).with_hooks(move |h| {
        let log = log.clone();
        h.on(point.clone(), priority, move |_ctx| {
            let log = log.clone();
            async move {
                log.lock().push(name.to_string());
                Ok(())
            }
        });
    })
}

fn failing(name: &'static str, priority: i32, log: &CallLog) -> TestModule {
    let log = log.clone();
    TestModule::new(name).with_hooks(move |h| {
        let log = log.clone();
        h.on(HookPoint::PreRequest, priority, move |_ctx| {
            let log = log.clone();
            async move {
                log.lock().push(name.to_string());
                Err(ExtensionError::InvalidInput("rejected".to_string()))
            }
        });
    })
}

#[tokio::test]
async fn test_handlers_run_in_priority_order() {
    let registry = registry();
    let log = call_log();
    install(&registry, recorder("late", HookPoint::PreRequest, 100, &log)).await;
    install(&registry, recorder("early", HookPoint::PreRequest, -10, &log)).await;
    install(&registry, recorder("middle", HookPoint::PreRequest, 0, &log)).await;

    let outcome = registry
        .dispatch_hook(HookPoint::PreRequest, HookInput::new())
        .await;
    assert_eq!(outcome.invoked, 3);
    assert!(outcome.is_ok());
    assert_eq!(*log.lock(), ["early", "middle", "late"]);
}

#[tokio::test]
async fn test_equal_priorities_keep_registration_order() {
    let registry = registry();
    let log = call_log();
    for name in ["zeta", "alpha", "mid"] {
        install(&registry, recorder(name, HookPoint::PreRequest, 5, &log)).await;
    }

    for _ in 0..3 {
        registry
            .dispatch_hook(HookPoint::PreRequest, HookInput::new())
            .await;
    }
    let calls = log.lock().clone();
    assert_eq!(calls.len(), 9);
    for chunk in calls.chunks(3) {
        assert_eq!(chunk, ["zeta", "alpha", "mid"]);
    }
}

#[tokio::test]
async fn test_reenabled_module_moves_to_end_of_its_priority() {
    let registry = registry();
    let log = call_log();
    install(&registry, recorder("a", HookPoint::PreRequest, 0, &log)).await;
    install(&registry, recorder("b", HookPoint::PreRequest, 0, &log)).await;

    registry.disable("a").await.unwrap();
    registry.enable("a").await.unwrap();
    registry
        .dispatch_hook(HookPoint::PreRequest, HookInput::new())
        .await;
    assert_eq!(*log.lock(), ["b", "a"]);
}

#[tokio::test]
async fn test_collect_policy_runs_every_handler() {
    let registry = registry();
    let log = call_log();
    install(&registry, failing("strict", 0, &log)).await;
    install(&registry, recorder("after", HookPoint::PreRequest, 10, &log)).await;

    let outcome = registry
        .dispatch_hook(HookPoint::PreRequest, HookInput::new())
        .await;
    assert_eq!(outcome.invoked, 2);
    assert!(!outcome.aborted);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].kind, HookFailureKind::Error);
    assert!(outcome.failures[0].message.contains("rejected"));
    assert_eq!(*log.lock(), ["strict", "after"]);

    // An error is not a fault; the module stays live.
    assert_eq!(
        registry.status("strict"),
        Some(basalt_core::ModuleStatus::Enabled)
    );
    let metrics = registry.metrics("strict").unwrap();
    assert_eq!(metrics.hook_invocations, 1);
    assert_eq!(metrics.hook_errors, 1);
}

#[tokio::test]
async fn test_abort_policy_stops_at_first_error() {
    let registry = registry_with(RuntimeConfig {
        hook_policy: ChainPolicy::AbortOnError,
        ..Default::default()
    });
    let log = call_log();
    install(&registry, recorder("first", HookPoint::PreRequest, -5, &log)).await;
    install(&registry, failing("strict", 0, &log)).await;
    install(&registry, recorder("after", HookPoint::PreRequest, 10, &log)).await;

    let outcome = registry
        .dispatch_hook(HookPoint::PreRequest, HookInput::new())
        .await;
    assert!(outcome.aborted);
    assert_eq!(outcome.invoked, 2);
    assert_eq!(*log.lock(), ["first", "strict"]);
}

#[tokio::test]
async fn test_points_are_dispatched_independently() {
    let registry = registry();
    let log = call_log();
    install(&registry, recorder("pre", HookPoint::PreRequest, 0, &log)).await;
    install(&registry, recorder("post", HookPoint::PostRequest, 0, &log)).await;

    let outcome = registry
        .dispatch_hook(HookPoint::PostRequest, HookInput::new())
        .await;
    assert_eq!(outcome.invoked, 1);
    assert_eq!(*log.lock(), ["post"]);

    let outcome = registry
        .dispatch_hook(HookPoint::PreDataAccess, HookInput::new())
        .await;
    assert_eq!(outcome.invoked, 0);
}

#[tokio::test]
async fn test_handlers_share_data_and_see_request() {
    let registry = registry();
    install(
        &registry,
        TestModule::new("tracer").with_hooks(|h| {
            h.on(HookPoint::PostRequest, 0, |ctx| async move {
                let path = ctx.request().map(|r| r.path.clone()).unwrap_or_default();
                let status = ctx.response().map(|r| r.status).unwrap_or_default();
                ctx.set("seen", json!(format!("{path} {status}")));
                Ok(())
            });
        }),
    )
    .await;
    install(
        &registry,
        TestModule::new("counter").with_hooks(|h| {
            h.on(HookPoint::PostRequest, 10, |ctx| async move {
                let seen = ctx.get("seen").unwrap_or_default();
                ctx.set("echo", seen);
                Ok(())
            });
        }),
    )
    .await;

    let input = HookInput::new()
        .with_request(RequestInfo::new("GET", "/api/health"))
        .with_response(ResponseInfo {
            status: 200,
            elapsed_ms: 3,
        });
    let outcome = registry
        .dispatch_hook(HookPoint::PostRequest, input.clone())
        .await;
    assert!(outcome.is_ok());
    let data = input.data();
    assert_eq!(data["seen"], json!("/api/health 200"));
    assert_eq!(data["echo"], json!("/api/health 200"));
}

#[tokio::test]
async fn test_disabled_module_receives_no_hooks() {
    let registry = registry();
    let log = call_log();
    install(&registry, recorder("a", HookPoint::PreRequest, 0, &log)).await;
    install(&registry, recorder("b", HookPoint::PreRequest, 1, &log)).await;

    registry.disable("a").await.unwrap();
    let outcome = registry
        .dispatch_hook(HookPoint::PreRequest, HookInput::new())
        .await;
    assert_eq!(outcome.invoked, 1);
    assert_eq!(*log.lock(), ["b"]);
    assert!(registry.get("a").unwrap().hooks.is_empty());
    assert_eq!(registry.get("b").unwrap().hooks[0].priority, 1);
}
