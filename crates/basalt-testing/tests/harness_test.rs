//! Harness tests
//!
//! The fixtures driven through the harness the way a module author would.

use axum::http::{Method, StatusCode};
use basalt_core::extension::{
    HookInput, HookPoint, ModuleStatus, RequestInfo, ResponseInfo, UserInfo,
};
use basalt_core::RuntimeConfig;
use basalt_testing::{AnalyticsFixture, EchoFixture, MockIdentity, TestHarness};
use serde_json::json;

fn post_request(path: &str) -> HookInput {
    HookInput::new()
        .with_request(RequestInfo::new("GET", path))
        .with_response(ResponseInfo {
            status: 200,
            elapsed_ms: 1,
        })
}

#[tokio::test]
async fn test_analytics_fixture_lifecycle() {
    let harness = TestHarness::new();
    let analytics = AnalyticsFixture::new();
    harness.install(analytics.clone()).await.unwrap();

    let response = harness.get("/ext/analytics/ping").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.text(), "pong");

    for i in 0..3 {
        let outcome = harness
            .dispatch_hook_with(HookPoint::PostRequest, post_request(&format!("/api/items/{i}")))
            .await;
        assert!(outcome.is_ok(), "{outcome:?}");
    }
    assert_eq!(analytics.counter(), 3);

    let services = analytics.services().unwrap();
    let rows: Vec<(String, serde_json::Value)> = services.data().scan("events", "", None).unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[2].1, json!({ "path": "/api/items/2", "status": 200 }));

    harness.registry().disable("analytics").await.unwrap();
    assert_eq!(
        harness.get("/ext/analytics/ping").await.status,
        StatusCode::NOT_FOUND
    );
    harness.dispatch_hook(HookPoint::PostRequest).await;
    assert_eq!(analytics.counter(), 3);
}

#[tokio::test]
async fn test_echo_fixture_routes() {
    let identity = MockIdentity::new().with_user(UserInfo::new("u1", "alice"), "alice-token");
    let harness = TestHarness::with_identity(RuntimeConfig::default(), identity);
    harness.install(EchoFixture::new("echo")).await.unwrap();

    let response = harness.get("/ext/echo/echo?x=1").await;
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body, json!({ "path": "/ext/echo/echo", "query": "x=1" }));

    let response = harness
        .request_json(Method::POST, "/ext/echo/echo", &json!({ "a": 1 }))
        .await;
    assert_eq!(response.json::<serde_json::Value>().unwrap(), json!({ "a": 1 }));

    let response = harness.get("/ext/echo/whoami").await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    let response = harness
        .request_with_token(Method::GET, "/ext/echo/whoami", "alice-token")
        .await;
    assert_eq!(response.text(), "alice");
}

#[tokio::test]
async fn test_harnesses_are_isolated() {
    let first = TestHarness::new();
    let second = TestHarness::new();
    first.install(EchoFixture::new("echo")).await.unwrap();

    assert_eq!(first.registry().status("echo"), Some(ModuleStatus::Enabled));
    assert_eq!(second.registry().status("echo"), None);
    assert_eq!(
        second.get("/ext/echo/echo").await.status,
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn test_install_reports_registration_errors() {
    let harness = TestHarness::new();
    harness.install(EchoFixture::new("echo")).await.unwrap();
    assert!(harness.install(EchoFixture::new("echo")).await.is_err());
}
