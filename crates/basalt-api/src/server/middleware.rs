//! Server middleware.

use std::time::Instant;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use basalt_core::extension::{bearer_token, HookInput, HookPoint, RequestInfo, ResponseInfo};

use super::types::{ServerState, ADMIN_ROLE};
use crate::models::error::ErrorResponse;

/// Runs the `pre_request` and `post_request` hook chains around a core
/// route.
///
/// Hooks observe the request; they cannot reject it. Failures are already
/// recorded by the registry and only logged here.
pub async fn request_hooks_middleware(
    State(state): State<ServerState>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let mut info = RequestInfo::new(request.method().as_str(), request.uri().path());
    info.query = request.uri().query().map(str::to_string);
    let token = bearer_token(request.headers()).map(str::to_string);
    if let Some(token) = token {
        info.user = state.identity.validate_token(&token).await.ok().flatten();
    }

    let input = HookInput::new().with_request(info);
    let pre = state
        .registry
        .dispatch_hook(HookPoint::PreRequest, input.clone())
        .await;
    if !pre.is_ok() {
        tracing::debug!(
            category = "extensions",
            failures = pre.failures.len(),
            "pre_request hooks reported failures"
        );
    }

    let response = next.run(request).await;

    let input = input.with_response(ResponseInfo {
        status: response.status().as_u16(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    });
    let post = state
        .registry
        .dispatch_hook(HookPoint::PostRequest, input)
        .await;
    if !post.is_ok() {
        tracing::debug!(
            category = "extensions",
            failures = post.failures.len(),
            "post_request hooks reported failures"
        );
    }

    response
}

/// Admin guard: bearer token resolved through the identity provider, with
/// the `admin` role.
pub async fn require_admin(
    State(state): State<ServerState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ErrorResponse> {
    let token = bearer_token(request.headers())
        .map(str::to_string)
        .ok_or_else(|| ErrorResponse::unauthorized("Missing bearer token"))?;

    let user = state
        .identity
        .validate_token(&token)
        .await
        .map_err(|e| {
            tracing::warn!(category = "auth", error = %e, "Identity provider failed");
            ErrorResponse::internal("Identity provider unavailable")
        })?
        .ok_or_else(|| ErrorResponse::unauthorized("Invalid token"))?;

    if !user.has_role(ADMIN_ROLE) {
        return Err(ErrorResponse::forbidden("Admin role required"));
    }

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}
