//! Application router configuration.

use axum::{
    extract::{Request, State},
    response::Response,
    routing::{any, get, post, put},
    Router,
};

use super::middleware::{request_hooks_middleware, require_admin};
use super::types::{ServerState, MAX_REQUEST_BODY_SIZE};

/// Build the host router.
///
/// `core` holds the host's own routes; they run inside the request hook
/// chains. Module routes are served under `/<namespace>/*` straight from the
/// registry snapshot, and the admin surface lives under `/api/extensions`.
pub fn create_router(state: ServerState, core: Router<ServerState>) -> Router {
    use crate::handlers::{basic, extensions};

    // Public routes (no authentication required)
    let public_routes = Router::new()
        .route("/api/health", get(basic::health_handler))
        .route("/api/health/status", get(basic::health_status_handler));

    // Host routes observed by pre_request/post_request hooks
    let core_routes = core.layer(axum::middleware::from_fn_with_state(
        state.clone(),
        request_hooks_middleware,
    ));

    // Admin routes (require admin role)
    let admin_routes = Router::new()
        .route("/api/extensions", get(extensions::list_extensions_handler))
        .route("/api/extensions/:name", get(extensions::get_extension_handler))
        .route(
            "/api/extensions/:name/enable",
            post(extensions::enable_extension_handler),
        )
        .route(
            "/api/extensions/:name/disable",
            post(extensions::disable_extension_handler),
        )
        .route(
            "/api/extensions/:name/config",
            put(extensions::update_extension_config_handler),
        )
        .route(
            "/api/extensions/:name/health",
            get(extensions::extension_health_handler),
        )
        .route(
            "/api/extensions/:name/metrics",
            get(extensions::extension_metrics_handler),
        )
        .route(
            "/api/extensions/:name/faults",
            get(extensions::extension_faults_handler),
        )
        .route(
            "/api/extensions/:name/migrations",
            get(extensions::extension_migrations_handler),
        )
        .route(
            "/api/extensions/:name/migrations/rollback",
            post(extensions::rollback_migrations_handler),
        )
        .route(
            "/api/extensions/:name/templates",
            get(extensions::extension_templates_handler),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_admin,
        ));

    // Module surface, resolved per request against the live snapshot
    let namespace = state.registry.config().namespace.clone();
    let extension_routes =
        Router::new().route(&format!("/{}/*rest", namespace), any(extension_route_handler));

    public_routes
        .merge(core_routes)
        .merge(admin_routes)
        .merge(extension_routes)
        .layer(tower_http::limit::RequestBodyLimitLayer::new(
            MAX_REQUEST_BODY_SIZE,
        ))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn extension_route_handler(State(state): State<ServerState>, request: Request) -> Response {
    state.registry.dispatch_route(request).await
}
