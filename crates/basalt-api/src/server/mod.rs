//! Web server for the Basalt host.

pub mod middleware;
pub mod router;
pub mod types;

pub use middleware::{request_hooks_middleware, require_admin};
pub use router::create_router;
pub use types::{ServerState, ADMIN_ROLE, MAX_REQUEST_BODY_SIZE};

use axum::Router;
use tokio::net::TcpListener;

/// Serve until a shutdown signal, then disable every module.
pub async fn serve(
    listener: TcpListener,
    state: ServerState,
    core: Router<ServerState>,
) -> std::io::Result<()> {
    let registry = state.registry.clone();
    let health_monitor = registry.spawn_health_monitor();
    let app = create_router(state, core);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    health_monitor.abort();
    registry.shutdown().await;
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
