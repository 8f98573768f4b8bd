//! Admin HTTP Server Module
//!
//! This module sets up the HTTP server for the management API using axum.

use std::future::Future;
use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::admin::error::{AdminError, AdminResult};
use crate::admin::handlers::{self, AdminState};

/// Build the application router with all routes
pub fn build_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ca.pem", get(handlers::ca_certificate))
        .route("/event", get(handlers::events))
        .route("/proxy", get(handlers::list_proxies).post(handlers::create_proxy))
        // POST takes a proxy type here, DELETE an id
        .route("/proxy/:id", post(handlers::create_typed_proxy).delete(handlers::remove_proxy))
        .route("/proxy/:id/start", get(handlers::start_proxy))
        .route("/proxy/:id/stop", get(handlers::stop_proxy))
        .route("/proxy/:id/update", post(handlers::update_proxy))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the management API until `shutdown` resolves
pub async fn start_admin_server<F>(listen_addr: SocketAddr, state: AdminState, shutdown: F) -> AdminResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    log::info!("Admin API server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| AdminError::Internal(e.to_string()))?;

    Ok(())
}
