//! Axum router configuration with middleware.
//!
//! All routes are under `/api/v1/`.
//! Middleware: CORS, tracing.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Event stream (server push)
        .route("/agent/stream", get(handlers::stream::agent_stream))
        // Operation lifecycle
        .route(
            "/agent/operations",
            post(handlers::operation::create_operation),
        )
        .route(
            "/agent/operations/{id}",
            get(handlers::operation::get_operation),
        )
        .route(
            "/agent/operations/{id}/cancel",
            post(handlers::operation::cancel_operation),
        )
        .route(
            "/agent/operations/{id}/intervention",
            post(handlers::operation::intervene),
        )
        .route(
            "/agent/interventions",
            get(handlers::operation::pending_interventions),
        )
        // Group orchestration triggers
        .route(
            "/groups/{group_id}/speak",
            post(handlers::orchestration::trigger_speak),
        )
        .route(
            "/groups/{group_id}/broadcast",
            post(handlers::orchestration::trigger_broadcast),
        )
        .route(
            "/groups/{group_id}/delegate",
            post(handlers::orchestration::trigger_delegate),
        );

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Simple health check endpoint.
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
