//! axum HTTP surface over [`TimerService`]: JSON routes for the intent
//! router and acknowledgment sources, plus an SSE feed of lifecycle events.

pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use timekeeper_runtime::TimerService;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(service: Arc<TimerService>) -> Router {
    let app_state = state::AppState::new(service);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Events (SSE)
        .route("/api/events", get(routes::events::sse_events))
        // Commands
        .route("/api/command", post(routes::command::process_command))
        .route("/api/command/check", post(routes::command::check_command))
        .route("/api/parse", post(routes::command::parse_command))
        // Timers
        .route("/api/timers", get(routes::timers::list_active))
        .route("/api/timers", delete(routes::timers::cancel_all))
        .route("/api/timers/{id}", get(routes::timers::get_timer))
        .route(
            "/api/timers/{key}/cancel",
            post(routes::timers::cancel_timer),
        )
        .route("/api/timers/{key}/pause", post(routes::timers::pause_timer))
        .route(
            "/api/timers/{key}/resume",
            post(routes::timers::resume_timer),
        )
        .route(
            "/api/timers/{key}/extend",
            post(routes::timers::extend_timer),
        )
        .route("/api/pool", get(routes::timers::get_pool))
        // Escalations
        .route(
            "/api/escalations",
            get(routes::escalations::list_escalations),
        )
        .route(
            "/api/escalations/acknowledge",
            post(routes::escalations::acknowledge),
        )
        // Config
        .route("/api/config", get(routes::config::get_config))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Start the HTTP server on `0.0.0.0:{port}`.
///
/// The service must already be started so finished countdowns are dispatched.
pub async fn serve(service: Arc<TimerService>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve_on(service, listener).await
}

/// Start the server on a pre-bound listener.
///
/// Lets the caller read the actual port first when binding port 0.
pub async fn serve_on(
    service: Arc<TimerService>,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let app = build_router(service);

    tracing::info!("timekeeper listening on http://localhost:{actual_port}");

    axum::serve(listener, app).await?;
    Ok(())
}
