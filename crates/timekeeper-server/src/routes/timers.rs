use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use std::time::Duration;
use timekeeper_runtime::{format_status, ActiveOverview};

use crate::error::AppError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

/// GET /api/timers: timers, sequences and ringing alarms.
pub async fn list_active(State(app): State<AppState>) -> Json<ActiveOverview> {
    Json(app.service.list_active())
}

/// GET /api/timers/{id}
pub async fn get_timer(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let timer = app
        .service
        .get_timer(&id)
        .ok_or_else(|| AppError::not_found(format!("timer not found: {id}")))?;
    let status = format_status(&timer);
    let mut json = serde_json::to_value(timer)?;
    json["status"] = serde_json::Value::String(status);
    Ok(Json(json))
}

/// GET /api/pool: handle ownership snapshot.
pub async fn get_pool(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let pool = app.service.pool_snapshot();
    Ok(Json(serde_json::json!({
        "capacity": pool.capacity(),
        "available": pool.available().collect::<Vec<_>>(),
        "in_use": pool.in_use(),
    })))
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

fn applied(found: bool, key: &str) -> Result<Json<serde_json::Value>, AppError> {
    if !found {
        return Err(AppError::not_found(format!("no timer matches '{key}'")));
    }
    Ok(Json(serde_json::json!({ "ok": true, "target": key })))
}

/// POST /api/timers/{key}/cancel: `key` is a timer id, sequence id or label.
pub async fn cancel_timer(
    State(app): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    applied(app.service.cancel(&key).await, &key)
}

/// POST /api/timers/{key}/pause
pub async fn pause_timer(
    State(app): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    applied(app.service.pause(&key).await, &key)
}

/// POST /api/timers/{key}/resume
pub async fn resume_timer(
    State(app): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    applied(app.service.resume(&key).await, &key)
}

#[derive(Deserialize)]
pub struct ExtendBody {
    pub seconds: u64,
}

/// POST /api/timers/{key}/extend
pub async fn extend_timer(
    State(app): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<ExtendBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    if body.seconds == 0 {
        return Err(AppError::bad_request("seconds must be positive"));
    }
    let found = app
        .service
        .extend(&key, Duration::from_secs(body.seconds))
        .await?;
    applied(found, &key)
}

/// DELETE /api/timers: cancel everything.
pub async fn cancel_all(State(app): State<AppState>) -> Json<serde_json::Value> {
    let cancelled = app.service.cancel_all().await;
    Json(serde_json::json!({ "cancelled": cancelled }))
}
