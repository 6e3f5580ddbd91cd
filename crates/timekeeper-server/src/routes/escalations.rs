use axum::{extract::State, Json};
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/escalations: alarms currently escalating.
pub async fn list_escalations(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!(app.service.list_active().escalations))
}

#[derive(Deserialize, Default)]
pub struct AcknowledgeBody {
    /// Timer id or label; omitted means every ringing alarm.
    #[serde(default)]
    pub timer: Option<String>,
    /// Who acknowledged: a phone, a room, a person.
    #[serde(default)]
    pub source: Option<String>,
}

/// POST /api/escalations/acknowledge
pub async fn acknowledge(
    State(app): State<AppState>,
    Json(body): Json<AcknowledgeBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let count = app
        .service
        .acknowledge(body.timer.as_deref(), body.source.as_deref());
    if count == 0 {
        if let Some(timer) = body.timer {
            return Err(AppError::not_found(format!("no alarm is ringing for '{timer}'")));
        }
    }
    Ok(Json(serde_json::json!({ "acknowledged": count })))
}
