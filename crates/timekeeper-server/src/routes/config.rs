use axum::extract::State;
use axum::Json;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/config: the effective configuration plus its validation warnings.
pub async fn get_config(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let config = app.service.config();
    Ok(Json(serde_json::json!({
        "config": serde_json::to_value(config)?,
        "warnings": serde_json::to_value(config.validate())?,
    })))
}
