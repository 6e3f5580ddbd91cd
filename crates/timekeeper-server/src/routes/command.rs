use axum::{extract::State, Json};
use serde::Deserialize;
use timekeeper_core::config::EscalationConfig;
use timekeeper_runtime::CommandResponse;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CommandBody {
    pub text: String,
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default)]
    pub room: Option<String>,
    /// Replaces the configured escalation for an alarm this command creates.
    #[serde(default)]
    pub escalation: Option<EscalationConfig>,
}

#[derive(Deserialize)]
pub struct TextBody {
    pub text: String,
}

fn non_empty(text: &str) -> Result<&str, AppError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(AppError::bad_request("text must not be empty"));
    }
    Ok(text)
}

/// POST /api/command: run an utterance through the timer subsystem.
///
/// Always 200 once the text is accepted; `success` in the body says whether
/// anything was started or changed.
pub async fn process_command(
    State(app): State<AppState>,
    Json(body): Json<CommandBody>,
) -> Result<Json<CommandResponse>, AppError> {
    let text = non_empty(&body.text)?;
    let response = app
        .service
        .process_command_with(
            text,
            body.speaker.as_deref(),
            body.room.as_deref(),
            body.escalation,
        )
        .await;
    tracing::debug!(success = response.success, "command processed");
    Ok(Json(response))
}

/// POST /api/command/check: would `process_command` claim this utterance?
pub async fn check_command(
    State(app): State<AppState>,
    Json(body): Json<TextBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let text = non_empty(&body.text)?;
    Ok(Json(serde_json::json!({
        "timer_command": app.service.is_timer_command(text),
    })))
}

/// POST /api/parse: dry-run the parser without starting anything.
pub async fn parse_command(
    State(app): State<AppState>,
    Json(body): Json<TextBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let text = non_empty(&body.text)?;
    let Some(sequence) = app.service.parser().parse(text, None, None) else {
        return Err(AppError::not_found(format!("no timer phrase in '{text}'")));
    };
    Ok(Json(serde_json::to_value(sequence)?))
}
