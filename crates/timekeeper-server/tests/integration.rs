use axum::http::StatusCode;
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Duration;
use timekeeper_core::config::Config;
use timekeeper_runtime::TimerService;
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A started service over `handles` simulated countdowns, behind the router.
async fn app(handles: usize) -> axum::Router {
    let mut config = Config::default();
    config.pool.handles = (1..=handles).map(|i| format!("timer.t{i}")).collect();
    config.escalation.stage_delays_secs = [30, 30, 60];
    let service = Arc::new(TimerService::builder(config).build());
    service.start().await;
    timekeeper_server::build_router(service)
}

async fn send(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let builder = axum::http::Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(axum::body::Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn get(app: &axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    send(app, "GET", uri, None).await
}

async fn post_json(
    app: &axum::Router,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    send(app, "POST", uri, Some(body)).await
}

async fn command(app: &axum::Router, text: &str) -> serde_json::Value {
    let (status, json) = post_json(
        app,
        "/api/command",
        serde_json::json!({ "text": text, "room": "kitchen" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    json
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn command_creates_a_labelled_timer() {
    let app = app(3).await;
    let json = command(&app, "set a pizza timer for 15 minutes").await;
    assert_eq!(json["success"], true);
    assert!(json["response_text"].as_str().unwrap().contains("pizza"));
    assert_eq!(json["timer"]["label"], "pizza");
    assert_eq!(json["sequence"]["shape"], "alarm");

    let (status, json) = get(&app, "/api/timers").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["timers"].as_array().unwrap().len(), 1);
    assert!(json["sequences"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn empty_command_is_rejected() {
    let app = app(1).await;
    let (status, json) =
        post_json(&app, "/api/command", serde_json::json!({ "text": "   " })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn unrecognized_command_reports_failure() {
    let app = app(1).await;
    let json = command(&app, "what's the weather").await;
    assert_eq!(json["success"], false);
    assert!(json.get("timer").is_none());
}

#[tokio::test]
async fn check_command_classifies_utterances() {
    let app = app(1).await;
    let (_, json) = post_json(
        &app,
        "/api/command/check",
        serde_json::json!({ "text": "turn off the fan in 5 minutes" }),
    )
    .await;
    assert_eq!(json["timer_command"], true);

    let (_, json) = post_json(
        &app,
        "/api/command/check",
        serde_json::json!({ "text": "play some jazz" }),
    )
    .await;
    assert_eq!(json["timer_command"], false);
}

#[tokio::test]
async fn parse_is_a_dry_run() {
    let app = app(1).await;
    let (status, json) = post_json(
        &app,
        "/api/parse",
        serde_json::json!({ "text": "turn on the porch light for 10 minutes" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["shape"], "device_duration");
    assert_eq!(json["actions"].as_array().unwrap().len(), 2);

    let (_, pool) = get(&app, "/api/pool").await;
    assert_eq!(pool["available"].as_array().unwrap().len(), 1);

    let (status, _) = post_json(
        &app,
        "/api/parse",
        serde_json::json!({ "text": "hello there" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn get_timer_includes_status_line() {
    let app = app(2).await;
    let json = command(&app, "set a tea timer for 4 minutes").await;
    let id = json["timer"]["id"].as_str().unwrap().to_string();

    let (status, json) = get(&app, &format!("/api/timers/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["status"].as_str().unwrap().starts_with("tea timer:"));

    let (status, _) = get(&app, "/api/timers/tmr-missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_by_label_frees_the_handle() {
    let app = app(1).await;
    command(&app, "set a pizza timer for 15 minutes").await;

    let (_, pool) = get(&app, "/api/pool").await;
    assert!(pool["available"].as_array().unwrap().is_empty());

    let (status, json) = post_json(&app, "/api/timers/pizza/cancel", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);

    let (_, pool) = get(&app, "/api/pool").await;
    assert_eq!(pool["capacity"], 1);
    assert_eq!(pool["available"].as_array().unwrap().len(), 1);

    let (status, _) = post_json(&app, "/api/timers/pizza/cancel", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn pause_resume_and_extend() {
    let app = app(1).await;
    command(&app, "set a bread timer for 20 minutes").await;

    let (status, _) = post_json(&app, "/api/timers/bread/pause", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let (_, json) = get(&app, "/api/timers").await;
    assert!(json["timers"][0]["paused_remaining"].is_number());

    let (status, _) = post_json(&app, "/api/timers/bread/resume", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = post_json(
        &app,
        "/api/timers/bread/extend",
        serde_json::json!({ "seconds": 300 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, json) = get(&app, "/api/timers").await;
    assert_eq!(json["timers"][0]["duration"], 1500);

    let (status, _) = post_json(
        &app,
        "/api/timers/bread/extend",
        serde_json::json!({ "seconds": 0 }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, json) = post_json(
        &app,
        "/api/timers/bread/extend",
        serde_json::json!({ "seconds": u64::MAX }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("invalid duration"));
    let (_, json) = get(&app, "/api/timers").await;
    assert_eq!(json["timers"][0]["duration"], 1500);
}

#[tokio::test]
async fn delete_cancels_everything() {
    let app = app(3).await;
    command(&app, "set a timer for 5 minutes").await;
    command(&app, "turn on the fan for 10 minutes").await;

    let (status, json) = send(&app, "DELETE", "/api/timers", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["cancelled"], 2);

    let (_, json) = get(&app, "/api/timers").await;
    assert!(json["timers"].as_array().unwrap().is_empty());
    assert!(json["sequences"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn exhausted_pool_is_reported_in_the_body() {
    let app = app(1).await;
    command(&app, "set a timer for 5 minutes").await;
    let json = command(&app, "set a timer for 10 minutes").await;
    assert_eq!(json["success"], false);
}

#[tokio::test(start_paused = true)]
async fn ringing_alarm_is_acknowledged_over_http() {
    let app = app(1).await;
    command(&app, "set a pizza timer for 1 minute").await;

    tokio::time::sleep(Duration::from_secs(61)).await;
    let (_, json) = get(&app, "/api/escalations").await;
    let ringing = json.as_array().unwrap();
    assert_eq!(ringing.len(), 1);
    assert_eq!(ringing[0]["label"], "pizza");

    let (status, json) = post_json(
        &app,
        "/api/escalations/acknowledge",
        serde_json::json!({ "timer": "pizza", "source": "phone" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["acknowledged"], 1);

    let (_, json) = get(&app, "/api/escalations").await;
    assert!(json.as_array().unwrap().is_empty());

    let (status, _) = post_json(
        &app,
        "/api/escalations/acknowledge",
        serde_json::json!({ "timer": "pizza" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn config_reports_warnings() {
    let app = app(2).await;
    let (status, json) = get(&app, "/api/config").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["config"]["pool"]["handles"].as_array().unwrap().len(), 2);
    assert!(json["warnings"].is_array());
}
