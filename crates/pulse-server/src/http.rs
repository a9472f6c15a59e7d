// HTTP and WebSocket endpoints

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use pulse_core::{Orchestrator, RunConfig, RunContext};
use pulse_types::{Run, RunRequest, RunResponse};

use crate::AppState;

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/run", post(start_run))
        .route("/api/run/{id}/cancel", post(cancel_run))
        .route("/api/run/{id}/rerun", post(rerun))
        .route("/api/run/{id}", get(run_details).delete(delete_run))
        .route("/api/status", get(status))
        .route("/api/history", get(history))
        .route("/api/query-groups", get(query_groups))
        .route("/ws", get(ws_upgrade))
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

// ===== Run lifecycle =====

/// Shared launch path for fresh runs and reruns. Rejects with 409 while
/// any run is live; the registry additionally guards per-id uniqueness.
async fn launch_run(
    state: &AppState,
    config: RunConfig,
    parent_run_id: Option<String>,
    user_id: Option<String>,
) -> Result<RunResponse, ApiError> {
    let active = state.registry.active_run_ids();
    if let Some(active_id) = active.first() {
        return Err(api_error(
            StatusCode::CONFLICT,
            format!("run {active_id} is already active"),
        ));
    }

    let run_id = format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S_%3f"));
    let mut run = Run::new(run_id.clone(), config.query.clone(), config.sources.clone());
    run.parent_run_id = parent_run_id;
    run.user_id = user_id;
    state.store.create_run(&run).map_err(|err| {
        warn!("failed to persist run record: {err}");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to persist run")
    })?;

    // Reset is acknowledged before the run task exists, so every event the
    // run emits lands in the new cache
    state.delivery.reset(&run_id, config.query.clone()).await;

    let orchestrator = Orchestrator::new(state.store.clone(), state.pipeline.clone());
    let bridge = state.bridge.clone();
    let task_run_id = run_id.clone();
    state
        .registry
        .start(&run_id, move |cancel| async move {
            let ctx = RunContext::new(task_run_id, bridge, cancel);
            orchestrator.run(ctx, config).await;
        })
        .map_err(|err| api_error(StatusCode::CONFLICT, err.to_string()))?;

    info!(run_id, "run started");
    Ok(RunResponse {
        run_id,
        status: "started".to_string(),
        query: run.query,
    })
}

async fn start_run(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    let config = RunConfig::from_request(&request);
    let response = launch_run(&state, config, None, request.user_id).await?;
    Ok(Json(response))
}

/// Launches a new run with the same query and sources as an earlier one
async fn rerun(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    let parent = state
        .store
        .get_run(&id)
        .map_err(|err| api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("run {id} not found")))?;

    let config = RunConfig {
        query: parent.query.clone(),
        sources: parent.sources.clone(),
        ..Default::default()
    };
    let response = launch_run(&state, config, Some(parent.run_id), parent.user_id).await?;
    Ok(Json(response))
}

async fn cancel_run(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let cancelled = state.registry.cancel(&id);
    if cancelled {
        info!(run_id = %id, "cancellation requested");
    }
    Json(json!({ "ok": cancelled }))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let active = state.registry.active_run_ids();
    let snapshot = state.delivery.snapshot().await.unwrap_or_default();
    Json(json!({
        "active": !active.is_empty(),
        "run_id": snapshot.run_id,
        "status": snapshot.status,
        "phase": snapshot.phase,
        "progress": snapshot.progress,
        "signal_count": snapshot.signals.len(),
    }))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    20
}

async fn history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Value>, ApiError> {
    let items = state
        .store
        .list_history(params.limit)
        .map_err(|err| api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(json!({ "runs": items })))
}

#[derive(Debug, Deserialize)]
struct QueryGroupParams {
    #[serde(default = "default_query_group_limit")]
    limit: usize,
}

fn default_query_group_limit() -> usize {
    20
}

/// History clustered by query text, newest group first
async fn query_groups(
    State(state): State<AppState>,
    Query(params): Query<QueryGroupParams>,
) -> Result<Json<Value>, ApiError> {
    let groups = state
        .store
        .query_groups(params.limit)
        .map_err(|err| api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(json!({ "groups": groups })))
}

async fn run_details(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let run = state
        .store
        .get_run(&id)
        .map_err(|err| api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("run {id} not found")))?;
    let steps = state
        .store
        .list_steps(&id, None)
        .map_err(|err| api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(json!({ "run": run, "steps": steps })))
}

#[derive(Debug, Deserialize)]
struct DeleteParams {
    #[serde(default)]
    confirm: bool,
}

async fn delete_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Result<Json<Value>, ApiError> {
    if !params.confirm {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "pass confirm=true to delete a run",
        ));
    }
    if state.registry.is_active(&id) {
        return Err(api_error(
            StatusCode::CONFLICT,
            "cannot delete a run while it is active",
        ));
    }
    let removed = state
        .store
        .delete_run(&id)
        .map_err(|err| api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    if !removed {
        return Err(api_error(StatusCode::NOT_FOUND, format!("run {id} not found")));
    }
    Ok(Json(json!({ "ok": true })))
}

// ===== WebSocket =====

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_stream(socket, state))
}

async fn ws_stream(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<String>();
    let Some(observer_id) = state.delivery.attach(frame_tx).await else {
        return;
    };

    loop {
        tokio::select! {
            frame = frame_rx.recv() => {
                let Some(frame) = frame else { break };
                if ws_tx.send(WsMessage::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(reply) = client_command(&state, text.as_str()) {
                            if ws_tx.send(WsMessage::Text(reply.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.delivery.detach(observer_id);
}

#[derive(Debug, Deserialize)]
struct ClientCommand {
    command: String,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default = "default_history_limit")]
    limit: usize,
}

/// Handles observer-initiated queries on the socket. Unknown or malformed
/// commands are ignored rather than answered with an error frame.
fn client_command(state: &AppState, text: &str) -> Option<String> {
    let command: ClientCommand = serde_json::from_str(text).ok()?;
    match command.command.as_str() {
        "get_history" => {
            let runs = state.store.list_history(command.limit).ok()?;
            Some(json!({ "type": "history", "data": { "runs": runs } }).to_string())
        }
        "get_query_groups" => {
            let groups = state.store.query_groups(command.limit).ok()?;
            Some(json!({ "type": "query_groups", "data": { "groups": groups } }).to_string())
        }
        "get_run_details" => {
            let run_id = command.run_id?;
            let run = state.store.get_run(&run_id).ok()??;
            let steps = state.store.list_steps(&run_id, None).ok()?;
            Some(json!({ "type": "run_details", "data": { "run": run, "steps": steps } }).to_string())
        }
        other => {
            warn!(command = other, "unknown ws command");
            None
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use pulse_core::{IntentInfo, JsonRunStore, NewsItem, PulseError, Result as CoreResult, StagePipeline};
    use pulse_types::{ChartData, RunStatus, Signal};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;
    use tower::ServiceExt;

    /// Pipeline that parks in the fetch phase until released, keeping the
    /// run observably active. In-flight stage calls are never aborted, so
    /// cancellation only lands once the parked fetch returns.
    struct ParkedPipeline {
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl StagePipeline for ParkedPipeline {
        async fn interpret_intent(&self, query: &str) -> CoreResult<IntentInfo> {
            Ok(IntentInfo {
                focus: query.to_string(),
                ..Default::default()
            })
        }

        async fn fetch_source(&self, _source: &str, _wide: u32) -> CoreResult<Vec<NewsItem>> {
            self.release.notified().await;
            Ok(Vec::new())
        }

        async fn search(&self, _query: &str) -> CoreResult<Vec<NewsItem>> {
            Ok(Vec::new())
        }

        async fn refresh_sentiment(&self) -> CoreResult<usize> {
            Ok(0)
        }

        async fn stored_backlog(&self) -> CoreResult<Vec<NewsItem>> {
            Ok(Vec::new())
        }

        async fn filter_high_value(
            &self,
            items: Vec<NewsItem>,
            _intent: Option<&IntentInfo>,
        ) -> CoreResult<Vec<NewsItem>> {
            Ok(items)
        }

        async fn analyze_item(
            &self,
            _item: &NewsItem,
            _intent: Option<&IntentInfo>,
        ) -> CoreResult<Option<Signal>> {
            Ok(None)
        }

        async fn chart_for(&self, _signal: &Signal, _ticker: &str) -> CoreResult<Option<ChartData>> {
            Ok(None)
        }

        async fn render_report(&self, _run_id: &str, _signals: &[Signal]) -> CoreResult<String> {
            Err(PulseError::Stage("no report in tests".to_string()))
        }
    }

    fn test_state() -> (AppState, Arc<tokio::sync::Notify>, tempfile::TempDir) {
        let temp = tempdir().unwrap();
        let store = Arc::new(JsonRunStore::new(temp.path()).unwrap());
        let release = Arc::new(tokio::sync::Notify::new());
        let state = AppState::new(
            store,
            Arc::new(ParkedPipeline {
                release: release.clone(),
            }),
        );
        (state, release, temp)
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_run() -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/run")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap()
    }

    #[tokio::test]
    async fn health_responds_ok() {
        let (state, _release, _temp) = test_state();
        let response = app_router(state)
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["ok"], true);
    }

    #[tokio::test]
    async fn second_start_conflicts_while_run_is_active() {
        let (state, release, _temp) = test_state();
        let app = app_router(state.clone());

        let first = app.clone().oneshot(post_run()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let run_id = json_body(first).await["run_id"].as_str().unwrap().to_string();

        let second = app.clone().oneshot(post_run()).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);

        // Cancel and wait for the registry to release the id
        let cancel = app
            .clone()
            .oneshot(
                Request::post(format!("/api/run/{run_id}/cancel"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(json_body(cancel).await["ok"], true);

        // Unpark the in-flight fetch; the next checkpoint observes the token
        for _ in 0..200 {
            if !state.registry.is_active(&run_id) {
                break;
            }
            release.notify_waiters();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!state.registry.is_active(&run_id));

        let run = state.store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn unknown_run_details_is_not_found() {
        let (state, _release, _temp) = test_state();
        let response = app_router(state)
            .oneshot(Request::get("/api/run/ghost").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_requires_confirmation() {
        let (state, _release, _temp) = test_state();
        let app = app_router(state);

        let response = app
            .clone()
            .oneshot(
                Request::delete("/api/run/whatever")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(
                Request::delete("/api/run/whatever?confirm=true")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_reports_idle_when_nothing_runs() {
        let (state, _release, _temp) = test_state();
        let response = app_router(state)
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["active"], false);
    }

    #[tokio::test]
    async fn rerun_of_missing_parent_is_not_found() {
        let (state, _release, _temp) = test_state();
        let response = app_router(state)
            .oneshot(
                Request::post("/api/run/ghost/rerun")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ws_client_commands_answer_history() {
        let (state, _release, _temp) = test_state();
        let mut run = Run::new(
            "run_x".to_string(),
            Some("chips".to_string()),
            "financial".to_string(),
        );
        run.status = RunStatus::Completed;
        state.store.create_run(&run).unwrap();

        let reply = client_command(&state, r#"{"command":"get_history"}"#).unwrap();
        let value: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["type"], "history");
        assert_eq!(value["data"]["runs"][0]["run_id"], "run_x");

        let reply = client_command(&state, r#"{"command":"get_query_groups"}"#).unwrap();
        let value: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["type"], "query_groups");
        assert_eq!(value["data"]["groups"][0]["query"], "chips");

        assert!(client_command(&state, r#"{"command":"bogus"}"#).is_none());
        assert!(client_command(&state, "not json").is_none());
    }

    #[tokio::test]
    async fn query_groups_endpoint_clusters_history() {
        let (state, _release, _temp) = test_state();
        for (run_id, offset) in [("run_1", 60), ("run_2", 0)] {
            let mut run = Run::new(
                run_id.to_string(),
                Some("chips".to_string()),
                "financial".to_string(),
            );
            run.status = RunStatus::Completed;
            run.started_at = Some(Utc::now() - chrono::Duration::seconds(offset));
            state.store.create_run(&run).unwrap();
        }

        let response = app_router(state)
            .oneshot(
                Request::get("/api/query-groups")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["groups"][0]["query"], "chips");
        assert_eq!(body["groups"][0]["run_count"], 2);
        assert_eq!(body["groups"][0]["runs"][0]["run_id"], "run_2");
    }
}
