//! HTTP trigger and status surface for the sync runner.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tally_sync::{build_scheduler, KindSelection, RunReport, SyncApp, SyncRunner};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

const DEFAULT_LOG_LIMIT: i64 = 5;
const MAX_LOG_LIMIT: i64 = 100;

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<SyncRunner>,
    pub cron_secret: Option<String>,
}

impl AppState {
    pub fn new(runner: Arc<SyncRunner>) -> Self {
        Self {
            runner,
            cron_secret: None,
        }
    }

    pub fn with_cron_secret(mut self, secret: Option<String>) -> Self {
        self.cron_secret = secret.filter(|s| !s.is_empty());
        self
    }
}

#[derive(Debug, Deserialize, Default)]
struct SyncQuery {
    project: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LogsQuery {
    limit: Option<i64>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/sync", get(recent_runs_handler).post(trigger_sync_handler))
        .route("/api/cron/sync", get(cron_sync_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Web server plus the cron scheduler when it is enabled.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let sync = SyncApp::from_env().await?;
    let scheduler = build_scheduler(&sync.config, sync.runner.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %sync.config.sync_cron, "scheduler started");
    }
    let state = AppState::new(sync.runner.clone())
        .with_cron_secret(sync.config.cron_secret.clone());
    serve(state, sync.config.web_port).await
}

async fn trigger_sync_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
) -> Response {
    let selection = match parse_selection(query.project.as_deref()) {
        Ok(selection) => selection,
        Err(response) => return response,
    };
    match run_detached(&state.runner, selection).await {
        Ok(report) => Json(report).into_response(),
        Err(response) => response,
    }
}

async fn recent_runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    match state.runner.recent_runs(limit).await {
        Ok(logs) => Json(json!({ "logs": logs })).into_response(),
        Err(err) => {
            error!(error = %err, "loading run log failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn cron_sync_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.cron_secret {
        let expected = format!("Bearer {secret}");
        let presented = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            warn!("rejected cron trigger with missing or wrong bearer token");
            return json_error(StatusCode::UNAUTHORIZED, "Unauthorized".to_string());
        }
    }

    let report = match run_detached(&state.runner, KindSelection::All).await {
        Ok(report) => report,
        Err(response) => return response,
    };
    let mut body = match serde_json::to_value(&report) {
        Ok(value) => value,
        Err(err) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    if let JsonValue::Object(map) = &mut body {
        map.insert("timestamp".into(), JsonValue::String(Utc::now().to_rfc3339()));
    }
    Json(body).into_response()
}

fn parse_selection(project: Option<&str>) -> Result<KindSelection, Response> {
    match project {
        None => Ok(KindSelection::All),
        Some(value) => value
            .parse()
            .map_err(|err| json_error(StatusCode::BAD_REQUEST, format!("{err}"))),
    }
}

/// Runs on its own task; a join failure (cancellation, or a panic outside any kind's
/// reconciliation) becomes a 500.
async fn run_detached(
    runner: &Arc<SyncRunner>,
    selection: KindSelection,
) -> Result<RunReport, Response> {
    let runner = Arc::clone(runner);
    tokio::spawn(async move { runner.run(selection).await })
        .await
        .map_err(|err| {
            error!(error = %err, %selection, "sync run aborted");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("sync run aborted: {err}"))
        })
}

fn json_error(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "success": false, "error": message }))).into_response()
}
