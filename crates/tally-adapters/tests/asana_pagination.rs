use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Duration;
use serde_json::json;
use tally_adapters::{AsanaSource, SourceError, TaskSource};
use tally_storage::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct SeenRequest {
    project_id: String,
    query: HashMap<String, String>,
    authorization: Option<String>,
    cache_control: Option<String>,
}

type Seen = Arc<Mutex<Vec<SeenRequest>>>;

async fn tasks_handler(
    State(seen): State<Seen>,
    Path(project_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
    };
    let earlier_attempts = {
        let mut seen = seen.lock().await;
        let earlier = seen.iter().filter(|r| r.project_id == project_id).count();
        seen.push(SeenRequest {
            project_id: project_id.clone(),
            query: query.clone(),
            authorization: header("authorization"),
            cache_control: header("cache-control"),
        });
        earlier
    };

    match project_id.as_str() {
        "locked" => {
            return (StatusCode::FORBIDDEN, "not a member of this project").into_response();
        }
        "down" => {
            return (StatusCode::SERVICE_UNAVAILABLE, "upstream unavailable").into_response();
        }
        "flaky" if earlier_attempts == 0 => {
            return (StatusCode::SERVICE_UNAVAILABLE, "warming up").into_response();
        }
        "flaky" => {
            return Json(json!({ "data": [{ "gid": "F1", "name": "Late" }], "next_page": null }))
                .into_response();
        }
        _ => {}
    }

    let page = match query.get("offset").map(String::as_str) {
        None => json!({
            "data": [
                { "gid": "A", "name": "First", "completed": false, "due_on": "2026-03-01" },
                {
                    "gid": "B",
                    "name": "Second",
                    "completed": true,
                    "completed_at": "2026-03-02T08:00:00.000Z"
                }
            ],
            "next_page": {
                "offset": "cursor-2",
                "path": "/projects/p/tasks?offset=cursor-2",
                "uri": ""
            }
        }),
        Some("cursor-2") => json!({
            "data": [
                { "gid": "C", "name": "Third", "completed": false, "custom_fields": [
                    { "name": "Video Type", "enum_value": { "name": "S5" } }
                ]}
            ],
            "next_page": null
        }),
        Some(_) => return (StatusCode::BAD_REQUEST, "bad offset").into_response(),
    };
    Json(page).into_response()
}

async fn project_handler(Path(project_id): Path<String>) -> Response {
    match project_id.as_str() {
        "proj-1" => Json(json!({ "data": { "gid": "proj-1", "name": "Creative Team" } }))
            .into_response(),
        "nameless" => Json(json!({ "data": { "gid": "nameless" } })).into_response(),
        _ => (StatusCode::NOT_FOUND, "unknown project").into_response(),
    }
}

async fn spawn_upstream() -> (String, Seen) {
    let seen: Seen = Arc::default();
    let app = Router::new()
        .route("/api/1.0/projects/{project_id}", get(project_handler))
        .route("/api/1.0/projects/{project_id}/tasks", get(tasks_handler))
        .with_state(seen.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/api/1.0"), seen)
}

fn client_with_retries(base: &str, max_retries: usize) -> AsanaSource {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: StdDuration::from_secs(5),
        user_agent: Some("tally-test".into()),
        backoff: BackoffPolicy {
            max_retries,
            base_delay: StdDuration::from_millis(1),
            max_delay: StdDuration::from_millis(5),
        },
    })
    .unwrap();
    AsanaSource::new(http, base, Some("secret-token".into())).unwrap()
}

fn client(base: &str) -> AsanaSource {
    client_with_retries(base, 0)
}

async fn requests_for(seen: &Seen, project_id: &str) -> usize {
    seen.lock()
        .await
        .iter()
        .filter(|r| r.project_id == project_id)
        .count()
}

#[tokio::test]
async fn follows_cursor_until_exhausted() {
    let (base, seen) = spawn_upstream().await;

    let tasks = client(&base)
        .fetch_all("proj-1", Duration::days(30))
        .await
        .unwrap();

    let gids = tasks.iter().map(|t| t.gid.as_str()).collect::<Vec<_>>();
    assert_eq!(gids, vec!["A", "B", "C"]);
    assert!(tasks[1].completed);
    assert_eq!(tasks[2].raw["custom_fields"][0]["enum_value"]["name"], "S5");

    let seen = seen.lock().await;
    assert_eq!(seen.len(), 2);
    for request in seen.iter() {
        assert_eq!(request.project_id, "proj-1");
        assert_eq!(request.authorization.as_deref(), Some("Bearer secret-token"));
        assert_eq!(request.cache_control.as_deref(), Some("no-cache"));
        assert_eq!(request.query.get("limit").map(String::as_str), Some("100"));
        assert!(request.query.contains_key("completed_since"));
    }
    assert_eq!(seen[1].query.get("offset").map(String::as_str), Some("cursor-2"));
}

#[tokio::test]
async fn non_success_status_aborts_with_body_text() {
    let (base, _seen) = spawn_upstream().await;

    let err = client(&base)
        .fetch_all("locked", Duration::days(30))
        .await
        .unwrap_err();

    match err {
        SourceError::Fetch(FetchError::HttpStatus { status, body, .. }) => {
            assert_eq!(status, 403);
            assert!(body.contains("not a member"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn transient_unavailable_is_retried() {
    let (base, seen) = spawn_upstream().await;

    let tasks = client_with_retries(&base, 2)
        .fetch_all("flaky", Duration::days(30))
        .await
        .unwrap();

    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].gid, "F1");
    assert_eq!(requests_for(&seen, "flaky").await, 2);
}

#[tokio::test]
async fn persistent_unavailable_gives_up_after_retry_budget() {
    let (base, seen) = spawn_upstream().await;
    let max_retries = 2;

    let err = client_with_retries(&base, max_retries)
        .fetch_all("down", Duration::days(30))
        .await
        .unwrap_err();

    match err {
        SourceError::Fetch(FetchError::HttpStatus { status, body, .. }) => {
            assert_eq!(status, 503);
            assert!(body.contains("upstream unavailable"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(requests_for(&seen, "down").await, max_retries + 1);
}

#[tokio::test]
async fn project_lookup_returns_display_name() {
    let (base, _seen) = spawn_upstream().await;
    let source = client(&base);

    assert_eq!(source.probe_project("proj-1").await.unwrap(), "Creative Team");
    assert!(matches!(
        source.probe_project("nameless").await,
        Err(SourceError::InvalidPayload(_))
    ));
    match source.probe_project("missing").await {
        Err(SourceError::Fetch(FetchError::HttpStatus { status, .. })) => assert_eq!(status, 404),
        other => panic!("unexpected result: {other:?}"),
    }
}
