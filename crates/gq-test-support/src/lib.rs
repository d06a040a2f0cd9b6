//! In-process mock of the generation backend (REST + progress websocket)
//!
//! Shared by the integration tests of every genqueue crate. Not published.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;

const CLOSE_SENTINEL: &str = "__close__";

#[derive(Default)]
pub struct MockState {
    pub jobs: Mutex<Vec<Value>>,
    pub results: Mutex<Vec<Value>>,
    pub status: Mutex<Value>,
    hits: Mutex<HashMap<String, usize>>,
    failures: Mutex<HashMap<String, (u16, usize)>>,
    delays: Mutex<HashMap<String, Duration>>,
    pub api_keys: Mutex<Vec<Option<String>>>,
    pub queries: Mutex<Vec<HashMap<String, String>>>,
    pub patches: Mutex<Vec<(String, Value)>>,
    next_job: AtomicU64,
    pub cancel_refused: AtomicBool,
    pub ws_connections: AtomicUsize,
    pub ws_open: AtomicUsize,
}

impl MockState {
    fn record(&self, key: &str, headers: &HeaderMap) -> Result<(), Response> {
        *self.hits.lock().entry(key.to_string()).or_default() += 1;
        self.api_keys.lock().push(
            headers
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        );

        let mut failures = self.failures.lock();
        if let Some((status, remaining)) = failures.get_mut(key) {
            if *remaining > 0 {
                *remaining -= 1;
                let status = StatusCode::from_u16(*status).unwrap();
                return Err((status, Json(json!({"detail": "injected failure"}))).into_response());
            }
        }
        Ok(())
    }
}

pub struct MockBackend {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
    push_tx: broadcast::Sender<String>,
}

#[derive(Clone)]
struct AppState {
    state: Arc<MockState>,
    push_tx: broadcast::Sender<String>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        *state.status.lock() = json!({"status": "ok", "gpu_available": true, "queue_length": 0});
        let (push_tx, _) = broadcast::channel(64);

        let app = Router::new()
            .route("/system/status", get(system_status))
            .route("/generation/jobs/active", get(active_jobs))
            .route("/generation/results", get(results))
            .route("/generation/generate", post(generate))
            .route("/generation/jobs/:id/cancel", post(cancel))
            .route(
                "/generation/results/:id",
                axum::routing::delete(delete_result).patch(patch_result),
            )
            .route("/generation/results/:id/download", get(download))
            .route("/ws/progress", get(progress_ws))
            .with_state(AppState {
                state: Arc::clone(&state),
                push_tx: push_tx.clone(),
            });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            push_tx,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self, key: &str) -> usize {
        self.state.hits.lock().get(key).copied().unwrap_or(0)
    }

    /// Fail the next `times` requests to `key` (e.g. `"GET /system/status"`)
    pub fn fail(&self, key: &str, status: u16, times: usize) {
        self.state
            .failures
            .lock()
            .insert(key.to_string(), (status, times));
    }

    /// Delay results responses whose `search` equals `search`
    pub fn delay_search(&self, search: &str, delay: Duration) {
        self.state.delays.lock().insert(search.to_string(), delay);
    }

    pub fn set_jobs(&self, jobs: Vec<Value>) {
        *self.state.jobs.lock() = jobs;
    }

    pub fn set_results(&self, results: Vec<Value>) {
        *self.state.results.lock() = results;
    }

    /// Send a frame to every open websocket
    pub fn push(&self, frame: Value) {
        let _ = self.push_tx.send(frame.to_string());
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.push_tx.send(text.to_string());
    }

    /// Close every open websocket from the server side
    pub fn drop_push_connections(&self) {
        let _ = self.push_tx.send(CLOSE_SENTINEL.to_string());
    }

    pub fn ws_connections(&self) -> usize {
        self.state.ws_connections.load(Ordering::SeqCst)
    }

    pub fn ws_open(&self) -> usize {
        self.state.ws_open.load(Ordering::SeqCst)
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

async fn system_status(State(app): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = app.state.record("GET /system/status", &headers) {
        return response;
    }
    let status = app.state.status.lock().clone();
    Json(status).into_response()
}

async fn active_jobs(State(app): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = app.state.record("GET /generation/jobs/active", &headers) {
        return response;
    }
    let jobs = app.state.jobs.lock().clone();
    Json(json!({ "jobs": jobs })).into_response()
}

async fn results(
    State(app): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(response) = app.state.record("GET /generation/results", &headers) {
        return response;
    }
    app.state.queries.lock().push(query.clone());

    let search = query.get("search").cloned().unwrap_or_default();
    let delay = app.state.delays.lock().get(&search).copied();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let limit: usize = query
        .get("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(usize::MAX);
    let favorites = query.get("favorites").map(String::as_str) == Some("true");
    let results: Vec<Value> = app
        .state
        .results
        .lock()
        .iter()
        .filter(|r| {
            search.is_empty()
                || r.get("prompt")
                    .and_then(Value::as_str)
                    .is_some_and(|p| p.contains(&search))
        })
        .filter(|r| !favorites || r.get("is_favorite") == Some(&Value::Bool(true)))
        .take(limit)
        .cloned()
        .collect();
    Json(Value::Array(results)).into_response()
}

async fn generate(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(response) = app.state.record("POST /generation/generate", &headers) {
        return response;
    }
    let n = app.state.next_job.fetch_add(1, Ordering::SeqCst) + 1;
    let job_id = format!("j{}", n);
    app.state.jobs.lock().push(json!({
        "job_id": job_id,
        "status": "queued",
        "prompt": body.get("prompt").cloned().unwrap_or(Value::Null),
    }));
    Json(json!({"job_id": job_id, "status": "queued"})).into_response()
}

async fn cancel(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(response) = app.state.record("POST /generation/jobs/cancel", &headers) {
        return response;
    }
    if app.state.cancel_refused.load(Ordering::SeqCst) {
        return Json(json!({"success": false, "message": "job already running"})).into_response();
    }
    app.state
        .jobs
        .lock()
        .retain(|job| job.get("job_id").and_then(Value::as_str) != Some(id.as_str()));
    Json(json!({"success": true})).into_response()
}

async fn delete_result(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(response) = app.state.record("DELETE /generation/results", &headers) {
        return response;
    }
    let mut results = app.state.results.lock();
    let before = results.len();
    results.retain(|r| r.get("id").and_then(Value::as_str) != Some(id.as_str()));
    if results.len() == before {
        return (StatusCode::NOT_FOUND, Json(json!({"detail": "Result not found"})))
            .into_response();
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn patch_result(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if let Err(response) = app.state.record("PATCH /generation/results", &headers) {
        return response;
    }
    app.state.patches.lock().push((id, body));
    StatusCode::NO_CONTENT.into_response()
}

async fn download(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(response) = app.state.record("GET /generation/results/download", &headers) {
        return response;
    }
    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::CONTENT_TYPE, "image/png".parse().unwrap());
    if id != "anonymous" {
        response_headers.insert(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}-final.png\"", id)
                .parse()
                .unwrap(),
        );
    }
    (response_headers, vec![0x89u8, b'P', b'N', b'G']).into_response()
}

async fn progress_ws(
    State(app): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(response) = app.state.record("GET /ws/progress", &headers) {
        return response;
    }
    let rx = app.push_tx.subscribe();
    let state = Arc::clone(&app.state);
    ws.on_upgrade(move |socket| pump(socket, rx, state))
}

async fn pump(mut socket: WebSocket, mut rx: broadcast::Receiver<String>, state: Arc<MockState>) {
    state.ws_connections.fetch_add(1, Ordering::SeqCst);
    state.ws_open.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Ok(text) if text == CLOSE_SENTINEL => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                Ok(text) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.ws_open.fetch_sub(1, Ordering::SeqCst);
}
