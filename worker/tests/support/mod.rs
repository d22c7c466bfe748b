//! In-process fake manager for integration tests.
//!
//! Serves the worker-facing HTTP surface and records everything the worker
//! sends, so tests can assert on ordering and content. State is shared
//! behind a mutex; tests mutate it to stage tasks, state-change requests and
//! may-i-run denials.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};

/// One recorded `POST /tasks/{id}/update`.
#[derive(Debug, Clone)]
pub struct RecordedUpdate {
    pub task_id: String,
    pub seq: i64,
    pub payload: serde_json::Value,
}

impl RecordedUpdate {
    pub fn activity(&self) -> Option<&str> {
        self.payload.get("activity").and_then(|v| v.as_str())
    }

    pub fn task_status(&self) -> Option<&str> {
        self.payload.get("task_status").and_then(|v| v.as_str())
    }
}

#[derive(Debug, Default)]
pub struct ManagerState {
    pub registrations: Vec<serde_json::Value>,
    pub sign_ons: Vec<serde_json::Value>,
    pub sign_offs: usize,
    /// Number of `POST /task` calls received.
    pub task_fetches: usize,
    /// Tasks handed out in order on `POST /task`.
    pub tasks: VecDeque<serde_json::Value>,
    /// Served once as a 423 reply to the next `POST /task`.
    pub fetch_state_change: Option<serde_json::Value>,
    /// Served once as a 200 reply to the next `GET /status-change`.
    pub status_change: Option<serde_json::Value>,
    /// Reply for `GET /may-i-run/{id}`; default allows execution.
    pub may_i_run: Option<serde_json::Value>,
    pub updates: Vec<RecordedUpdate>,
    pub acks: Vec<String>,
    pub returned_tasks: Vec<String>,
}

type Shared = Arc<Mutex<ManagerState>>;

pub struct FakeManager {
    pub state: Shared,
    pub addr: SocketAddr,
}

#[allow(dead_code)] // not every test binary uses every helper
impl FakeManager {
    /// Start on an ephemeral port.
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(listener)
    }

    /// Start on a specific address (e.g. one that was unreachable earlier in
    /// the test, to simulate a manager coming back up).
    pub async fn start_on(addr: SocketAddr) -> Self {
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        Self::serve(listener)
    }

    fn serve(listener: tokio::net::TcpListener) -> Self {
        let addr = listener.local_addr().unwrap();
        let state: Shared = Arc::default();

        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { state, addr }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn push_task(&self, task: serde_json::Value) {
        self.state.lock().unwrap().tasks.push_back(task);
    }

    pub fn updates(&self) -> Vec<RecordedUpdate> {
        self.state.lock().unwrap().updates.clone()
    }

    pub fn task_fetches(&self) -> usize {
        self.state.lock().unwrap().task_fetches
    }

    pub fn acks(&self) -> Vec<String> {
        self.state.lock().unwrap().acks.clone()
    }

    /// Poll until `predicate` holds or the timeout elapses; panics on timeout.
    pub async fn wait_until<F>(&self, what: &str, timeout: Duration, mut predicate: F)
    where
        F: FnMut(&ManagerState) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate(&self.state.lock().unwrap()) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "timed out waiting for {what}; manager state: {:?}",
                    self.state.lock().unwrap()
                );
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

fn router(state: Shared) -> Router {
    Router::new()
        .route("/register-worker", post(register_worker))
        .route("/sign-on", post(sign_on))
        .route("/sign-off", post(sign_off))
        .route("/task", post(fetch_task))
        .route("/tasks/:task_id/update", post(task_update))
        .route("/tasks/:task_id/return", post(task_return))
        .route("/may-i-run/:task_id", get(may_i_run))
        .route("/status-change", get(status_change))
        .route("/ack-status-change/:status", post(ack_status_change))
        .with_state(state)
}

async fn register_worker(
    State(state): State<Shared>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let mut state = state.lock().unwrap();
    state.registrations.push(body);
    let id = format!("worker-{}", state.registrations.len());
    Json(serde_json::json!({ "_id": id })).into_response()
}

async fn sign_on(State(state): State<Shared>, Json(body): Json<serde_json::Value>) -> StatusCode {
    state.lock().unwrap().sign_ons.push(body);
    StatusCode::NO_CONTENT
}

async fn sign_off(State(state): State<Shared>) -> StatusCode {
    state.lock().unwrap().sign_offs += 1;
    StatusCode::NO_CONTENT
}

async fn fetch_task(State(state): State<Shared>) -> Response {
    let mut state = state.lock().unwrap();
    state.task_fetches += 1;

    if let Some(change) = state.fetch_state_change.take() {
        return (StatusCode::LOCKED, Json(change)).into_response();
    }
    match state.tasks.pop_front() {
        Some(task) => Json(task).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn task_update(
    State(state): State<Shared>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> StatusCode {
    let seq = headers
        .get("X-Farmhand-Update-Seq")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(-1);
    state.lock().unwrap().updates.push(RecordedUpdate {
        task_id,
        seq,
        payload,
    });
    StatusCode::NO_CONTENT
}

async fn task_return(State(state): State<Shared>, Path(task_id): Path<String>) -> StatusCode {
    state.lock().unwrap().returned_tasks.push(task_id);
    StatusCode::NO_CONTENT
}

async fn may_i_run(State(state): State<Shared>, Path(_task_id): Path<String>) -> Response {
    let reply = state
        .lock()
        .unwrap()
        .may_i_run
        .clone()
        .unwrap_or_else(|| serde_json::json!({ "may_keep_running": true }));
    Json(reply).into_response()
}

async fn status_change(State(state): State<Shared>) -> Response {
    match state.lock().unwrap().status_change.take() {
        Some(change) => Json(change).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn ack_status_change(State(state): State<Shared>, Path(status): Path<String>) -> StatusCode {
    state.lock().unwrap().acks.push(status);
    StatusCode::NO_CONTENT
}
