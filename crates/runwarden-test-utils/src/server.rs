use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

struct EngineState {
    run_id: String,
    statuses: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    submissions: Mutex<Vec<String>>,
    aborted: Mutex<Vec<String>>,
}

/// A workflow engine speaking the HTTP API on a random local port. It runs
/// on its own thread so blocking tests can drive a child process against it.
pub struct FakeEngineServer {
    pub addr: SocketAddr,
    state: Arc<EngineState>,
}

impl FakeEngineServer {
    /// `statuses` are served in order to status queries; the last one repeats.
    pub fn start(run_id: &str, statuses: &[&str]) -> Self {
        let state = Arc::new(EngineState {
            run_id: run_id.to_string(),
            statuses: Mutex::new(statuses.iter().map(|s| s.to_string()).collect()),
            last: Mutex::new("Succeeded".to_string()),
            submissions: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
        });

        let listener =
            std::net::TcpListener::bind("127.0.0.1:0").expect("bind random port");
        listener
            .set_nonblocking(true)
            .expect("set listener non-blocking");
        let addr = listener.local_addr().expect("local_addr");

        let router = Router::new()
            .route("/api/workflows/v1", post(submit))
            .route("/api/workflows/v1/query", get(query))
            .route("/api/workflows/v1/{id}/abort", post(abort))
            .with_state(state.clone());

        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("build server runtime");
            rt.block_on(async move {
                let listener =
                    tokio::net::TcpListener::from_std(listener).expect("adopt listener");
                axum::serve(listener, router).await.ok();
            });
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Raw multipart bodies of every submission.
    pub fn submissions(&self) -> Vec<String> {
        self.state.submissions.lock().expect("poisoned").clone()
    }

    pub fn aborted(&self) -> Vec<String> {
        self.state.aborted.lock().expect("poisoned").clone()
    }
}

async fn submit(State(state): State<Arc<EngineState>>, body: Bytes) -> Json<Value> {
    state
        .submissions
        .lock()
        .expect("poisoned")
        .push(String::from_utf8_lossy(&body).into_owned());
    Json(json!({"id": state.run_id, "status": "Submitted"}))
}

async fn query(
    State(state): State<Arc<EngineState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let id = params.get("id").cloned().unwrap_or_default();
    let mut last = state.last.lock().expect("poisoned");
    if let Some(next) = state.statuses.lock().expect("poisoned").pop_front() {
        *last = next;
    }
    Json(json!({
        "results": [{"id": id, "status": last.clone()}],
        "totalResultsCount": 1
    }))
}

async fn abort(State(state): State<Arc<EngineState>>, Path(id): Path<String>) -> Json<Value> {
    state.aborted.lock().expect("poisoned").push(id.clone());
    Json(json!({"id": id, "status": "Aborting"}))
}
