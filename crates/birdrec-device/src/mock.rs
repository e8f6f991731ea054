//! In-process fake recorder for tests
//!
//! Serves the same routes as the recorder firmware on a loopback port and
//! records every request it sees.

use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{StatusCode, Uri},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use birdrec_core::Device;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

type Params = Query<HashMap<String, String>>;

#[derive(Default)]
struct MockState {
    name: String,
    requests: Mutex<Vec<String>>,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    /// Files whose download fails after the first chunk
    broken: Mutex<HashSet<String>>,
    fail_commands: AtomicBool,
    last_time: Mutex<Option<i64>>,
    metadata: Mutex<Option<String>>,
    firmware_bytes: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockState {
    fn record(&self, uri: &Uri) {
        lock(&self.requests).push(uri.path().to_string());
    }

    fn command_reply(&self, reply: &'static str) -> (StatusCode, &'static str) {
        if self.fail_commands.load(Ordering::SeqCst) {
            (StatusCode::SERVICE_UNAVAILABLE, "SD card not ready")
        } else {
            (StatusCode::OK, reply)
        }
    }
}

/// Fake recorder bound to `127.0.0.1:<random port>`
pub struct MockRecorder {
    addr: SocketAddr,
    state: Arc<MockState>,
    server: JoinHandle<()>,
}

impl MockRecorder {
    /// Start a recorder whose metadata reports the name `esp-1`
    pub async fn spawn() -> Self {
        Self::spawn_named("esp-1").await
    }

    pub async fn spawn_named(name: &str) -> Self {
        let state = Arc::new(MockState {
            name: name.to_string(),
            ..Default::default()
        });

        let app = Router::new()
            .route("/", get(metadata))
            .route("/start", get(start))
            .route("/stop", get(stop))
            .route("/reset", get(reset))
            .route("/set_time", get(set_time))
            .route("/list", get(list))
            .route("/download", get(download))
            .route("/delete", get(delete))
            .route("/rename", get(rename))
            .route("/update", post(update))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind mock recorder");
        let addr = listener.local_addr().expect("mock recorder address");
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            addr,
            state,
            server,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// A registry entry pointing at this recorder
    pub fn device(&self, name: &str) -> Device {
        Device::new(name, self.addr.ip(), self.addr.port())
    }

    /// Number of requests received for `path`
    pub fn count(&self, path: &str) -> usize {
        lock(&self.state.requests)
            .iter()
            .filter(|p| p.as_str() == path)
            .count()
    }

    /// Every request path in arrival order
    pub fn requests(&self) -> Vec<String> {
        lock(&self.state.requests).clone()
    }

    /// Make start/stop/reset/set_time answer 503
    pub fn fail_commands(&self, fail: bool) {
        self.state.fail_commands.store(fail, Ordering::SeqCst);
    }

    pub fn add_file(&self, name: &str, data: Vec<u8>) {
        lock(&self.state.files).insert(name.to_string(), data);
    }

    /// Serve `data` then abort the transfer mid-body
    pub fn add_broken_file(&self, name: &str, data: Vec<u8>) {
        lock(&self.state.broken).insert(name.to_string());
        self.add_file(name, data);
    }

    pub fn file_names(&self) -> Vec<String> {
        lock(&self.state.files).keys().cloned().collect()
    }

    pub fn last_time(&self) -> Option<i64> {
        *lock(&self.state.last_time)
    }

    /// Replace the `GET /` body
    pub fn set_metadata(&self, body: &str) {
        *lock(&self.state.metadata) = Some(body.to_string());
    }

    pub fn firmware_bytes(&self) -> usize {
        self.state.firmware_bytes.load(Ordering::SeqCst)
    }
}

impl Drop for MockRecorder {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// A device on a loopback port nobody listens on
pub async fn unreachable_device(name: &str) -> Device {
    let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind unused port");
    let addr = listener.local_addr().expect("unused port address");
    drop(listener);
    Device::new(name, addr.ip(), addr.port())
}

async fn metadata(State(state): State<Arc<MockState>>, uri: Uri) -> impl IntoResponse {
    state.record(&uri);
    lock(&state.metadata).clone().unwrap_or_else(|| {
        format!(
            "{{\n  \"Device Name\": \"{}\",\n  \"Firmware Version\": \"FW_mock\",\n  \"Serial Number\": \"SN-0000\",\n  \"SSID Name\": \"mock-net\"\n}}",
            state.name
        )
    })
}

async fn start(State(state): State<Arc<MockState>>, uri: Uri) -> impl IntoResponse {
    state.record(&uri);
    state.command_reply("Recording started")
}

async fn stop(State(state): State<Arc<MockState>>, uri: Uri) -> impl IntoResponse {
    state.record(&uri);
    state.command_reply("Recording stopped")
}

async fn reset(State(state): State<Arc<MockState>>, uri: Uri) -> impl IntoResponse {
    state.record(&uri);
    state.command_reply("reset")
}

async fn set_time(
    State(state): State<Arc<MockState>>,
    uri: Uri,
    Query(params): Params,
) -> impl IntoResponse {
    state.record(&uri);
    let reply = state.command_reply("Time set successfully");
    if reply.0 != StatusCode::OK {
        return reply;
    }
    match params.get("time").and_then(|t| t.parse().ok()) {
        Some(time) => {
            *lock(&state.last_time) = Some(time);
            reply
        }
        None => (StatusCode::BAD_REQUEST, "Time parameter missing"),
    }
}

async fn list(State(state): State<Arc<MockState>>, uri: Uri) -> impl IntoResponse {
    state.record(&uri);
    lock(&state.files)
        .iter()
        .map(|(name, data)| format!("{} - {} B\n", name, data.len()))
        .collect::<String>()
}

async fn download(
    State(state): State<Arc<MockState>>,
    uri: Uri,
    Query(params): Params,
) -> impl IntoResponse {
    state.record(&uri);
    let Some(file) = params.get("file") else {
        return (StatusCode::BAD_REQUEST, "File parameter missing").into_response();
    };
    let data = lock(&state.files).get(file).cloned();
    match data {
        Some(data) if lock(&state.broken).contains(file) => {
            let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
                Ok(Bytes::from(data)),
                Err(std::io::Error::other("SD card read failed")),
            ];
            (StatusCode::OK, Body::from_stream(futures_util::stream::iter(chunks))).into_response()
        }
        Some(data) => (StatusCode::OK, data).into_response(),
        None => (StatusCode::NOT_FOUND, "File not found").into_response(),
    }
}

async fn delete(
    State(state): State<Arc<MockState>>,
    uri: Uri,
    Query(params): Params,
) -> impl IntoResponse {
    state.record(&uri);
    match params.get("file") {
        Some(file) => {
            lock(&state.files).remove(file);
            (StatusCode::OK, "File deleted successfully")
        }
        None => (StatusCode::BAD_REQUEST, "File parameter missing"),
    }
}

async fn rename(
    State(state): State<Arc<MockState>>,
    uri: Uri,
    Query(params): Params,
) -> impl IntoResponse {
    state.record(&uri);
    let (Some(old), Some(new)) = (params.get("file"), params.get("new_name")) else {
        return (StatusCode::BAD_REQUEST, "File parameters missing");
    };
    let mut files = lock(&state.files);
    match files.remove(old) {
        Some(data) => {
            files.insert(new.clone(), data);
            (StatusCode::OK, "File renamed successfully")
        }
        None => (StatusCode::INTERNAL_SERVER_ERROR, "File rename failed"),
    }
}

async fn update(State(state): State<Arc<MockState>>, uri: Uri, body: Bytes) -> impl IntoResponse {
    state.record(&uri);
    state.firmware_bytes.fetch_add(body.len(), Ordering::SeqCst);
    (StatusCode::OK, "Firmware update started")
}
