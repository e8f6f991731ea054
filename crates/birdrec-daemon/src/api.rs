//! REST API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use birdrec_core::Device;
use birdrec_device::DeviceError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::analyzer::{AnalyzeRequest, AnalyzerError};
use crate::orchestrator::OrchestratorError;
use crate::state::AppState;

type ApiResult<T> = Result<T, Response>;

/// API error response
#[derive(Serialize)]
struct ApiError {
    error: String,
}

impl ApiError {
    fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ApiError::new(msg))).into_response()
}

fn device_status(e: &DeviceError) -> StatusCode {
    match e {
        DeviceError::InvalidFileName(_) => StatusCode::BAD_REQUEST,
        DeviceError::Io(_) | DeviceError::Client(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn device_error(e: DeviceError) -> Response {
    error_response(device_status(&e), e.to_string())
}

fn orchestrator_error(e: OrchestratorError) -> Response {
    let status = match &e {
        OrchestratorError::NoDevices => StatusCode::CONFLICT,
        OrchestratorError::UnknownDevice(_) => StatusCode::NOT_FOUND,
        OrchestratorError::Device(d) => device_status(d),
    };
    error_response(status, e.to_string())
}

async fn lookup(state: &AppState, name: &str) -> ApiResult<Device> {
    state.orchestrator.device(name).await.map_err(orchestrator_error)
}

fn ok_status(status: &str) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": status }))
}

/// List all discovered devices
pub async fn list_devices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.devices().await)
}

/// Trigger a discovery scan
pub async fn trigger_scan(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("Manual scan triggered");

    match state.scanner.scan_once().await {
        Ok(devices) => Json(serde_json::json!({
            "status": "completed",
            "devices_found": devices.len()
        }))
        .into_response(),
        Err(e) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Scan failed: {}", e),
        ),
    }
}

/// Get a device together with the metadata it reports
pub async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let device = lookup(&state, &name).await?;
    let metadata = state.client().metadata(&device).await.map_err(device_error)?;
    Ok(Json(serde_json::json!({
        "device": device,
        "metadata": metadata,
    })))
}

/// Select a device and sync its clock
pub async fn select_device(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let device = state
        .orchestrator
        .select(&name)
        .await
        .map_err(orchestrator_error)?;
    Ok(Json(serde_json::json!({
        "status": "selected",
        "device": device,
    })))
}

pub async fn start_device(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let reply = state
        .orchestrator
        .start_device(&name)
        .await
        .map_err(orchestrator_error)?;
    Ok(Json(serde_json::json!({ "status": "started", "reply": reply })))
}

pub async fn stop_device(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let session_secs = state
        .orchestrator
        .stop_device(&name)
        .await
        .map_err(orchestrator_error)?;
    Ok(Json(serde_json::json!({
        "status": "stopped",
        "session_secs": session_secs,
    })))
}

pub async fn reset_device(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let device = lookup(&state, &name).await?;
    state.client().reset(&device).await.map_err(device_error)?;
    Ok(ok_status("reset"))
}

pub async fn sync_device(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let device = lookup(&state, &name).await?;
    state.client().sync_time(&device).await.map_err(device_error)?;
    Ok(ok_status("synced"))
}

pub async fn list_files(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let device = lookup(&state, &name).await?;
    let files = state.client().list_files(&device).await.map_err(device_error)?;
    Ok(Json(files))
}

/// Downloads land in a per-device folder under the download dir
fn download_dir(state: &AppState, device: &Device) -> PathBuf {
    state.config.device.download_dir.join(&device.name)
}

#[derive(Serialize)]
struct DownloadResult {
    file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn download_all(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let device = lookup(&state, &name).await?;
    let dest = download_dir(&state, &device);
    let progress = state.downloads.clone();

    let results = state
        .client()
        .download_all(&device, &dest, move |p| {
            let _ = progress.send(p.clone());
        })
        .await
        .map_err(device_error)?;

    let results: Vec<DownloadResult> = results
        .into_iter()
        .map(|(file, result)| match result {
            Ok(path) => DownloadResult {
                file,
                path: Some(path),
                error: None,
            },
            Err(e) => {
                warn!(device = %device.name, file = %file, error = %e, "Download failed");
                DownloadResult {
                    file,
                    path: None,
                    error: Some(e.to_string()),
                }
            }
        })
        .collect();
    Ok(Json(results))
}

pub async fn download_file(
    State(state): State<Arc<AppState>>,
    Path((name, file)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let device = lookup(&state, &name).await?;
    let dest = download_dir(&state, &device);
    let progress = state.downloads.clone();

    let path = state
        .client()
        .download(&device, &file, &dest, |p| {
            let _ = progress.send(p.clone());
        })
        .await
        .map_err(device_error)?;
    Ok(Json(DownloadResult {
        file,
        path: Some(path),
        error: None,
    }))
}

pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path((name, file)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let device = lookup(&state, &name).await?;
    state
        .client()
        .delete_file(&device, &file)
        .await
        .map_err(device_error)?;
    Ok(ok_status("deleted"))
}

#[derive(Deserialize)]
pub struct RenameRequest {
    new_name: String,
}

pub async fn rename_file(
    State(state): State<Arc<AppState>>,
    Path((name, file)): Path<(String, String)>,
    Json(req): Json<RenameRequest>,
) -> ApiResult<impl IntoResponse> {
    let device = lookup(&state, &name).await?;
    state
        .client()
        .rename_file(&device, &file, &req.new_name)
        .await
        .map_err(device_error)?;
    Ok(ok_status("renamed"))
}

#[derive(Deserialize)]
pub struct FirmwareRequest {
    path: PathBuf,
}

pub async fn upload_firmware(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<FirmwareRequest>,
) -> ApiResult<impl IntoResponse> {
    let device = lookup(&state, &name).await?;
    let upload = state
        .client()
        .update_firmware(&device, &req.path)
        .await
        .map_err(device_error)?;
    Ok(Json(upload))
}

/// Current recording session
pub async fn get_recording(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.session().await)
}

/// Start recording on every known device
pub async fn start_recording(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let report = state
        .orchestrator
        .start_all()
        .await
        .map_err(orchestrator_error)?;
    Ok(Json(report))
}

/// Stop recording on every known device
pub async fn stop_recording(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let report = state
        .orchestrator
        .stop_all()
        .await
        .map_err(orchestrator_error)?;
    Ok(Json(report))
}

pub async fn list_schedule(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.scheduler.entries().await)
}

/// Minutes as typed by the user or as a JSON number
#[derive(Deserialize)]
#[serde(untagged)]
pub enum DurationInput {
    Minutes(u64),
    Text(String),
}

#[derive(Deserialize)]
pub struct ScheduleRequest {
    time: String,
    duration: DurationInput,
}

pub async fn add_schedule(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ScheduleRequest>,
) -> ApiResult<impl IntoResponse> {
    let duration = match req.duration {
        DurationInput::Minutes(m) => m.to_string(),
        DurationInput::Text(s) => s,
    };
    let entry = state
        .scheduler
        .add(&req.time, &duration)
        .await
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok((StatusCode::CREATED, Json(entry)))
}

pub async fn remove_schedule(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
) -> ApiResult<impl IntoResponse> {
    match state.scheduler.remove(index).await {
        Some(entry) => Ok(Json(entry)),
        None => Err(error_response(
            StatusCode::NOT_FOUND,
            format!("No schedule entry at index {}", index),
        )),
    }
}

/// Run the analyzer on its own task
pub async fn analyze(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AnalyzeRequest>,
) -> ApiResult<impl IntoResponse> {
    let analyzer = state.analyzer.clone();
    let result = tokio::spawn(async move { analyzer.run(&req).await })
        .await
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    match result {
        Ok(report) => Ok(Json(report)),
        Err(e @ AnalyzerError::EmptyPath(_)) => {
            Err(error_response(StatusCode::BAD_REQUEST, e.to_string()))
        }
        Err(e) => Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            e.to_string(),
        )),
    }
}

/// Get current configuration
pub async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.config.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::server::router;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use birdrec_core::ManualClock;
    use birdrec_device::mock::{unreachable_device, MockRecorder};
    use birdrec_discovery::StaticBrowser;
    use chrono::DateTime;
    use tower::ServiceExt;

    async fn state_with(devices: Vec<Device>, config: Config) -> Arc<AppState> {
        let clock = Arc::new(ManualClock::new(
            DateTime::parse_from_rfc3339("2026-06-01T12:00:00+00:00").unwrap(),
        ));
        let state =
            AppState::with_parts(config, Arc::new(StaticBrowser::new(devices)), clock).unwrap();
        state.scanner.scan_once().await.unwrap();
        state
    }

    async fn call(
        state: &Arc<AppState>,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                req = req.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = router(state.clone())
            .oneshot(req.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_devices_and_recording() {
        let mock = MockRecorder::spawn().await;
        let dead = unreachable_device("esp-2").await;
        let state = state_with(vec![mock.device("esp-1"), dead], Config::default()).await;

        let (status, devices) = call(&state, Method::GET, "/api/devices", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(devices.as_array().unwrap().len(), 2);

        let (status, report) = call(&state, Method::POST, "/api/recording/start", None).await;
        assert_eq!(status, StatusCode::OK);
        let outcomes = report["outcomes"].as_array().unwrap();
        assert_eq!(outcomes[0]["device"], "esp-1");
        assert_eq!(outcomes[0]["ok"], true);
        assert_eq!(outcomes[1]["ok"], false);
        assert!(outcomes[1]["error"].is_string());

        let (_, session) = call(&state, Method::GET, "/api/recording", None).await;
        assert_eq!(session["active"], true);
    }

    #[tokio::test]
    async fn test_error_status_codes() {
        let empty = state_with(Vec::new(), Config::default()).await;
        let (status, body) = call(&empty, Method::POST, "/api/recording/start", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "No devices found");

        let mock = MockRecorder::spawn().await;
        let state = state_with(vec![mock.device("esp-1")], Config::default()).await;

        let (status, _) = call(&state, Method::POST, "/api/devices/nope/start", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        mock.fail_commands(true);
        let (status, body) = call(&state, Method::POST, "/api/devices/esp-1/start", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("SD card not ready"));

        let (status, _) = call(
            &state,
            Method::POST,
            "/api/schedule",
            Some(serde_json::json!({ "time": "25:99", "duration": "abc" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(state.scheduler.entries().await.is_empty());

        let (status, _) = call(
            &state,
            Method::POST,
            "/api/analyze",
            Some(serde_json::json!({ "input": "", "output": "out" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_schedule_routes() {
        let state = state_with(Vec::new(), Config::default()).await;

        let (status, entry) = call(
            &state,
            Method::POST,
            "/api/schedule",
            Some(serde_json::json!({ "time": "6:30", "duration": 45 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(entry["time"], "06:30");
        assert_eq!(entry["duration_minutes"], 45);
        assert_eq!(entry["status"], "scheduled");

        let (_, list) = call(&state, Method::GET, "/api/schedule", None).await;
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, _) = call(&state, Method::DELETE, "/api/schedule/4", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&state, Method::DELETE, "/api/schedule/0", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(state.scheduler.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_file_routes() {
        let mock = MockRecorder::spawn().await;
        mock.add_file("rec_0001.wav", vec![7u8; 64]);
        mock.add_file("rec_0002.wav", vec![8u8; 32]);
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.device.download_dir = dir.path().to_path_buf();
        let state = state_with(vec![mock.device("esp-1")], config).await;

        let (status, files) = call(&state, Method::GET, "/api/devices/esp-1/files", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(files[0]["name"], "rec_0001.wav");
        assert_eq!(files[0]["size"], "64 B");

        let (status, _) = call(
            &state,
            Method::POST,
            "/api/devices/esp-1/files/rec_0001.wav/download",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            std::fs::read(dir.path().join("esp-1").join("rec_0001.wav")).unwrap(),
            vec![7u8; 64]
        );

        let (status, _) = call(
            &state,
            Method::POST,
            "/api/devices/esp-1/files/rec_0002.wav/rename",
            Some(serde_json::json!({ "new_name": "dawn.wav" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(
            &state,
            Method::DELETE,
            "/api/devices/esp-1/files/rec_0001.wav",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(mock.file_names(), vec!["dawn.wav".to_string()]);

        let (status, results) =
            call(&state, Method::POST, "/api/devices/esp-1/files/download", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(results[0]["file"], "dawn.wav");
        assert!(dir.path().join("esp-1").join("dawn.wav").exists());
    }

    #[tokio::test]
    async fn test_select_and_metadata() {
        let mock = MockRecorder::spawn_named("ESPREC-01").await;
        let state = state_with(vec![mock.device("ESPREC-01")], Config::default()).await;
        let synced_on_scan = mock.count("/set_time");

        let (status, _) = call(&state, Method::POST, "/api/devices/ESPREC-01/select", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(mock.count("/set_time"), synced_on_scan + 1);

        let (status, body) = call(&state, Method::GET, "/api/devices/ESPREC-01", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["device"]["name"], "ESPREC-01");
        assert!(body["metadata"].to_string().contains("FW_mock"));
    }
}
