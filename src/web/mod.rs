//! HTTP server: browser client files and the JSON control API

use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::{
    body::Body,
    extract::State,
    http::{header, Response, StatusCode, Uri},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::error::Result;
use crate::prefs::{self, EmulatorSettings};
use crate::state::AppState;
use crate::storage;

/// Directory searched for the browser client bundle
const CLIENT_DIR: &str = "client";

#[derive(Serialize)]
struct ApiResult {
    success: bool,
    message: String,
}

impl ApiResult {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }

    fn fail(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            message: message.into(),
        })
    }
}

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/api/status", get(status))
        .route("/api/storage", get(storage_list))
        .route("/api/config", get(config_get).post(config_set))
        .route("/api/restart", post(relay_restart))
        .route("/api/keyframe", post(request_keyframe))
        .route("/api/emulator/start", post(emulator_start))
        .route("/api/emulator/stop", post(emulator_stop))
        .route("/api/emulator/restart", post(emulator_restart))
        .route("/*path", get(static_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let (width, height) = state.video_shm.geometry();
    Json(json!({
        "emulator_connected": state.control.is_connected(),
        "emulator_running": state.supervisor.is_running(),
        "emulator_pid": state.supervisor.pid(),
        "video": {
            "width": width,
            "height": height,
            "frame_count": state.video_shm.frame_count(),
        },
        "peers": state.sessions.peer_count().await,
    }))
}

async fn storage_list(State(state): State<Arc<AppState>>) -> Json<storage::StorageInfo> {
    let roms_path = state.config.roms_path.clone();
    let images_path = state.config.images_path.clone();
    let info = tokio::task::spawn_blocking(move || storage::scan_storage(&roms_path, &images_path))
        .await
        .unwrap_or_else(|_| storage::scan_storage(&state.config.roms_path, &state.config.images_path));
    Json(info)
}

async fn config_get(State(state): State<Arc<AppState>>) -> Result<Json<EmulatorSettings>> {
    Ok(Json(prefs::read_prefs(&state.config.prefs_path)?))
}

async fn config_set(
    State(state): State<Arc<AppState>>,
    Json(settings): Json<EmulatorSettings>,
) -> Result<Json<ApiResult>> {
    prefs::write_prefs(
        &settings,
        &state.config.prefs_path,
        &state.config.roms_path,
        &state.config.images_path,
    )?;
    Ok(ApiResult::ok("Configuration saved"))
}

/// Relay a polite restart to the emulator itself; it answers by exiting
/// with the restart code and the supervisor respawns it.
async fn relay_restart(State(state): State<Arc<AppState>>) -> Json<ApiResult> {
    if state.control.send_line("{\"type\":\"restart\"}").await {
        ApiResult::ok("Restart sent to emulator")
    } else {
        ApiResult::fail("Emulator not connected")
    }
}

async fn request_keyframe(State(state): State<Arc<AppState>>) -> Json<ApiResult> {
    state.keyframe_request.store(true, Ordering::Release);
    ApiResult::ok("Keyframe requested")
}

async fn emulator_start(State(state): State<Arc<AppState>>) -> Json<ApiResult> {
    if state.supervisor.is_running() {
        return ApiResult::fail(format!(
            "Emulator already running (pid {})",
            state.supervisor.pid()
        ));
    }
    match state.supervisor.start().await {
        Ok(()) => ApiResult::ok("Emulator started"),
        Err(e) => ApiResult::fail(e.to_string()),
    }
}

async fn emulator_stop(State(state): State<Arc<AppState>>) -> Json<ApiResult> {
    if !state.supervisor.is_running() {
        return ApiResult::fail("Emulator not running");
    }
    state.supervisor.stop().await;
    ApiResult::ok("Emulator stopped")
}

async fn emulator_restart(State(state): State<Arc<AppState>>) -> Json<ApiResult> {
    state.supervisor.request_restart();
    ApiResult::ok("Restart requested")
}

async fn index_handler() -> Response<Body> {
    serve_client_file("index.html").await
}

async fn static_handler(uri: Uri) -> Response<Body> {
    serve_client_file(uri.path().trim_start_matches('/')).await
}

/// Serve client files from disk, falling back to an embedded placeholder
/// page when no bundle is installed
async fn serve_client_file(path: &str) -> Response<Body> {
    // Reject traversal before touching the filesystem
    if !path.contains("..") {
        let file_path = std::path::Path::new(CLIENT_DIR).join(path);
        if let Ok(data) = tokio::fs::read(&file_path).await {
            let mime = mime_guess::from_path(path)
                .first_or_octet_stream()
                .to_string();
            return Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, mime)
                .body(Body::from(data))
                .unwrap();
        }
    }

    if path == "index.html" {
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
            .body(Body::from(PLACEHOLDER_HTML))
            .unwrap();
    }

    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from("Not Found"))
        .unwrap()
}

/// Shown when the client bundle is not installed next to the binary
const PLACEHOLDER_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>macemu Gateway</title>
    <style>
        body { font-family: -apple-system, sans-serif; background: #1a1a1a; color: #fff;
               display: flex; justify-content: center; align-items: center; min-height: 100vh; margin: 0; }
        .container { text-align: center; }
        p { color: #888; }
    </style>
</head>
<body>
    <div class="container">
        <h1>macemu Gateway</h1>
        <p>Client bundle not installed. Place the browser client in ./client/ or use the API directly.</p>
    </div>
</body>
</html>"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_result_serializes_in_the_unified_shape() {
        let ok = serde_json::to_value(&ApiResult {
            success: true,
            message: "done".into(),
        })
        .unwrap();
        assert_eq!(ok, json!({"success": true, "message": "done"}));
    }
}
