//! Local control API – the recorder's user surface.
//!
//! Routes:
//!   GET  /api/health                  → health check
//!   GET  /api/status                  → status indicator, timer, badge, notices
//!   POST /api/record/toggle           → start / stop (body `{name?}`)
//!   POST /api/visibility              → page visibility change
//!   POST /api/destination             → pick the cloud folder
//!   POST /api/login                   → interactive re-login
//!   PUT  /api/auto-upload             → auto-upload preference
//!   GET  /api/recordings              → catalog, newest first
//!   GET  /api/recordings/{id}         → payload bytes of this session's takes
//!   POST /api/recordings/{id}/save    → manual local save

use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post, put};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use memo_common::protocol::{
    AutoUploadRequest, Destination, DestinationRequest, HealthResponse, RecordingListItem, SaveResponse,
    StatusSnapshot, ToggleRequest, ToggleResponse, VisibilityRequest,
};

use crate::credentials::AuthError;
use crate::feedback::Feedback;
use crate::session::{Recorder, SaveError};
use crate::upload::PickError;

/// Shared state for route handlers.
#[derive(Clone)]
struct AppState {
    recorder: Arc<Mutex<Recorder>>,
    feedback: Feedback,
    start_time: Instant,
}

/// Serve the control API until `shutdown` is cancelled.
pub async fn run(
    recorder: Arc<Mutex<Recorder>>,
    feedback: Feedback,
    listen_addr: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let state = AppState {
        recorder,
        feedback,
        start_time: Instant::now(),
    };

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/record/toggle", post(toggle))
        .route("/api/visibility", post(visibility))
        .route("/api/destination", post(destination))
        .route("/api/login", post(login))
        .route("/api/auto-upload", put(auto_upload))
        .route("/api/recordings", get(list_recordings))
        .route("/api/recordings/{id}", get(download_recording))
        .route("/api/recordings/{id}/save", post(save_recording))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = TcpListener::bind(listen_addr).await?;
    info!("Control API listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

// ── route handlers ───────────────────────────────────────────────────────
//
// Handlers that change recorder state run on a spawned task holding the
// lock.  A client that disconnects drops only the wait on that task, never
// a half-finished take, upload or sign-in.

fn task_failed(e: JoinError) -> StatusCode {
    error!("Recorder task failed: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// Never waits on the recorder, so it stays responsive during uploads.
async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.feedback.snapshot())
}

/// The body is optional; an empty one toggles without naming the take.
async fn toggle(State(state): State<AppState>, body: Bytes) -> Result<Json<ToggleResponse>, StatusCode> {
    let req: ToggleRequest = if body.is_empty() {
        ToggleRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?
    };
    let recorder = Arc::clone(&state.recorder);
    let response = tokio::spawn(async move { recorder.lock_owned().await.toggle(req.name).await })
        .await
        .map_err(task_failed)?;
    Ok(Json(response))
}

async fn visibility(State(state): State<AppState>, Json(req): Json<VisibilityRequest>) -> StatusCode {
    let recorder = Arc::clone(&state.recorder);
    let task = tokio::spawn(async move { recorder.lock_owned().await.visibility_changed(req.visible).await });
    match task.await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => task_failed(e),
    }
}

async fn destination(
    State(state): State<AppState>,
    Json(req): Json<DestinationRequest>,
) -> Result<Json<Option<Destination>>, StatusCode> {
    let recorder = Arc::clone(&state.recorder);
    let picked = tokio::spawn(async move { recorder.lock_owned().await.select_destination(&req.query).await })
        .await
        .map_err(task_failed)?;
    match picked {
        Ok(picked) => Ok(Json(picked)),
        Err(PickError::Auth(AuthError::NotConfigured)) => Err(StatusCode::SERVICE_UNAVAILABLE),
        Err(PickError::Auth(_) | PickError::Unauthorized) => Err(StatusCode::UNAUTHORIZED),
        Err(PickError::Failed(_)) => Err(StatusCode::BAD_GATEWAY),
    }
}

async fn login(State(state): State<AppState>) -> Result<Json<StatusSnapshot>, StatusCode> {
    let recorder = Arc::clone(&state.recorder);
    let result = tokio::spawn(async move { recorder.lock_owned().await.login().await })
        .await
        .map_err(task_failed)?;
    match result {
        Ok(_) => Ok(Json(state.feedback.snapshot())),
        Err(AuthError::NotConfigured) => Err(StatusCode::SERVICE_UNAVAILABLE),
        Err(AuthError::Failed(_)) => Err(StatusCode::UNAUTHORIZED),
    }
}

async fn auto_upload(State(state): State<AppState>, Json(req): Json<AutoUploadRequest>) -> StatusCode {
    state.recorder.lock().await.set_auto_upload(req.enabled);
    StatusCode::NO_CONTENT
}

async fn list_recordings(State(state): State<AppState>) -> Result<Json<Vec<RecordingListItem>>, StatusCode> {
    let recorder = state.recorder.lock().await;
    recorder.recordings().map(Json).map_err(|e| {
        error!("Cannot read catalog: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

fn save_status(e: &SaveError) -> StatusCode {
    match e {
        SaveError::NotFound | SaveError::DataGone => StatusCode::NOT_FOUND,
        SaveError::Store(_) | SaveError::Write(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn download_recording(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let (entry, payload) = state.recorder.lock().await.payload(&id).map_err(|e| save_status(&e))?;

    let disposition = format!("attachment; filename=\"{}\"", entry.file_name().replace('"', "'"));
    Ok((
        [
            (header::CONTENT_TYPE, entry.mime_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from(payload.to_vec()),
    ))
}

async fn save_recording(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SaveResponse>, StatusCode> {
    let save = state.recorder.lock().await.save_local(&id);
    let result = match save {
        Ok(save) => save.write().await,
        Err(e) => Err(e),
    };
    match result {
        Ok(path) => Ok(Json(SaveResponse {
            path: path.display().to_string(),
        })),
        Err(e) => {
            error!("Manual save of {id} failed: {e:#}");
            Err(save_status(&e))
        }
    }
}
