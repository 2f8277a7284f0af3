use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::directory::{Camera, CameraDirectory, CameraIn};
use crate::streaming::{self, HubRegistry, HubStats, StreamError, ViewerSession};

/// Web server state
#[derive(Clone)]
pub struct AppState {
    pub directory: Arc<CameraDirectory>,
    pub registry: Arc<HubRegistry>,
}

impl AppState {
    pub fn new(directory: Arc<CameraDirectory>, registry: Arc<HubRegistry>) -> Self {
        Self {
            directory,
            registry,
        }
    }
}

/// All HTTP routes, ready to serve
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/stream/:camera_id", get(stream_handler))
        .route("/cams", get(list_cameras_handler).post(add_camera_handler))
        .route("/cams/:camera_id", delete(delete_camera_handler))
        .route("/api/streams", get(streams_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on an already bound listener until `signal` completes
///
/// Stream responses never finish on their own, so the registry is shut down
/// before connections are drained. That ends every viewer body.
pub async fn serve<F>(listener: TcpListener, state: AppState, signal: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let registry = Arc::clone(&state.registry);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            signal.await;
            registry.shutdown().await;
        })
        .await?;
    info!("Web server stopped");
    Ok(())
}

/// Start the web server
pub async fn run_server(addr: &str, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Starting web server on http://{}", listener.local_addr()?);
    serve(listener, state, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// MJPEG stream for one camera
async fn stream_handler(
    State(state): State<AppState>,
    Path(camera_id): Path<u32>,
) -> Result<Response, StreamError> {
    let camera = state.directory.resolve(camera_id)?;
    let subscription = state.registry.attach(camera.id, &camera.url).await?;
    let session = ViewerSession::new(subscription, state.registry.config().write_timeout);

    Ok((
        [
            (header::CONTENT_TYPE, streaming::CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(session.into_stream()),
    )
        .into_response())
}

#[derive(Serialize)]
struct CameraList {
    status: &'static str,
    cams: Vec<Camera>,
}

async fn list_cameras_handler(State(state): State<AppState>) -> Json<CameraList> {
    Json(CameraList {
        status: "success",
        cams: state.directory.list(),
    })
}

async fn add_camera_handler(
    State(state): State<AppState>,
    Json(camera): Json<CameraIn>,
) -> Json<Value> {
    let camera = state.directory.add(camera);
    Json(json!({ "status": "success", "camera_id": camera.id }))
}

/// Missing cameras are reported in the body with a 200 status.
async fn delete_camera_handler(
    State(state): State<AppState>,
    Path(camera_id): Path<u32>,
) -> Json<Value> {
    match state.directory.remove(camera_id) {
        Some(camera) => Json(json!({ "status": "success", "deleted_id": camera.id })),
        None => Json(json!({ "status": "error", "message": "Camera not found" })),
    }
}

#[derive(Serialize)]
struct StreamsResponse {
    streams: Vec<HubStats>,
}

async fn streams_handler(State(state): State<AppState>) -> Json<StreamsResponse> {
    Json(StreamsResponse {
        streams: state.registry.stats(),
    })
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
