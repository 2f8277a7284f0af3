//! Live relay core: per-camera hubs fanning frames out to viewers.

mod frame_distributor;
mod hub;
mod registry;
mod session;

pub use frame_distributor::{FrameDistributor, FrameReceiver, FrameRecvError, FrameStats};
pub use hub::{HubConfig, HubState, HubStats, StreamHub, Subscription};
pub use registry::HubRegistry;
pub use session::{encode_part, ViewerSession, BOUNDARY, CONTENT_TYPE};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::directory::DirectoryError;

/// Errors surfaced to a viewer before its stream starts
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("camera {0} not found")]
    CameraNotFound(u32),

    #[error("camera {0} is disabled")]
    CameraDisabled(u32),

    #[error("camera {0} has reached its viewer limit")]
    ViewerLimitReached(u32),

    #[error("stream for camera {0} closed while attaching")]
    HubClosed(u32),

    #[error("server is shutting down")]
    ShuttingDown,
}

impl From<DirectoryError> for StreamError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::NotFound(id) => StreamError::CameraNotFound(id),
            DirectoryError::Disabled(id) => StreamError::CameraDisabled(id),
        }
    }
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            // Disabled cameras are indistinguishable from missing ones
            StreamError::CameraNotFound(_) | StreamError::CameraDisabled(_) => (
                StatusCode::NOT_FOUND,
                "Camera not found or disabled".to_string(),
            ),
            StreamError::ViewerLimitReached(_)
            | StreamError::HubClosed(_)
            | StreamError::ShuttingDown => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}
