//! RTSP camera to MJPEG relay
//!
//! Pulls each camera's RTSP stream once, encodes frames to JPEG and fans them
//! out to any number of HTTP viewers as `multipart/x-mixed-replace` parts.

pub mod camera;
pub mod config;
pub mod directory;
pub mod processing;
pub mod streaming;
#[cfg(any(test, feature = "test-mode"))]
pub mod testing;
pub mod web;

pub use config::Config;
pub use directory::CameraDirectory;
pub use streaming::HubRegistry;
