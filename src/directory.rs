//! In-memory camera records
//!
//! Resolves camera ids to the RTSP URL the relay should pull from. Records
//! are seeded from configuration and managed through the `/cams` endpoints.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::info;

/// Path and query used when a camera has no explicit `rtsp_link`.
const DEFAULT_RTSP_PATH: &str = "/cam/realmonitor?channel=1&subtype=1";
const DEFAULT_RTSP_PORT: u16 = 554;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("camera {0} not found")]
    NotFound(u32),

    #[error("camera {0} is disabled")]
    Disabled(u32),
}

/// Fields supplied when creating a camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraIn {
    pub name: String,
    pub ip: String,
    pub username: String,
    pub password: String,

    #[serde(default)]
    pub location: Option<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_stream_type")]
    pub stream_type: String,

    #[serde(default)]
    pub rtsp_link: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_stream_type() -> String {
    "rtsp".to_string()
}

/// A stored camera record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub id: u32,
    pub name: String,
    pub ip: String,
    pub username: String,
    pub password: String,
    pub location: Option<String>,
    pub enabled: bool,
    pub stream_type: String,
    pub rtsp_link: Option<String>,
}

impl Camera {
    fn from_input(id: u32, input: CameraIn) -> Self {
        Self {
            id,
            name: input.name,
            ip: input.ip,
            username: input.username,
            password: input.password,
            location: input.location,
            enabled: input.enabled,
            stream_type: input.stream_type,
            rtsp_link: input.rtsp_link,
        }
    }

    /// The explicit `rtsp_link` if set, otherwise a URL built from the
    /// host and credentials.
    pub fn rtsp_url(&self) -> String {
        match self.rtsp_link.as_deref().map(str::trim) {
            Some(link) if !link.is_empty() => link.to_string(),
            _ => format!(
                "rtsp://{}:{}@{}:{}{}",
                self.username, self.password, self.ip, DEFAULT_RTSP_PORT, DEFAULT_RTSP_PATH
            ),
        }
    }
}

/// Where to pull a camera's stream from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCamera {
    pub id: u32,
    pub url: String,
}

struct Records {
    cameras: BTreeMap<u32, Camera>,
    next_id: u32,
}

/// Camera records held in memory. Ids start at 1 and are never reused.
pub struct CameraDirectory {
    records: RwLock<Records>,
}

impl CameraDirectory {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Records {
                cameras: BTreeMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Directory pre-populated with `cameras`, numbered in order from 1.
    pub fn with_cameras(cameras: impl IntoIterator<Item = CameraIn>) -> Self {
        let directory = Self::new();
        for camera in cameras {
            directory.add(camera);
        }
        directory
    }

    pub fn add(&self, input: CameraIn) -> Camera {
        let mut records = self.records.write();
        let id = records.next_id;
        records.next_id += 1;

        let camera = Camera::from_input(id, input);
        records.cameras.insert(id, camera.clone());

        info!(camera_id = id, name = %camera.name, enabled = camera.enabled, "Camera added");
        camera
    }

    pub fn list(&self) -> Vec<Camera> {
        self.records.read().cameras.values().cloned().collect()
    }

    pub fn get(&self, id: u32) -> Option<Camera> {
        self.records.read().cameras.get(&id).cloned()
    }

    pub fn remove(&self, id: u32) -> Option<Camera> {
        let removed = self.records.write().cameras.remove(&id);
        if removed.is_some() {
            info!(camera_id = id, "Camera deleted");
        }
        removed
    }

    /// Stream location for an enabled camera.
    pub fn resolve(&self, id: u32) -> Result<ResolvedCamera, DirectoryError> {
        let records = self.records.read();
        let camera = records
            .cameras
            .get(&id)
            .ok_or(DirectoryError::NotFound(id))?;

        if !camera.enabled {
            return Err(DirectoryError::Disabled(id));
        }

        Ok(ResolvedCamera {
            id,
            url: camera.rtsp_url(),
        })
    }
}

impl Default for CameraDirectory {
    fn default() -> Self {
        Self::new()
    }
}
