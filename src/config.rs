use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::camera::RtspOptions;
use crate::directory::CameraIn;
use crate::streaming::HubConfig;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be between 1 and 100, got {value}")]
    OutOfRange { field: &'static str, value: u64 },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    /// Cameras loaded into the directory at startup
    #[serde(default)]
    pub cameras: Vec<CameraIn>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,

    #[serde(default = "default_web_port")]
    pub web_port: u16,
}

/// Relay tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StreamConfig {
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    #[serde(default = "default_placeholder_interval_ms")]
    pub placeholder_interval_ms: u64,

    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    #[serde(default = "default_pull_timeout_ms")]
    pub pull_timeout_ms: u64,

    /// Consecutive pull timeouts before the source counts as failed
    #[serde(default = "default_max_read_failures")]
    pub max_read_failures: u32,

    #[serde(default = "default_rtsp_latency_ms")]
    pub rtsp_latency_ms: u32,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// 0 means unlimited
    #[serde(default)]
    pub max_viewers_per_camera: usize,

    /// How long a viewer may go without accepting a part before it is dropped
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

// Default value functions
fn default_bind_ip() -> String { "0.0.0.0".to_string() }
fn default_web_port() -> u16 { 8000 }
fn default_jpeg_quality() -> u8 { 80 }
fn default_placeholder_interval_ms() -> u64 { 100 }
fn default_open_timeout_ms() -> u64 { 5000 }
fn default_pull_timeout_ms() -> u64 { 2000 }
fn default_max_read_failures() -> u32 { 3 }
fn default_rtsp_latency_ms() -> u32 { 200 }
fn default_channel_capacity() -> usize { 2 }
fn default_write_timeout_ms() -> u64 { 5000 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            web_port: default_web_port(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: default_jpeg_quality(),
            placeholder_interval_ms: default_placeholder_interval_ms(),
            open_timeout_ms: default_open_timeout_ms(),
            pull_timeout_ms: default_pull_timeout_ms(),
            max_read_failures: default_max_read_failures(),
            rtsp_latency_ms: default_rtsp_latency_ms(),
            channel_capacity: default_channel_capacity(),
            max_viewers_per_camera: 0,
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        content
            .parse()
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.stream.validate()
    }

    /// Socket address string for the HTTP listener
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.bind_ip, self.server.web_port)
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ConfigError::OutOfRange {
                field: "jpeg-quality",
                value: self.jpeg_quality as u64,
            });
        }

        let nonzero = [
            ("placeholder-interval-ms", self.placeholder_interval_ms),
            ("open-timeout-ms", self.open_timeout_ms),
            ("pull-timeout-ms", self.pull_timeout_ms),
            ("max-read-failures", self.max_read_failures as u64),
            ("channel-capacity", self.channel_capacity as u64),
            ("write-timeout-ms", self.write_timeout_ms),
        ];
        if let Some((field, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(*field));
        }

        Ok(())
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            placeholder_interval: Duration::from_millis(self.placeholder_interval_ms),
            channel_capacity: self.channel_capacity,
            max_viewers: self.max_viewers_per_camera,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }

    pub fn rtsp_options(&self) -> RtspOptions {
        RtspOptions {
            latency_ms: self.rtsp_latency_ms,
            open_timeout: Duration::from_millis(self.open_timeout_ms),
            pull_timeout: Duration::from_millis(self.pull_timeout_ms),
            max_read_failures: self.max_read_failures,
        }
    }
}
