//! Camera relay server

use anyhow::{Context, Result};
use clap::Parser;
use gstreamer as gst;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use camera_relay::camera::RtspOpener;
use camera_relay::processing::JpegEncoder;
use camera_relay::web::{self, AppState};
use camera_relay::{CameraDirectory, Config, HubRegistry};

#[derive(Parser, Debug)]
#[command(name = "camera-relay")]
#[command(about = "Relays RTSP network cameras to browsers as MJPEG over HTTP")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Override the address to bind
    #[arg(long)]
    bind_ip: Option<String>,

    /// Override the HTTP port
    #[arg(long)]
    web_port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt().with_env_filter(filter).with_target(false).init();

    info!("Camera relay starting");

    let mut config = if Path::new(&cli.config).exists() {
        info!(config_path = %cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        warn!(config_path = %cli.config, "Config file not found, using defaults");
        Config::default()
    };

    if let Some(bind_ip) = cli.bind_ip {
        config.server.bind_ip = bind_ip;
    }
    if let Some(web_port) = cli.web_port {
        config.server.web_port = web_port;
    }

    // Initialize GStreamer once globally
    gst::init().context("Failed to initialize GStreamer")?;

    let directory = Arc::new(CameraDirectory::with_cameras(config.cameras.clone()));
    info!(
        cameras = directory.list().len(),
        jpeg_quality = config.stream.jpeg_quality,
        max_viewers = config.stream.max_viewers_per_camera,
        "Configuration loaded"
    );

    let registry = Arc::new(HubRegistry::new(
        Arc::new(RtspOpener::new(config.stream.rtsp_options())),
        Arc::new(JpegEncoder::new(config.stream.jpeg_quality)),
        config.stream.hub_config(),
    ));

    web::run_server(&config.bind_addr(), AppState::new(directory, registry)).await?;

    info!("Camera relay stopped");
    Ok(())
}
