//! camerad - camera relay daemon
//!
//! This daemon:
//! 1. Loads the relay configuration (file + env + flags)
//! 2. Builds the capture session manager; the device stays closed until needed
//! 3. Serves the MJPEG stream, status and recording control over HTTP
//! 4. On Ctrl-C ends every stream, finishes any recording and closes the device

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use camera_relay::{
    api::{ApiConfig, ApiServer},
    CaptureSessionManager, RelayConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Share one capture device with many MJPEG viewers")]
struct Args {
    /// Config file (JSON, or TOML by extension). Same as CAMERA_RELAY_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Listen address, overrides config and CAMERA_RELAY_ADDR.
    #[arg(long)]
    addr: Option<String>,
    /// Capture device, e.g. /dev/video0 or stub://demo.
    #[arg(long)]
    device: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if let Some(path) = &args.config {
        std::env::set_var("CAMERA_RELAY_CONFIG", path);
    }
    let mut config = RelayConfig::load().context("loading relay configuration")?;
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    if let Some(device) = args.device {
        config.capture.device = device;
    }
    config.capture.validate()?;

    let manager = Arc::new(
        CaptureSessionManager::new(&config.capture)
            .with_context(|| format!("no driver for {}", config.capture.device))?,
    );
    log::info!(
        "camerad: device {} at {}x{} @ {} fps, quality {}, recordings in {}",
        config.capture.device,
        config.capture.width,
        config.capture.height,
        config.capture.target_fps,
        config.capture.jpeg_quality,
        config.recording.dir.display()
    );

    let api_config = ApiConfig {
        addr: config.server.addr.clone(),
        stream: config.stream.clone(),
        recordings_dir: config.recording.dir.clone(),
    };
    let api_handle = ApiServer::new(api_config, manager.clone())
        .spawn()
        .with_context(|| format!("starting api on {}", config.server.addr))?;
    log::info!("camerad: stream at http://{}/video_feed", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("camerad waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping streams...");
    api_handle.stop()?;
    if let Some(summary) = manager.shutdown() {
        log::info!(
            "camerad: saved {} ({} frames)",
            summary.path.display(),
            summary.frames
        );
    }
    Ok(())
}
