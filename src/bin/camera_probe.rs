//! camera_probe - check what a capture device actually delivers
//!
//! For each requested resolution: open the device, print the negotiated
//! format, time one capture and its JPEG encode, then close again.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;

use camera_relay::config::parse_resolution;
use camera_relay::device::{driver_for, DeviceHandle};
use camera_relay::{CaptureSettings, FrameCodec};

#[derive(Parser, Debug)]
#[command(author, version, about = "Probe a capture device at several resolutions")]
struct Args {
    /// Capture device, e.g. /dev/video0 or stub://probe.
    #[arg(long, env = "CAMERA_RELAY_DEVICE", default_value = "/dev/video0")]
    device: String,
    /// Comma separated WxH list.
    #[arg(long, default_value = "640x480,480x360,320x240")]
    resolutions: String,
    /// JPEG quality used for the encode timing and snapshot.
    #[arg(long, default_value_t = 70)]
    quality: u8,
    /// Write the first successful frame here as JPEG.
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let resolutions = args
        .resolutions
        .split(',')
        .filter(|r| !r.trim().is_empty())
        .map(parse_resolution)
        .collect::<Result<Vec<_>>>()?;
    let driver = driver_for(&args.device)?;
    let codec = FrameCodec::new(args.quality);
    let mut snapshot = args.snapshot.clone();
    let mut working = 0usize;

    println!("probing {} via {}", args.device, driver.name());
    for (width, height) in resolutions {
        let settings = CaptureSettings {
            device: args.device.clone(),
            width,
            height,
            ..CaptureSettings::default()
        };
        let mut handle = DeviceHandle::new(driver.clone(), &settings);
        let opened = Instant::now();
        let format = match handle.open() {
            Ok(format) => format,
            Err(err) => {
                println!("  {}x{}: open failed: {}", width, height, err);
                continue;
            }
        };
        let open_ms = opened.elapsed().as_millis();

        let started = Instant::now();
        let result = handle.capture();
        let capture_ms = started.elapsed().as_millis();
        handle.close();
        let frame = match result {
            Ok(frame) => frame,
            Err(err) => {
                println!("  {}x{}: capture failed: {}", width, height, err);
                continue;
            }
        };

        let started = Instant::now();
        let encoded = codec
            .encode(&frame, 1)
            .map_err(|e| anyhow!("encode {}x{}: {}", width, height, e))?;
        let encode_ms = started.elapsed().as_millis();
        working += 1;
        println!(
            "  {}x{}: got {}x{} @ {} fps ({}), open {} ms, capture {} ms, jpeg {} bytes in {} ms",
            width,
            height,
            format.width,
            format.height,
            format.fps,
            format.backend,
            open_ms,
            capture_ms,
            encoded.len(),
            encode_ms
        );

        if let Some(path) = snapshot.take() {
            std::fs::write(&path, encoded.bytes())
                .with_context(|| format!("writing snapshot {}", path.display()))?;
            println!("  snapshot written to {}", path.display());
        }
    }

    if working == 0 {
        return Err(anyhow!("{} delivered no frames at any resolution", args.device));
    }
    println!("{} resolution(s) working", working);
    Ok(())
}
