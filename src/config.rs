use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DEVICE: &str = "/dev/video0";
const DEFAULT_WIDTH: u32 = 480;
const DEFAULT_HEIGHT: u32 = 360;
const DEFAULT_FPS: u32 = 10;
const DEFAULT_BUFFER_DEPTH: u32 = 1;
const DEFAULT_JPEG_QUALITY: u8 = 70;
const DEFAULT_FAILURE_THRESHOLD: u32 = 10;
const DEFAULT_WARMUP_ATTEMPTS: u32 = 3;
const DEFAULT_OPEN_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CAPTURE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_PACING_MS: u64 = 100;
const DEFAULT_MAX_STREAM_ERRORS: u32 = 10;
const DEFAULT_ERROR_BACKOFF_MS: u64 = 1_000;
const DEFAULT_ADDR: &str = "0.0.0.0:5001";
const DEFAULT_RECORDINGS_DIR: &str = "recordings";

#[derive(Debug, Deserialize, Default)]
struct RelayConfigFile {
    capture: Option<CaptureConfigFile>,
    stream: Option<StreamConfigFile>,
    server: Option<ServerConfigFile>,
    recording: Option<RecordingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    buffer_depth: Option<u32>,
    jpeg_quality: Option<u8>,
    min_interval_ms: Option<u64>,
    failure_threshold: Option<u32>,
    warmup_attempts: Option<u32>,
    open_timeout_ms: Option<u64>,
    capture_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    pacing_ms: Option<u64>,
    max_consecutive_errors: Option<u32>,
    error_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordingConfigFile {
    dir: Option<PathBuf>,
}

/// Fully resolved configuration for `camerad`.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub capture: CaptureSettings,
    pub stream: StreamSettings,
    pub server: ServerSettings,
    pub recording: RecordingSettings,
}

/// Device and cache settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    /// Device node (`/dev/video0`) or `stub://<name>` for the synthetic source.
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    /// Number of driver buffers; 1 keeps the served frame as close to "now" as possible.
    pub buffer_depth: u32,
    /// JPEG quality, 1..=100.
    pub jpeg_quality: u8,
    /// Minimum age before the cached frame goes stale.
    pub min_interval: Duration,
    /// Consecutive capture failures tolerated before `Exhausted`.
    pub failure_threshold: u32,
    pub warmup_attempts: u32,
    pub open_timeout: Duration,
    pub capture_timeout: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            target_fps: DEFAULT_FPS,
            buffer_depth: DEFAULT_BUFFER_DEPTH,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            min_interval: interval_for_fps(DEFAULT_FPS),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            warmup_attempts: DEFAULT_WARMUP_ATTEMPTS,
            open_timeout: Duration::from_millis(DEFAULT_OPEN_TIMEOUT_MS),
            capture_timeout: Duration::from_millis(DEFAULT_CAPTURE_TIMEOUT_MS),
        }
    }
}

impl CaptureSettings {
    /// Settings for the synthetic `stub://` device, handy in tests and demos.
    pub fn stub(name: &str) -> Self {
        Self {
            device: format!("stub://{}", name),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.device.trim().is_empty() {
            return Err(anyhow!("capture device must not be empty"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!(
                "resolution must be non-zero (got {}x{})",
                self.width,
                self.height
            ));
        }
        if self.target_fps == 0 {
            return Err(anyhow!("target_fps must be >= 1"));
        }
        if self.buffer_depth == 0 {
            return Err(anyhow!("buffer_depth must be >= 1"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!(
                "jpeg_quality must be within 1..=100 (got {})",
                self.jpeg_quality
            ));
        }
        if self.failure_threshold == 0 {
            return Err(anyhow!("failure_threshold must be >= 1"));
        }
        if self.warmup_attempts == 0 {
            return Err(anyhow!("warmup_attempts must be >= 1"));
        }
        if self.open_timeout.is_zero() || self.capture_timeout.is_zero() {
            return Err(anyhow!("device timeouts must be greater than zero"));
        }
        Ok(())
    }
}

/// Per-consumer delivery loop settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    /// Sleep between frames of one consumer.
    pub pacing: Duration,
    /// Consecutive failed frames before the stream is terminated.
    pub max_consecutive_errors: u32,
    /// Extra sleep after a failed frame.
    pub error_backoff: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            pacing: Duration::from_millis(DEFAULT_PACING_MS),
            max_consecutive_errors: DEFAULT_MAX_STREAM_ERRORS,
            error_backoff: Duration::from_millis(DEFAULT_ERROR_BACKOFF_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSettings {
    pub dir: PathBuf,
}

impl RelayConfig {
    /// Load from `CAMERA_RELAY_CONFIG` (JSON, or TOML by extension), then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMERA_RELAY_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let file_cfg = file_cfg.unwrap_or_default();
        let interval_pinned = file_cfg
            .capture
            .as_ref()
            .map_or(false, |capture| capture.min_interval_ms.is_some());
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env(interval_pinned)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RelayConfigFile) -> Self {
        let capture_file = file.capture.unwrap_or_default();
        let target_fps = capture_file.target_fps.unwrap_or(DEFAULT_FPS);
        let capture = CaptureSettings {
            device: capture_file
                .device
                .unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
            width: capture_file.width.unwrap_or(DEFAULT_WIDTH),
            height: capture_file.height.unwrap_or(DEFAULT_HEIGHT),
            target_fps,
            buffer_depth: capture_file.buffer_depth.unwrap_or(DEFAULT_BUFFER_DEPTH),
            jpeg_quality: capture_file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            min_interval: capture_file
                .min_interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| interval_for_fps(target_fps)),
            failure_threshold: capture_file
                .failure_threshold
                .unwrap_or(DEFAULT_FAILURE_THRESHOLD),
            warmup_attempts: capture_file
                .warmup_attempts
                .unwrap_or(DEFAULT_WARMUP_ATTEMPTS),
            open_timeout: Duration::from_millis(
                capture_file
                    .open_timeout_ms
                    .unwrap_or(DEFAULT_OPEN_TIMEOUT_MS),
            ),
            capture_timeout: Duration::from_millis(
                capture_file
                    .capture_timeout_ms
                    .unwrap_or(DEFAULT_CAPTURE_TIMEOUT_MS),
            ),
        };
        let stream_file = file.stream.unwrap_or_default();
        let stream = StreamSettings {
            pacing: Duration::from_millis(stream_file.pacing_ms.unwrap_or(DEFAULT_PACING_MS)),
            max_consecutive_errors: stream_file
                .max_consecutive_errors
                .unwrap_or(DEFAULT_MAX_STREAM_ERRORS),
            error_backoff: Duration::from_millis(
                stream_file
                    .error_backoff_ms
                    .unwrap_or(DEFAULT_ERROR_BACKOFF_MS),
            ),
        };
        let server = ServerSettings {
            addr: file
                .server
                .and_then(|server| server.addr)
                .unwrap_or_else(|| DEFAULT_ADDR.to_string()),
        };
        let recording = RecordingSettings {
            dir: file
                .recording
                .and_then(|recording| recording.dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RECORDINGS_DIR)),
        };
        Self {
            capture,
            stream,
            server,
            recording,
        }
    }

    /// `interval_pinned` is set when the file gave `min_interval_ms` explicitly;
    /// an fps override then leaves the interval alone.
    fn apply_env(&mut self, interval_pinned: bool) -> Result<()> {
        if let Ok(addr) = std::env::var("CAMERA_RELAY_ADDR") {
            if !addr.trim().is_empty() {
                self.server.addr = addr;
            }
        }
        if let Ok(device) = std::env::var("CAMERA_RELAY_DEVICE") {
            if !device.trim().is_empty() {
                self.capture.device = device;
            }
        }
        if let Ok(dir) = std::env::var("CAMERA_RELAY_RECORDINGS_DIR") {
            if !dir.trim().is_empty() {
                self.recording.dir = PathBuf::from(dir);
            }
        }
        if let Ok(fps) = std::env::var("CAMERA_RELAY_FPS") {
            let fps: u32 = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAMERA_RELAY_FPS must be an integer"))?;
            if !interval_pinned {
                self.capture.min_interval = interval_for_fps(fps);
            }
            self.capture.target_fps = fps;
        }
        if let Ok(quality) = std::env::var("CAMERA_RELAY_QUALITY") {
            self.capture.jpeg_quality = quality
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAMERA_RELAY_QUALITY must be an integer in 1..=100"))?;
        }
        if let Ok(resolution) = std::env::var("CAMERA_RELAY_RESOLUTION") {
            let (width, height) = parse_resolution(&resolution)?;
            self.capture.width = width;
            self.capture.height = height;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.capture.validate()?;
        self.server
            .addr
            .parse::<SocketAddr>()
            .map_err(|e| anyhow!("invalid server addr '{}': {}", self.server.addr, e))?;
        if self.stream.pacing.is_zero() {
            return Err(anyhow!("stream pacing must be greater than zero"));
        }
        if self.stream.max_consecutive_errors == 0 {
            return Err(anyhow!("max_consecutive_errors must be >= 1"));
        }
        Ok(())
    }
}

/// Parse a `WIDTHxHEIGHT` resolution string.
pub fn parse_resolution(value: &str) -> Result<(u32, u32)> {
    let (w, h) = value
        .trim()
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow!("resolution must look like 640x480 (got '{}')", value))?;
    let width = w
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid resolution width '{}'", w))?;
    let height = h
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid resolution height '{}'", h))?;
    Ok((width, height))
}

/// Cache refresh interval matching a target frame rate.
pub fn interval_for_fps(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
