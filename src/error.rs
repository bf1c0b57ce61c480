//! Error types for the capture path and the recording sink.
//!
//! Device errors are recoverable at the process level: the worst outcome of any
//! `DeviceError` is that the current device session is torn down and re-opened on
//! the next hold. Recording errors only ever stop the recording.

use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors raised by the capture device and the frame cache.
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    #[error("device {device} unavailable: {reason}")]
    Unavailable { device: String, reason: String },

    #[error("device {device} opened but produced no frame after {attempts} warm-up attempts")]
    WarmupFailed { device: String, attempts: u32 },

    #[error("frame read failed: {0}")]
    ReadFailed(String),

    #[error("device gave up after {failures} consecutive capture failures")]
    Exhausted { failures: u32 },

    #[error("device {op} did not complete within {after:?}")]
    Timeout { op: &'static str, after: Duration },
}

impl DeviceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::Unavailable { .. } => ErrorKind::DeviceUnavailable,
            DeviceError::WarmupFailed { .. } => ErrorKind::WarmupFailed,
            DeviceError::ReadFailed(_) => ErrorKind::ReadFailed,
            DeviceError::Exhausted { .. } => ErrorKind::Exhausted,
            // A capture that hangs is a read failure as far as retry policy goes.
            DeviceError::Timeout { op: "open", .. } => ErrorKind::DeviceUnavailable,
            DeviceError::Timeout { .. } => ErrorKind::ReadFailed,
        }
    }
}

/// Errors raised by the recording sink.
#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("a recording is already in progress: {}", .0.display())]
    AlreadyRecording(PathBuf),

    #[error("no recording in progress")]
    NotRecording,

    #[error("recording i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("recording could not acquire the device: {0}")]
    Device(#[from] DeviceError),
}

impl RecordingError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RecordingError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RecordingError::AlreadyRecording(_) => ErrorKind::AlreadyRecording,
            RecordingError::NotRecording | RecordingError::Io { .. } => ErrorKind::IoError,
            RecordingError::Device(err) => err.kind(),
        }
    }
}

/// Coarse classification carried in status output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DeviceUnavailable,
    WarmupFailed,
    ReadFailed,
    Exhausted,
    AlreadyRecording,
    IoError,
}

/// The most recent failure observed by the session manager.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    /// Wall-clock time of the failure, milliseconds since the unix epoch.
    pub at_ms: u64,
    pub consecutive_failures: u32,
}

impl ErrorRecord {
    pub fn now(kind: ErrorKind, message: impl Into<String>, consecutive_failures: u32) -> Self {
        let at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self {
            kind,
            message: message.into(),
            at_ms,
            consecutive_failures,
        }
    }
}
