//! Exclusive capture device ownership.
//!
//! A `DeviceDriver` knows how to open one kind of hardware and hands back a
//! `CaptureBackend` for the duration of a device session. `DeviceHandle` wraps
//! that lifecycle:
//!
//! - `open` spawns a capture worker thread that opens the backend, applies the
//!   configuration and performs warm-up reads before reporting ready
//! - `capture` asks the worker for one frame and waits at most `capture_timeout`
//! - `close` tears the worker down; it is idempotent
//!
//! The backend never leaves its worker thread, so a read that hangs in the driver
//! only costs the caller the watchdog timeout, never the caller's lock forever.
//! A worker that is still stuck when the device is closed is kept aside, and the
//! next `open` waits for it to let go of the hardware before opening again.
//!
//! Available drivers:
//! - `stub://<name>`: synthetic moving scene (`synthetic`)
//! - `/dev/videoN`: V4L2 devices (feature: device-v4l2)
//! - `scripted`: fault-injecting driver for tests

#[cfg(feature = "device-v4l2")]
mod normalize;
pub mod scripted;
pub mod synthetic;
#[cfg(feature = "device-v4l2")]
pub mod v4l2;
mod worker;

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CaptureSettings;
use crate::error::DeviceError;
use crate::frame::RawFrame;

use self::worker::{CaptureWorker, WorkerThread};

pub use scripted::{ScriptProbe, ScriptedDriver};
pub use synthetic::SyntheticDriver;
#[cfg(feature = "device-v4l2")]
pub use v4l2::V4l2Driver;

/// Configuration applied to the hardware on open.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub buffer_depth: u32,
}

impl From<&CaptureSettings> for DeviceConfig {
    fn from(settings: &CaptureSettings) -> Self {
        Self {
            device: settings.device.clone(),
            width: settings.width,
            height: settings.height,
            target_fps: settings.target_fps,
            buffer_depth: settings.buffer_depth,
        }
    }
}

/// Bounds on the slow parts of a device session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Watchdog {
    pub warmup_attempts: u32,
    pub open_timeout: Duration,
    pub capture_timeout: Duration,
}

impl From<&CaptureSettings> for Watchdog {
    fn from(settings: &CaptureSettings) -> Self {
        Self {
            warmup_attempts: settings.warmup_attempts.max(1),
            open_timeout: settings.open_timeout,
            capture_timeout: settings.capture_timeout,
        }
    }
}

/// Format the hardware actually agreed to, which may differ from the request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ActiveFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub backend: String,
}

/// An open device session. Lives on the capture worker thread.
pub trait CaptureBackend: Send {
    /// Blocking read of the next frame, converted to RGB24.
    fn read_frame(&mut self) -> Result<RawFrame, DeviceError>;

    fn format(&self) -> ActiveFormat;

    /// Release hardware resources. Must tolerate repeated calls.
    fn close(&mut self);
}

/// Opens backends for one kind of device.
pub trait DeviceDriver: Send + Sync {
    fn name(&self) -> &'static str;

    fn open(&self, config: &DeviceConfig) -> Result<Box<dyn CaptureBackend>, DeviceError>;
}

/// Pick the driver for a configured device string.
pub fn driver_for(device: &str) -> Result<Arc<dyn DeviceDriver>, DeviceError> {
    if device.starts_with("stub://") {
        return Ok(Arc::new(SyntheticDriver::new()));
    }
    #[cfg(feature = "device-v4l2")]
    {
        Ok(Arc::new(V4l2Driver::new()))
    }
    #[cfg(not(feature = "device-v4l2"))]
    {
        Err(DeviceError::Unavailable {
            device: device.to_string(),
            reason: "capture devices require the device-v4l2 feature".to_string(),
        })
    }
}

/// Observable device state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum DeviceState {
    Unopened,
    Open(DeviceConfig),
    Failed(String),
}

/// Lifetime counters for one handle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    pub opens: u64,
    pub closes: u64,
    pub frames_captured: u64,
}

/// Process-wide owner of the capture device.
pub struct DeviceHandle {
    driver: Arc<dyn DeviceDriver>,
    config: DeviceConfig,
    watchdog: Watchdog,
    session: Option<CaptureWorker>,
    /// Worker from an earlier session that has not yet released the hardware.
    releasing: Option<WorkerThread>,
    failure: Option<String>,
    stats: DeviceStats,
}

impl DeviceHandle {
    pub fn new(driver: Arc<dyn DeviceDriver>, settings: &CaptureSettings) -> Self {
        Self {
            driver,
            config: DeviceConfig::from(settings),
            watchdog: Watchdog::from(settings),
            session: None,
            releasing: None,
            failure: None,
            stats: DeviceStats::default(),
        }
    }

    /// Open the device, apply the configuration and warm it up.
    ///
    /// Returns the active format immediately if the device is already open.
    pub fn open(&mut self) -> Result<ActiveFormat, DeviceError> {
        if let Some(session) = &self.session {
            return Ok(session.format().clone());
        }
        self.await_release()?;
        log::info!(
            "device: opening {} via {} ({}x{} @ {} fps, {} buffers)",
            self.config.device,
            self.driver.name(),
            self.config.width,
            self.config.height,
            self.config.target_fps,
            self.config.buffer_depth
        );
        match CaptureWorker::spawn(self.driver.clone(), self.config.clone(), self.watchdog) {
            Ok(session) => {
                let format = session.format().clone();
                log::info!(
                    "device: {} ready ({}x{} @ {} fps, backend {})",
                    self.config.device,
                    format.width,
                    format.height,
                    format.fps,
                    format.backend
                );
                self.session = Some(session);
                self.failure = None;
                self.stats.opens += 1;
                Ok(format)
            }
            Err(failure) => {
                let err = failure.error;
                log::warn!("device: open of {} failed: {}", self.config.device, err);
                self.releasing = failure.straggler;
                self.failure = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Wait up to `open_timeout` for a stuck worker from the previous session.
    fn await_release(&mut self) -> Result<(), DeviceError> {
        let Some(thread) = self.releasing.take() else {
            return Ok(());
        };
        match thread.wait_exit(self.watchdog.open_timeout) {
            Ok(()) => {
                log::info!("device: previous session of {} released", self.config.device);
                Ok(())
            }
            Err(thread) => {
                self.releasing = Some(thread);
                let err = DeviceError::Unavailable {
                    device: self.config.device.clone(),
                    reason: "previous capture session has not released the device".to_string(),
                };
                self.failure = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Read one frame. Fails with `ReadFailed` when the device is not open.
    pub fn capture(&mut self) -> Result<RawFrame, DeviceError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| DeviceError::ReadFailed("device not open".to_string()))?;
        let frame = session.capture()?;
        self.stats.frames_captured += 1;
        Ok(frame)
    }

    /// Release the device. Safe to call on a closed handle.
    pub fn close(&mut self) {
        self.failure = None;
        if let Some(session) = self.session.take() {
            self.stats.closes += 1;
            match session.shutdown() {
                None => log::info!("device: closed {}", self.config.device),
                Some(thread) => {
                    self.releasing = Some(thread);
                    self.failure = Some("capture worker still inside a driver read".to_string());
                }
            }
        }
    }

    /// Close the device and remember why the session ended.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.close();
        let reason = reason.into();
        log::warn!("device: {} marked failed: {}", self.config.device, reason);
        self.failure = Some(reason);
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn state(&self) -> DeviceState {
        match (&self.session, &self.failure) {
            (Some(_), _) => DeviceState::Open(self.config.clone()),
            (None, Some(reason)) => DeviceState::Failed(reason.clone()),
            (None, None) => DeviceState::Unopened,
        }
    }

    pub fn format(&self) -> Option<ActiveFormat> {
        self.session.as_ref().map(|session| session.format().clone())
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn stats(&self) -> DeviceStats {
        self.stats
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scripted_handle() -> (DeviceHandle, ScriptProbe) {
        let (driver, probe) = ScriptedDriver::new();
        let mut settings = CaptureSettings::stub("handle");
        settings.width = 8;
        settings.height = 6;
        settings.warmup_attempts = 2;
        settings.capture_timeout = Duration::from_millis(200);
        (DeviceHandle::new(Arc::new(driver), &settings), probe)
    }

    #[test]
    fn open_capture_close_lifecycle() {
        let (mut handle, probe) = scripted_handle();
        assert_eq!(handle.state(), DeviceState::Unopened);

        let format = handle.open().expect("open");
        assert_eq!((format.width, format.height), (8, 6));
        assert!(matches!(handle.state(), DeviceState::Open(_)));

        let frame = handle.capture().expect("capture");
        assert!(frame.is_well_formed());

        handle.close();
        handle.close();
        assert_eq!(handle.state(), DeviceState::Unopened);
        assert_eq!(probe.hardware_opens(), 1);
        assert_eq!(probe.hardware_closes(), 1);
    }

    #[test]
    fn reopen_is_a_no_op_while_open() {
        let (mut handle, probe) = scripted_handle();
        handle.open().expect("first open");
        handle.open().expect("second open");
        assert_eq!(probe.hardware_opens(), 1);
        assert_eq!(handle.stats().opens, 1);
    }

    #[test]
    fn warmup_failure_closes_hardware_again() {
        let (mut handle, probe) = scripted_handle();
        probe.fail_next_captures(2);

        let err = handle.open().expect_err("warm-up should fail");
        assert!(matches!(err, DeviceError::WarmupFailed { attempts: 2, .. }));
        assert!(matches!(handle.state(), DeviceState::Failed(_)));
        assert_eq!(probe.hardware_opens(), 1);
        assert_eq!(probe.hardware_closes(), 1);
    }

    #[test]
    fn warmup_tolerates_a_slow_first_frame() {
        let (mut handle, probe) = scripted_handle();
        probe.fail_next_captures(1);
        handle.open().expect("second warm-up read succeeds");
        assert!(handle.is_open());
    }

    #[test]
    fn capture_on_closed_handle_is_a_read_failure() {
        let (mut handle, _probe) = scripted_handle();
        let err = handle.capture().expect_err("closed");
        assert!(matches!(err, DeviceError::ReadFailed(_)));
    }

    fn slow_handle(capture_timeout: u64, open_timeout: u64) -> (DeviceHandle, ScriptProbe) {
        let (driver, probe) = ScriptedDriver::new();
        let mut settings = CaptureSettings::stub("slow");
        settings.width = 8;
        settings.height = 6;
        settings.warmup_attempts = 1;
        settings.capture_timeout = Duration::from_millis(capture_timeout);
        settings.open_timeout = Duration::from_millis(open_timeout);
        (DeviceHandle::new(Arc::new(driver), &settings), probe)
    }

    #[test]
    fn stuck_capture_is_bounded_by_the_watchdog() {
        let (mut handle, probe) = slow_handle(200, 1_000);
        handle.open().expect("open");
        let reads_before = probe.captures();
        probe.set_capture_delay(Duration::from_millis(500));

        let started = std::time::Instant::now();
        let err = handle.capture().expect_err("should time out");
        assert!(matches!(err, DeviceError::Timeout { op: "capture", .. }));
        assert!(started.elapsed() < Duration::from_millis(400));

        // Still waiting on the same read; nothing new reaches the hardware.
        let err = handle.capture().expect_err("read still outstanding");
        assert!(matches!(err, DeviceError::Timeout { op: "capture", .. }));
        assert_eq!(probe.captures(), reads_before + 1);

        probe.set_capture_delay(Duration::ZERO);
        handle.close();
        assert!(!handle.is_open());
        assert!(!probe.hardware_open(), "close must wait out the stuck read");
        assert_eq!(probe.hardware_closes(), 1);

        handle.open().expect("reopen");
        assert_eq!(probe.hardware_opens(), 2);
        assert_eq!(probe.peak_live_sessions(), 1);
        handle.close();
    }

    #[test]
    fn reopen_waits_for_a_worker_stuck_past_close() {
        let (mut handle, probe) = slow_handle(100, 150);
        handle.open().expect("open");
        probe.set_capture_delay(Duration::from_millis(700));
        assert!(handle.capture().is_err());

        handle.close();
        assert!(!handle.is_open());
        assert!(probe.hardware_open(), "read is still inside the driver");
        assert!(matches!(handle.state(), DeviceState::Failed(_)));

        probe.set_capture_delay(Duration::ZERO);
        let err = handle.open().expect_err("old worker still holds the device");
        assert!(matches!(err, DeviceError::Unavailable { .. }));
        assert_eq!(probe.hardware_opens(), 1);

        std::thread::sleep(Duration::from_millis(500));
        handle.open().expect("reopen once the read returned");
        assert_eq!(probe.hardware_opens(), 2);
        assert_eq!(probe.hardware_closes(), 1);
        assert_eq!(probe.peak_live_sessions(), 1);
        handle.close();
        assert!(!probe.hardware_open());
    }

    #[test]
    fn failed_open_is_reported_and_retryable() {
        let (mut handle, probe) = scripted_handle();
        probe.fail_next_opens(1);
        assert!(matches!(
            handle.open(),
            Err(DeviceError::Unavailable { .. })
        ));
        assert!(matches!(handle.state(), DeviceState::Failed(_)));

        handle.open().expect("second attempt");
        assert!(handle.is_open());
    }

    #[test]
    fn unknown_devices_need_a_driver() {
        let stub = driver_for("stub://front");
        assert!(stub.is_ok());
        #[cfg(not(feature = "device-v4l2"))]
        assert!(driver_for("/dev/video0").is_err());
    }
}
