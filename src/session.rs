//! Capture session manager.
//!
//! One `CaptureSessionManager` owns the device, the frame cache, the consumer
//! registry and the recorder, all behind a single mutex. Every decision that
//! opens or closes the device is made while holding it, so two threads can never
//! both conclude they are first in or last out.
//!
//! Holds on the device:
//! - each registered consumer (`stream_begin` .. `stream_end`)
//! - an active recording (`recording_start` .. `recording_stop`)
//!
//! The device is open while at least one hold exists. The one exception is a
//! session that hit `Exhausted`: the hardware is closed and marked failed, and
//! the next frame request from a remaining hold opens it again.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;

use crate::cache::{CacheStats, RateLimitedCache};
use crate::codec::avi::ContainerConfig;
use crate::codec::FrameCodec;
use crate::config::CaptureSettings;
use crate::device::{
    self, ActiveFormat, DeviceConfig, DeviceDriver, DeviceHandle, DeviceState, DeviceStats,
};
use crate::error::{DeviceError, ErrorRecord, RecordingError};
use crate::frame::EncodedFrame;
use crate::recorder::{self, Recorder, RecordingSink, RecordingSummary};
use crate::registry::{ClientRegistry, ConsumerToken};

struct SessionState {
    device: DeviceHandle,
    cache: RateLimitedCache,
    registry: ClientRegistry,
    recorder: Recorder,
    last_error: Option<ErrorRecord>,
    shut_down: bool,
}

impl SessionState {
    fn note_device_error(&mut self, err: &DeviceError) {
        self.last_error = Some(ErrorRecord::now(
            err.kind(),
            err.to_string(),
            self.cache.failures().consecutive,
        ));
    }

    /// Close the device if nothing holds it any more.
    fn release_if_unheld(&mut self) {
        if self.registry.active() == 0 && !self.recorder.is_active() && self.device.is_open() {
            self.device.close();
            self.cache.clear();
        }
    }
}

/// Snapshot returned by `status()`.
#[derive(Clone, Debug, Serialize)]
pub struct SessionStatus {
    pub device_open: bool,
    pub device_state: DeviceState,
    pub active_consumers: usize,
    pub peak_consumers: usize,
    pub recording_active: bool,
    pub recording_path: Option<PathBuf>,
    pub recording_frames: u64,
    pub recording_error: Option<String>,
    pub last_error: Option<ErrorRecord>,
    pub consecutive_failures: u32,
    pub format: Option<ActiveFormat>,
    pub cache: CacheStats,
    pub device: DeviceStats,
}

/// Configured versus negotiated capture parameters.
#[derive(Clone, Debug, Serialize)]
pub struct CameraInfo {
    pub configured: DeviceConfig,
    pub active: Option<ActiveFormat>,
    pub jpeg_quality: u8,
    pub min_interval_ms: u64,
}

pub struct CaptureSessionManager {
    state: Mutex<SessionState>,
    jpeg_quality: u8,
}

impl CaptureSessionManager {
    /// Build a manager for the driver matching `settings.device`.
    pub fn new(settings: &CaptureSettings) -> Result<Self, DeviceError> {
        let driver = device::driver_for(&settings.device)?;
        Ok(Self::with_driver(driver, settings))
    }

    pub fn with_driver(driver: Arc<dyn DeviceDriver>, settings: &CaptureSettings) -> Self {
        let codec = FrameCodec::new(settings.jpeg_quality);
        let container = ContainerConfig {
            width: settings.width,
            height: settings.height,
            fps: settings.target_fps,
            quality: settings.jpeg_quality,
        };
        let state = SessionState {
            device: DeviceHandle::new(driver, settings),
            cache: RateLimitedCache::new(codec, settings.min_interval, settings.failure_threshold),
            registry: ClientRegistry::new(),
            recorder: Recorder::new(container),
            last_error: None,
            shut_down: false,
        };
        Self {
            state: Mutex::new(state),
            jpeg_quality: codec.quality(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a consumer, opening the device if this is the first hold.
    pub fn stream_begin(&self) -> Result<ConsumerToken, DeviceError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.shut_down {
            return Err(shut_down_error(&state.device));
        }
        match state.registry.register(&mut state.device) {
            Ok(token) => {
                log::info!(
                    "session: consumer {} connected ({} active)",
                    token.id(),
                    state.registry.active()
                );
                Ok(token)
            }
            Err(err) => {
                log::warn!("session: consumer registration failed: {}", err);
                state.note_device_error(&err);
                Err(err)
            }
        }
    }

    /// Current frame for a registered consumer.
    pub fn stream_next(&self, _token: &ConsumerToken) -> Result<EncodedFrame, DeviceError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.shut_down {
            return Err(shut_down_error(&state.device));
        }
        let SessionState {
            device,
            cache,
            recorder,
            ..
        } = &mut *state;
        let result = cache.get(device, Instant::now(), |raw, encoded| {
            recorder.record(raw, encoded)
        });
        if let Err(err) = &result {
            state.note_device_error(err);
            if matches!(err, DeviceError::Exhausted { .. }) {
                state.device.fail(err.to_string());
            }
        }
        result
    }

    /// Unregister a consumer. Consumes the token, so it runs once per `stream_begin`.
    pub fn stream_end(&self, token: ConsumerToken) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let id = token.id();
        let recording = state.recorder.is_active();
        state
            .registry
            .unregister(token, &mut state.device, &mut state.cache, recording);
        log::info!(
            "session: consumer {} disconnected ({} active)",
            id,
            state.registry.active()
        );
    }

    /// Register a consumer whose `stream_end` runs when the guard is dropped.
    pub fn stream_guard(self: &Arc<Self>) -> Result<StreamGuard, DeviceError> {
        let token = self.stream_begin()?;
        Ok(StreamGuard {
            manager: Arc::clone(self),
            token: Some(token),
        })
    }

    /// Start recording to `path`, opening the device if no consumer holds it.
    pub fn recording_start(&self, path: &Path) -> Result<(), RecordingError> {
        self.start_recording(path, |recorder| recorder.start(path))
    }

    /// Start recording to a fresh `video_<timestamp>.avi` under `dir`.
    pub fn recording_start_timestamped(&self, dir: &Path) -> Result<PathBuf, RecordingError> {
        let path = recorder::timestamped_path(dir).map_err(|e| RecordingError::io(dir, e))?;
        self.recording_start(&path)?;
        Ok(path)
    }

    pub fn recording_start_with_sink(
        &self,
        path: &Path,
        sink: Box<dyn RecordingSink>,
    ) -> Result<(), RecordingError> {
        self.start_recording(path, move |recorder| recorder.start_with_sink(path, sink))
    }

    fn start_recording<F>(&self, path: &Path, start: F) -> Result<(), RecordingError>
    where
        F: FnOnce(&mut Recorder) -> Result<(), RecordingError>,
    {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.shut_down {
            return Err(RecordingError::Device(shut_down_error(&state.device)));
        }
        if let Some(active) = state.recorder.path() {
            return Err(RecordingError::AlreadyRecording(active.to_path_buf()));
        }
        if let Err(err) = state.device.open() {
            state.note_device_error(&err);
            return Err(RecordingError::Device(err));
        }
        if let Err(err) = start(&mut state.recorder) {
            log::warn!(
                "session: could not start recording {}: {}",
                path.display(),
                err
            );
            state.release_if_unheld();
            return Err(err);
        }
        log::info!(
            "session: recording started ({} consumers attached)",
            state.registry.active()
        );
        Ok(())
    }

    /// Stop the recording, closing the device if no consumer holds it.
    pub fn recording_stop(&self) -> Result<RecordingSummary, RecordingError> {
        let mut state = self.lock();
        let result = state.recorder.stop();
        state.release_if_unheld();
        if let Err(err) = &result {
            if !matches!(err, RecordingError::NotRecording) {
                state.last_error = Some(ErrorRecord::now(err.kind(), err.to_string(), 0));
            }
        }
        result
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.lock();
        SessionStatus {
            device_open: state.device.is_open(),
            device_state: state.device.state(),
            active_consumers: state.registry.active(),
            peak_consumers: state.registry.peak(),
            recording_active: state.recorder.is_active(),
            recording_path: state.recorder.path().map(Path::to_path_buf),
            recording_frames: state.recorder.frames(),
            recording_error: state.recorder.failure(),
            last_error: state.last_error.clone(),
            consecutive_failures: state.cache.failures().consecutive,
            format: state.device.format(),
            cache: state.cache.stats(),
            device: state.device.stats(),
        }
    }

    pub fn camera_info(&self) -> CameraInfo {
        let state = self.lock();
        CameraInfo {
            configured: state.device.config().clone(),
            active: state.device.format(),
            jpeg_quality: self.jpeg_quality,
            min_interval_ms: u64::try_from(state.cache.min_interval().as_millis())
                .unwrap_or(u64::MAX),
        }
    }

    pub fn active_consumers(&self) -> usize {
        self.lock().registry.active()
    }

    pub fn is_device_open(&self) -> bool {
        self.lock().device.is_open()
    }

    /// Stop any recording and close the device. Later frame and
    /// registration requests fail; outstanding `stream_end` calls still work.
    pub fn shutdown(&self) -> Option<RecordingSummary> {
        let mut state = self.lock();
        if state.shut_down {
            return None;
        }
        state.shut_down = true;
        let summary = if state.recorder.is_active() {
            match state.recorder.stop() {
                Ok(summary) => Some(summary),
                Err(err) => {
                    log::error!("session: recording did not close cleanly: {}", err);
                    None
                }
            }
        } else {
            None
        };
        state.device.close();
        state.cache.clear();
        log::info!(
            "session: shut down ({} consumers still attached)",
            state.registry.active()
        );
        summary
    }
}

fn shut_down_error(device: &DeviceHandle) -> DeviceError {
    DeviceError::Unavailable {
        device: device.config().device.clone(),
        reason: "capture session is shut down".to_string(),
    }
}

/// A registered consumer. Dropping it unregisters.
pub struct StreamGuard {
    manager: Arc<CaptureSessionManager>,
    token: Option<ConsumerToken>,
}

impl StreamGuard {
    pub fn id(&self) -> u64 {
        self.token.as_ref().map(ConsumerToken::id).unwrap_or(0)
    }

    pub fn next_frame(&self) -> Result<EncodedFrame, DeviceError> {
        match &self.token {
            Some(token) => self.manager.stream_next(token),
            None => Err(DeviceError::ReadFailed("stream already ended".to_string())),
        }
    }

    pub fn manager(&self) -> &Arc<CaptureSessionManager> {
        &self.manager
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.manager.stream_end(token);
        }
    }
}
