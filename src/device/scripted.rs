//! Fault-injecting capture driver.
//!
//! `ScriptedDriver` behaves like a small, fast camera whose failures are
//! scripted through a shared `ScriptProbe`. The probe also counts the hardware
//! calls made against it, which is how the open/close accounting of the
//! session manager is observed in tests.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{ActiveFormat, CaptureBackend, DeviceConfig, DeviceDriver};
use crate::error::DeviceError;
use crate::frame::RawFrame;

#[derive(Debug, Default)]
struct Script {
    opens: u32,
    closes: u32,
    captures: u64,
    live_sessions: u32,
    peak_live_sessions: u32,
    fail_opens: u32,
    fail_captures: u32,
    capture_delay: Duration,
}

fn lock(script: &Mutex<Script>) -> MutexGuard<'_, Script> {
    script.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Driver half: hand to a `DeviceHandle`.
#[derive(Debug)]
pub struct ScriptedDriver {
    script: Arc<Mutex<Script>>,
}

/// Control half: keep in the test.
#[derive(Clone, Debug)]
pub struct ScriptProbe {
    script: Arc<Mutex<Script>>,
}

impl ScriptedDriver {
    pub fn new() -> (Self, ScriptProbe) {
        let script = Arc::new(Mutex::new(Script::default()));
        (
            Self {
                script: script.clone(),
            },
            ScriptProbe { script },
        )
    }
}

impl ScriptProbe {
    /// Make the next `n` hardware opens fail.
    pub fn fail_next_opens(&self, n: u32) {
        lock(&self.script).fail_opens = n;
    }

    /// Make the next `n` reads fail, warm-up reads included.
    pub fn fail_next_captures(&self, n: u32) {
        lock(&self.script).fail_captures = n;
    }

    pub fn set_capture_delay(&self, delay: Duration) {
        lock(&self.script).capture_delay = delay;
    }

    pub fn hardware_opens(&self) -> u32 {
        lock(&self.script).opens
    }

    pub fn hardware_closes(&self) -> u32 {
        lock(&self.script).closes
    }

    /// Every read attempt that reached the hardware.
    pub fn captures(&self) -> u64 {
        lock(&self.script).captures
    }

    /// True while a backend is open and not yet closed.
    pub fn hardware_open(&self) -> bool {
        lock(&self.script).live_sessions > 0
    }

    /// Most backends ever open at the same time.
    pub fn peak_live_sessions(&self) -> u32 {
        lock(&self.script).peak_live_sessions
    }
}

impl DeviceDriver for ScriptedDriver {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn open(&self, config: &DeviceConfig) -> Result<Box<dyn CaptureBackend>, DeviceError> {
        let mut script = lock(&self.script);
        if script.fail_opens > 0 {
            script.fail_opens -= 1;
            return Err(DeviceError::Unavailable {
                device: config.device.clone(),
                reason: "scripted open failure".to_string(),
            });
        }
        script.opens += 1;
        script.live_sessions += 1;
        script.peak_live_sessions = script.peak_live_sessions.max(script.live_sessions);
        Ok(Box::new(ScriptedBackend {
            script: self.script.clone(),
            width: config.width,
            height: config.height,
            fps: config.target_fps,
            sequence: 0,
            closed: false,
        }))
    }
}

struct ScriptedBackend {
    script: Arc<Mutex<Script>>,
    width: u32,
    height: u32,
    fps: u32,
    sequence: u64,
    closed: bool,
}

impl CaptureBackend for ScriptedBackend {
    fn read_frame(&mut self) -> Result<RawFrame, DeviceError> {
        let delay = {
            let mut script = lock(&self.script);
            script.captures += 1;
            if script.fail_captures > 0 {
                script.fail_captures -= 1;
                return Err(DeviceError::ReadFailed("scripted read failure".to_string()));
            }
            script.capture_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let len = (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| DeviceError::ReadFailed("frame dimensions overflow".to_string()))?;
        self.sequence += 1;
        let fill = (self.sequence % 251) as u8;
        Ok(RawFrame::new(
            vec![fill; len],
            self.width,
            self.height,
            self.sequence,
        ))
    }

    fn format(&self) -> ActiveFormat {
        ActiveFormat {
            width: self.width,
            height: self.height,
            fps: self.fps,
            backend: "scripted".to_string(),
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut script = lock(&self.script);
        script.closes += 1;
        script.live_sessions = script.live_sessions.saturating_sub(1);
    }
}

impl Drop for ScriptedBackend {
    fn drop(&mut self) {
        self.close();
    }
}
