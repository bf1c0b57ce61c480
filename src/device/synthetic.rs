//! Synthetic capture device for `stub://` paths.
//!
//! Produces a slowly changing gradient so consecutive frames differ and the
//! full encode/deliver path can be exercised without hardware.

use super::{ActiveFormat, CaptureBackend, DeviceConfig, DeviceDriver};
use crate::error::DeviceError;
use crate::frame::RawFrame;

#[derive(Debug, Default)]
pub struct SyntheticDriver;

impl SyntheticDriver {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceDriver for SyntheticDriver {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn open(&self, config: &DeviceConfig) -> Result<Box<dyn CaptureBackend>, DeviceError> {
        log::info!("synthetic: connected to {}", config.device);
        Ok(Box::new(SyntheticBackend::new(config)))
    }
}

struct SyntheticBackend {
    width: u32,
    height: u32,
    fps: u32,
    frame_count: u64,
    /// Simulated scene state; shifts every 50 frames.
    scene_state: u8,
    closed: bool,
}

impl SyntheticBackend {
    fn new(config: &DeviceConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            fps: config.target_fps,
            frame_count: 0,
            scene_state: 0,
            closed: false,
        }
    }

    fn generate_pixels(&mut self) -> Result<Vec<u8>, DeviceError> {
        let pixel_count = (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| {
                DeviceError::ReadFailed(format!(
                    "synthetic frame {}x{} overflows",
                    self.width, self.height
                ))
            })?;

        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64 * 32) % 256) as u8;
        }
        Ok(pixels)
    }
}

impl CaptureBackend for SyntheticBackend {
    fn read_frame(&mut self) -> Result<RawFrame, DeviceError> {
        if self.closed {
            return Err(DeviceError::ReadFailed("synthetic device closed".to_string()));
        }
        self.frame_count += 1;
        let pixels = self.generate_pixels()?;
        Ok(RawFrame::new(
            pixels,
            self.width,
            self.height,
            self.frame_count,
        ))
    }

    fn format(&self) -> ActiveFormat {
        ActiveFormat {
            width: self.width,
            height: self.height,
            fps: self.fps,
            backend: "synthetic".to_string(),
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
