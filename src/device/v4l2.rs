//! V4L2 capture driver.
//!
//! Opens a local device node (e.g. /dev/video0), negotiates resolution, frame
//! rate and buffer depth, and converts each buffer to RGB24. YUYV is requested
//! first; devices that insist on RGB3 or MJPG are handled too.

use ouroboros::self_referencing;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{ActiveFormat, CaptureBackend, DeviceConfig, DeviceDriver};
use crate::error::DeviceError;
use crate::frame::RawFrame;

#[derive(Debug, Default)]
pub struct V4l2Driver;

impl V4l2Driver {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceDriver for V4l2Driver {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn open(&self, config: &DeviceConfig) -> Result<Box<dyn CaptureBackend>, DeviceError> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let unavailable = |reason: String| DeviceError::Unavailable {
            device: config.device.clone(),
            reason,
        };

        let device = v4l::Device::with_path(&config.device)
            .map_err(|e| unavailable(format!("open: {}", e)))?;
        let mut format = device
            .format()
            .map_err(|e| unavailable(format!("read format: {}", e)))?;
        format.width = config.width;
        format.height = config.height;
        format.fourcc = v4l::FourCC::new(b"YUYV");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "v4l2: failed to set format on {}: {}",
                    config.device,
                    err
                );
                device
                    .format()
                    .map_err(|e| unavailable(format!("read format after set failure: {}", e)))?
            }
        };

        let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            unavailable(format!("unsupported pixel format {}", format.fourcc))
        })?;

        let mut fps = config.target_fps;
        if config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(config.target_fps);
            match device.set_params(&params) {
                Ok(actual) => {
                    let interval = actual.interval;
                    if interval.numerator > 0 {
                        fps = interval.denominator / interval.numerator;
                    }
                }
                Err(err) => {
                    log::warn!("v4l2: failed to set fps on {}: {}", config.device, err);
                }
            }
        }

        let buffer_depth = config.buffer_depth.max(1);
        let state = V4l2StateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, buffer_depth)
            },
        }
        .try_build()
        .map_err(|e| unavailable(format!("create buffer stream: {}", e)))?;

        log::info!(
            "v4l2: connected to {} ({}x{} {} @ {} fps)",
            config.device,
            format.width,
            format.height,
            format.fourcc,
            fps
        );

        Ok(Box::new(V4l2Backend {
            state: Some(state),
            width: format.width,
            height: format.height,
            fps,
            pixel_format,
            sequence: 0,
        }))
    }
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

struct V4l2Backend {
    state: Option<V4l2State>,
    width: u32,
    height: u32,
    fps: u32,
    pixel_format: PixelFormat,
    sequence: u64,
}

impl CaptureBackend for V4l2Backend {
    fn read_frame(&mut self) -> Result<RawFrame, DeviceError> {
        use v4l::io::traits::CaptureStream;

        let state = self
            .state
            .as_mut()
            .ok_or_else(|| DeviceError::ReadFailed("v4l2 device closed".to_string()))?;
        let buffer = state
            .with_mut(|fields| {
                fields
                    .stream
                    .next()
                    .map(|(buf, _meta)| buf.to_vec())
            })
            .map_err(|e| DeviceError::ReadFailed(format!("capture v4l2 frame: {}", e)))?;

        let (pixels, width, height) =
            normalize_to_rgb(&buffer, self.width, self.height, self.pixel_format)?;
        self.sequence += 1;
        Ok(RawFrame::new(pixels, width, height, self.sequence))
    }

    fn format(&self) -> ActiveFormat {
        ActiveFormat {
            width: self.width,
            height: self.height,
            fps: self.fps,
            backend: "v4l2".to_string(),
        }
    }

    fn close(&mut self) {
        // Dropping the stream unmaps the buffers, dropping the device closes the fd.
        self.state = None;
    }
}
