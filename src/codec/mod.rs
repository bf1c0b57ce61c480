//! Frame encoding.
//!
//! - `FrameCodec`: RGB24 -> JPEG at a fixed quality (delivery format)
//! - `avi::ContainerWriter`: appends frames to a Motion-JPEG AVI file

pub mod avi;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::error::{ParameterError, ParameterErrorKind};
use image::{ExtendedColorType, ImageError};

use crate::frame::{EncodedFrame, RawFrame};

pub use avi::{ContainerWriter, ContainerStats};

/// Lossy JPEG encoder. Same pixels and quality always give the same bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameCodec {
    quality: u8,
}

impl FrameCodec {
    /// Quality is clamped into 1..=100.
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Compress one raw frame. `sequence` is the cache's capture counter.
    pub fn encode(&self, frame: &RawFrame, sequence: u64) -> Result<EncodedFrame, ImageError> {
        let bytes = self.encode_jpeg(frame)?;
        Ok(EncodedFrame::new(
            Bytes::from(bytes),
            frame.width,
            frame.height,
            sequence,
            frame.captured_at(),
        ))
    }

    pub(crate) fn encode_jpeg(&self, frame: &RawFrame) -> Result<Vec<u8>, ImageError> {
        // The encoder asserts on length mismatches; turn those into errors instead.
        if !frame.is_well_formed() {
            return Err(ImageError::Parameter(ParameterError::from_kind(
                ParameterErrorKind::DimensionMismatch,
            )));
        }
        let mut out = Vec::with_capacity(frame.expected_len() / 8);
        JpegEncoder::new_with_quality(&mut out, self.quality).encode(
            frame.pixels(),
            frame.width,
            frame.height,
            ExtendedColorType::Rgb8,
        )?;
        Ok(out)
    }
}
