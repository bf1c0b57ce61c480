//! Frame types flowing from the device to consumers and the recorder.
//!
//! - `RawFrame`: packed RGB24 pixels as delivered by a capture backend.
//! - `EncodedFrame`: a JPEG-compressed frame shared by every consumer.
//!
//! `EncodedFrame` holds its bytes in `bytes::Bytes`, so handing the cached frame
//! to N consumers is a reference-count bump rather than N copies.

use bytes::Bytes;
use std::time::{Duration, Instant};

/// Bytes per pixel of a packed RGB24 frame.
pub const RGB_BYTES_PER_PIXEL: usize = 3;

/// One uncompressed frame read from the capture device.
#[derive(Clone, Debug)]
pub struct RawFrame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Per-device-session capture counter, starting at 1.
    pub sequence: u64,
    captured_at: Instant,
}

impl RawFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Self {
        Self {
            data,
            width,
            height,
            sequence,
            captured_at: Instant::now(),
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Expected RGB24 length for the frame dimensions.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * RGB_BYTES_PER_PIXEL
    }

    pub fn is_well_formed(&self) -> bool {
        !self.data.is_empty() && self.data.len() == self.expected_len()
    }
}

/// A compressed frame ready for delivery. Cheap to clone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedFrame {
    bytes: Bytes,
    pub width: u32,
    pub height: u32,
    /// Cache sequence number: increments once per hardware capture.
    pub sequence: u64,
    captured_at: Instant,
}

impl EncodedFrame {
    pub fn new(bytes: Bytes, width: u32, height: u32, sequence: u64, captured_at: Instant) -> Self {
        Self {
            bytes,
            width,
            height,
            sequence,
            captured_at,
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.captured_at)
    }
}
