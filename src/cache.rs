//! Rate-limited frame cache.
//!
//! The cache is what lets N consumers share one device: within `min_interval`
//! of the last successful capture every `get` is served from memory, so the
//! hardware sees at most one capture per interval regardless of consumer count.
//!
//! Failure policy:
//! - a failed capture bumps the consecutive-failure count
//! - up to `failure_threshold` failures, the last good frame is served again
//!   (or the error is propagated when there is none)
//! - past the threshold the caller gets `DeviceError::Exhausted`
//! - any successful capture resets the count

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::codec::FrameCodec;
use crate::device::DeviceHandle;
use crate::error::{DeviceError, ErrorKind};
use crate::frame::{EncodedFrame, RawFrame};

/// Validity of the cached frame at a point in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    Fresh,
    Stale,
}

/// Consecutive capture failures since the last success.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FailureRecord {
    pub consecutive: u32,
    pub last_kind: Option<ErrorKind>,
    pub last_at: Option<Instant>,
}

impl FailureRecord {
    fn record(&mut self, err: &DeviceError, at: Instant) {
        self.consecutive = self.consecutive.saturating_add(1);
        self.last_kind = Some(err.kind());
        self.last_at = Some(at);
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub captures: u64,
    pub stale_serves: u64,
}

pub struct RateLimitedCache {
    codec: FrameCodec,
    min_interval: Duration,
    failure_threshold: u32,
    frame: Option<EncodedFrame>,
    last_capture: Option<Instant>,
    sequence: u64,
    failures: FailureRecord,
    stats: CacheStats,
}

impl RateLimitedCache {
    pub fn new(codec: FrameCodec, min_interval: Duration, failure_threshold: u32) -> Self {
        Self {
            codec,
            min_interval,
            failure_threshold,
            frame: None,
            last_capture: None,
            sequence: 0,
            failures: FailureRecord::default(),
            stats: CacheStats::default(),
        }
    }

    pub fn state_at(&self, now: Instant) -> CacheState {
        match (&self.frame, self.last_capture) {
            (Some(_), Some(at)) if now.saturating_duration_since(at) <= self.min_interval => {
                CacheState::Fresh
            }
            _ => CacheState::Stale,
        }
    }

    /// Current frame, recapturing through `device` when stale.
    ///
    /// `on_capture` sees every frame that actually came off the hardware, in
    /// capture order, and never a cache hit.
    pub fn get<F>(
        &mut self,
        device: &mut DeviceHandle,
        now: Instant,
        mut on_capture: F,
    ) -> Result<EncodedFrame, DeviceError>
    where
        F: FnMut(&RawFrame, &EncodedFrame),
    {
        if self.state_at(now) == CacheState::Fresh {
            if let Some(frame) = &self.frame {
                self.stats.hits += 1;
                return Ok(frame.clone());
            }
        }

        match self.refresh(device, now) {
            Ok((raw, encoded)) => {
                on_capture(&raw, &encoded);
                Ok(encoded)
            }
            Err(err) => {
                self.failures.record(&err, now);
                let failures = self.failures.consecutive;
                if failures > self.failure_threshold {
                    log::error!(
                        "cache: {} consecutive capture failures, giving up: {}",
                        failures,
                        err
                    );
                    return Err(DeviceError::Exhausted { failures });
                }
                log::warn!(
                    "cache: capture failed ({}/{}): {}",
                    failures,
                    self.failure_threshold,
                    err
                );
                match &self.frame {
                    Some(frame) => {
                        self.stats.stale_serves += 1;
                        Ok(frame.clone())
                    }
                    None => Err(err),
                }
            }
        }
    }

    fn refresh(
        &mut self,
        device: &mut DeviceHandle,
        now: Instant,
    ) -> Result<(RawFrame, EncodedFrame), DeviceError> {
        device.open()?;
        let raw = device.capture()?;
        let sequence = self.sequence + 1;
        let encoded = self
            .codec
            .encode(&raw, sequence)
            .map_err(|e| DeviceError::ReadFailed(format!("encode frame: {}", e)))?;

        self.sequence = sequence;
        self.frame = Some(encoded.clone());
        self.last_capture = Some(now);
        self.stats.captures += 1;
        if self.failures.consecutive > 0 {
            log::info!(
                "cache: capture recovered after {} failures",
                self.failures.consecutive
            );
        }
        self.failures.reset();
        Ok((raw, encoded))
    }

    /// Drop the cached frame and failure history; used when the device session ends.
    pub fn clear(&mut self) {
        self.frame = None;
        self.last_capture = None;
        self.failures.reset();
    }

    pub fn latest(&self) -> Option<&EncodedFrame> {
        self.frame.as_ref()
    }

    pub fn failures(&self) -> &FailureRecord {
        &self.failures
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}
