//! Active consumer accounting.
//!
//! The registry turns consumer arrivals and departures into device open/close
//! decisions. It holds no lock of its own: the session manager calls it with
//! the device and cache already under its mutex, which is what makes the
//! "first in opens, last out closes" decision atomic.

use crate::cache::RateLimitedCache;
use crate::device::DeviceHandle;
use crate::error::DeviceError;

/// Proof of one registration. Not `Clone`: it is consumed by unregistration,
/// so each `register` is matched by at most one `unregister`.
#[derive(Debug, PartialEq, Eq, Hash)]
#[must_use = "a consumer token must be handed back to unregister"]
pub struct ConsumerToken {
    id: u64,
}

impl ConsumerToken {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Default)]
pub struct ClientRegistry {
    active: usize,
    next_id: u64,
    peak: usize,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a consumer, opening the device if it is not already open.
    ///
    /// On open failure the reservation is rolled back before returning.
    pub fn register(&mut self, device: &mut DeviceHandle) -> Result<ConsumerToken, DeviceError> {
        self.active += 1;
        if !device.is_open() {
            if let Err(err) = device.open() {
                self.active -= 1;
                return Err(err);
            }
        }
        self.next_id += 1;
        self.peak = self.peak.max(self.active);
        Ok(ConsumerToken { id: self.next_id })
    }

    /// Remove a consumer. The last one out closes the device and drops the
    /// cache unless another hold (a recording) keeps it open.
    pub fn unregister(
        &mut self,
        token: ConsumerToken,
        device: &mut DeviceHandle,
        cache: &mut RateLimitedCache,
        other_hold: bool,
    ) {
        let was = self.active;
        self.active = self.active.saturating_sub(1);
        log::debug!("registry: consumer {} released", token.id);
        if was > 0 && self.active == 0 && !other_hold {
            device.close();
            cache.clear();
        }
    }

    pub fn active(&self) -> usize {
        self.active
    }

    /// Highest concurrent consumer count seen.
    pub fn peak(&self) -> usize {
        self.peak
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameCodec;
    use crate::config::CaptureSettings;
    use crate::device::{ScriptProbe, ScriptedDriver};
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (ClientRegistry, DeviceHandle, RateLimitedCache, ScriptProbe) {
        let (driver, probe) = ScriptedDriver::new();
        let mut settings = CaptureSettings::stub("registry");
        settings.width = 4;
        settings.height = 4;
        settings.warmup_attempts = 1;
        let device = DeviceHandle::new(Arc::new(driver), &settings);
        let cache = RateLimitedCache::new(FrameCodec::new(70), Duration::from_millis(100), 10);
        (ClientRegistry::new(), device, cache, probe)
    }

    #[test]
    fn first_opens_last_closes() {
        let (mut registry, mut device, mut cache, probe) = setup();
        let a = registry.register(&mut device).unwrap();
        let b = registry.register(&mut device).unwrap();
        assert_eq!(probe.hardware_opens(), 1);
        assert_ne!(a.id(), b.id());

        registry.unregister(a, &mut device, &mut cache, false);
        assert!(device.is_open());
        registry.unregister(b, &mut device, &mut cache, false);
        assert!(!device.is_open());
        assert_eq!(probe.hardware_closes(), 1);
        assert_eq!(registry.active(), 0);
        assert_eq!(registry.peak(), 2);
    }

    #[test]
    fn failed_open_rolls_back_the_reservation() {
        let (mut registry, mut device, _cache, probe) = setup();
        probe.fail_next_opens(1);
        assert!(registry.register(&mut device).is_err());
        assert_eq!(registry.active(), 0);
        assert!(!device.is_open());

        let token = registry.register(&mut device).unwrap();
        assert_eq!(registry.active(), 1);
        assert_eq!(token.id(), 1);
    }

    #[test]
    fn other_hold_keeps_device_open() {
        let (mut registry, mut device, mut cache, probe) = setup();
        let token = registry.register(&mut device).unwrap();
        registry.unregister(token, &mut device, &mut cache, true);
        assert!(device.is_open());
        assert_eq!(probe.hardware_closes(), 0);
    }
}
