//! Per-consumer delivery loop.
//!
//! A `StreamGenerator` is an iterator of multipart chunks for one consumer. It
//! registers with the session manager when created and unregisters exactly once,
//! whichever way it ends: exhausted error budget, cancellation, a failed write
//! to the consumer, or simply being dropped.

use std::io::{self, Write};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::StreamSettings;
use crate::error::DeviceError;
use crate::frame::EncodedFrame;
use crate::session::{CaptureSessionManager, StreamGuard};

/// Multipart boundary between chunks.
pub const BOUNDARY: &str = "frame";

/// `Content-Type` of the whole stream response.
pub fn stream_content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={}", BOUNDARY)
}

/// Shared stop signal. Clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for up to `timeout`. Returns `true` if cancelled meanwhile.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// One part of the multipart stream.
#[derive(Clone, Debug)]
pub enum Chunk {
    Frame(EncodedFrame),
    /// Human-readable error in place of a frame.
    Diagnostic(String),
}

impl Chunk {
    pub fn content_type(&self) -> &'static str {
        match self {
            Chunk::Frame(_) => "image/jpeg",
            Chunk::Diagnostic(_) => "text/plain",
        }
    }

    pub fn body(&self) -> &[u8] {
        match self {
            Chunk::Frame(frame) => &frame.bytes()[..],
            Chunk::Diagnostic(text) => text.as_bytes(),
        }
    }

    pub fn is_frame(&self) -> bool {
        matches!(self, Chunk::Frame(_))
    }

    /// Write boundary, part headers and body.
    pub fn write_part<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let body = self.body();
        write!(
            out,
            "--{}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
            BOUNDARY,
            self.content_type(),
            body.len()
        )?;
        out.write_all(body)?;
        out.write_all(b"\r\n")
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub frames: u64,
    pub diagnostics: u64,
    pub bytes: u64,
}

pub struct StreamGenerator {
    guard: Option<StreamGuard>,
    id: u64,
    settings: StreamSettings,
    cancel: CancelToken,
    consecutive_errors: u32,
    last_failed: bool,
    started: Option<Instant>,
    stats: StreamStats,
}

impl StreamGenerator {
    /// Register a consumer. Fails if the device cannot be acquired.
    pub fn start(
        manager: &Arc<CaptureSessionManager>,
        settings: StreamSettings,
        cancel: CancelToken,
    ) -> Result<Self, DeviceError> {
        let guard = manager.stream_guard()?;
        Ok(Self {
            id: guard.id(),
            guard: Some(guard),
            settings,
            cancel,
            consecutive_errors: 0,
            last_failed: false,
            started: None,
            stats: StreamStats::default(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    pub fn is_finished(&self) -> bool {
        self.guard.is_none()
    }

    /// Write chunks to `out` until the stream ends or a write fails.
    ///
    /// A write error is how a disconnected consumer shows up; the consumer is
    /// unregistered before the error is returned.
    pub fn pump<W: Write>(&mut self, out: &mut W) -> io::Result<StreamStats> {
        while let Some(chunk) = self.next() {
            if let Err(err) = chunk.write_part(out).and_then(|()| out.flush()) {
                log::debug!("stream {}: consumer went away: {}", self.id, err);
                self.finish();
                return Err(err);
            }
            self.stats.bytes += chunk.body().len() as u64;
        }
        Ok(self.stats)
    }

    /// Unregister now. Later calls to `next` return `None`.
    pub fn finish(&mut self) {
        if let Some(guard) = self.guard.take() {
            drop(guard);
            let elapsed = self.started.map(|t| t.elapsed()).unwrap_or_default();
            log::info!(
                "stream {}: ended after {} frames, {} diagnostics ({:.1}s)",
                self.id,
                self.stats.frames,
                self.stats.diagnostics,
                elapsed.as_secs_f64()
            );
        }
    }

    fn delay(&self) -> Duration {
        if self.started.is_none() {
            Duration::ZERO
        } else if self.last_failed {
            self.settings.pacing + self.settings.error_backoff
        } else {
            self.settings.pacing
        }
    }
}

impl Iterator for StreamGenerator {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.guard.is_none() {
            return None;
        }
        if self.consecutive_errors >= self.settings.max_consecutive_errors {
            log::warn!(
                "stream {}: {} consecutive errors, closing",
                self.id,
                self.consecutive_errors
            );
            self.finish();
            return None;
        }

        let delay = self.delay();
        let cancelled = if delay.is_zero() {
            self.cancel.is_cancelled()
        } else {
            self.cancel.wait_timeout(delay)
        };
        if cancelled {
            self.finish();
            return None;
        }
        self.started.get_or_insert_with(Instant::now);

        let result = self.guard.as_ref()?.next_frame();
        match result {
            Ok(frame) => {
                self.consecutive_errors = 0;
                self.last_failed = false;
                self.stats.frames += 1;
                if self.stats.frames % 50 == 0 {
                    log::debug!("stream {}: streamed {} frames", self.id, self.stats.frames);
                }
                Some(Chunk::Frame(frame))
            }
            Err(err) => {
                self.consecutive_errors += 1;
                self.last_failed = true;
                self.stats.diagnostics += 1;
                log::warn!("stream {}: frame unavailable: {}", self.id, err);
                Some(Chunk::Diagnostic(format!("Camera error: {}", err)))
            }
        }
    }
}

impl Drop for StreamGenerator {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureSettings;
    use crate::device::{ScriptProbe, ScriptedDriver};

    fn setup() -> (Arc<CaptureSessionManager>, ScriptProbe, StreamSettings) {
        let (driver, probe) = ScriptedDriver::new();
        let mut capture = CaptureSettings::stub("stream");
        capture.width = 8;
        capture.height = 8;
        capture.warmup_attempts = 1;
        capture.min_interval = Duration::from_millis(1);
        let manager = Arc::new(CaptureSessionManager::with_driver(
            Arc::new(driver),
            &capture,
        ));
        let settings = StreamSettings {
            pacing: Duration::from_millis(2),
            max_consecutive_errors: 3,
            error_backoff: Duration::from_millis(1),
        };
        (manager, probe, settings)
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn yields_jpeg_chunks() {
        let (manager, _probe, settings) = setup();
        let stream = StreamGenerator::start(&manager, settings, CancelToken::new()).unwrap();
        let chunks: Vec<Chunk> = stream.take(3).collect();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(Chunk::is_frame));
        assert_eq!(manager.active_consumers(), 0);
    }

    #[test]
    fn terminates_after_consecutive_errors() {
        let (manager, probe, settings) = setup();
        let mut stream = StreamGenerator::start(&manager, settings, CancelToken::new()).unwrap();
        probe.fail_next_captures(100);
        let chunks: Vec<Chunk> = stream.by_ref().collect();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.content_type() == "text/plain"));
        assert!(stream.is_finished());
        assert_eq!(manager.active_consumers(), 0);
        assert!(!manager.is_device_open());
    }

    #[test]
    fn cancellation_ends_the_stream() {
        let (manager, _probe, settings) = setup();
        let cancel = CancelToken::new();
        let mut stream = StreamGenerator::start(&manager, settings, cancel.clone()).unwrap();
        assert!(stream.next().is_some());
        cancel.cancel();
        assert!(stream.next().is_none());
        assert_eq!(manager.active_consumers(), 0);
    }

    #[test]
    fn pump_writes_multipart_and_unregisters_on_write_error() {
        let (manager, _probe, settings) = setup();
        let mut stream = StreamGenerator::start(&manager, settings, CancelToken::new()).unwrap();
        assert!(stream.pump(&mut BrokenPipe).is_err());
        assert!(stream.is_finished());
        assert_eq!(manager.active_consumers(), 0);

        let mut out = Vec::new();
        Chunk::Diagnostic("boom".to_string())
            .write_part(&mut out)
            .unwrap();
        assert_eq!(
            out,
            b"--frame\r\nContent-Type: text/plain\r\nContent-Length: 4\r\n\r\nboom\r\n"
        );
    }

    #[test]
    fn cancel_wakes_a_waiting_thread() {
        let cancel = CancelToken::new();
        let waiter = cancel.clone();
        let handle = std::thread::spawn(move || waiter.wait_timeout(Duration::from_secs(10)));
        std::thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        assert!(handle.join().unwrap());
    }
}
