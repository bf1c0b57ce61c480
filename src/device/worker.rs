use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{ActiveFormat, CaptureBackend, DeviceConfig, DeviceDriver, Watchdog};
use crate::error::DeviceError;
use crate::frame::RawFrame;

const WARMUP_RETRY_DELAY: Duration = Duration::from_millis(100);

enum Request {
    Capture(SyncSender<Result<RawFrame, DeviceError>>),
    Close,
}

/// Handle to the thread that owns an open backend.
pub(super) struct CaptureWorker {
    requests: Sender<Request>,
    format: ActiveFormat,
    capture_timeout: Duration,
    thread: Option<WorkerThread>,
    /// Reply to a capture that outlived the watchdog; the thread may still be inside the driver.
    pending: Option<Receiver<Result<RawFrame, DeviceError>>>,
}

/// The worker thread itself. Its exit is observable without joining, so a
/// caller can bound how long it waits for the backend to be released.
pub(super) struct WorkerThread {
    exited: Receiver<()>,
    join: JoinHandle<()>,
}

impl WorkerThread {
    /// Wait up to `timeout` for the thread to finish. Hands the thread back if
    /// it is still running.
    pub(super) fn wait_exit(self, timeout: Duration) -> Result<(), WorkerThread> {
        match self.exited.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => Err(self),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.join.join().is_err() {
                    log::error!("device: capture worker panicked");
                }
                Ok(())
            }
        }
    }
}

/// Why a worker could not be started, plus the thread if it is still busy
/// opening the backend.
pub(super) struct SpawnFailure {
    pub(super) error: DeviceError,
    pub(super) straggler: Option<WorkerThread>,
}

impl From<DeviceError> for SpawnFailure {
    fn from(error: DeviceError) -> Self {
        Self {
            error,
            straggler: None,
        }
    }
}

impl CaptureWorker {
    pub(super) fn spawn(
        driver: Arc<dyn DeviceDriver>,
        config: DeviceConfig,
        watchdog: Watchdog,
    ) -> Result<Self, SpawnFailure> {
        let (request_tx, request_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (exit_tx, exit_rx) = mpsc::channel::<()>();
        let device = config.device.clone();

        let join = std::thread::Builder::new()
            .name("capture-worker".to_string())
            .spawn(move || {
                let _exit = exit_tx;
                run(driver, config, watchdog, ready_tx, request_rx)
            })
            .map_err(|err| DeviceError::Unavailable {
                device: device.clone(),
                reason: format!("spawn capture worker: {}", err),
            })?;
        let thread = WorkerThread {
            exited: exit_rx,
            join,
        };

        match ready_rx.recv_timeout(watchdog.open_timeout) {
            Ok(Ok(format)) => Ok(Self {
                requests: request_tx,
                format,
                capture_timeout: watchdog.capture_timeout,
                thread: Some(thread),
                pending: None,
            }),
            Ok(Err(err)) => {
                // The worker already closed the backend and is on its way out.
                let straggler = thread.wait_exit(watchdog.open_timeout).err();
                Err(SpawnFailure {
                    error: err,
                    straggler,
                })
            }
            Err(RecvTimeoutError::Timeout) => {
                // Dropping the request sender lets the worker close the backend
                // and exit as soon as the driver returns.
                log::warn!(
                    "device: {} did not become ready within {:?}",
                    device,
                    watchdog.open_timeout
                );
                Err(SpawnFailure {
                    error: DeviceError::Timeout {
                        op: "open",
                        after: watchdog.open_timeout,
                    },
                    straggler: Some(thread),
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                let straggler = thread.wait_exit(watchdog.open_timeout).err();
                Err(SpawnFailure {
                    error: DeviceError::Unavailable {
                        device,
                        reason: "capture worker exited during open".to_string(),
                    },
                    straggler,
                })
            }
        }
    }

    pub(super) fn format(&self) -> &ActiveFormat {
        &self.format
    }

    /// Ask for one frame. A read still outstanding from an earlier timeout is
    /// awaited again rather than queueing another behind it.
    pub(super) fn capture(&mut self) -> Result<RawFrame, DeviceError> {
        let reply = match self.pending.take() {
            Some(reply) => reply,
            None => {
                let (reply_tx, reply_rx) = mpsc::sync_channel(1);
                self.requests
                    .send(Request::Capture(reply_tx))
                    .map_err(|_| DeviceError::ReadFailed("capture worker is gone".to_string()))?;
                reply_rx
            }
        };
        match reply.recv_timeout(self.capture_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.pending = Some(reply);
                Err(DeviceError::Timeout {
                    op: "capture",
                    after: self.capture_timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(DeviceError::ReadFailed(
                "capture worker exited".to_string(),
            )),
        }
    }

    /// Close the backend, waiting at most `capture_timeout` for the worker.
    ///
    /// Returns the thread if it is still stuck in the driver; the hardware is
    /// not released until that thread exits.
    pub(super) fn shutdown(mut self) -> Option<WorkerThread> {
        self.release()
    }

    fn release(&mut self) -> Option<WorkerThread> {
        let thread = self.thread.take()?;
        let _ = self.requests.send(Request::Close);
        match thread.wait_exit(self.capture_timeout) {
            Ok(()) => None,
            Err(thread) => {
                log::warn!(
                    "device: capture worker still inside a driver read after {:?}",
                    self.capture_timeout
                );
                Some(thread)
            }
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        if self.release().is_some() {
            log::warn!("device: abandoning capture worker stuck in a driver read");
        }
    }
}

fn run(
    driver: Arc<dyn DeviceDriver>,
    config: DeviceConfig,
    watchdog: Watchdog,
    ready: SyncSender<Result<ActiveFormat, DeviceError>>,
    requests: Receiver<Request>,
) {
    let mut backend = match driver.open(&config) {
        Ok(backend) => backend,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    if let Err(err) = warm_up(backend.as_mut(), &config, &watchdog) {
        backend.close();
        let _ = ready.send(Err(err));
        return;
    }

    if ready.send(Ok(backend.format())).is_err() {
        backend.close();
        return;
    }

    for request in requests {
        match request {
            Request::Capture(reply) => {
                let _ = reply.send(backend.read_frame());
            }
            Request::Close => break,
        }
    }
    backend.close();
}

fn warm_up(
    backend: &mut dyn CaptureBackend,
    config: &DeviceConfig,
    watchdog: &Watchdog,
) -> Result<(), DeviceError> {
    let started = Instant::now();
    let mut attempts = 0;
    while attempts < watchdog.warmup_attempts {
        attempts += 1;
        match backend.read_frame() {
            Ok(frame) if frame.is_well_formed() => {
                log::debug!(
                    "device: warm-up frame from {} on attempt {} ({}x{})",
                    config.device,
                    attempts,
                    frame.width,
                    frame.height
                );
                return Ok(());
            }
            Ok(_) => log::debug!("device: warm-up frame {} was malformed", attempts),
            Err(err) => log::debug!("device: warm-up attempt {} failed: {}", attempts, err),
        }
        if started.elapsed() >= watchdog.open_timeout {
            break;
        }
        if attempts < watchdog.warmup_attempts {
            std::thread::sleep(WARMUP_RETRY_DELAY);
        }
    }
    Err(DeviceError::WarmupFailed {
        device: config.device.clone(),
        attempts,
    })
}
