//! Recording sink.
//!
//! A recording does not pull frames on its own. While active it is handed every
//! frame that came off the hardware for a consumer, in capture order, and appends
//! it to its container. A failed write ends the recording on the spot; the error
//! is parked until the next `stop()` so the streaming path never sees it.

use std::fs;
use std::io::{self, Seek, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::codec::avi::ContainerConfig;
use crate::codec::{ContainerStats, ContainerWriter};
use crate::error::RecordingError;
use crate::frame::{EncodedFrame, RawFrame};

/// Destination of recorded frames.
pub trait RecordingSink: Send {
    fn append(&mut self, raw: &RawFrame, encoded: &EncodedFrame) -> io::Result<()>;

    /// Flush and close. Called exactly once.
    fn finish(self: Box<Self>) -> io::Result<ContainerStats>;
}

impl<W: Write + Seek + Send> RecordingSink for ContainerWriter<W> {
    fn append(&mut self, _raw: &RawFrame, encoded: &EncodedFrame) -> io::Result<()> {
        // The consumer path already paid for the JPEG; reuse it.
        self.append_jpeg(encoded.bytes(), encoded.width, encoded.height)
    }

    fn finish(self: Box<Self>) -> io::Result<ContainerStats> {
        ContainerWriter::finish(*self)
    }
}

/// Result of a completed recording.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecordingSummary {
    pub path: PathBuf,
    pub frames: u64,
    pub bytes: u64,
    /// Local wall-clock start time, RFC 3339.
    pub started_at: String,
    pub duration_ms: u64,
}

struct ActiveRecording {
    path: PathBuf,
    sink: Box<dyn RecordingSink>,
    started_at: DateTime<Local>,
    started: Instant,
    frames: u64,
}

impl ActiveRecording {
    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// A write failure that ended a recording before anyone asked it to stop.
struct ParkedFailure {
    path: PathBuf,
    source: io::Error,
}

pub struct Recorder {
    container: ContainerConfig,
    active: Option<ActiveRecording>,
    failure: Option<ParkedFailure>,
}

impl Recorder {
    pub fn new(container: ContainerConfig) -> Self {
        Self {
            container,
            active: None,
            failure: None,
        }
    }

    /// Start an AVI recording at `path`. The file must not exist yet.
    pub fn start(&mut self, path: &Path) -> Result<(), RecordingError> {
        self.ensure_idle()?;
        let writer = ContainerWriter::create(path, self.container)
            .map_err(|e| RecordingError::io(path, e))?;
        self.begin(path.to_path_buf(), Box::new(writer));
        Ok(())
    }

    /// Start recording into a caller-supplied sink.
    pub fn start_with_sink(
        &mut self,
        path: &Path,
        sink: Box<dyn RecordingSink>,
    ) -> Result<(), RecordingError> {
        self.ensure_idle()?;
        self.begin(path.to_path_buf(), sink);
        Ok(())
    }

    fn ensure_idle(&self) -> Result<(), RecordingError> {
        match &self.active {
            Some(active) => Err(RecordingError::AlreadyRecording(active.path.clone())),
            None => Ok(()),
        }
    }

    fn begin(&mut self, path: PathBuf, sink: Box<dyn RecordingSink>) {
        if let Some(stale) = self.failure.take() {
            log::warn!(
                "recorder: discarding unreported failure of {}: {}",
                stale.path.display(),
                stale.source
            );
        }
        log::info!("recorder: recording to {}", path.display());
        self.active = Some(ActiveRecording {
            path,
            sink,
            started_at: Local::now(),
            started: Instant::now(),
            frames: 0,
        });
    }

    /// Append one captured frame. A no-op when idle.
    pub fn record(&mut self, raw: &RawFrame, encoded: &EncodedFrame) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        match active.sink.append(raw, encoded) {
            Ok(()) => active.frames += 1,
            Err(err) => {
                log::error!(
                    "recorder: write to {} failed after {} frames, stopping: {}",
                    active.path.display(),
                    active.frames,
                    err
                );
                if let Some(active) = self.active.take() {
                    let path = active.path;
                    if let Err(close_err) = active.sink.finish() {
                        log::warn!(
                            "recorder: closing {} after failure: {}",
                            path.display(),
                            close_err
                        );
                    }
                    self.failure = Some(ParkedFailure { path, source: err });
                }
            }
        }
    }

    /// Finish the active recording, or report the failure that ended it.
    pub fn stop(&mut self) -> Result<RecordingSummary, RecordingError> {
        if let Some(active) = self.active.take() {
            let duration = active.elapsed();
            let started_at = active.started_at.to_rfc3339();
            let path = active.path;
            let frames = active.frames;
            let stats = active
                .sink
                .finish()
                .map_err(|e| RecordingError::io(path.clone(), e))?;
            log::info!(
                "recorder: finished {} ({} frames, {} bytes, {:.1}s)",
                path.display(),
                frames,
                stats.bytes,
                duration.as_secs_f64()
            );
            return Ok(RecordingSummary {
                path,
                frames,
                bytes: stats.bytes,
                started_at,
                duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            });
        }
        match self.failure.take() {
            Some(failure) => Err(RecordingError::io(failure.path, failure.source)),
            None => Err(RecordingError::NotRecording),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.active.as_ref().map(|active| active.path.as_path())
    }

    pub fn frames(&self) -> u64 {
        self.active.as_ref().map(|active| active.frames).unwrap_or(0)
    }

    /// Description of a failure not yet reported through `stop()`.
    pub fn failure(&self) -> Option<String> {
        self.failure
            .as_ref()
            .map(|f| format!("{}: {}", f.path.display(), f.source))
    }
}

/// `dir/video_YYYYmmdd_HHMMSS.avi`, with a numeric suffix if that name is taken.
pub fn timestamped_path(dir: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let stem = Local::now().format("video_%Y%m%d_%H%M%S").to_string();
    let mut candidate = dir.join(format!("{}.avi", stem));
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{}_{}.avi", stem, n));
        n += 1;
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};

    fn container() -> ContainerConfig {
        ContainerConfig {
            width: 4,
            height: 4,
            fps: 10,
            quality: 70,
        }
    }

    fn frame(seq: u64) -> (RawFrame, EncodedFrame) {
        let raw = RawFrame::new(vec![seq as u8; 4 * 4 * 3], 4, 4, seq);
        let encoded = EncodedFrame::new(
            Bytes::from_static(&[0xFF, 0xD8, 0x00, 0xFF, 0xD9]),
            4,
            4,
            seq,
            raw.captured_at(),
        );
        (raw, encoded)
    }

    /// Keeps appended sequences; fails every append after `fail_after`.
    struct MemorySink {
        seen: Arc<Mutex<Vec<u64>>>,
        fail_after: Option<usize>,
    }

    impl RecordingSink for MemorySink {
        fn append(&mut self, raw: &RawFrame, _encoded: &EncodedFrame) -> io::Result<()> {
            let mut seen = self.seen.lock().unwrap();
            if self.fail_after.is_some_and(|n| seen.len() >= n) {
                return Err(io::Error::other("disk full"));
            }
            seen.push(raw.sequence);
            Ok(())
        }

        fn finish(self: Box<Self>) -> io::Result<ContainerStats> {
            let frames = self.seen.lock().unwrap().len() as u64;
            Ok(ContainerStats { frames, bytes: 0 })
        }
    }

    #[test]
    fn records_frames_in_capture_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.avi");
        let mut recorder = Recorder::new(container());
        recorder.start(&path).unwrap();
        for seq in 1..=3 {
            let (raw, encoded) = frame(seq);
            recorder.record(&raw, &encoded);
        }
        let summary = recorder.stop().unwrap();
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.path, path);
        assert!(std::fs::metadata(&path).unwrap().len() > 224);
        assert!(!recorder.is_active());
    }

    #[test]
    fn second_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = Recorder::new(container());
        recorder.start(&dir.path().join("a.avi")).unwrap();
        let err = recorder.start(&dir.path().join("b.avi")).unwrap_err();
        assert!(matches!(err, RecordingError::AlreadyRecording(_)));
        assert!(!dir.path().join("b.avi").exists());
    }

    #[test]
    fn uncreatable_path_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = Recorder::new(container());
        let err = recorder
            .start(&dir.path().join("missing").join("clip.avi"))
            .unwrap_err();
        assert!(matches!(err, RecordingError::Io { .. }));
        assert!(!recorder.is_active());
    }

    #[test]
    fn write_failure_stops_and_is_reported_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = MemorySink {
            seen: seen.clone(),
            fail_after: Some(2),
        };
        let mut recorder = Recorder::new(container());
        recorder
            .start_with_sink(Path::new("mem.avi"), Box::new(sink))
            .unwrap();
        for seq in 1..=4 {
            let (raw, encoded) = frame(seq);
            recorder.record(&raw, &encoded);
        }
        assert!(!recorder.is_active());
        assert!(recorder.failure().unwrap().contains("disk full"));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);

        assert!(matches!(recorder.stop(), Err(RecordingError::Io { .. })));
        assert!(matches!(recorder.stop(), Err(RecordingError::NotRecording)));
    }

    #[test]
    fn stop_without_recording() {
        let mut recorder = Recorder::new(container());
        assert!(matches!(recorder.stop(), Err(RecordingError::NotRecording)));
    }

    #[test]
    fn timestamped_names_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let recordings = dir.path().join("recordings");
        let first = timestamped_path(&recordings).unwrap();
        std::fs::write(&first, b"x").unwrap();
        let second = timestamped_path(&recordings).unwrap();
        assert_ne!(first, second);
        let name = first.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("video_") && name.ends_with(".avi"));
    }
}
