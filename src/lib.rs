//! Camera relay
//!
//! Shares one exclusive capture device between any number of MJPEG viewers,
//! with an optional recording running alongside.
//!
//! # Architecture
//!
//! Leaf first:
//!
//! - `device`: owns the hardware; open / capture / close behind a watchdog
//! - `codec`: JPEG encoding and the Motion-JPEG AVI container
//! - `cache`: serves the last frame until it goes stale, bounding hardware reads
//! - `registry`: consumer count; first in opens, last out closes
//! - `recorder`: appends every captured frame to a container while active
//! - `session`: the single manager serializing all of the above
//! - `stream`: per-consumer chunk generator with guaranteed unregistration
//! - `api`: HTTP server exposing the stream, status and recording control
//!
//! The device is open exactly while something holds it: a streaming consumer
//! or a recording.

pub mod api;
pub mod cache;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod frame;
pub mod recorder;
pub mod registry;
pub mod session;
pub mod stream;

pub use cache::{CacheState, RateLimitedCache};
pub use codec::{ContainerWriter, FrameCodec};
pub use config::{CaptureSettings, RelayConfig, StreamSettings};
pub use device::{ActiveFormat, DeviceHandle, DeviceState};
pub use error::{DeviceError, ErrorKind, ErrorRecord, RecordingError};
pub use frame::{EncodedFrame, RawFrame};
pub use recorder::{Recorder, RecordingSink, RecordingSummary};
pub use registry::{ClientRegistry, ConsumerToken};
pub use session::{CameraInfo, CaptureSessionManager, SessionStatus, StreamGuard};
pub use stream::{CancelToken, Chunk, StreamGenerator};
