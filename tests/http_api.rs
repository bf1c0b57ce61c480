use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camera_relay::api::{ApiConfig, ApiHandle, ApiServer};
use camera_relay::{CaptureSessionManager, CaptureSettings, StreamSettings};

fn start(recordings: &std::path::Path) -> (ApiHandle, Arc<CaptureSessionManager>) {
    let mut capture = CaptureSettings::stub("http");
    capture.width = 32;
    capture.height = 24;
    capture.warmup_attempts = 1;
    capture.min_interval = Duration::from_millis(5);
    let manager = Arc::new(CaptureSessionManager::new(&capture).expect("stub driver"));
    let cfg = ApiConfig {
        addr: "127.0.0.1:0".to_string(),
        stream: StreamSettings {
            pacing: Duration::from_millis(10),
            ..StreamSettings::default()
        },
        recordings_dir: recordings.to_path_buf(),
    };
    let handle = ApiServer::new(cfg, manager.clone())
        .spawn()
        .expect("spawn api");
    (handle, manager)
}

fn request(addr: SocketAddr, method: &str, path: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    write!(
        stream,
        "{} {} HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n",
        method, path
    )
    .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).expect("read response");
    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status code");
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

fn count(haystack: &[u8], needle: &[u8]) -> usize {
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

#[test]
fn health_status_and_camera_info() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, _manager) = start(dir.path());

    let (status, body) = request(handle.addr, "GET", "/health");
    assert_eq!(status, 200);
    let health: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["device_open"], false);

    let (status, body) = request(handle.addr, "GET", "/status");
    assert_eq!(status, 200);
    let st: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(st["active_consumers"], 0);
    assert_eq!(st["recording_active"], false);

    let (status, body) = request(handle.addr, "GET", "/camera_info");
    assert_eq!(status, 200);
    let info: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(info["configured"]["width"], 32);
    assert_eq!(info["jpeg_quality"], 70);

    assert_eq!(request(handle.addr, "GET", "/nope").0, 404);
    assert_eq!(request(handle.addr, "POST", "/status").0, 405);
    assert_eq!(request(handle.addr, "GET", "/recording/start").0, 405);

    handle.stop().unwrap();
}

#[test]
fn video_feed_streams_multipart_jpeg_and_releases_on_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, manager) = start(dir.path());

    let mut stream = TcpStream::connect(handle.addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(b"GET /video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    while count(&received, b"Content-Type: image/jpeg") < 3 {
        let n = stream.read(&mut buf).expect("stream data");
        assert!(n > 0, "stream closed early");
        received.extend_from_slice(&buf[..n]);
    }
    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.contains("multipart/x-mixed-replace; boundary=frame"));
    assert!(count(&received, b"--frame\r\n") >= 3);
    assert!(count(&received, &[0xFF, 0xD8]) >= 3);
    assert_eq!(manager.active_consumers(), 1);
    assert!(manager.is_device_open());

    drop(stream);
    assert!(
        wait_for(|| manager.active_consumers() == 0),
        "consumer was not released after disconnect"
    );
    assert!(!manager.is_device_open());

    handle.stop().unwrap();
}

#[test]
fn stop_ends_live_streams() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, manager) = start(dir.path());

    let mut stream = TcpStream::connect(handle.addr).unwrap();
    stream
        .write_all(b"GET /video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    assert!(wait_for(|| manager.active_consumers() == 1));

    handle.stop().unwrap();
    assert_eq!(manager.active_consumers(), 0);
    assert!(!manager.is_device_open());
}

#[test]
fn recording_control_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let recordings = dir.path().join("recordings");
    let (handle, manager) = start(&recordings);

    let (status, body) = request(handle.addr, "POST", "/recording/start");
    assert_eq!(status, 200, "body: {}", body);
    let started: serde_json::Value = serde_json::from_str(&body).unwrap();
    let path = std::path::PathBuf::from(started["path"].as_str().unwrap());
    assert!(path.starts_with(&recordings));
    assert!(manager.is_device_open());

    let (status, body) = request(handle.addr, "POST", "/recording/start");
    assert_eq!(status, 409);
    let err: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(err["error"], "already_recording");

    let (status, body) = request(handle.addr, "POST", "/recording/stop");
    assert_eq!(status, 200);
    let stopped: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(stopped["status"], "stopped");
    assert!(path.exists());
    assert!(!manager.is_device_open());

    assert_eq!(request(handle.addr, "POST", "/recording/stop").0, 409);
    handle.stop().unwrap();
}
