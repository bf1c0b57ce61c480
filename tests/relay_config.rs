use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use camera_relay::config::RelayConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CAMERA_RELAY_CONFIG",
        "CAMERA_RELAY_ADDR",
        "CAMERA_RELAY_DEVICE",
        "CAMERA_RELAY_RECORDINGS_DIR",
        "CAMERA_RELAY_FPS",
        "CAMERA_RELAY_QUALITY",
        "CAMERA_RELAY_RESOLUTION",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_a_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = RelayConfig::load().expect("load defaults");
    assert_eq!(cfg.capture.device, "/dev/video0");
    assert_eq!((cfg.capture.width, cfg.capture.height), (480, 360));
    assert_eq!(cfg.capture.target_fps, 10);
    assert_eq!(cfg.capture.buffer_depth, 1);
    assert_eq!(cfg.capture.jpeg_quality, 70);
    assert_eq!(cfg.capture.min_interval, Duration::from_millis(100));
    assert_eq!(cfg.capture.failure_threshold, 10);
    assert_eq!(cfg.stream.max_consecutive_errors, 10);
    assert_eq!(cfg.server.addr, "0.0.0.0:5001");
    assert_eq!(cfg.recording.dir, PathBuf::from("recordings"));
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "capture": {
            "device": "stub://garage",
            "width": 640,
            "height": 480,
            "target_fps": 15,
            "jpeg_quality": 85,
            "failure_threshold": 4,
            "capture_timeout_ms": 750
        },
        "stream": { "pacing_ms": 40, "max_consecutive_errors": 3 },
        "server": { "addr": "127.0.0.1:7000" },
        "recording": { "dir": "/var/lib/camera/recordings" }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("CAMERA_RELAY_CONFIG", file.path());
    std::env::set_var("CAMERA_RELAY_ADDR", "127.0.0.1:7100");
    std::env::set_var("CAMERA_RELAY_RESOLUTION", "320x240");

    let cfg = RelayConfig::load().expect("load config");
    assert_eq!(cfg.capture.device, "stub://garage");
    assert_eq!((cfg.capture.width, cfg.capture.height), (320, 240));
    assert_eq!(cfg.capture.target_fps, 15);
    assert_eq!(cfg.capture.min_interval, Duration::from_millis(66));
    assert_eq!(cfg.capture.jpeg_quality, 85);
    assert_eq!(cfg.capture.failure_threshold, 4);
    assert_eq!(cfg.capture.capture_timeout, Duration::from_millis(750));
    assert_eq!(cfg.stream.pacing, Duration::from_millis(40));
    assert_eq!(cfg.stream.max_consecutive_errors, 3);
    assert_eq!(cfg.server.addr, "127.0.0.1:7100");
    assert_eq!(
        cfg.recording.dir,
        PathBuf::from("/var/lib/camera/recordings")
    );

    clear_env();
}

#[test]
fn loads_toml_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
[capture]
device = "stub://porch"
target_fps = 5
buffer_depth = 2

[recording]
dir = "clips"
"#;
    file.write_all(toml.as_bytes()).expect("write config");
    std::env::set_var("CAMERA_RELAY_CONFIG", file.path());
    std::env::set_var("CAMERA_RELAY_FPS", "20");

    let cfg = RelayConfig::load().expect("load toml config");
    assert_eq!(cfg.capture.device, "stub://porch");
    assert_eq!(cfg.capture.buffer_depth, 2);
    assert_eq!(cfg.capture.target_fps, 20);
    assert_eq!(cfg.capture.min_interval, Duration::from_millis(50));
    assert_eq!(cfg.recording.dir, PathBuf::from("clips"));

    clear_env();
}

#[test]
fn fps_override_keeps_an_explicit_interval() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{ "capture": { "min_interval_ms": 250 } }"#)
        .expect("write config");
    std::env::set_var("CAMERA_RELAY_CONFIG", file.path());
    std::env::set_var("CAMERA_RELAY_FPS", "20");

    let cfg = RelayConfig::load().expect("load config");
    assert_eq!(cfg.capture.target_fps, 20);
    assert_eq!(cfg.capture.min_interval, Duration::from_millis(250));

    clear_env();
}

#[test]
fn rejects_invalid_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAMERA_RELAY_QUALITY", "150");
    assert!(RelayConfig::load().is_err());
    clear_env();

    std::env::set_var("CAMERA_RELAY_RESOLUTION", "wide");
    assert!(RelayConfig::load().is_err());
    clear_env();

    std::env::set_var("CAMERA_RELAY_ADDR", "not-an-addr");
    assert!(RelayConfig::load().is_err());
    clear_env();

    std::env::set_var("CAMERA_RELAY_FPS", "0");
    assert!(RelayConfig::load().is_err());
    clear_env();
}

#[test]
fn rejects_malformed_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(b"{ \"capture\": { \"width\": \"wide\" } }")
        .expect("write config");
    std::env::set_var("CAMERA_RELAY_CONFIG", file.path());
    assert!(RelayConfig::load().is_err());

    clear_env();
}
