//! HTTP front end.
//!
//! A small HTTP/1.1 server on `std::net`: one accept thread, one thread per
//! connection. Routes:
//!
//! - `GET /video_feed`: `multipart/x-mixed-replace` MJPEG stream
//! - `GET /status`, `GET /camera_info`, `GET /health`: JSON
//! - `POST /recording/start`, `POST /recording/stop`: JSON

use crate::config::StreamSettings;
use crate::error::{DeviceError, RecordingError};
use crate::session::CaptureSessionManager;
use crate::stream::{stream_content_type, CancelToken, StreamGenerator};
use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::json;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;
const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub stream: StreamSettings,
    pub recordings_dir: PathBuf,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5001".to_string(),
            stream: StreamSettings::default(),
            recordings_dir: PathBuf::from("recordings"),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    cancel: CancelToken,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting, end every live stream and wait for connection threads.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    manager: Arc<CaptureSessionManager>,
}

struct Context {
    cfg: ApiConfig,
    manager: Arc<CaptureSessionManager>,
    cancel: CancelToken,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, manager: Arc<CaptureSessionManager>) -> Self {
        Self { cfg, manager }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let cancel = CancelToken::new();
        let ctx = Arc::new(Context {
            cfg: self.cfg,
            manager: self.manager,
            cancel: cancel.clone(),
        });
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("api-accept".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, ctx, shutdown_thread) {
                    log::error!("camera api stopped: {}", err);
                }
            })?;
        log::info!("camera api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            cancel,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, ctx: Arc<Context>, shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                connections.retain(|conn| !conn.is_finished());
                let ctx = ctx.clone();
                let spawned = std::thread::Builder::new()
                    .name("api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &ctx) {
                            log::warn!("camera api request from {} failed: {}", peer, err);
                        }
                    });
                match spawned {
                    Ok(conn) => connections.push(conn),
                    Err(err) => log::error!("camera api could not spawn handler: {}", err),
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    for conn in connections {
        if conn.join().is_err() {
            log::error!("camera api connection thread panicked");
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, ctx: &Context) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(CLIENT_WRITE_TIMEOUT))?;
    let request = read_request(&mut stream)?;
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/video_feed") => serve_stream(stream, ctx),
        ("GET", "/status") => write_json(&mut stream, 200, &ctx.manager.status()),
        ("GET", "/camera_info") => write_json(&mut stream, 200, &ctx.manager.camera_info()),
        ("GET", "/health") => write_json(
            &mut stream,
            200,
            &json!({
                "status": "ok",
                "device_open": ctx.manager.is_device_open(),
                "active_consumers": ctx.manager.active_consumers(),
            }),
        ),
        ("POST", "/recording/start") => {
            match ctx
                .manager
                .recording_start_timestamped(&ctx.cfg.recordings_dir)
            {
                Ok(path) => write_json(
                    &mut stream,
                    200,
                    &json!({ "status": "recording", "path": path }),
                ),
                Err(err) => write_recording_error(&mut stream, &err),
            }
        }
        ("POST", "/recording/stop") => match ctx.manager.recording_stop() {
            Ok(summary) => write_json(
                &mut stream,
                200,
                &json!({ "status": "stopped", "recording": summary }),
            ),
            Err(err) => write_recording_error(&mut stream, &err),
        },
        (_, "/video_feed" | "/status" | "/camera_info" | "/health")
        | (_, "/recording/start" | "/recording/stop") => write_json(
            &mut stream,
            405,
            &json!({ "error": "method_not_allowed" }),
        ),
        _ => write_json(&mut stream, 404, &json!({ "error": "not_found" })),
    }
}

fn serve_stream(mut stream: TcpStream, ctx: &Context) -> Result<()> {
    let mut generator =
        match StreamGenerator::start(&ctx.manager, ctx.cfg.stream.clone(), ctx.cancel.clone()) {
            Ok(generator) => generator,
            Err(err) => return write_device_error(&mut stream, &err),
        };
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        stream_content_type()
    );
    if let Err(err) = stream.write_all(header.as_bytes()) {
        log::debug!("stream {}: consumer left before first frame: {}", generator.id(), err);
        return Ok(());
    }
    // A write error here is the consumer disconnecting, not a server fault.
    if let Ok(stats) = generator.pump(&mut stream) {
        log::debug!("stream {}: closed by server ({} bytes)", generator.id(), stats.bytes);
    }
    Ok(())
}

fn write_device_error(stream: &mut TcpStream, err: &DeviceError) -> Result<()> {
    write_json(
        stream,
        503,
        &json!({ "error": err.kind(), "message": err.to_string() }),
    )
}

fn write_recording_error(stream: &mut TcpStream, err: &RecordingError) -> Result<()> {
    let status = match err {
        RecordingError::AlreadyRecording(_) | RecordingError::NotRecording => 409,
        RecordingError::Device(_) => 503,
        RecordingError::Io { .. } => 500,
    };
    write_json(
        stream,
        status,
        &json!({ "error": err.kind(), "message": err.to_string() }),
    )
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_json<T: Serialize>(stream: &mut TcpStream, status: u16, body: &T) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}
