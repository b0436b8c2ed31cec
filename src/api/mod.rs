//! HTTP surface of the detection service.
//!
//! Minimal HTTP/1.1 over `TcpListener`: one request per connection, one worker
//! thread per connection, `Connection: close` on every response. At most
//! `max_connections` workers run at once; connections past that get 503.

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::ServiceConfig;
use crate::dispatch::{AnalyzeRequest, DetectionDispatcher};

const MAX_HEADER_BYTES: usize = 16 * 1024;
const HEADER_TIMEOUT: Duration = Duration::from_secs(5);
const BODY_TIMEOUT: Duration = Duration::from_secs(30);
const BUSY_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub allowed_origin: String,
    pub max_request_bytes: usize,
    pub max_connections: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
            allowed_origin: "http://localhost:8080".to_string(),
            max_request_bytes: 16 * 1024 * 1024,
            max_connections: 32,
        }
    }
}

impl From<&ServiceConfig> for ApiConfig {
    fn from(cfg: &ServiceConfig) -> Self {
        Self {
            addr: cfg.addr.clone(),
            allowed_origin: cfg.allowed_origin.clone(),
            max_request_bytes: cfg.max_request_bytes,
            max_connections: cfg.max_connections,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    dispatcher: Arc<DetectionDispatcher>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, dispatcher: Arc<DetectionDispatcher>) -> Self {
        Self { cfg, dispatcher }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid listen address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("failed to bind {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!("analysis api listening on http://{}", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = Arc::new(self.cfg);
        let dispatcher = self.dispatcher;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, dispatcher, shutdown_thread) {
                log::error!("analysis api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: Arc<ApiConfig>,
    dispatcher: Arc<DetectionDispatcher>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let active = Arc::new(AtomicUsize::new(0));
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((mut stream, peer)) => {
                let Some(slot) = WorkerSlot::acquire(&active, cfg.max_connections) else {
                    log::warn!("rejecting {}: {} requests in flight", peer, cfg.max_connections);
                    if let Err(err) = reject_busy(&mut stream, &cfg.allowed_origin) {
                        log::debug!("busy reply to {} failed: {}", peer, err);
                    }
                    continue;
                };
                let cfg = cfg.clone();
                let dispatcher = dispatcher.clone();
                std::thread::spawn(move || {
                    let _slot = slot;
                    if let Err(err) = handle_connection(stream, &cfg, &dispatcher) {
                        log::warn!("request from {} failed: {:#}", peer, err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Reply 503 without reading the request, then drain what the client sent so
/// closing the socket does not reset the connection under the reply.
fn reject_busy(stream: &mut TcpStream, allowed_origin: &str) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(BUSY_DRAIN_TIMEOUT))?;
    let busy = Response::error(503, "server_busy", "too many requests in flight");
    write_response(stream, &busy, allowed_origin)?;
    stream.shutdown(Shutdown::Write)?;
    let mut buf = [0u8; 4096];
    let mut drained = 0;
    while drained < MAX_HEADER_BYTES {
        match stream.read(&mut buf) {
            Ok(n) if n > 0 => drained += n,
            _ => break,
        }
    }
    Ok(())
}

/// One counted worker; the count drops when the slot does.
struct WorkerSlot {
    active: Arc<AtomicUsize>,
}

impl WorkerSlot {
    fn acquire(active: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .ok()
            .map(|_| Self {
                active: active.clone(),
            })
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Response {
    status: u16,
    body: Vec<u8>,
}

impl Response {
    fn json(status: u16, value: serde_json::Value) -> Self {
        Self {
            status,
            body: value.to_string().into_bytes(),
        }
    }

    fn error(status: u16, kind: &str, detail: impl Into<String>) -> Self {
        Self::json(status, json!({ "error": kind, "detail": detail.into() }))
    }

    fn empty(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }
}

fn handle_connection(
    mut stream: TcpStream,
    cfg: &ApiConfig,
    dispatcher: &DetectionDispatcher,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let response = match read_request(&mut stream, cfg.max_request_bytes) {
        Ok(ReadOutcome::Request(request)) => route(&request, dispatcher),
        Ok(ReadOutcome::TooLarge(len)) => {
            log::warn!("rejected {} byte request body", len);
            Response::error(
                413,
                "payload_too_large",
                format!("request body exceeds {} bytes", cfg.max_request_bytes),
            )
        }
        Err(err) => {
            log::debug!("malformed request: {:#}", err);
            Response::error(400, "bad_request", err.to_string())
        }
    };
    write_response(&mut stream, &response, &cfg.allowed_origin)
}

fn route(request: &HttpRequest, dispatcher: &DetectionDispatcher) -> Response {
    if request.method == "OPTIONS" {
        return Response::empty(204);
    }
    match (request.path.as_str(), request.method.as_str()) {
        ("/analyze", "POST") => analyze(&request.body, dispatcher),
        ("/health", "GET") => Response::json(200, json!({ "status": "healthy" })),
        ("/models", "GET") => {
            let registry = dispatcher.registry();
            Response::json(
                200,
                json!({ "models": registry.list(), "default": registry.default_name() }),
            )
        }
        ("/analyze", _) | ("/health", _) | ("/models", _) => {
            Response::error(405, "method_not_allowed", format!("{} not allowed", request.method))
        }
        _ => Response::error(404, "not_found", format!("no route for {}", request.path)),
    }
}

fn analyze(body: &[u8], dispatcher: &DetectionDispatcher) -> Response {
    let request: AnalyzeRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(err) => return Response::error(400, "bad_request", format!("invalid JSON body: {}", err)),
    };
    match dispatcher.dispatch(&request) {
        Ok(result) => match serde_json::to_value(&result) {
            Ok(value) => Response::json(200, value),
            Err(err) => Response::error(500, "internal_error", err.to_string()),
        },
        Err(err) => {
            if err.status_code() >= 500 {
                log::error!("analyze failed: {}", err);
            } else {
                log::debug!("analyze rejected: {}", err);
            }
            Response::error(err.status_code(), err.kind(), err.to_string())
        }
    }
}

enum ReadOutcome {
    Request(HttpRequest),
    TooLarge(usize),
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

fn read_request(stream: &mut TcpStream, max_body: usize) -> Result<ReadOutcome> {
    stream.set_read_timeout(Some(HEADER_TIMEOUT))?;
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let head = parse_head(&data[..header_end])?;
    if head.content_length > max_body {
        return Ok(ReadOutcome::TooLarge(head.content_length));
    }
    let content_length = head.content_length;

    let mut body = data.split_off(header_end);
    body.truncate(content_length);
    stream.set_read_timeout(Some(BODY_TIMEOUT))?;
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!(
                "connection closed after {} of {} body bytes",
                body.len(),
                content_length
            ));
        }
        let take = n.min(content_length - body.len());
        body.extend_from_slice(&buf[..take]);
    }

    Ok(ReadOutcome::Request(HttpRequest {
        method: head.method,
        path: head.path,
        body,
    }))
}

#[derive(Debug, PartialEq)]
struct RequestHead {
    method: String,
    path: String,
    content_length: usize,
}

/// Parse the request line and headers (everything up to the blank line).
fn parse_head(raw: &[u8]) -> Result<RequestHead> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid Content-Length '{}'", value))?,
        None => 0,
    };
    Ok(RequestHead {
        method: method.to_ascii_uppercase(),
        path: raw_path.split('?').next().unwrap_or(raw_path).to_string(),
        content_length,
    })
}

fn write_response(stream: &mut TcpStream, response: &Response, allowed_origin: &str) -> Result<()> {
    let status_line = match response.status {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let mut header = format!(
        "{status_line}\r\nAccess-Control-Allow-Origin: {origin}\r\nAccess-Control-Allow-Methods: GET, POST, OPTIONS\r\nAccess-Control-Allow-Headers: Content-Type\r\nAccess-Control-Allow-Credentials: true\r\nVary: Origin\r\nCache-Control: no-store\r\nConnection: close\r\n",
        status_line = status_line,
        origin = allowed_origin,
    );
    if !response.body.is_empty() {
        header.push_str("Content-Type: application/json\r\n");
    }
    header.push_str(&format!("Content-Length: {}\r\n\r\n", response.body.len()));
    stream.write_all(header.as_bytes())?;
    stream.write_all(&response.body)?;
    stream.flush()?;
    Ok(())
}
