//! Shared utilities for integration and load testing.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use gateway_control::clock;
use gateway_control::config::{BreakerConfig, GatewayConfig, PoolConfig, QueueConfig, ServerConfig, TenantConfig};
use gateway_control::pool::{ConnectError, Connector, DownstreamFailure};
use gateway_control::Dispatcher;

#[derive(Default)]
pub struct Script {
    pub connects: AtomicU32,
    pub calls: AtomicU32,
    pub refuse_connect: AtomicBool,
    pub fail_calls: AtomicBool,
    pub panic_calls: AtomicBool,
    pub delay_ms: AtomicU64,
    /// Payloads in the order the downstream saw them.
    pub seen: Mutex<Vec<Bytes>>,
}

/// In-memory downstream whose behaviour tests flip at runtime.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    pub script: Arc<Script>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(ms: u64) -> Self {
        let connector = Self::default();
        connector.script.delay_ms.store(ms, Ordering::SeqCst);
        connector
    }

    pub fn set_delay(&self, ms: u64) {
        self.script.delay_ms.store(ms, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.script.fail_calls.store(failing, Ordering::SeqCst);
    }

    /// Make calls panic, as a connector bug would.
    pub fn set_panicking(&self, panicking: bool) {
        self.script.panic_calls.store(panicking, Ordering::SeqCst);
    }

    pub fn set_refusing(&self, refusing: bool) {
        self.script.refuse_connect.store(refusing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.script.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<Bytes> {
        self.script.seen.lock().unwrap().clone()
    }
}

impl Connector for ScriptedConnector {
    type Connection = u32;

    async fn connect(&self) -> Result<u32, ConnectError> {
        if self.script.refuse_connect.load(Ordering::SeqCst) {
            return Err(ConnectError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            )));
        }
        Ok(self.script.connects.fetch_add(1, Ordering::SeqCst))
    }

    async fn call(&self, _conn: &mut u32, payload: Bytes) -> Result<Bytes, DownstreamFailure> {
        self.script.calls.fetch_add(1, Ordering::SeqCst);
        self.script.seen.lock().unwrap().push(payload.clone());
        if self.script.panic_calls.load(Ordering::SeqCst) {
            panic!("scripted downstream panicked");
        }

        let delay = self.script.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.script.fail_calls.load(Ordering::SeqCst) {
            return Err(DownstreamFailure::Status(503));
        }
        Ok(payload)
    }
}

/// Small, fast settings for one server.
pub fn server_config(id: &str) -> ServerConfig {
    let mut server = ServerConfig::new(id, "127.0.0.1:0");
    server.workers = Some(2);
    server.request_timeout_ms = 1_000;
    server.breaker = BreakerConfig {
        failure_threshold: 5,
        success_threshold: 2,
        open_timeout_ms: 200,
    };
    server.pool = PoolConfig {
        min_size: 1,
        max_size: 2,
        ceiling: 2,
        acquire_timeout_ms: 200,
        connect_retries: 1,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        unhealthy_after: 3,
        ..PoolConfig::default()
    };
    server.queue = QueueConfig {
        max_size: 16,
        processing_timeout_ms: 5_000,
    };
    server
}

pub fn tenant(id: &str, rate: f64, burst_factor: f64) -> TenantConfig {
    TenantConfig {
        id: id.to_string(),
        rate,
        burst_factor,
        fairness_weight: 1.0,
    }
}

/// Gateway config with fast maintenance ticks and generous default quotas.
pub fn gateway_config(tenants: Vec<TenantConfig>) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.rate_limit.window_ms = 60_000;
    config.rate_limit.default_rate = 10_000.0;
    config.maintenance.scale_interval_ms = 50;
    config.maintenance.sweep_interval_ms = 20;
    config.tenants = tenants;
    config
}

/// Dispatcher on the real clock with one scripted server registered.
pub fn dispatcher_with(
    config: GatewayConfig,
    server: ServerConfig,
    connector: ScriptedConnector,
) -> Arc<Dispatcher<ScriptedConnector>> {
    let dispatcher = Dispatcher::new(config, clock::system());
    dispatcher.register_server(server, connector).unwrap();
    dispatcher
}

/// Start a programmable HTTP backend on an ephemeral port.
///
/// Each connection reads one request, answers with the closure's status and
/// body, and closes.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let body = read_request_body(&mut socket).await;
                        let (status, reply) = f(body).await;
                        let status_text = match status {
                            200 => "200 OK",
                            429 => "429 Too Many Requests",
                            500 => "500 Internal Server Error",
                            502 => "502 Bad Gateway",
                            503 => "503 Service Unavailable",
                            _ => "200 OK",
                        };
                        let response = format!(
                            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            reply.len(),
                            reply
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });
    addr
}

async fn read_request_body(socket: &mut tokio::net::TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = find_header_end(&buf) {
            let headers = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let length = headers
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                return buf[end + 4..end + 4 + length].to_vec();
            }
        }
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return Vec::new(),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
