//! Shared utilities for integration and load testing.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use forward_proxy::config::{BackendConfig, ProxyConfig};
use forward_proxy::lifecycle::{startup, Shutdown};
use forward_proxy::{HttpServer, ProxyManager};

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "200 OK",
        404 => "404 Not Found",
        500 => "500 Internal Server Error",
        502 => "502 Bad Gateway",
        503 => "503 Service Unavailable",
        _ => "200 OK",
    }
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Serve keep-alive HTTP/1.1 requests on one connection until the peer
/// closes it.
async fn serve_connection<F, Fut>(mut socket: TcpStream, f: Arc<F>)
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let header_end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let request_end = header_end + content_length(&head);
        while buf.len() < request_end {
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        buf.drain(..request_end);

        let path = head
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or("/")
            .to_string();

        let (status, body) = f(path).await;
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nContent-Type: text/plain\r\n\r\n{}",
            status_text(status),
            body.len(),
            body
        );
        if socket.write_all(response.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// Start a programmable mock backend. The handler receives the request path.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _)) => {
                    tokio::spawn(serve_connection(socket, f.clone()));
                }
                Err(_) => break,
            }
        }
    });
    addr
}

/// Start a simple mock backend that returns a fixed response.
pub async fn start_mock_backend(response: &'static str) -> SocketAddr {
    start_programmable_backend(move |_| async move { (200, response.to_string()) }).await
}

pub fn backend(id: &str, addr: SocketAddr) -> BackendConfig {
    BackendConfig::new(id, format!("http://{}", addr))
}

/// Config with background noise turned off.
pub fn quiet_config(backends: Vec<BackendConfig>) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.backends = backends;
    config.health_check.enabled = false;
    config.cache.enabled = false;
    config.retries.retry_delay_ms = 10;
    config.observability.metrics_enabled = false;
    config
}

pub struct TestProxy {
    pub addr: SocketAddr,
    pub manager: Arc<ProxyManager>,
    pub shutdown: Arc<Shutdown>,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn stop(self) {
        self.shutdown.complete(Duration::from_secs(2)).await;
    }
}

/// Start the full proxy (core services and HTTP front end) on an ephemeral port.
pub async fn spawn_proxy(config: ProxyConfig) -> TestProxy {
    let shutdown = Arc::new(Shutdown::new());
    let services = startup::start(&config, &shutdown).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(services.manager.clone(), &config);
    let server_shutdown = shutdown.subscribe();
    shutdown.track(
        "http-server",
        tokio::spawn(async move {
            let _ = server.run(listener, server_shutdown).await;
        }),
    );

    TestProxy {
        addr,
        manager: services.manager,
        shutdown,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}
