//! Outbound connection establishment.
//!
//! [`Connector`] is the seam between the pool and the wire. The production
//! implementation dials TCP and runs a hyper HTTP/1.1 handshake; the
//! connection driver runs on its own task and ends when the send handle is
//! dropped.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Request};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use crate::error::ProxyError;
use crate::load_balancer::backend::Backend;
use crate::proxy::message::{ProxyRequest, ProxyResponse};

/// One established connection to a backend.
#[async_trait]
pub trait UpstreamConnection: Send {
    /// Send a request and buffer the whole response.
    async fn send(&mut self, backend: &Backend, request: &ProxyRequest) -> Result<ProxyResponse, ProxyError>;

    /// False once the peer closed the connection or it broke.
    fn is_open(&self) -> bool;
}

/// Opens new connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, backend: &Backend) -> Result<Box<dyn UpstreamConnection>, ProxyError>;
}

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP: [header::HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

/// Plain-HTTP/1.1 connector over TCP.
#[derive(Debug, Clone)]
pub struct Http1Connector {
    max_response_bytes: usize,
}

impl Http1Connector {
    pub fn new(max_response_bytes: usize) -> Self {
        Self { max_response_bytes }
    }
}

impl Default for Http1Connector {
    fn default() -> Self {
        Self::new(16 * 1024 * 1024)
    }
}

#[async_trait]
impl Connector for Http1Connector {
    async fn connect(&self, backend: &Backend) -> Result<Box<dyn UpstreamConnection>, ProxyError> {
        if backend.address.scheme() != "http" {
            return Err(ProxyError::transport(
                &backend.id,
                format!("unsupported upstream scheme {}", backend.address.scheme()),
            ));
        }

        let authority = backend.authority();
        let stream = TcpStream::connect(&authority)
            .await
            .map_err(|e| ProxyError::transport(&backend.id, e))?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(backend = %backend.id, error = %e, "Failed to set TCP_NODELAY");
        }

        let (sender, connection) = http1::handshake::<_, Body>(TokioIo::new(stream))
            .await
            .map_err(|e| ProxyError::transport(&backend.id, e))?;

        let id = backend.id.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(backend = %id, error = %e, "Upstream connection ended with error");
            }
        });

        tracing::debug!(backend = %backend.id, authority = %authority, "Upstream connection established");
        Ok(Box::new(Http1Connection {
            sender,
            max_response_bytes: self.max_response_bytes,
        }))
    }
}

struct Http1Connection {
    sender: SendRequest<Body>,
    max_response_bytes: usize,
}

#[async_trait]
impl UpstreamConnection for Http1Connection {
    async fn send(&mut self, backend: &Backend, request: &ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        self.sender
            .ready()
            .await
            .map_err(|e| ProxyError::transport(&backend.id, e))?;

        let mut headers = request.headers.clone();
        strip_hop_by_hop(&mut headers);
        let host = HeaderValue::from_str(&backend.authority())
            .map_err(|e| ProxyError::transport(&backend.id, e))?;
        headers.insert(header::HOST, host);

        let mut upstream = Request::builder()
            .method(request.method.clone())
            .uri(request.path_and_query())
            .body(Body::from(request.body.clone()))
            .map_err(|e| ProxyError::transport(&backend.id, e))?;
        *upstream.headers_mut() = headers;

        let response = self
            .sender
            .send_request(upstream)
            .await
            .map_err(|e| ProxyError::transport(&backend.id, e))?;

        let (parts, body) = response.into_parts();
        let body = axum::body::to_bytes(Body::new(body), self.max_response_bytes)
            .await
            .map_err(|e| ProxyError::transport(&backend.id, e))?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        Ok(ProxyResponse {
            status: parts.status,
            headers,
            body,
        })
    }

    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::ACCEPT));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 on loopback is not listening in test environments.
        let backend = crate::load_balancer::backend::test_backend("dead", 1);
        let err = Http1Connector::default().connect(&backend).await.err().unwrap();
        assert!(matches!(err, ProxyError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_connect_configures_live_stream() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.map(|(stream, _)| stream) });

        let backend = crate::load_balancer::backend::test_backend("live", port);
        let conn = Http1Connector::default().connect(&backend).await.unwrap();
        assert!(conn.is_open());

        let server_side = accept.await.unwrap().unwrap();
        assert!(server_side.peer_addr().is_ok());
    }
}
