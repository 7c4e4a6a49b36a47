//! Scripted connector for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use axum::http::StatusCode;
use dashmap::DashMap;
use crate::error::ProxyError;
use crate::load_balancer::backend::Backend;
use crate::pool::{Connector, UpstreamConnection};
use crate::proxy::message::{ProxyRequest, ProxyResponse};

/// How a scripted backend behaves. The default answers 200 with the
/// backend id as body.
#[derive(Debug, Clone)]
pub(crate) enum Behaviour {
    Ok,
    Status(StatusCode),
    Delay(Duration),
    Hang,
    RefuseConnect,
    Disconnect,
}

#[derive(Default)]
struct State {
    behaviours: DashMap<String, Behaviour>,
    hits: DashMap<String, usize>,
    connects: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
}

#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    state: Arc<State>,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, backend: &str, behaviour: Behaviour) {
        self.state.behaviours.insert(backend.to_string(), behaviour);
    }

    pub(crate) fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn live(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    pub(crate) fn max_live(&self) -> usize {
        self.state.max_live.load(Ordering::SeqCst)
    }

    /// Requests that reached `backend`.
    pub(crate) fn hits(&self, backend: &str) -> usize {
        self.state.hits.get(backend).map(|h| *h).unwrap_or(0)
    }

    fn behaviour(&self, backend: &str) -> Behaviour {
        self.state
            .behaviours
            .get(backend)
            .map(|b| b.clone())
            .unwrap_or(Behaviour::Ok)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, backend: &Backend) -> Result<Box<dyn UpstreamConnection>, ProxyError> {
        if let Behaviour::RefuseConnect = self.behaviour(&backend.id) {
            return Err(ProxyError::transport(&backend.id, "connection refused"));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let live = self.state.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            connector: self.clone(),
            open: AtomicBool::new(true),
        }))
    }
}

struct MockConnection {
    connector: MockConnector,
    open: AtomicBool,
}

#[async_trait]
impl UpstreamConnection for MockConnection {
    async fn send(&mut self, backend: &Backend, _request: &ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        *self.connector.state.hits.entry(backend.id.clone()).or_default() += 1;
        match self.connector.behaviour(&backend.id) {
            Behaviour::Ok | Behaviour::RefuseConnect => {
                Ok(ProxyResponse::new(StatusCode::OK, backend.id.clone()))
            }
            Behaviour::Status(status) => Ok(ProxyResponse::new(status, format!("{status}"))),
            Behaviour::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(ProxyResponse::new(StatusCode::OK, backend.id.clone()))
            }
            Behaviour::Hang => std::future::pending().await,
            Behaviour::Disconnect => {
                self.open.store(false, Ordering::SeqCst);
                Err(ProxyError::transport(&backend.id, "connection reset by peer"))
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.connector.state.live.fetch_sub(1, Ordering::SeqCst);
    }
}
