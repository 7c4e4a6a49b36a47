//! Forward proxy and load-balancing engine.
//!
//! Accepts requests, picks a healthy backend, forwards through pooled
//! connections with retries and per-backend circuit breaking, and caches
//! successful GET responses.

pub mod admin;
pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod observability;
pub mod pool;
pub mod proxy;
pub mod resilience;

pub use config::schema::ProxyConfig;
pub use error::ProxyError;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use proxy::{ProxyManager, ProxyRequest, ProxyResponse, RequestContext};
