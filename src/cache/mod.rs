//! Response caching.
//!
//! # Data Flow
//! ```text
//! Forwarder (GET, cache enabled)
//!     → response.rs (key "proxy:{backend}:{method}:{uri}", eligibility, encoding)
//!     → CacheStore (external key/value collaborator)
//!         - memory.rs (bounded in-process default)
//! ```
//!
//! # Design Decisions
//! - Only GET + 200 responses are stored, always as whole entries
//! - Store failures are logged and read as misses; they never fail a request
//! - Keys embed the backend id so entries never collide across backends

pub mod memory;
pub mod response;

use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;

pub use memory::MemoryCacheStore;
pub use response::{cache_key, is_cacheable, ResponseCache};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache store error: {0}")]
    Store(String),
    #[error("cache entry encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("corrupt cache entry: {0}")]
    Corrupt(&'static str),
}

/// External key/value store used for cached responses.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError>;

    fn name(&self) -> &'static str;
}
