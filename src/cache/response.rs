//! Response cache adapter.
//!
//! Entries are encoded as a length-prefixed JSON header (status, headers,
//! expiry) followed by the raw body bytes.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use crate::cache::{CacheError, CacheStore};
use crate::config::CacheConfig;
use crate::proxy::message::{ProxyRequest, ProxyResponse};

/// Deterministic key for a backend's response to `method uri`.
pub fn cache_key(backend_id: &str, method: &Method, uri: &str) -> String {
    format!("proxy:{}:{}:{}", backend_id, method, uri)
}

/// Only successful GETs are cached.
pub fn is_cacheable(method: &Method, status: StatusCode) -> bool {
    method == Method::GET && status == StatusCode::OK
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    status: u16,
    headers: Vec<(String, String)>,
    expires_at_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn encode(response: &ProxyResponse, ttl: Duration) -> Result<Bytes, CacheError> {
    let header = EntryHeader {
        status: response.status.as_u16(),
        headers: response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect(),
        expires_at_ms: now_ms().saturating_add(ttl.as_millis() as u64),
    };
    let header = serde_json::to_vec(&header)?;

    let mut buf = BytesMut::with_capacity(4 + header.len() + response.body.len());
    buf.put_u32(header.len() as u32);
    buf.put_slice(&header);
    buf.put_slice(&response.body);
    Ok(buf.freeze())
}

/// Decode an entry; `Ok(None)` if it has expired.
fn decode(raw: Bytes) -> Result<Option<ProxyResponse>, CacheError> {
    if raw.len() < 4 {
        return Err(CacheError::Corrupt("truncated length prefix"));
    }
    let header_len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    let body_start = 4usize
        .checked_add(header_len)
        .filter(|end| *end <= raw.len())
        .ok_or(CacheError::Corrupt("truncated header"))?;

    let header: EntryHeader = serde_json::from_slice(&raw[4..body_start])?;
    if header.expires_at_ms <= now_ms() {
        return Ok(None);
    }

    let status = StatusCode::from_u16(header.status).map_err(|_| CacheError::Corrupt("invalid status"))?;
    let mut headers = HeaderMap::with_capacity(header.headers.len());
    for (name, value) in header.headers {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            headers.append(name, value);
        }
    }
    Ok(Some(ProxyResponse {
        status,
        headers,
        body: raw.slice(body_start..),
    }))
}

/// Stores and retrieves proxied GET responses through a [`CacheStore`].
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
    max_body_bytes: usize,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("store", &self.store.name())
            .field("ttl", &self.ttl)
            .field("max_body_bytes", &self.max_body_bytes)
            .finish()
    }
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration, max_body_bytes: usize) -> Self {
        Self {
            store,
            ttl,
            max_body_bytes,
        }
    }

    pub fn from_config(store: Arc<dyn CacheStore>, config: &CacheConfig) -> Self {
        Self::new(store, config.ttl(), config.max_body_bytes)
    }

    /// Cached response of `backend_id` for this request, if fresh.
    /// Store errors and undecodable entries read as a miss.
    pub async fn lookup(&self, backend_id: &str, request: &ProxyRequest) -> Option<ProxyResponse> {
        let key = cache_key(backend_id, &request.method, request.path_and_query());
        let raw = match self.store.get(&key).await {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache lookup failed, treating as miss");
                return None;
            }
        };
        match decode(raw) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Discarding unreadable cache entry");
                None
            }
        }
    }

    /// Store `response` if eligible. Returns whether it was written.
    pub async fn store(&self, backend_id: &str, request: &ProxyRequest, response: &ProxyResponse) -> bool {
        if !is_cacheable(&request.method, response.status) || response.body.len() > self.max_body_bytes {
            return false;
        }
        let key = cache_key(backend_id, &request.method, request.path_and_query());
        let result = match encode(response, self.ttl) {
            Ok(value) => self.store.set(&key, value, self.ttl).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                tracing::debug!(key = %key, bytes = response.body.len(), "Response cached");
                true
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache store failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use async_trait::async_trait;
    use axum::http::{header, Uri};

    fn cache(ttl: Duration) -> ResponseCache {
        ResponseCache::new(Arc::new(MemoryCacheStore::new(100)), ttl, 1024)
    }

    fn get(uri: &'static str) -> ProxyRequest {
        ProxyRequest::get(Uri::from_static(uri))
    }

    #[test]
    fn test_key_format() {
        assert_eq!(cache_key("b1", &Method::GET, "/items?page=2"), "proxy:b1:GET:/items?page=2");
        assert_ne!(
            cache_key("b1", &Method::GET, "/x"),
            cache_key("b2", &Method::GET, "/x")
        );
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let cache = cache(Duration::from_secs(60));
        let request = get("/resource?id=1");

        let mut first = ProxyResponse::new(StatusCode::OK, "first");
        first.headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        assert!(cache.store("b1", &request, &first).await);
        assert!(cache.store("b1", &request, &ProxyResponse::new(StatusCode::OK, "second")).await);

        let hit = cache.lookup("b1", &request).await.unwrap();
        assert_eq!(hit.body, Bytes::from_static(b"second"));
        assert!(hit.headers.is_empty());

        // Different backend, same URI: no collision.
        assert!(cache.lookup("b2", &request).await.is_none());
    }

    #[tokio::test]
    async fn test_headers_round_trip() {
        let cache = cache(Duration::from_secs(60));
        let request = get("/h");
        let mut response = ProxyResponse::new(StatusCode::OK, "body");
        response.headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        cache.store("b1", &request, &response).await;

        assert_eq!(cache.lookup("b1", &request).await.unwrap(), response);
    }

    #[tokio::test]
    async fn test_ineligible_responses_not_stored() {
        let cache = cache(Duration::from_secs(60));

        let post = ProxyRequest::new(Method::POST, Uri::from_static("/r"));
        assert!(!cache.store("b1", &post, &ProxyResponse::new(StatusCode::OK, "x")).await);

        let request = get("/r");
        assert!(!cache.store("b1", &request, &ProxyResponse::new(StatusCode::NOT_FOUND, "x")).await);
        assert!(!cache.store("b1", &request, &ProxyResponse::new(StatusCode::CREATED, "x")).await);
        assert!(cache.lookup("b1", &request).await.is_none());

        let big = ProxyResponse::new(StatusCode::OK, vec![0u8; 2048]);
        assert!(!cache.store("b1", &request, &big).await);
    }

    #[tokio::test]
    async fn test_expired_entry_is_miss() {
        let cache = cache(Duration::from_millis(10));
        let request = get("/short");
        cache.store("b1", &request, &ProxyResponse::new(StatusCode::OK, "x")).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.lookup("b1", &request).await.is_none());
    }

    struct FailingStore;

    #[async_trait]
    impl CacheStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<Bytes>, CacheError> {
            Err(CacheError::Store("unreachable".into()))
        }

        async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Store("unreachable".into()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test]
    async fn test_store_errors_are_misses() {
        let cache = ResponseCache::new(Arc::new(FailingStore), Duration::from_secs(60), 1024);
        let request = get("/r");
        assert!(!cache.store("b1", &request, &ProxyResponse::new(StatusCode::OK, "x")).await);
        assert!(cache.lookup("b1", &request).await.is_none());
    }

    #[test]
    fn test_corrupt_entries_rejected() {
        assert!(decode(Bytes::from_static(b"\x00")).is_err());
        assert!(decode(Bytes::from_static(b"\x00\x00\x00\xffab")).is_err());
    }
}
