//! Request handling and transformation.
//!
//! # Responsibilities
//! - Generate a unique request ID (UUID v4) when the client sent none
//! - Enforce the body size limit while buffering
//! - Turn an inbound axum request into a [`ProxyRequest`]
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - The ID is forwarded upstream and echoed back to the client

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, Request};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use crate::proxy::message::{ProxyRequest, RequestContext};

pub const X_REQUEST_ID: &str = "x-request-id";

/// Assigns `x-request-id` to requests that lack one.
pub fn set_request_id_layer() -> SetRequestIdLayer<MakeRequestUuid> {
    SetRequestIdLayer::new(HeaderName::from_static(X_REQUEST_ID), MakeRequestUuid)
}

/// Copies `x-request-id` from the request onto the response.
pub fn propagate_request_id_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::new(HeaderName::from_static(X_REQUEST_ID))
}

pub fn request_id(headers: &HeaderMap) -> &str {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
}

/// Why an inbound request could not be buffered.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// Buffer the body and build the engine request.
pub async fn into_proxy_request(
    request: Request<Body>,
    max_body_bytes: usize,
    context: RequestContext,
) -> Result<ProxyRequest, BufferError> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, max_body_bytes)
        .await
        .map_err(|_| BufferError::TooLarge { limit: max_body_bytes })?;

    Ok(ProxyRequest {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
        body,
        context,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, Method};

    #[tokio::test]
    async fn test_into_proxy_request() {
        let request = Request::builder()
            .method(Method::PUT)
            .uri("/items/7?x=1")
            .header(X_REQUEST_ID, "abc")
            .body(Body::from("payload"))
            .unwrap();

        let proxied = into_proxy_request(request, 1024, RequestContext::new()).await.unwrap();
        assert_eq!(proxied.method, Method::PUT);
        assert_eq!(proxied.path_and_query(), "/items/7?x=1");
        assert_eq!(proxied.body, "payload");
        assert_eq!(request_id(&proxied.headers), "abc");
    }

    #[tokio::test]
    async fn test_body_limit() {
        let request = Request::builder().uri("/").body(Body::from(vec![0u8; 64])).unwrap();
        let err = into_proxy_request(request, 16, RequestContext::new()).await.unwrap_err();
        assert!(matches!(err, BufferError::TooLarge { limit: 16 }));
    }

    #[test]
    fn test_request_id_fallback() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_id(&headers), "unknown");
        headers.insert(X_REQUEST_ID, HeaderValue::from_static("r-1"));
        assert_eq!(request_id(&headers), "r-1");
    }
}
