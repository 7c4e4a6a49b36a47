//! Response handling and transformation.
//!
//! # Responsibilities
//! - Turn a buffered backend response into an axum response
//! - Map engine errors to gateway status codes with a JSON body
//!
//! # Design Decisions
//! - Hop-by-hop headers were already stripped by the connector
//! - Backend timeouts result in 504 Gateway Timeout

use axum::body::Body;
use axum::http::{header, HeaderValue, Response};
use axum::response::IntoResponse;
use serde::Serialize;
use crate::error::ProxyError;
use crate::proxy::message::ProxyResponse;

/// `Via` value added to proxied responses.
pub const VIA: &str = "1.1 forward-proxy";

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: &'static str,
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> axum::response::Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
            .headers_mut()
            .insert(header::VIA, HeaderValue::from_static(VIA));
        response
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
        };
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_error_response() {
        let response = ProxyError::NoBackendsAvailable.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["kind"], "no_backends");
        assert_eq!(json["error"], "no backends available");
    }

    #[tokio::test]
    async fn test_backend_response_passthrough() {
        let mut proxied = ProxyResponse::new(StatusCode::CREATED, "made");
        proxied
            .headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        let response = proxied.into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(response.headers()[header::VIA], VIA);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(body, "made");
    }
}
