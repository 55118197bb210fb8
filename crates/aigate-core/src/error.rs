//! The error envelope every gateway failure is rendered as.

use aigate_protocol::sse::encode_data;
use aigate_provider_core::ProviderError;
use bytes::Bytes;
use http::StatusCode;
use serde_json::{Value, json};

#[derive(Debug, Clone)]
pub struct ProxyError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
    /// Raw upstream body, as JSON when it parses.
    pub upstream: Option<Value>,
}

impl ProxyError {
    pub fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
            upstream: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "upstream_error", message)
    }

    /// A non-2xx upstream answer. The upstream status is kept.
    pub fn upstream_status(status: u16, body: &[u8]) -> Self {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
        let upstream = if body.is_empty() {
            None
        } else {
            Some(
                serde_json::from_slice::<Value>(body)
                    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned())),
            )
        };
        Self {
            status,
            kind: "upstream_error",
            message: format!("upstream responded with status {}", status.as_u16()),
            upstream,
        }
    }

    fn error_object(&self, request_id: &str, call_id: &str) -> Value {
        let mut error = json!({
            "code": self.status.as_u16(),
            "type": self.kind,
            "message": self.message,
            "request_id": request_id,
            "call_id": call_id,
        });
        if let Some(upstream) = &self.upstream {
            error["upstream"] = upstream.clone();
        }
        error
    }

    pub fn envelope(&self, request_id: &str, call_id: &str) -> Value {
        json!({"success": false, "error": self.error_object(request_id, call_id)})
    }

    pub fn body(&self, request_id: &str, call_id: &str) -> Bytes {
        Bytes::from(self.envelope(request_id, call_id).to_string())
    }

    /// The terminal event sent when a stream that already started fails.
    pub fn sse_event(&self, request_id: &str, call_id: &str) -> Bytes {
        let payload = json!({"error": self.error_object(request_id, call_id)});
        encode_data(&payload.to_string())
    }
}

impl From<&ProviderError> for ProxyError {
    fn from(err: &ProviderError) -> Self {
        let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, err.kind(), err.to_string())
    }
}

impl From<ProviderError> for ProxyError {
    fn from(err: ProviderError) -> Self {
        Self::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_body_is_kept_as_json_or_text() {
        let err = ProxyError::upstream_status(429, br#"{"error":{"message":"slow down"}}"#);
        let envelope = err.envelope("req-1", "call-1");
        assert_eq!(envelope["success"], false);
        assert_eq!(envelope["error"]["code"], 429);
        assert_eq!(envelope["error"]["request_id"], "req-1");
        assert_eq!(envelope["error"]["upstream"]["error"]["message"], "slow down");

        let err = ProxyError::upstream_status(503, b"service unavailable");
        assert_eq!(err.envelope("r", "c")["error"]["upstream"], "service unavailable");
    }

    #[test]
    fn provider_errors_map_to_status() {
        let err = ProxyError::from(ProviderError::InvalidConfig("no host".into()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.kind, "invalid_config");
        let err = ProxyError::from(ProviderError::NotFound("model".into()));
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn sse_event_carries_the_error_object() {
        let event = ProxyError::bad_gateway("stream broke").sse_event("r", "c");
        let text = std::str::from_utf8(&event).unwrap();
        assert!(text.starts_with("data: {\"error\":"));
        assert!(text.ends_with("\n\n"));
        assert!(!text.contains("success"));
    }
}
