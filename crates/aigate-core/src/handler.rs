use std::convert::Infallible;
use std::sync::Arc;

use aigate_provider_core::Headers;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::Response;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::core::CoreState;
use crate::engine::{GatewayBody, GatewayResponse, InboundRequest};
use crate::error::ProxyError;

/// Fallback for every method and path.
pub async fn gateway_handler(
    State(state): State<Arc<CoreState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let body = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(body) => body,
        Err(err) => {
            return into_response(state.gateway.reject(ProxyError::bad_request(format!(
                "read request body (limit {} bytes): {err}",
                state.max_body_bytes
            ))));
        }
    };
    let query = match uri.query() {
        Some(raw) => match serde_urlencoded::from_str::<Vec<(String, String)>>(raw) {
            Ok(pairs) => pairs,
            Err(err) => {
                return into_response(
                    state
                        .gateway
                        .reject(ProxyError::bad_request(format!("invalid query string: {err}"))),
                );
            }
        },
        None => Vec::new(),
    };

    let inbound = InboundRequest {
        method: method.as_str().to_string(),
        path: uri.path().to_string(),
        query,
        headers: header_pairs(&headers),
        body,
    };

    // Dropping the handler future (client gone) cancels the request.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let response = state.gateway.handle(inbound, cancel).await;
    guard.disarm();
    into_response(response)
}

fn header_pairs(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn into_response(response: GatewayResponse) -> Response {
    let body = match response.body {
        GatewayBody::Full(bytes) => Body::from(bytes),
        GatewayBody::Stream(rx) => {
            Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>))
        }
    };
    let mut out = Response::new(body);
    *out.status_mut() = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let headers = out.headers_mut();
    for (name, value) in response.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) else {
            tracing::debug!(event = "response_header_dropped", header = %name);
            continue;
        };
        headers.append(name, value);
    }
    out
}
