//! The orchestrator: match a route, authenticate, run the request chain,
//! call upstream, then drive the response chain over a whole body or a
//! stream of split units.

mod chain;
mod changes;

use std::sync::Arc;
use std::time::Instant;

use aigate_provider_core::{
    ChunkSplitter, FilterRegistry, Headers, IdentityResolver, LocalResponse, OutboundRequest,
    PassthroughSplitter, ProviderError, RequestCtx, RequestSignal, ResponseHead, header_get,
    header_set,
};
use bytes::{Bytes, BytesMut};
use http::StatusCode;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProxyError;
use crate::redact::Redacted;
use crate::route::RouteTable;
use crate::upstream_client::{UpstreamBody, UpstreamChunks, UpstreamClient, UpstreamRequest};
use chain::FilterChain;

pub const REQUEST_ID_HEADER: &str = "x-ai-proxy-request-id";
pub const CALL_ID_HEADER: &str = "x-ai-proxy-call-id";
pub const BODY_CHANGES_HEADER: &str = "x-ai-proxy-body-transform-changes";

const STREAM_BUFFER: usize = 32;
const CLIENT_CLOSED_REQUEST: u16 = 499;

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Never forwarded upstream. Credentials belong to the gateway, and
/// response bodies must arrive unencoded for filters to read them.
const INBOUND_ONLY: [&str; 5] = ["authorization", "x-api-key", "host", "content-length", "accept-encoding"];

#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Headers,
    pub body: Bytes,
}

#[derive(Debug)]
pub enum GatewayBody {
    Full(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

#[derive(Debug)]
pub struct GatewayResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: GatewayBody,
}

impl GatewayResponse {
    /// Collects the body, draining a stream to its end.
    pub async fn into_bytes(self) -> Bytes {
        match self.body {
            GatewayBody::Full(bytes) => bytes,
            GatewayBody::Stream(mut rx) => {
                let mut out = BytesMut::new();
                while let Some(chunk) = rx.recv().await {
                    out.extend_from_slice(&chunk);
                }
                out.freeze()
            }
        }
    }
}

pub struct Gateway {
    routes: RouteTable,
    registry: Arc<FilterRegistry>,
    identity: Arc<dyn IdentityResolver>,
    upstream: Arc<dyn UpstreamClient>,
}

impl Gateway {
    pub fn new(
        routes: RouteTable,
        registry: Arc<FilterRegistry>,
        identity: Arc<dyn IdentityResolver>,
        upstream: Arc<dyn UpstreamClient>,
    ) -> Self {
        Self {
            routes,
            registry,
            identity,
            upstream,
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// An error answer for a request that never reached `handle`.
    pub fn reject(&self, err: ProxyError) -> GatewayResponse {
        let ctx = RequestCtx::new("", "", OffsetDateTime::now_utc().unix_timestamp());
        error_response(&ctx, err)
    }

    pub async fn handle(&self, inbound: InboundRequest, cancel: CancellationToken) -> GatewayResponse {
        let method = inbound.method.to_ascii_uppercase();
        let mut ctx = RequestCtx::new(
            method.clone(),
            String::new(),
            OffsetDateTime::now_utc().unix_timestamp(),
        );
        ctx.cancel = cancel;
        ctx.query = inbound.query.clone();
        tracing::info!(
            event = "downstream_received",
            request_id = %ctx.request_id,
            call_id = %ctx.call_id,
            method = %method,
            path = %inbound.path,
        );

        let Some(found) = self.routes.find_best_match(&method, &inbound.path) else {
            return error_response(
                &ctx,
                ProxyError::not_found(format!("no route for {method} {}", inbound.path)),
            );
        };
        ctx.route_method = found.route.method.clone();
        ctx.route_path = found.route.path.as_str().to_string();
        ctx.path_params = found.params;
        tracing::debug!(
            event = "route_matched",
            request_id = %ctx.request_id,
            route_method = %ctx.route_method,
            route_path = %ctx.route_path,
        );

        let Some(token) = api_key(&inbound.headers) else {
            return error_response(&ctx, ProxyError::unauthorized("missing api key"));
        };
        match self.identity.resolve(&token).await {
            Ok((client, client_token)) => {
                ctx.client = Some(client);
                ctx.client_token = client_token;
            }
            Err(err) => return error_response(&ctx, ProxyError::from(&err)),
        }

        let mut chain = match FilterChain::build(
            &self.registry,
            &found.route.request_filters,
            &found.route.response_filters,
        ) {
            Ok(chain) => chain,
            Err(err) => return error_response(&ctx, ProxyError::internal(err.to_string())),
        };

        let mut req = OutboundRequest {
            method: method.clone(),
            scheme: "https".to_string(),
            host: String::new(),
            path: inbound.path,
            query: inbound.query,
            headers: forwardable(inbound.headers),
            body: inbound.body,
        };
        match chain.run_request(&mut ctx, &mut req).await {
            Ok(RequestSignal::Continue) => {}
            Ok(RequestSignal::Respond(local)) => return local_response(&ctx, local),
            Err(err) => return error_response(&ctx, ProxyError::from(&err)),
        }

        let url = match req.url() {
            Ok(url) => url,
            Err(err) => return error_response(&ctx, ProxyError::from(&err)),
        };
        tracing::debug!(
            event = "upstream_request",
            request_id = %ctx.request_id,
            call_id = %ctx.call_id,
            method = %req.method,
            url = %url,
            stream = ctx.is_stream,
            headers = ?Redacted(&req.headers),
        );
        let upstream_req = UpstreamRequest {
            method: req.method,
            url,
            headers: req.headers,
            body: req.body,
            is_stream: ctx.is_stream,
        };

        let started = Instant::now();
        let cancel = ctx.cancel.clone();
        let sent = tokio::select! {
            sent = self.upstream.send(upstream_req) => sent,
            _ = cancel.cancelled() => {
                tracing::info!(event = "downstream_cancelled", request_id = %ctx.request_id);
                let status = StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST);
                return error_response(&ctx, ProxyError::new(status, "cancelled", "client closed request"));
            }
        };
        let response = match sent {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    event = "upstream_failed",
                    request_id = %ctx.request_id,
                    call_id = %ctx.call_id,
                    error = %err,
                );
                return error_response(&ctx, ProxyError::bad_gateway(err.to_string()));
            }
        };
        tracing::info!(
            event = "upstream_response",
            request_id = %ctx.request_id,
            call_id = %ctx.call_id,
            status = response.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
        );

        if !(200..300).contains(&response.status) {
            let status = response.status;
            return match response.into_bytes().await {
                Ok(body) => error_response(&ctx, ProxyError::upstream_status(status, &body)),
                Err(err) => error_response(&ctx, ProxyError::bad_gateway(err.to_string())),
            };
        }

        let mut head = ResponseHead {
            status: response.status,
            headers: strip_response_headers(response.headers),
        };
        if let Err(err) = chain.run_headers(&mut ctx, &mut head).await {
            return abort(&mut ctx, &mut chain, &head, err).await;
        }

        match response.body {
            UpstreamBody::Bytes(body) => finish_whole(ctx, chain, head, body).await,
            UpstreamBody::Stream(chunks) => {
                let splitter = ctx
                    .take_splitter()
                    .unwrap_or_else(|| Box::new(PassthroughSplitter));
                let status = head.status;
                let headers = gateway_headers(&ctx, head.headers.clone());
                let (tx, rx) = mpsc::channel(STREAM_BUFFER);
                tokio::spawn(pump(ctx, chain, head, splitter, chunks, tx));
                GatewayResponse {
                    status,
                    headers,
                    body: GatewayBody::Stream(rx),
                }
            }
        }
    }
}

async fn finish_whole(
    mut ctx: RequestCtx,
    mut chain: FilterChain,
    head: ResponseHead,
    body: Bytes,
) -> GatewayResponse {
    let mut out = BytesMut::new();
    match chain.run_chunk(&mut ctx, &head, body).await {
        Ok(Some(bytes)) => out.extend_from_slice(&bytes),
        Ok(None) => {}
        Err(err) => return abort(&mut ctx, &mut chain, &head, err).await,
    }
    let (tail, err) = chain.run_complete(&mut ctx, &head).await;
    if let Some(err) = err {
        return error_response(&ctx, response_failure(&err));
    }
    for bytes in tail {
        out.extend_from_slice(&bytes);
    }

    let mut headers = gateway_headers(&ctx, head.headers);
    if header_get(&headers, "content-type").is_none() {
        header_set(&mut headers, "content-type", "application/json");
    }
    tracing::info!(
        event = "downstream_responded",
        request_id = %ctx.request_id,
        call_id = %ctx.call_id,
        status = head.status,
        stream = false,
        bytes = out.len(),
    );
    GatewayResponse {
        status: head.status,
        headers,
        body: GatewayBody::Full(out.freeze()),
    }
}

/// Fails a response that has not started. Every `on_complete` still runs.
async fn abort(
    ctx: &mut RequestCtx,
    chain: &mut FilterChain,
    head: &ResponseHead,
    err: ProviderError,
) -> GatewayResponse {
    ctx.stream_error = Some(err.clone());
    let _ = chain.run_complete(ctx, head).await;
    error_response(ctx, response_failure(&err))
}

async fn pump(
    mut ctx: RequestCtx,
    mut chain: FilterChain,
    head: ResponseHead,
    mut splitter: Box<dyn ChunkSplitter>,
    mut upstream: UpstreamChunks,
    tx: mpsc::Sender<Bytes>,
) {
    let cancel = ctx.cancel.clone();
    let mut failure: Option<ProviderError> = None;
    let mut client_gone = false;
    let mut sent_bytes = 0usize;

    'read: loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => {
                client_gone = true;
                break;
            }
            _ = tx.closed() => {
                client_gone = true;
                break;
            }
            item = upstream.recv() => item,
        };
        let (units, done) = match item {
            Some(Ok(bytes)) => (splitter.push(&bytes), false),
            Some(Err(err)) => {
                failure = Some(ProviderError::Upstream(err.to_string()));
                break;
            }
            None => (splitter.finish(), true),
        };
        for unit in units {
            match chain.run_chunk(&mut ctx, &head, unit).await {
                Ok(Some(out)) => {
                    sent_bytes += out.len();
                    if tx.send(out).await.is_err() {
                        client_gone = true;
                        break 'read;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    failure = Some(err);
                    break 'read;
                }
            }
        }
        if done {
            break;
        }
    }

    if client_gone {
        cancel.cancel();
        drop(upstream);
        tracing::info!(event = "downstream_cancelled", request_id = %ctx.request_id, call_id = %ctx.call_id);
    }
    if let Some(err) = &failure {
        tracing::warn!(
            event = "stream_aborted",
            request_id = %ctx.request_id,
            call_id = %ctx.call_id,
            error = %err,
        );
        ctx.stream_error = Some(err.clone());
    }

    let (tail, complete_error) = chain.run_complete(&mut ctx, &head).await;
    if !client_gone {
        for bytes in tail {
            sent_bytes += bytes.len();
            if tx.send(bytes).await.is_err() {
                break;
            }
        }
        if let Some(err) = failure.or(complete_error) {
            let event = response_failure(&err).sse_event(&ctx.request_id, &ctx.call_id);
            let _ = tx.send(event).await;
        }
    }
    tracing::info!(
        event = "downstream_responded",
        request_id = %ctx.request_id,
        call_id = %ctx.call_id,
        status = head.status,
        stream = true,
        bytes = sent_bytes,
        client_gone,
    );
}

/// Failures after the upstream answered are the gateway's to report as 502.
fn response_failure(err: &ProviderError) -> ProxyError {
    ProxyError::new(StatusCode::BAD_GATEWAY, err.kind(), err.to_string())
}

fn error_response(ctx: &RequestCtx, err: ProxyError) -> GatewayResponse {
    tracing::warn!(
        event = "downstream_responded",
        request_id = %ctx.request_id,
        call_id = %ctx.call_id,
        status = err.status.as_u16(),
        kind = err.kind,
        error = %err.message,
    );
    let mut headers = gateway_headers(ctx, Vec::new());
    header_set(&mut headers, "content-type", "application/json");
    GatewayResponse {
        status: err.status.as_u16(),
        headers,
        body: GatewayBody::Full(err.body(&ctx.request_id, &ctx.call_id)),
    }
}

fn local_response(ctx: &RequestCtx, local: LocalResponse) -> GatewayResponse {
    tracing::info!(
        event = "downstream_responded",
        request_id = %ctx.request_id,
        call_id = %ctx.call_id,
        status = local.status,
        local = true,
    );
    GatewayResponse {
        status: local.status,
        headers: gateway_headers(ctx, local.headers),
        body: GatewayBody::Full(local.body),
    }
}

fn gateway_headers(ctx: &RequestCtx, mut headers: Headers) -> Headers {
    header_set(&mut headers, REQUEST_ID_HEADER, ctx.request_id.as_str());
    header_set(&mut headers, CALL_ID_HEADER, ctx.call_id.as_str());
    if !ctx.body_changes.is_empty()
        && let Some(changes) = changes::encode(&ctx.body_changes)
    {
        header_set(&mut headers, BODY_CHANGES_HEADER, changes);
    }
    headers
}

/// Bearer token first, then `x-api-key`.
fn api_key(headers: &Headers) -> Option<String> {
    if let Some(value) = header_get(headers, "authorization") {
        let value = value.trim();
        if let Some(prefix) = value.get(..7)
            && prefix.eq_ignore_ascii_case("bearer ")
        {
            let token = value[7..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    header_get(headers, "x-api-key")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

fn forwardable(headers: Headers) -> Headers {
    headers
        .into_iter()
        .filter(|(name, _)| {
            !HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
                && !INBOUND_ONLY.iter().any(|h| name.eq_ignore_ascii_case(h))
        })
        .collect()
}

fn strip_response_headers(headers: Headers) -> Headers {
    headers
        .into_iter()
        .filter(|(name, _)| {
            !HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
                && !name.eq_ignore_ascii_case("content-length")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn api_key_prefers_bearer() {
        let h = headers(&[("Authorization", "Bearer sk-1"), ("x-api-key", "sk-2")]);
        assert_eq!(api_key(&h).as_deref(), Some("sk-1"));
        let h = headers(&[("authorization", "Basic abc"), ("X-Api-Key", " sk-2 ")]);
        assert_eq!(api_key(&h).as_deref(), Some("sk-2"));
        assert_eq!(api_key(&headers(&[("authorization", "Bearer ")])), None);
    }

    #[test]
    fn credentials_and_hop_headers_are_not_forwarded() {
        let h = headers(&[
            ("Authorization", "Bearer sk"),
            ("Host", "gateway.local"),
            ("Connection", "keep-alive"),
            ("Content-Length", "12"),
            ("content-type", "application/json"),
            ("anthropic-beta", "tools"),
        ]);
        let out = forwardable(h);
        assert_eq!(
            out,
            headers(&[("content-type", "application/json"), ("anthropic-beta", "tools")])
        );
    }
}
