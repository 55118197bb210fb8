use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use aigate_provider_core::Headers;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use wreq::{Client, Method, Proxy};

/// The request as it leaves the gateway.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Bytes,
    /// A successful response is handed back as a stream instead of buffered.
    pub is_stream: bool,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("no data from upstream within the idle timeout")]
    IdleTimeout,
    #[error("upstream body: {0}")]
    Body(String),
    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
    #[error("upstream transport: {0}")]
    Other(String),
}

pub type UpstreamChunks = mpsc::Receiver<Result<Bytes, UpstreamError>>;

pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(UpstreamChunks),
}

pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    /// Drains a streamed body; used for error responses.
    pub async fn into_bytes(self) -> Result<Bytes, UpstreamError> {
        match self.body {
            UpstreamBody::Bytes(bytes) => Ok(bytes),
            UpstreamBody::Stream(mut rx) => {
                let mut out = Vec::new();
                while let Some(chunk) = rx.recv().await {
                    out.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(out))
            }
        }
    }
}

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, UpstreamError>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(600),
            stream_idle_timeout: Duration::from_secs(120),
        }
    }
}

/// Headers wreq derives from the URL and body itself.
const SKIPPED_HEADERS: [&str; 2] = ["host", "content-length"];

#[derive(Clone)]
pub struct WreqUpstreamClient {
    client: Client,
    stream_idle_timeout: Duration,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, wreq::Error> {
        let proxy = normalize_proxy(config.proxy.clone());
        Ok(Self {
            client: build_client(&config, proxy.as_deref())?,
            stream_idle_timeout: config.stream_idle_timeout,
        })
    }
}

fn normalize_proxy(value: Option<String>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

fn build_client(config: &UpstreamClientConfig, proxy: Option<&str>) -> Result<Client, wreq::Error> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .read_timeout(config.stream_idle_timeout);

    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy)?);
    }

    builder.build()
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, UpstreamError>> + Send + 'a>> {
        Box::pin(async move {
            let method = Method::from_bytes(req.method.as_bytes())
                .map_err(|err| UpstreamError::InvalidRequest(err.to_string()))?;
            let mut builder = self.client.request(method, &req.url);
            for (name, value) in &req.headers {
                if SKIPPED_HEADERS
                    .iter()
                    .any(|skipped| name.eq_ignore_ascii_case(skipped))
                {
                    continue;
                }
                builder = builder.header(name.as_str(), value.as_str());
            }
            if !req.body.is_empty() {
                builder = builder.body(req.body);
            }

            let resp = builder.send().await.map_err(map_wreq_error)?;
            convert_response(resp, req.is_stream, self.stream_idle_timeout).await
        })
    }
}

async fn convert_response(
    resp: wreq::Response,
    want_stream: bool,
    stream_idle_timeout: Duration,
) -> Result<UpstreamResponse, UpstreamError> {
    let status = resp.status().as_u16();
    let headers = headers_from_wreq(resp.headers());

    let is_success = (200..300).contains(&status);
    if !is_success || !want_stream {
        let body = resp.bytes().await.map_err(map_wreq_error)?;
        return Ok(UpstreamResponse {
            status,
            headers,
            body: UpstreamBody::Bytes(body),
        });
    }

    let (tx, rx) = mpsc::channel::<Result<Bytes, UpstreamError>>(16);
    tokio::spawn(async move {
        let mut stream = resp.bytes_stream();
        loop {
            let item = tokio::select! {
                _ = tx.closed() => break,
                next = tokio::time::timeout(stream_idle_timeout, stream.next()) => next,
            };
            let message = match item {
                Err(_) => Err(UpstreamError::IdleTimeout),
                Ok(None) => break,
                Ok(Some(Ok(chunk))) => Ok(chunk),
                Ok(Some(Err(err))) => Err(UpstreamError::Body(err.to_string())),
            };
            let failed = message.is_err();
            if tx.send(message).await.is_err() || failed {
                break;
            }
        }
    });

    Ok(UpstreamResponse {
        status,
        headers,
        body: UpstreamBody::Stream(rx),
    })
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (k, v) in map {
        if let Ok(s) = v.to_str() {
            out.push((k.as_str().to_string(), s.to_string()));
        }
    }
    out
}

fn map_wreq_error(err: wreq::Error) -> UpstreamError {
    let message = err.to_string();
    if err.is_timeout() {
        return UpstreamError::Timeout(message);
    }
    if err.is_connect() || err.is_connection_reset() {
        return UpstreamError::Connect(message);
    }
    UpstreamError::Other(message)
}
