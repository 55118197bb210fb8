//! Vendor jobs that answer a submit with a task id instead of a result, as
//! asynchronous speech synthesis does. The submit response is replaced by the
//! task's final result, fetched by polling the vendor's status endpoint with
//! exponential backoff.
//!
//! The filter must sit after the directors in the request chain: it records
//! the outbound target they produced and polls the same host with the same
//! credentials.

use std::sync::Arc;
use std::time::Duration;

use aigate_provider_core::{
    Attempt, BackoffConfig, Filter, OutboundRequest, PollError, ProviderError, ProviderResult,
    RequestCtx, RequestFilter, RequestSignal, ResponseFilter, ResponseHead, header_remove,
    header_set, poll,
};
use aigate_transform::template::resolve;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::http_client::{AuxiliaryClient, check_asset_url};

pub const ASYNC_TASK_FILTER: &str = "async-task";

/// Model, then provider metadata key holding an [`AsyncTaskConfig`].
const METADATA_KEY: &str = "async_task";
/// Not carried over from the submit request to status checks.
const SUBMIT_ONLY_HEADERS: [&str; 5] = [
    "content-type",
    "content-length",
    "transfer-encoding",
    "accept-encoding",
    "host",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultEncoding {
    /// The result value is returned as JSON.
    #[default]
    Json,
    /// The result is a base64 string, returned decoded.
    Base64,
    /// The result is a URL, downloaded and returned.
    Url,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Zero polls until the client goes away.
    pub timeout_ms: u64,
    pub multiplier: f64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            initial_interval_ms: 500,
            max_interval_ms: 5_000,
            timeout_ms: 120_000,
            multiplier: 2.0,
        }
    }
}

impl PollSettings {
    fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_interval: Duration::from_millis(self.initial_interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms),
            timeout: Some(Duration::from_millis(self.timeout_ms)),
            multiplier: self.multiplier,
        }
    }
}

/// Where a vendor puts the task id, status and result. Fields holding
/// locations are JSON pointers (`/data/task_id`).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AsyncTaskConfig {
    pub task_id: String,
    /// Templated; `${@task.id}` is the submitted task's id.
    pub status_path: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default = "default_done")]
    pub done: Vec<String>,
    #[serde(default = "default_failed")]
    pub failed: Vec<String>,
    /// The whole final status body when absent.
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub result_encoding: ResultEncoding,
    #[serde(default)]
    pub content_type: Option<String>,
    /// Vendor failure message.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub poll: PollSettings,
}

fn default_status() -> String {
    "/status".to_string()
}

fn default_done() -> Vec<String> {
    vec!["succeeded".to_string(), "success".to_string(), "completed".to_string()]
}

fn default_failed() -> Vec<String> {
    vec!["failed".to_string(), "error".to_string(), "cancelled".to_string()]
}

impl AsyncTaskConfig {
    pub fn from_value(value: &Value) -> ProviderResult<Option<Self>> {
        if value.is_null() {
            return Ok(None);
        }
        let config: Self = serde_json::from_value(value.clone())
            .map_err(|err| ProviderError::InvalidConfig(format!("async task config: {err}")))?;
        for (field, pointer) in [("task_id", Some(&config.task_id)), ("status", Some(&config.status))]
            .into_iter()
            .chain([("result", config.result.as_ref()), ("error", config.error.as_ref())])
        {
            if let Some(pointer) = pointer
                && !pointer.starts_with('/')
            {
                return Err(ProviderError::InvalidConfig(format!(
                    "async task config: {field} must be a JSON pointer, got {pointer:?}"
                )));
            }
        }
        if config.status_path.trim().is_empty() {
            return Err(ProviderError::InvalidConfig(
                "async task config: status_path is empty".to_string(),
            ));
        }
        Ok(Some(config))
    }

    fn response_content_type(&self) -> &str {
        match (&self.content_type, self.result_encoding) {
            (Some(content_type), _) => content_type,
            (None, ResultEncoding::Json) => "application/json",
            (None, _) => "application/octet-stream",
        }
    }

    fn state(&self, body: &Value) -> TaskState {
        let Some(status) = body.pointer(&self.status).and_then(status_text) else {
            return TaskState::Running;
        };
        let matches = |values: &[String]| values.iter().any(|value| value.eq_ignore_ascii_case(&status));
        if matches(&self.done) {
            TaskState::Done
        } else if matches(&self.failed) {
            let message = self
                .error
                .as_deref()
                .and_then(|pointer| body.pointer(pointer))
                .and_then(status_text)
                .unwrap_or_else(|| status.clone());
            TaskState::Failed(message)
        } else {
            TaskState::Running
        }
    }
}

fn status_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()).filter(|text| !text.is_empty()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[derive(Debug, PartialEq)]
enum TaskState {
    Running,
    Done,
    Failed(String),
}

struct ActiveTask {
    config: AsyncTaskConfig,
    /// The submit request as the directors left it, body dropped.
    target: OutboundRequest,
    polling: bool,
}

pub struct AsyncTaskFilter {
    client: Arc<dyn AuxiliaryClient>,
    route_config: Option<AsyncTaskConfig>,
    task: Option<ActiveTask>,
}

impl AsyncTaskFilter {
    /// `config` is the route-level default; model and provider metadata
    /// override it per request.
    pub fn new(client: Arc<dyn AuxiliaryClient>, config: &Value) -> ProviderResult<Self> {
        Ok(Self {
            client,
            route_config: AsyncTaskConfig::from_value(config)?,
            task: None,
        })
    }

    fn config_for(&self, ctx: &RequestCtx) -> ProviderResult<Option<AsyncTaskConfig>> {
        let from_metadata = [
            ctx.model.as_ref().map(|model| &model.metadata),
            ctx.provider.as_ref().map(|provider| &provider.metadata),
        ]
        .into_iter()
        .flatten()
        .find_map(|metadata| metadata.get(METADATA_KEY));
        match from_metadata {
            Some(value) => AsyncTaskConfig::from_value(value),
            None => Ok(self.route_config.clone()),
        }
    }

    async fn resolve_task(
        &self,
        ctx: &mut RequestCtx,
        task: &ActiveTask,
        submitted: Value,
    ) -> ProviderResult<Bytes> {
        let config = &task.config;
        let task_id = submitted
            .pointer(&config.task_id)
            .and_then(status_text)
            .ok_or_else(|| {
                ProviderError::Upstream(format!("submit response has no task id at {}", config.task_id))
            })?;
        tracing::info!(
            event = "async_task_submitted",
            request_id = %ctx.request_id,
            call_id = %ctx.call_id,
            task_id = %task_id,
        );

        let finished = match config.state(&submitted) {
            TaskState::Done => submitted,
            TaskState::Failed(message) => return Err(task_failed(&task_id, &message)),
            TaskState::Running => {
                ctx.set_template_var("task", "id", task_id.clone());
                let mut status = task.target.clone();
                status.method = "GET".to_string();
                let resolved = resolve(&config.status_path, &ctx.object_graph())?;
                match resolved.split_once('?') {
                    Some((path, query)) => {
                        status.path = path.to_string();
                        status.query = serde_urlencoded::from_str(query).map_err(|err| {
                            ProviderError::InvalidConfig(format!("status path query: {err}"))
                        })?;
                    }
                    None => {
                        status.path = resolved;
                        status.query.clear();
                    }
                }
                let url = status.url()?;

                let started = Instant::now();
                let client = self.client.as_ref();
                let headers = status.headers.as_slice();
                let url = url.as_str();
                let id = task_id.as_str();
                poll(&ctx.cancel, &config.poll.backoff(), move || {
                    check_status(client, url, headers, config, id)
                })
                .await
                .map_err(|err| match err {
                    PollError::Failed(err) => err,
                    PollError::Timeout => ProviderError::Upstream(format!(
                        "task {task_id} did not finish within {}ms",
                        config.poll.timeout_ms
                    )),
                    PollError::Cancelled => {
                        ProviderError::Upstream(format!("task {task_id} polling cancelled"))
                    }
                })
                .inspect(|_| {
                    tracing::info!(
                        event = "async_task_completed",
                        request_id = %ctx.request_id,
                        call_id = %ctx.call_id,
                        task_id = %task_id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                    );
                })?
            }
        };
        self.task_result(config, &finished).await
    }

    async fn task_result(&self, config: &AsyncTaskConfig, finished: &Value) -> ProviderResult<Bytes> {
        let value = match &config.result {
            Some(pointer) => finished.pointer(pointer).ok_or_else(|| {
                ProviderError::Upstream(format!("finished task has no result at {pointer}"))
            })?,
            None => finished,
        };
        match config.result_encoding {
            ResultEncoding::Json => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|err| ProviderError::Upstream(format!("encode task result: {err}"))),
            ResultEncoding::Base64 => {
                let text = value.as_str().ok_or_else(|| {
                    ProviderError::Upstream("task result is not a base64 string".to_string())
                })?;
                STANDARD
                    .decode(text.trim())
                    .map(Bytes::from)
                    .map_err(|err| ProviderError::Upstream(format!("decode task result: {err}")))
            }
            ResultEncoding::Url => {
                let url = value.as_str().ok_or_else(|| {
                    ProviderError::Upstream("task result is not a URL".to_string())
                })?;
                check_asset_url(url)?;
                Ok(self.client.fetch(url).await?.data)
            }
        }
    }
}

fn task_failed(task_id: &str, message: &str) -> ProviderError {
    ProviderError::Upstream(format!("task {task_id} failed: {message}"))
}

async fn check_status(
    client: &dyn AuxiliaryClient,
    url: &str,
    headers: &[(String, String)],
    config: &AsyncTaskConfig,
    task_id: &str,
) -> Attempt<Value, ProviderError> {
    let response = match client.get(url, headers).await {
        Ok(response) => response,
        Err(err) => return Attempt::Done(Err(err)),
    };
    match response.status {
        200..=299 => {}
        // Not visible yet, throttled, or a vendor hiccup.
        404 | 429 | 500..=599 => return Attempt::Pending,
        status => {
            return Attempt::Done(Err(ProviderError::Upstream(format!(
                "task status {status}: {}",
                String::from_utf8_lossy(&response.body)
            ))));
        }
    }
    let body: Value = match serde_json::from_slice(&response.body) {
        Ok(body) => body,
        Err(err) => {
            return Attempt::Done(Err(ProviderError::Upstream(format!(
                "decode task status: {err}"
            ))));
        }
    };
    match config.state(&body) {
        TaskState::Running => Attempt::Pending,
        TaskState::Done => Attempt::Done(Ok(body)),
        TaskState::Failed(message) => Attempt::Done(Err(task_failed(task_id, &message))),
    }
}

impl Filter for AsyncTaskFilter {
    fn name(&self) -> &str {
        ASYNC_TASK_FILTER
    }

    fn as_request_filter(&mut self) -> Option<&mut dyn RequestFilter> {
        Some(self)
    }

    fn as_response_filter(&mut self) -> Option<&mut dyn ResponseFilter> {
        Some(self)
    }
}

#[async_trait]
impl RequestFilter for AsyncTaskFilter {
    async fn on_request(
        &mut self,
        ctx: &mut RequestCtx,
        req: &mut OutboundRequest,
    ) -> ProviderResult<RequestSignal> {
        let Some(config) = self.config_for(ctx)? else {
            return Ok(RequestSignal::Continue);
        };
        if ctx.is_stream {
            return Err(ProviderError::InvalidRequest(
                "asynchronous tasks cannot be streamed".to_string(),
            ));
        }
        let mut target = req.clone();
        target.body = Bytes::new();
        for name in SUBMIT_ONLY_HEADERS {
            header_remove(&mut target.headers, name);
        }
        header_set(&mut target.headers, "accept", "application/json");
        self.task = Some(ActiveTask {
            config,
            target,
            polling: false,
        });
        Ok(RequestSignal::Continue)
    }
}

#[async_trait]
impl ResponseFilter for AsyncTaskFilter {
    async fn on_headers(&mut self, _ctx: &mut RequestCtx, head: &mut ResponseHead) -> ProviderResult<()> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        task.polling = head.is_success();
        if task.polling {
            header_remove(&mut head.headers, "content-length");
            header_remove(&mut head.headers, "content-encoding");
            header_set(&mut head.headers, "content-type", task.config.response_content_type());
        }
        Ok(())
    }

    async fn on_body_chunk(
        &mut self,
        ctx: &mut RequestCtx,
        _head: &ResponseHead,
        chunk: Bytes,
        _index: usize,
    ) -> ProviderResult<Option<Bytes>> {
        let Some(task) = self.task.take_if(|task| task.polling) else {
            return Ok(Some(chunk));
        };
        let submitted: Value = serde_json::from_slice(&chunk)
            .map_err(|err| ProviderError::Upstream(format!("decode submit response: {err}")))?;
        self.resolve_task(ctx, &task, submitted).await.map(Some)
    }
}
