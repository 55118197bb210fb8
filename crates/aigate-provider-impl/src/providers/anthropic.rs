//! Anthropic Messages API director.

use aigate_protocol::claude::{ANTHROPIC_VERSION, MessagesRequest, MessagesResponse, StreamEvent};
use aigate_protocol::openai::ChatCompletionRequest;
use aigate_protocol::sse::{SseEvent, SseParser, done_event, encode_data};
use aigate_provider_core::api_style::{STYLE_ANTHROPIC, VENDOR_ANTHROPIC};
use aigate_provider_core::{
    Filter, OutboundRequest, ProviderError, ProviderResult, RequestCtx, RequestFilter,
    RequestSignal, ResponseFilter, ResponseHead, SseChunkSplitter, header_remove, header_set,
};
use aigate_transform::ConvertError;
use aigate_transform::claude2openai::{AnthropicStreamState, StreamControl, messages_to_chat};
use aigate_transform::openai2claude::chat_to_messages;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::filters::apply_api_config;

pub const ANTHROPIC_DIRECTOR: &str = "anthropic-director";

const DEFAULT_HOST: &str = "api.anthropic.com";
const DEFAULT_PATH: &str = "/v1/messages";

pub(crate) fn convert_error(err: ConvertError) -> ProviderError {
    ProviderError::InvalidRequest(err.to_string())
}

/// Decodes the canonical chat request and converts it to a Messages request.
pub(crate) fn decode_messages_request(body: &[u8]) -> ProviderResult<MessagesRequest> {
    let chat: ChatCompletionRequest = serde_json::from_slice(body)
        .map_err(|err| ProviderError::InvalidRequest(format!("chat completion request: {err}")))?;
    chat_to_messages(chat).map_err(convert_error)
}

/// Turns Anthropic stream events into `chat.completion.chunk` SSE events.
/// One per stream.
pub(crate) struct ChatStreamConverter {
    state: AnthropicStreamState,
}

impl ChatStreamConverter {
    pub(crate) fn new(ctx: &RequestCtx) -> Self {
        let model = ctx
            .model
            .as_ref()
            .map(|model| model.name.clone())
            .unwrap_or_default();
        Self {
            state: AnthropicStreamState::new(format!("chatcmpl-{}", ctx.call_id), model, ctx.created),
        }
    }

    pub(crate) fn push_event(&mut self, event: StreamEvent, out: &mut BytesMut) -> ProviderResult<()> {
        match self.state.transform_event(event) {
            Some(StreamControl::Chunk(chunk)) => {
                let json = serde_json::to_string(&chunk)
                    .map_err(|err| ProviderError::Upstream(format!("encode chunk: {err}")))?;
                out.extend_from_slice(&encode_data(&json));
                Ok(())
            }
            Some(StreamControl::Error(detail)) => Err(ProviderError::Upstream(format!(
                "{}: {}",
                detail.r#type, detail.message
            ))),
            None => Ok(()),
        }
    }

    pub(crate) fn push_json(&mut self, data: &[u8], out: &mut BytesMut) -> ProviderResult<()> {
        let event: StreamEvent = serde_json::from_slice(data)
            .map_err(|err| ProviderError::Upstream(format!("decode stream event: {err}")))?;
        self.push_event(event, out)
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.state.is_completed()
    }
}

pub(crate) fn truncated_stream() -> ProviderError {
    ProviderError::Upstream("stream ended before message_stop".to_string())
}

pub(crate) fn chat_response_body(body: &[u8], created: i64) -> ProviderResult<Bytes> {
    let response: MessagesResponse = serde_json::from_slice(body)
        .map_err(|err| ProviderError::Upstream(format!("decode messages response: {err}")))?;
    let chat = messages_to_chat(response, created);
    serde_json::to_vec(&chat)
        .map(Bytes::from)
        .map_err(|err| ProviderError::Upstream(format!("encode chat response: {err}")))
}

/// Content type and framing of a translated response.
pub(crate) fn rewrite_response_head(head: &mut ResponseHead, stream: bool) {
    header_remove(&mut head.headers, "content-length");
    header_remove(&mut head.headers, "content-encoding");
    let content_type = if stream {
        "text/event-stream"
    } else {
        "application/json"
    };
    header_set(&mut head.headers, "content-type", content_type);
}

#[derive(Default)]
pub struct AnthropicDirector {
    active: bool,
    parser: SseParser,
    stream: Option<ChatStreamConverter>,
}

impl AnthropicDirector {
    fn enabled(ctx: &RequestCtx) -> bool {
        let Some(config) = ctx.api_config.as_ref() else {
            return false;
        };
        config.style_is(STYLE_ANTHROPIC)
            && (config.api_vendor.is_none() || config.vendor_is(VENDOR_ANTHROPIC))
    }

    fn convert_events(&mut self, events: Vec<SseEvent>, out: &mut BytesMut) -> ProviderResult<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        for event in events {
            if event.data.trim().is_empty() || event.is_done() {
                continue;
            }
            stream.push_json(event.data.as_bytes(), out)?;
        }
        Ok(())
    }
}

impl Filter for AnthropicDirector {
    fn name(&self) -> &str {
        ANTHROPIC_DIRECTOR
    }

    fn as_request_filter(&mut self) -> Option<&mut dyn RequestFilter> {
        Some(self)
    }

    fn as_response_filter(&mut self) -> Option<&mut dyn ResponseFilter> {
        Some(self)
    }
}

#[async_trait]
impl RequestFilter for AnthropicDirector {
    async fn on_request(
        &mut self,
        ctx: &mut RequestCtx,
        req: &mut OutboundRequest,
    ) -> ProviderResult<RequestSignal> {
        if !Self::enabled(ctx) {
            return Ok(RequestSignal::Continue);
        }
        let messages = decode_messages_request(&req.body)?;
        let api_key = ctx.provider()?.api_key.clone();

        req.method = "POST".to_string();
        req.scheme = "https".to_string();
        req.host = DEFAULT_HOST.to_string();
        req.path = DEFAULT_PATH.to_string();
        header_set(&mut req.headers, "anthropic-version", ANTHROPIC_VERSION);
        if !api_key.trim().is_empty() {
            header_set(&mut req.headers, "x-api-key", api_key);
        }
        req.set_json_body(&messages)?;
        if ctx.is_stream {
            header_set(&mut req.headers, "accept", "text/event-stream");
            ctx.chunk_splitter = Some(Box::new(SseChunkSplitter::default()));
        }

        apply_api_config(ctx, req)?;
        Ok(RequestSignal::Continue)
    }
}

#[async_trait]
impl ResponseFilter for AnthropicDirector {
    async fn on_headers(&mut self, ctx: &mut RequestCtx, head: &mut ResponseHead) -> ProviderResult<()> {
        self.active = Self::enabled(ctx) && head.is_success();
        if !self.active {
            return Ok(());
        }
        rewrite_response_head(head, ctx.is_stream);
        if ctx.is_stream {
            self.stream = Some(ChatStreamConverter::new(ctx));
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
        if !self.active {
            return Ok(Some(chunk));
        }
        if self.stream.is_none() {
            return chat_response_body(&chunk, ctx.created).map(Some);
        }
        let events = self.parser.push_bytes(&chunk);
        let mut out = BytesMut::new();
        self.convert_events(events, &mut out)?;
        Ok((!out.is_empty()).then(|| out.freeze()))
    }

    async fn on_complete(&mut self, ctx: &mut RequestCtx, _head: &ResponseHead) -> ProviderResult<Option<Bytes>> {
        if !self.active || self.stream.is_none() || ctx.stream_error.is_some() {
            return Ok(None);
        }
        let mut out = BytesMut::new();
        let trailing = self.parser.finish();
        self.convert_events(trailing, &mut out)?;
        if !self.stream.as_ref().is_some_and(ChatStreamConverter::is_completed) {
            return Err(truncated_stream());
        }
        out.extend_from_slice(&done_event());
        Ok(Some(out.freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ctx_with, model, provider};
    use aigate_provider_core::header_get;
    use serde_json::{Value, json};

    fn anthropic_ctx(api: Value) -> RequestCtx {
        ctx_with(provider(Value::Null, api), model("claude-sonnet-4-5", Value::Null))
    }

    fn chat_request(body: Value) -> OutboundRequest {
        OutboundRequest {
            method: "POST".into(),
            scheme: String::new(),
            host: String::new(),
            path: "/v1/chat/completions".into(),
            query: Vec::new(),
            headers: vec![("content-type".into(), "application/json".into())],
            body: Bytes::from(serde_json::to_vec(&body).unwrap()),
        }
    }

    #[tokio::test]
    async fn builds_messages_request_with_defaults() {
        let mut ctx = anthropic_ctx(json!({
            "api_style": "anthropic-compatible",
            "api_vendor": "anthropic",
            "directives": {"*:*": {"headers": {"anthropic-beta": {"op": "set", "values": ["tools-2024"]}}}}
        }));
        let mut req = chat_request(json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"}
            ],
            "max_tokens": 256,
            "stop": "END",
            "tool_choice": "required",
            "tools": [{"type": "function", "function": {"name": "f", "parameters": {"type": "object"}}}]
        }));

        let mut director = AnthropicDirector::default();
        director.on_request(&mut ctx, &mut req).await.unwrap();

        assert_eq!(req.url().unwrap(), "https://api.anthropic.com/v1/messages");
        assert_eq!(header_get(&req.headers, "x-api-key"), Some("sk-test"));
        assert_eq!(header_get(&req.headers, "anthropic-version"), Some("2023-06-01"));
        assert_eq!(header_get(&req.headers, "anthropic-beta"), Some("tools-2024"));
        let body: Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["stop_sequences"], json!(["END"]));
        assert_eq!(body["tool_choice"], json!({"type": "any"}));
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[tokio::test]
    async fn bedrock_vendor_is_not_handled_here() {
        let mut ctx = anthropic_ctx(json!({
            "api_style": "anthropic-compatible",
            "api_vendor": "aws-bedrock",
            "directives": {"*:*": {}}
        }));
        let mut req = chat_request(json!({"model": "x", "messages": []}));
        AnthropicDirector::default().on_request(&mut ctx, &mut req).await.unwrap();
        assert!(req.host.is_empty());
    }

    #[tokio::test]
    async fn converts_non_streamed_response() {
        let mut ctx = anthropic_ctx(json!({"api_style": "anthropic-compatible", "directives": {"*:*": {}}}));
        let mut director = AnthropicDirector::default();
        let mut head = ResponseHead {
            status: 200,
            headers: vec![("content-type".into(), "application/json".into()), ("content-length".into(), "10".into())],
        };
        director.on_headers(&mut ctx, &mut head).await.unwrap();
        assert_eq!(header_get(&head.headers, "content-length"), None);

        let upstream = json!({
            "id": "msg_1", "type": "message", "role": "assistant", "model": "claude-sonnet-4-5",
            "content": [{"type": "text", "text": "hello"}],
            "stop_reason": "max_tokens",
            "usage": {"input_tokens": 5, "output_tokens": 7}
        });
        let out = director
            .on_body_chunk(&mut ctx, &head, Bytes::from(upstream.to_string()), 0)
            .await
            .unwrap()
            .unwrap();
        let chat: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(chat["choices"][0]["message"]["content"], "hello");
        assert_eq!(chat["choices"][0]["finish_reason"], "length");
        assert_eq!(chat["usage"]["total_tokens"], 12);
        assert!(director.on_complete(&mut ctx, &head).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn streams_chunks_and_terminates_with_done() {
        let mut ctx = anthropic_ctx(json!({"api_style": "anthropic-compatible", "directives": {"*:*": {}}}));
        ctx.is_stream = true;
        let mut director = AnthropicDirector::default();
        let mut head = ResponseHead { status: 200, headers: Vec::new() };
        director.on_headers(&mut ctx, &mut head).await.unwrap();
        assert_eq!(header_get(&head.headers, "content-type"), Some("text/event-stream"));

        let events = [
            json!({"type": "message_start", "message": {"id": "msg_1", "model": "claude-sonnet-4-5", "role": "assistant", "content": [], "usage": {"input_tokens": 3, "output_tokens": 1}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hel"}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "lo"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 4}}),
            json!({"type": "message_stop"}),
        ];
        let mut text = String::new();
        let mut last = Value::Null;
        for (index, event) in events.iter().enumerate() {
            let frame = format!("event: {}\ndata: {}\n\n", event["type"].as_str().unwrap(), event);
            if let Some(out) = director
                .on_body_chunk(&mut ctx, &head, Bytes::from(frame), index)
                .await
                .unwrap()
            {
                for line in std::str::from_utf8(&out).unwrap().lines() {
                    let Some(data) = line.strip_prefix("data: ") else { continue };
                    let chunk: Value = serde_json::from_str(data).unwrap();
                    if let Some(content) = chunk["choices"][0]["delta"]["content"].as_str() {
                        text.push_str(content);
                    }
                    last = chunk;
                }
            }
        }
        assert_eq!(text, "Hello");
        assert_eq!(last["usage"]["total_tokens"], 7);

        let tail = director.on_complete(&mut ctx, &head).await.unwrap().unwrap();
        assert_eq!(&tail[..], b"data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn stream_without_message_stop_fails_instead_of_done() {
        let mut ctx = anthropic_ctx(json!({"api_style": "anthropic-compatible", "directives": {"*:*": {}}}));
        ctx.is_stream = true;
        let mut director = AnthropicDirector::default();
        let mut head = ResponseHead { status: 200, headers: Vec::new() };
        director.on_headers(&mut ctx, &mut head).await.unwrap();

        let events = [
            json!({"type": "message_start", "message": {"id": "msg_1", "model": "claude-sonnet-4-5", "role": "assistant", "content": [], "usage": {"input_tokens": 3, "output_tokens": 1}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hel"}}),
        ];
        for (index, event) in events.iter().enumerate() {
            let frame = format!("event: {}\ndata: {}\n\n", event["type"].as_str().unwrap(), event);
            director.on_body_chunk(&mut ctx, &head, Bytes::from(frame), index).await.unwrap();
        }

        let err = director.on_complete(&mut ctx, &head).await.unwrap_err();
        assert!(matches!(err, ProviderError::Upstream(_)));
        assert!(err.to_string().contains("message_stop"));
    }

    #[tokio::test]
    async fn error_event_fails_the_stream_and_suppresses_done() {
        let mut ctx = anthropic_ctx(json!({"api_style": "anthropic-compatible", "directives": {"*:*": {}}}));
        ctx.is_stream = true;
        let mut director = AnthropicDirector::default();
        let mut head = ResponseHead { status: 200, headers: Vec::new() };
        director.on_headers(&mut ctx, &mut head).await.unwrap();

        let frame = "event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n";
        let err = director
            .on_body_chunk(&mut ctx, &head, Bytes::from(frame), 0)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("overloaded_error"));

        ctx.stream_error = Some(err);
        assert!(director.on_complete(&mut ctx, &head).await.unwrap().is_none());
    }
}
