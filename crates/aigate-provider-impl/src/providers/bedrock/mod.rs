//! AWS Bedrock `InvokeModel` director for Anthropic models.

mod sigv4;

use std::sync::Arc;

use aigate_protocol::claude::{
    BEDROCK_ANTHROPIC_VERSION, ContentBlock, ImageSource, MessagesRequest, ToolResultContent,
};
use aigate_protocol::eventstream::{EventStreamDecoder, EventStreamMessage};
use aigate_protocol::sse::done_event;
use aigate_provider_core::api_style::{STYLE_ANTHROPIC, VENDOR_BEDROCK};
use aigate_provider_core::{
    EventStreamChunkSplitter, Filter, OutboundRequest, ProviderError, ProviderResult, RequestCtx,
    RequestFilter, RequestSignal, ResponseFilter, ResponseHead, header_set,
};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::{Bytes, BytesMut};
use serde::Deserialize;

pub use sigv4::{SigV4Headers, SigV4Output, SigV4Signer, SigV4Timestamp, SigningError};

use crate::filters::apply_api_config;
use crate::http_client::{AuxiliaryClient, check_asset_url};
use crate::providers::anthropic::{
    ChatStreamConverter, chat_response_body, decode_messages_request, rewrite_response_head,
    truncated_stream,
};

pub const BEDROCK_DIRECTOR: &str = "bedrock-director";

const SERVICE: &str = "bedrock";
const DEFAULT_REGION: &str = "us-east-1";
const INVOKE_SUFFIX: &str = "/invoke";
const INVOKE_STREAM_SUFFIX: &str = "/invoke-with-response-stream";
const EVENTSTREAM_CONTENT_TYPE: &str = "application/vnd.amazon.eventstream";
/// Headers that survive into the signed request; everything else is dropped.
const SIGNED_SAFELIST: [&str; 2] = ["content-type", "accept"];

#[derive(Debug, Clone)]
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
    region: String,
}

impl AwsCredentials {
    fn from_ctx(ctx: &RequestCtx) -> ProviderResult<Self> {
        let provider = ctx.provider()?;
        Ok(Self {
            access_key_id: provider
                .metadata_str("access_key_id")
                .ok_or(ProviderError::MissingCredentialField("access_key_id"))?
                .to_string(),
            secret_access_key: provider
                .metadata_str("secret_access_key")
                .ok_or(ProviderError::MissingCredentialField("secret_access_key"))?
                .to_string(),
            session_token: provider.metadata_str("session_token").map(str::to_string),
            region: provider
                .metadata_str("region")
                .unwrap_or(DEFAULT_REGION)
                .to_string(),
        })
    }

    fn signer(&self) -> ProviderResult<SigV4Signer> {
        SigV4Signer::new(
            &self.access_key_id,
            &self.secret_access_key,
            self.session_token.clone(),
            &self.region,
            SERVICE,
        )
        .map_err(signing_error)
    }
}

fn signing_error(err: SigningError) -> ProviderError {
    match err {
        SigningError::MissingField(field) => ProviderError::MissingCredentialField(field),
        other => ProviderError::Signing(other.to_string()),
    }
}

/// Keeps the safelisted headers and signs the request as it will be sent.
pub fn sign_request(
    req: &mut OutboundRequest,
    signer: &SigV4Signer,
    timestamp: SigV4Timestamp,
) -> ProviderResult<()> {
    req.headers.retain(|(name, _)| {
        SIGNED_SAFELIST
            .iter()
            .any(|allowed| name.eq_ignore_ascii_case(allowed))
    });
    let url = req.url()?;
    let signed = signer
        .sign(&req.method, &url, &req.headers, &req.body, timestamp)
        .map_err(signing_error)?;
    for (name, value) in signed.headers.into_pairs() {
        header_set(&mut req.headers, name, value);
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct PayloadPart {
    bytes: String,
}

pub struct BedrockDirector {
    assets: Arc<dyn AuxiliaryClient>,
    active: bool,
    decoder: EventStreamDecoder,
    stream: Option<ChatStreamConverter>,
}

impl BedrockDirector {
    pub fn new(assets: Arc<dyn AuxiliaryClient>) -> Self {
        Self {
            assets,
            active: false,
            decoder: EventStreamDecoder::new(),
            stream: None,
        }
    }

    fn enabled(ctx: &RequestCtx) -> bool {
        ctx.style_is(STYLE_ANTHROPIC) && ctx.vendor_is(VENDOR_BEDROCK)
    }

    async fn inline_image(&self, source: &mut ImageSource) -> ProviderResult<()> {
        let ImageSource::Url { url } = source else {
            return Ok(());
        };
        check_asset_url(url)?;
        let asset = self.assets.fetch(url).await?;
        let media_type = asset
            .content_type
            .as_deref()
            .and_then(|value| value.split(';').next())
            .map(str::trim)
            .filter(|value| value.starts_with("image/"))
            .or_else(|| media_type_from_url(url))
            .ok_or_else(|| {
                ProviderError::InvalidRequest(format!("{url} is not a supported image"))
            })?
            .to_string();
        *source = ImageSource::Base64 {
            media_type,
            data: STANDARD.encode(&asset.data),
        };
        Ok(())
    }

    async fn inline_images(&self, request: &mut MessagesRequest) -> ProviderResult<()> {
        for message in &mut request.messages {
            for block in &mut message.content {
                match block {
                    ContentBlock::Image { source } => self.inline_image(source).await?,
                    ContentBlock::ToolResult {
                        content: ToolResultContent::Blocks(blocks),
                        ..
                    } => {
                        for nested in blocks {
                            if let ContentBlock::Image { source } = nested {
                                self.inline_image(source).await?;
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn decode_frames(&mut self, chunk: &[u8]) -> ProviderResult<Bytes> {
        self.decoder.push(chunk);
        let mut out = BytesMut::new();
        while let Some(message) = self.decoder.next_message() {
            let message = message
                .map_err(|err| ProviderError::Upstream(format!("bedrock event stream: {err}")))?;
            self.handle_message(message, &mut out)?;
        }
        Ok(out.freeze())
    }

    fn handle_message(&mut self, message: EventStreamMessage, out: &mut BytesMut) -> ProviderResult<()> {
        match message.message_type() {
            "event" => {
                if message.payload.is_empty() {
                    return Ok(());
                }
                let part: PayloadPart = serde_json::from_slice(&message.payload)
                    .map_err(|err| ProviderError::Upstream(format!("bedrock payload: {err}")))?;
                let event = STANDARD
                    .decode(part.bytes.as_bytes())
                    .map_err(|err| ProviderError::Upstream(format!("bedrock payload bytes: {err}")))?;
                match self.stream.as_mut() {
                    Some(stream) => stream.push_json(&event, out),
                    None => Ok(()),
                }
            }
            _ => {
                let kind = message
                    .header(":exception-type")
                    .or_else(|| message.header(":error-code"))
                    .unwrap_or("exception")
                    .to_string();
                Err(ProviderError::Upstream(format!(
                    "{kind}: {}",
                    String::from_utf8_lossy(&message.payload)
                )))
            }
        }
    }
}

fn media_type_from_url(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    let ext = path.rsplit('.').next()?;
    match ext {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

impl Filter for BedrockDirector {
    fn name(&self) -> &str {
        BEDROCK_DIRECTOR
    }

    fn as_request_filter(&mut self) -> Option<&mut dyn RequestFilter> {
        Some(self)
    }

    fn as_response_filter(&mut self) -> Option<&mut dyn ResponseFilter> {
        Some(self)
    }
}

#[async_trait]
impl RequestFilter for BedrockDirector {
    async fn on_request(
        &mut self,
        ctx: &mut RequestCtx,
        req: &mut OutboundRequest,
    ) -> ProviderResult<RequestSignal> {
        if !Self::enabled(ctx) {
            return Ok(RequestSignal::Continue);
        }
        let credentials = AwsCredentials::from_ctx(ctx)?;
        let signer = credentials.signer()?;
        let model_name = ctx.model()?.name.clone();

        let mut messages = decode_messages_request(&req.body)?;
        messages.model = None;
        messages.stream = None;
        messages.anthropic_version = Some(BEDROCK_ANTHROPIC_VERSION.to_string());
        self.inline_images(&mut messages).await?;

        req.method = "POST".to_string();
        req.scheme = "https".to_string();
        req.host = format!("bedrock-runtime.{}.amazonaws.com", credentials.region);
        req.path = format!("/model/{}{INVOKE_SUFFIX}", urlencoding::encode(&model_name));
        req.set_json_body(&messages)?;

        apply_api_config(ctx, req)?;

        if ctx.is_stream {
            if let Some(base) = req.path.strip_suffix(INVOKE_SUFFIX) {
                req.path = format!("{base}{INVOKE_STREAM_SUFFIX}");
            }
            header_set(&mut req.headers, "accept", EVENTSTREAM_CONTENT_TYPE);
            ctx.chunk_splitter = Some(Box::new(EventStreamChunkSplitter::default()));
        } else {
            header_set(&mut req.headers, "accept", "application/json");
        }

        // Signing covers the transmitted bytes, so it runs after every body edit.
        sign_request(req, &signer, SigV4Timestamp::now().map_err(signing_error)?)?;

        tracing::debug!(
            event = "bedrock_request_signed",
            request_id = %ctx.request_id,
            call_id = %ctx.call_id,
            region = %credentials.region,
            path = %req.path,
        );
        Ok(RequestSignal::Continue)
    }
}

#[async_trait]
impl ResponseFilter for BedrockDirector {
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
        let out = self.decode_frames(&chunk)?;
        Ok((!out.is_empty()).then_some(out))
    }

    async fn on_complete(&mut self, ctx: &mut RequestCtx, _head: &ResponseHead) -> ProviderResult<Option<Bytes>> {
        if !self.active || self.stream.is_none() || ctx.stream_error.is_some() {
            return Ok(None);
        }
        if self.decoder.buffered() > 0 {
            return Err(ProviderError::Upstream(
                "bedrock event stream ended inside a frame".to_string(),
            ));
        }
        if !self.stream.as_ref().is_some_and(ChatStreamConverter::is_completed) {
            tracing::warn!(
                event = "bedrock_stream_truncated",
                request_id = %ctx.request_id,
                call_id = %ctx.call_id,
            );
            return Err(truncated_stream());
        }
        Ok(Some(done_event()))
    }
}
