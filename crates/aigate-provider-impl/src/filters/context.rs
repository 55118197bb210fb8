//! Resolves the model and provider a request targets and derives the
//! effective API-style config from them.

use std::sync::Arc;

use aigate_provider_core::{
    Filter, ModelCatalog, ModelSelector, OutboundRequest, ProviderError, ProviderResult,
    RequestCtx, RequestFilter, RequestSignal, header_get, merge,
};
use aigate_transform::body::is_json_content_type;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::form::{form_text_field, replace_form_text_field};

pub const CONTEXT_FILTER: &str = "context";

const MODEL_ID_HEADER: &str = "x-ai-proxy-model-id";
const MODEL_HEADER: &str = "x-ai-proxy-model";
const MODEL_NAME_HEADER: &str = "x-ai-proxy-model-name";
/// Gateway control headers are never forwarded upstream.
const CONTROL_HEADER_PREFIX: &str = "x-ai-proxy-";

pub struct ContextFilter {
    catalog: Arc<dyn ModelCatalog>,
}

impl ContextFilter {
    pub fn new(catalog: Arc<dyn ModelCatalog>) -> Self {
        Self { catalog }
    }
}

impl Filter for ContextFilter {
    fn name(&self) -> &str {
        CONTEXT_FILTER
    }

    fn as_request_filter(&mut self) -> Option<&mut dyn RequestFilter> {
        Some(self)
    }
}

#[async_trait]
impl RequestFilter for ContextFilter {
    async fn on_request(
        &mut self,
        ctx: &mut RequestCtx,
        req: &mut OutboundRequest,
    ) -> ProviderResult<RequestSignal> {
        let mut json_body = parse_json_body(req)?;
        let selector = find_selector(ctx, req, json_body.as_ref())?
            .ok_or_else(|| ProviderError::InvalidRequest("model is required".to_string()))?;
        req.headers
            .retain(|(name, _)| !name.to_ascii_lowercase().starts_with(CONTROL_HEADER_PREFIX));

        let client = ctx.client()?.clone();
        let (model, provider) = self
            .catalog
            .find_model(&client, &selector)
            .await
            .ok_or_else(|| {
                ProviderError::NotFound(format!("model {:?} not found", selector.as_str()))
            })?;

        if let Some(object) = json_body.as_mut().and_then(Value::as_object_mut) {
            ctx.is_stream = object.get("stream").and_then(Value::as_bool).unwrap_or(false);
            if object.contains_key("model") {
                object.insert("model".to_string(), Value::String(model.name.clone()));
                let encoded = serde_json::to_vec(object)
                    .map_err(|err| ProviderError::InvalidConfig(format!("encode body: {err}")))?;
                req.body = Bytes::from(encoded);
            }
        } else {
            if let Some(stream) = form_text_field(req.content_type(), &req.body, "stream")? {
                ctx.is_stream = matches!(stream.trim(), "true" | "1");
            }
            if let Some(body) =
                replace_form_text_field(req.content_type(), &req.body, "model", &model.name)?
            {
                req.body = body;
            }
        }

        let config = merge(
            &ctx.route_method,
            &ctx.route_path,
            provider.api.iter().chain(model.api.iter()),
        )
        .ok_or_else(|| {
            ProviderError::InvalidConfig(format!(
                "no api style config for {} {} on provider {}",
                ctx.route_method, ctx.route_path, provider.name
            ))
        })?;

        tracing::debug!(
            event = "model_resolved",
            request_id = %ctx.request_id,
            call_id = %ctx.call_id,
            model = %model.name,
            provider = %provider.name,
            api_style = config.api_style.as_deref().unwrap_or("-"),
            api_vendor = config.api_vendor.as_deref().unwrap_or("-"),
            stream = ctx.is_stream,
        );

        ctx.api_config = Some(config);
        ctx.model = Some(model);
        ctx.provider = Some(provider);
        Ok(RequestSignal::Continue)
    }
}

fn parse_json_body(req: &OutboundRequest) -> ProviderResult<Option<Value>> {
    if req.body.is_empty() || !is_json_content_type(req.content_type()) {
        return Ok(None);
    }
    serde_json::from_slice(&req.body)
        .map(Some)
        .map_err(|err| ProviderError::InvalidRequest(format!("request body is not valid JSON: {err}")))
}

fn find_selector(
    ctx: &RequestCtx,
    req: &OutboundRequest,
    json_body: Option<&Value>,
) -> ProviderResult<Option<ModelSelector>> {
    if let Some(selector) = header_get(&req.headers, MODEL_ID_HEADER).and_then(ModelSelector::id) {
        return Ok(Some(selector));
    }
    let candidates = [
        header_get(&req.headers, MODEL_HEADER),
        header_get(&req.headers, MODEL_NAME_HEADER),
        ctx.path_params.get("model").map(String::as_str),
        ctx.query
            .iter()
            .find(|(key, _)| key == "model")
            .map(|(_, value)| value.as_str()),
        json_body.and_then(|body| body.get("model")).and_then(Value::as_str),
    ];
    if let Some(selector) = candidates.into_iter().flatten().find_map(ModelSelector::parse) {
        return Ok(Some(selector));
    }
    Ok(form_text_field(req.content_type(), &req.body, "model")?
        .as_deref()
        .and_then(ModelSelector::parse))
}
