//! Applies the effective API-style directive to the outbound request, in the
//! order method, scheme, host, path, query, headers, body. Every string is
//! templated against the request's object graph first.

use std::collections::BTreeMap;

use aigate_provider_core::api_style::{STYLE_ANTHROPIC, STYLE_VERTEX};
use aigate_provider_core::{
    ApiDirective, Filter, KvDirective, KvOp, OutboundRequest, PathDirective, PathOp,
    ProviderError, ProviderResult, RequestCtx, RequestFilter, RequestSignal,
};
use aigate_transform::body::{BodyTransform, BodyTransformError, apply_body_transform};
use aigate_transform::template::{resolve, resolve_value};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

pub const CUSTOM_HTTP_DIRECTOR: &str = "custom-http-director";

pub fn apply_api_config(ctx: &mut RequestCtx, req: &mut OutboundRequest) -> ProviderResult<()> {
    let directive = ctx.api_config()?.directive.clone();
    let graph = ctx.object_graph();
    apply_directive(&directive, &graph, ctx, req)
}

pub fn apply_directive(
    directive: &ApiDirective,
    graph: &Value,
    ctx: &mut RequestCtx,
    req: &mut OutboundRequest,
) -> ProviderResult<()> {
    if let Some(method) = templated(directive.method.as_deref(), graph)? {
        req.method = method.to_ascii_uppercase();
    }
    if let Some(scheme) = templated(directive.scheme.as_deref(), graph)? {
        req.scheme = scheme;
    }
    if let Some(host) = templated(directive.host.as_deref(), graph)? {
        req.host = host;
    }
    if req.host.trim().is_empty() {
        return Err(ProviderError::InvalidConfig(
            "resolved upstream host is empty".to_string(),
        ));
    }
    if let Some(path) = &directive.path {
        apply_path(path, graph, &mut req.path)?;
    }
    apply_kv(&directive.query, graph, &mut req.query, str::eq)?;
    apply_kv(&directive.headers, graph, &mut req.headers, |a, b| {
        a.eq_ignore_ascii_case(b)
    })?;
    if let Some(body) = &directive.body {
        apply_body(body, graph, ctx, req)?;
    }
    Ok(())
}

fn templated(value: Option<&str>, graph: &Value) -> ProviderResult<Option<String>> {
    let Some(value) = value.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };
    Ok(Some(resolve(value, graph)?))
}

fn apply_path(directive: &PathDirective, graph: &Value, path: &mut String) -> ProviderResult<()> {
    match directive.op {
        PathOp::Set => {
            if let Some(value) = templated(directive.value.as_deref(), graph)? {
                *path = value;
            }
        }
        PathOp::Replace => {
            for pair in &directive.replace {
                if pair.from.is_empty() {
                    continue;
                }
                let to = resolve(&pair.to, graph)?;
                *path = path.replace(&pair.from, &to);
            }
        }
        PathOp::Unknown => {}
    }
    Ok(())
}

fn apply_kv(
    directives: &BTreeMap<String, KvDirective>,
    graph: &Value,
    pairs: &mut Vec<(String, String)>,
    same_key: fn(&str, &str) -> bool,
) -> ProviderResult<()> {
    for (key, directive) in directives {
        match directive.op {
            KvOp::Add => {
                for value in &directive.values {
                    pairs.push((key.clone(), resolve(value, graph)?));
                }
            }
            KvOp::Set => {
                let values = directive
                    .values
                    .iter()
                    .map(|value| resolve(value, graph))
                    .collect::<Result<Vec<_>, _>>()?;
                pairs.retain(|(existing, _)| !same_key(existing, key));
                pairs.extend(values.into_iter().map(|value| (key.clone(), value)));
            }
            KvOp::Delete => pairs.retain(|(existing, _)| !same_key(existing, key)),
            KvOp::Unknown => {}
        }
    }
    Ok(())
}

fn apply_body(
    directive: &BodyTransform,
    graph: &Value,
    ctx: &mut RequestCtx,
    req: &mut OutboundRequest,
) -> ProviderResult<()> {
    let mut directive = directive.clone();
    for value in directive.default.values_mut().chain(directive.force.values_mut()) {
        resolve_value(value, graph)?;
    }
    let outcome = apply_body_transform(req.content_type(), &directive, &req.body)
        .map_err(|err| match err {
            BodyTransformError::Decode(_) => ProviderError::InvalidRequest(err.to_string()),
            BodyTransformError::Encode(_) => ProviderError::InvalidConfig(err.to_string()),
        })?;
    if !outcome.changes.is_empty() {
        req.body = Bytes::from(outcome.body);
        ctx.body_changes.extend(outcome.changes);
    }
    Ok(())
}

/// Generic director for OpenAI-compatible upstreams; also the fallback when
/// no API style is configured.
#[derive(Debug, Default)]
pub struct CustomHttpDirector;

impl CustomHttpDirector {
    fn enabled(ctx: &RequestCtx) -> bool {
        let Some(config) = ctx.api_config.as_ref() else {
            return false;
        };
        !config.style_is(STYLE_ANTHROPIC) && !config.style_is(STYLE_VERTEX)
    }
}

impl Filter for CustomHttpDirector {
    fn name(&self) -> &str {
        CUSTOM_HTTP_DIRECTOR
    }

    fn as_request_filter(&mut self) -> Option<&mut dyn RequestFilter> {
        Some(self)
    }
}

#[async_trait]
impl RequestFilter for CustomHttpDirector {
    async fn on_request(
        &mut self,
        ctx: &mut RequestCtx,
        req: &mut OutboundRequest,
    ) -> ProviderResult<RequestSignal> {
        if Self::enabled(ctx) {
            apply_api_config(ctx, req)?;
        }
        Ok(RequestSignal::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ctx_with, model, provider};
    use aigate_provider_core::header_get;
    use serde_json::json;

    fn request(body: Value) -> OutboundRequest {
        OutboundRequest {
            method: "POST".into(),
            scheme: "https".into(),
            host: String::new(),
            path: "/v1/chat/completions".into(),
            query: vec![("keep".into(), "1".into()), ("drop".into(), "x".into())],
            headers: vec![
                ("content-type".into(), "application/json".into()),
                ("X-Old".into(), "gone".into()),
            ],
            body: Bytes::from(serde_json::to_vec(&body).unwrap()),
        }
    }

    #[tokio::test]
    async fn applies_every_stage_with_templates() {
        let provider = provider(
            json!({"api-host": "llm.example.com", "region": "eu"}),
            json!({
                "api_style": "openai-compatible",
                "directives": {"*:*": {
                    "host": "${@provider.metadata.api-host}",
                    "path": {"op": "replace", "replace": [{"from": "/v1", "to": "/${@provider.metadata.region}/v1"}]},
                    "query": {
                        "drop": {"op": "delete"},
                        "api-version": {"op": "set", "values": ["2024-10-01"]}
                    },
                    "headers": {
                        "Authorization": {"op": "set", "values": ["Bearer ${@provider.api_key}"]},
                        "x-old": {"op": "delete"},
                        "X-Tag": {"op": "add", "values": ["a", "b"]}
                    }
                }}
            }),
        );
        let model = model(
            "gpt-x-upstream",
            json!({"directives": {"POST:/v1/chat/completions": {
                "body": {
                    "rename": {"max_tokens": "max_completion_tokens"},
                    "drop": ["top_p"],
                    "force": {"user": "${@model.name}"}
                }
            }}}),
        );
        let mut ctx = ctx_with(provider, model);
        let mut req = request(json!({"model": "gpt-x-upstream", "max_tokens": 150, "top_p": 0.9}));

        let mut director = CustomHttpDirector;
        let signal = director.on_request(&mut ctx, &mut req).await.unwrap();
        assert!(matches!(signal, RequestSignal::Continue));

        assert_eq!(req.url().unwrap(), "https://llm.example.com/eu/v1/chat/completions?keep=1&api-version=2024-10-01");
        assert_eq!(header_get(&req.headers, "authorization"), Some("Bearer sk-test"));
        assert_eq!(header_get(&req.headers, "x-old"), None);
        assert_eq!(req.headers.iter().filter(|(k, _)| k == "X-Tag").count(), 2);

        let body: Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(body, json!({"model": "gpt-x-upstream", "max_completion_tokens": 150, "user": "gpt-x-upstream"}));
        assert_eq!(ctx.body_changes.len(), 3);
    }

    #[tokio::test]
    async fn empty_host_fails() {
        let provider = provider(json!({}), json!({"directives": {"*:*": {"scheme": "https"}}}));
        let model = model("m", Value::Null);
        let mut ctx = ctx_with(provider, model);
        let mut req = request(json!({}));
        let err = CustomHttpDirector.on_request(&mut ctx, &mut req).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn unknown_ops_are_ignored() {
        let provider = provider(
            json!({}),
            json!({"directives": {"*:*": {
                "host": "h.example.com",
                "path": {"op": "regex", "value": "/nope"},
                "headers": {"X-Old": {"op": "prepend", "values": ["z"]}}
            }}}),
        );
        let mut ctx = ctx_with(provider, model("m", Value::Null));
        let mut req = request(json!({}));
        CustomHttpDirector.on_request(&mut ctx, &mut req).await.unwrap();
        assert_eq!(req.path, "/v1/chat/completions");
        assert_eq!(header_get(&req.headers, "x-old"), Some("gone"));
    }

    #[tokio::test]
    async fn skips_other_styles() {
        let provider = provider(
            json!({}),
            json!({"api_style": "anthropic-compatible", "directives": {"*:*": {"host": "x"}}}),
        );
        let mut ctx = ctx_with(provider, model("m", Value::Null));
        let mut req = request(json!({}));
        CustomHttpDirector.on_request(&mut ctx, &mut req).await.unwrap();
        assert!(req.host.is_empty());
    }
}
