use aigate_provider_core::{ApiSegment, Client, Model, Provider, RequestCtx, merge};
use serde_json::Value;

pub(crate) fn client() -> Client {
    Client {
        id: "client-1".into(),
        name: "tester".into(),
        allowed_models: Vec::new(),
        metadata: Value::Null,
    }
}

pub(crate) fn provider(metadata: Value, api: Value) -> Provider {
    Provider {
        id: "provider-1".into(),
        name: "upstream".into(),
        api_key: "sk-test".into(),
        metadata,
        api: segment(api),
    }
}

pub(crate) fn model(name: &str, api: Value) -> Model {
    Model {
        id: "model-1".into(),
        name: name.into(),
        display_name: None,
        provider_id: "provider-1".into(),
        created: 1_700_000_000,
        metadata: Value::Null,
        api: segment(api),
    }
}

fn segment(api: Value) -> Option<ApiSegment> {
    if api.is_null() {
        None
    } else {
        Some(serde_json::from_value(api).unwrap())
    }
}

/// A context as the `context` filter leaves it for `POST /v1/chat/completions`.
pub(crate) fn ctx_with(provider: Provider, model: Model) -> RequestCtx {
    ctx_for("POST", "/v1/chat/completions", provider, model)
}

pub(crate) fn ctx_for(method: &str, path: &str, provider: Provider, model: Model) -> RequestCtx {
    let mut ctx = RequestCtx::new(method, path, 1_700_000_100);
    ctx.api_config = merge(
        method,
        path,
        provider.api.iter().chain(model.api.iter()),
    );
    ctx.client = Some(client());
    ctx.provider = Some(provider);
    ctx.model = Some(model);
    ctx
}
