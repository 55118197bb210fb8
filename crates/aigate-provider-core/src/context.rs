//! Request-scoped state threaded by `&mut` through every filter.

use std::collections::BTreeMap;

use aigate_transform::body::BodyChange;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api_style::ApiStyleConfig;
use crate::errors::{ProviderError, ProviderResult};
use crate::records::{Client, ClientToken, Model, Provider};
use crate::splitter::ChunkSplitter;

pub struct RequestCtx {
    pub request_id: String,
    pub call_id: String,
    /// Matched route method.
    pub route_method: String,
    /// Matched route path pattern, e.g. `/v1/models/{model}`.
    pub route_path: String,
    pub path_params: BTreeMap<String, String>,
    pub query: Vec<(String, String)>,
    pub client: Option<Client>,
    pub client_token: Option<ClientToken>,
    pub model: Option<Model>,
    pub provider: Option<Provider>,
    pub is_stream: bool,
    pub api_config: Option<ApiStyleConfig>,
    /// Extra roots for the template object graph, e.g. `vertex`.
    pub template_vars: Map<String, Value>,
    pub chunk_splitter: Option<Box<dyn ChunkSplitter>>,
    pub body_changes: Vec<BodyChange>,
    pub cancel: CancellationToken,
    /// Set by the orchestrator when a stream fails; read by `on_complete`.
    pub stream_error: Option<ProviderError>,
    /// Unix seconds at request start.
    pub created: i64,
}

impl RequestCtx {
    pub fn new(route_method: impl Into<String>, route_path: impl Into<String>, created: i64) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            call_id: Uuid::now_v7().to_string(),
            route_method: route_method.into(),
            route_path: route_path.into(),
            path_params: BTreeMap::new(),
            query: Vec::new(),
            client: None,
            client_token: None,
            model: None,
            provider: None,
            is_stream: false,
            api_config: None,
            template_vars: Map::new(),
            chunk_splitter: None,
            body_changes: Vec::new(),
            cancel: CancellationToken::new(),
            stream_error: None,
            created,
        }
    }

    pub fn client(&self) -> ProviderResult<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| ProviderError::Unauthorized("no authenticated client".to_string()))
    }

    pub fn model(&self) -> ProviderResult<&Model> {
        self.model
            .as_ref()
            .ok_or_else(|| ProviderError::InvalidConfig("model not resolved for route".to_string()))
    }

    pub fn provider(&self) -> ProviderResult<&Provider> {
        self.provider.as_ref().ok_or_else(|| {
            ProviderError::InvalidConfig("provider not resolved for route".to_string())
        })
    }

    pub fn api_config(&self) -> ProviderResult<&ApiStyleConfig> {
        self.api_config.as_ref().ok_or_else(|| {
            ProviderError::InvalidConfig("no api style config resolved for route".to_string())
        })
    }

    pub fn style_is(&self, style: &str) -> bool {
        self.api_config.as_ref().is_some_and(|cfg| cfg.style_is(style))
    }

    pub fn vendor_is(&self, vendor: &str) -> bool {
        self.api_config.as_ref().is_some_and(|cfg| cfg.vendor_is(vendor))
    }

    pub fn set_template_var(&mut self, root: &str, key: &str, value: impl Into<Value>) {
        let entry = self
            .template_vars
            .entry(root.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(map) = entry {
            map.insert(key.to_string(), value.into());
        }
    }

    /// The graph `${@...}` placeholders resolve against.
    pub fn object_graph(&self) -> Value {
        let mut graph = Map::new();
        graph.insert("provider".to_string(), to_value(&self.provider));
        graph.insert("model".to_string(), to_value(&self.model));
        graph.insert("client".to_string(), to_value(&self.client));
        graph.insert("request".to_string(), json!({
            "id": self.request_id,
            "call_id": self.call_id,
            "stream": self.is_stream,
            "path_params": self.path_params,
        }));
        for (key, value) in &self.template_vars {
            graph.insert(key.clone(), value.clone());
        }
        Value::Object(graph)
    }

    pub fn take_splitter(&mut self) -> Option<Box<dyn ChunkSplitter>> {
        self.chunk_splitter.take()
    }
}

fn to_value<T: serde::Serialize>(value: &Option<T>) -> Value {
    value
        .as_ref()
        .and_then(|inner| serde_json::to_value(inner).ok())
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aigate_transform::template::resolve;

    #[test]
    fn graph_exposes_records_and_vars() {
        let mut ctx = RequestCtx::new("POST", "/v1/chat/completions", 0);
        ctx.provider = Some(Provider {
            id: "p1".into(),
            name: "vertex".into(),
            api_key: "secret".into(),
            metadata: json!({"api-host": "example.com"}),
            api: None,
        });
        ctx.set_template_var("vertex", "project_id", "proj-1");

        let graph = ctx.object_graph();
        assert_eq!(
            resolve("${@provider.metadata.api-host}/${@vertex.project_id}", &graph).unwrap(),
            "example.com/proj-1"
        );
        assert!(resolve("${@model.name}", &graph).is_err());
    }

    #[test]
    fn ids_are_distinct_versions() {
        let ctx = RequestCtx::new("GET", "/", 0);
        assert_eq!(Uuid::parse_str(&ctx.request_id).unwrap().get_version_num(), 4);
        assert_eq!(Uuid::parse_str(&ctx.call_id).unwrap().get_version_num(), 7);
    }
}
