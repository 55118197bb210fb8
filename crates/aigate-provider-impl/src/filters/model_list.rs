use std::sync::Arc;

use aigate_protocol::openai::{ModelList, ModelObject};
use aigate_provider_core::{
    Filter, LocalResponse, ModelCatalog, OutboundRequest, ProviderResult, RequestCtx,
    RequestFilter, RequestSignal,
};
use async_trait::async_trait;

pub const MODEL_LIST_FILTER: &str = "model-list";

/// Answers `GET /v1/models` from the catalog without calling upstream.
pub struct ModelListFilter {
    catalog: Arc<dyn ModelCatalog>,
}

impl ModelListFilter {
    pub fn new(catalog: Arc<dyn ModelCatalog>) -> Self {
        Self { catalog }
    }
}

impl Filter for ModelListFilter {
    fn name(&self) -> &str {
        MODEL_LIST_FILTER
    }

    fn as_request_filter(&mut self) -> Option<&mut dyn RequestFilter> {
        Some(self)
    }
}

#[async_trait]
impl RequestFilter for ModelListFilter {
    async fn on_request(
        &mut self,
        ctx: &mut RequestCtx,
        _req: &mut OutboundRequest,
    ) -> ProviderResult<RequestSignal> {
        let client = ctx.client()?;
        let data = self
            .catalog
            .list_models(client)
            .await
            .into_iter()
            .map(|(model, provider)| ModelObject {
                id: model.public_name().to_string(),
                object: "model".to_string(),
                created: model.created,
                owned_by: provider.name,
            })
            .collect();
        let response = LocalResponse::json(200, &ModelList::new(data))?;
        Ok(RequestSignal::Respond(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{client, model, provider};
    use aigate_provider_core::{Client, Model, ModelSelector, Provider};
    use serde_json::{Value, json};

    struct Fixed(Vec<(Model, Provider)>);

    #[async_trait]
    impl ModelCatalog for Fixed {
        async fn find_model(&self, _: &Client, _: &ModelSelector) -> Option<(Model, Provider)> {
            None
        }

        async fn list_models(&self, _: &Client) -> Vec<(Model, Provider)> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn lists_models_locally() {
        let mut named = model("claude-sonnet-4-upstream", Value::Null);
        named.display_name = Some("claude-sonnet".into());
        let mut filter = ModelListFilter::new(Arc::new(Fixed(vec![(named, provider(Value::Null, Value::Null))])));
        let mut ctx = RequestCtx::new("GET", "/v1/models", 0);
        ctx.client = Some(client());

        let signal = filter
            .on_request(&mut ctx, &mut OutboundRequest::default())
            .await
            .unwrap();
        let RequestSignal::Respond(response) = signal else {
            panic!("expected a local response");
        };
        assert_eq!(response.status, 200);
        let body: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(
            body,
            json!({"object": "list", "data": [{
                "id": "claude-sonnet", "object": "model", "created": 1_700_000_000, "owned_by": "upstream"
            }]})
        );
    }
}
