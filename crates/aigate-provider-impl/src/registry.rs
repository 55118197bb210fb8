use std::sync::Arc;

use aigate_provider_core::{Filter, FilterRegistryBuilder, ModelCatalog, RegistryError};

use crate::filters::{
    ASYNC_TASK_FILTER, AsyncTaskFilter, CONTEXT_FILTER, CUSTOM_HTTP_DIRECTOR, ContextFilter,
    CustomHttpDirector, MODEL_LIST_FILTER, ModelListFilter,
};
use crate::http_client::AuxiliaryClient;
use crate::providers::{
    ANTHROPIC_DIRECTOR, AnthropicDirector, BEDROCK_DIRECTOR, BedrockDirector, VERTEX_DIRECTOR,
    VertexDirector, VertexTokenCache,
};

/// Process-wide collaborators shared by every filter instance.
#[derive(Clone)]
pub struct BuiltinServices {
    pub catalog: Arc<dyn ModelCatalog>,
    pub assets: Arc<dyn AuxiliaryClient>,
    pub vertex_tokens: Arc<VertexTokenCache>,
}

impl BuiltinServices {
    pub fn new(catalog: Arc<dyn ModelCatalog>, assets: Arc<dyn AuxiliaryClient>) -> Self {
        let vertex_tokens = Arc::new(VertexTokenCache::new(assets.clone()));
        Self {
            catalog,
            assets,
            vertex_tokens,
        }
    }
}

/// Registers every built-in filter. Called once at startup, before the
/// registry is frozen; factories build a fresh instance per request.
pub fn register_builtin_filters(
    builder: &mut FilterRegistryBuilder,
    services: &BuiltinServices,
) -> Result<(), RegistryError> {
    let catalog = services.catalog.clone();
    builder.register(CONTEXT_FILTER, move |_, _| {
        Ok(Box::new(ContextFilter::new(catalog.clone())) as Box<dyn Filter>)
    })?;

    builder.register(CUSTOM_HTTP_DIRECTOR, |_, _| {
        Ok(Box::new(CustomHttpDirector) as Box<dyn Filter>)
    })?;

    builder.register(ANTHROPIC_DIRECTOR, |_, _| {
        Ok(Box::new(AnthropicDirector::default()) as Box<dyn Filter>)
    })?;

    let assets = services.assets.clone();
    builder.register(BEDROCK_DIRECTOR, move |_, _| {
        Ok(Box::new(BedrockDirector::new(assets.clone())) as Box<dyn Filter>)
    })?;

    let tokens = services.vertex_tokens.clone();
    builder.register(VERTEX_DIRECTOR, move |_, _| {
        Ok(Box::new(VertexDirector::new(tokens.clone())) as Box<dyn Filter>)
    })?;

    let catalog = services.catalog.clone();
    builder.register(MODEL_LIST_FILTER, move |_, _| {
        Ok(Box::new(ModelListFilter::new(catalog.clone())) as Box<dyn Filter>)
    })?;

    let assets = services.assets.clone();
    builder.register(ASYNC_TASK_FILTER, move |_, config| {
        Ok(Box::new(AsyncTaskFilter::new(assets.clone(), config)?) as Box<dyn Filter>)
    })?;

    Ok(())
}
