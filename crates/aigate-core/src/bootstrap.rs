//! Builds a ready [`Core`] from merged configuration: catalog, filter
//! registry, route table, upstream client.

use std::sync::Arc;

use aigate_provider_core::{FilterRegistryBuilder, ProviderError, RegistryError};
use aigate_provider_impl::{BuiltinServices, WreqAuxiliaryClient, register_builtin_filters};

use crate::catalog::{CatalogError, CatalogFile, MemoryCatalog};
use crate::config::GatewayConfig;
use crate::core::Core;
use crate::engine::Gateway;
use crate::route::{RouteError, RouteFile, RouteTable};
use crate::upstream_client::WreqUpstreamClient;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("load catalog: {0}")]
    Catalog(#[from] CatalogError),
    #[error("load routes: {0}")]
    Routes(#[from] RouteError),
    #[error("register filters: {0}")]
    Registry(#[from] RegistryError),
    #[error("build auxiliary client: {0}")]
    Auxiliary(ProviderError),
    #[error("build upstream client: {0}")]
    Upstream(#[from] wreq::Error),
}

pub fn bootstrap(config: &GatewayConfig) -> Result<Core, BootstrapError> {
    let catalog = Arc::new(MemoryCatalog::new(CatalogFile::load(&config.catalog_path)?)?);
    let (clients, providers, models) = catalog.counts();
    tracing::info!(
        event = "catalog_loaded",
        path = %config.catalog_path.display(),
        clients,
        providers,
        models,
    );

    let assets = WreqAuxiliaryClient::new(
        config.proxy.as_deref(),
        config.request_timeout,
        config.max_body_bytes,
    )
    .map_err(BootstrapError::Auxiliary)?;
    let services = BuiltinServices::new(catalog.clone(), Arc::new(assets));
    let mut builder = FilterRegistryBuilder::new();
    register_builtin_filters(&mut builder, &services)?;
    let registry = builder.build();

    let routes = RouteTable::build(&RouteFile::load(&config.routes_path)?.routes, &registry)?;
    tracing::info!(
        event = "routes_loaded",
        path = %config.routes_path.display(),
        routes = routes.len(),
    );

    let upstream = WreqUpstreamClient::new(config.upstream())?;
    let gateway = Gateway::new(routes, registry, catalog, Arc::new(upstream));
    Ok(Core::new(gateway, config.max_body_bytes))
}
