//! The gateway runtime: route table, filter-chain orchestration, upstream
//! client and the axum surface in front of them.

pub mod bootstrap;
pub mod catalog;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod handler;
pub mod redact;
pub mod route;
pub mod upstream_client;

pub use bootstrap::{BootstrapError, bootstrap};
pub use catalog::{CatalogError, CatalogFile, MemoryCatalog};
pub use config::{ConfigError, GatewayConfig, GatewayConfigPatch};
pub use crate::core::{Core, CoreState};
pub use engine::{Gateway, GatewayBody, GatewayResponse, InboundRequest};
pub use error::ProxyError;
pub use route::{RouteDefinition, RouteError, RouteFile, RouteTable};
pub use upstream_client::{
    UpstreamBody, UpstreamClient, UpstreamClientConfig, UpstreamError, UpstreamRequest,
    UpstreamResponse, WreqUpstreamClient,
};
