//! Built-in filters: model resolution, the generic HTTP director, the vendor
//! directors and the local model list.
//!
//! Directors only transform the outbound request and the response stream;
//! the proxied upstream call itself is made by the gateway engine. The only
//! network IO here is auxiliary: Vertex token exchange and Bedrock image
//! download, both through [`AuxiliaryClient`].

pub mod filters;
pub mod form;
pub mod http_client;
pub mod providers;
mod registry;

#[cfg(test)]
mod test_support;

pub use http_client::{AuxiliaryClient, FetchedAsset, AuxiliaryResponse, WreqAuxiliaryClient};
pub use registry::{BuiltinServices, register_builtin_filters};
