//! Core gateway abstractions: filter capabilities, the filter registry, the
//! request-scoped context, API-style configuration and the backoff poller.
//!
//! This crate performs no network IO. Concrete filters live in
//! `aigate-provider-impl`; the orchestrator that drives them lives in
//! `aigate-core`.

pub mod api_style;
pub mod catalog;
pub mod context;
pub mod errors;
pub mod filter;
pub mod headers;
pub mod poll;
pub mod records;
pub mod registry;
pub mod request;
pub mod splitter;

pub use api_style::{
    ApiDirective, ApiSegment, ApiStyleConfig, KvDirective, KvOp, PathDirective, PathOp,
    ReplacePair, merge,
};
pub use catalog::{IdentityResolver, ModelCatalog, ModelSelector};
pub use context::RequestCtx;
pub use errors::{ProviderError, ProviderResult};
pub use filter::{Filter, RequestFilter, RequestSignal, ResponseFilter};
pub use headers::{Headers, header_append, header_get, header_remove, header_set};
pub use poll::{Attempt, BackoffConfig, PollError, poll};
pub use records::{Client, ClientToken, Model, Provider};
pub use registry::{FilterFactory, FilterRegistry, FilterRegistryBuilder, FilterSpec, RegistryError};
pub use request::{LocalResponse, OutboundRequest, ResponseHead};
pub use splitter::{ChunkSplitter, EventStreamChunkSplitter, PassthroughSplitter, SseChunkSplitter};
