//! Filter capabilities. A filter is tagged by what it can do, not by a type
//! hierarchy: the orchestrator asks for each capability and skips filters
//! that lack it.

use async_trait::async_trait;
use bytes::Bytes;

use crate::context::RequestCtx;
use crate::errors::ProviderResult;
use crate::request::{LocalResponse, OutboundRequest, ResponseHead};

#[derive(Debug)]
pub enum RequestSignal {
    Continue,
    /// Stop the chain and answer without calling upstream.
    Respond(LocalResponse),
}

#[async_trait]
pub trait RequestFilter: Send {
    async fn on_request(
        &mut self,
        ctx: &mut RequestCtx,
        req: &mut OutboundRequest,
    ) -> ProviderResult<RequestSignal>;
}

#[async_trait]
pub trait ResponseFilter: Send {
    async fn on_headers(&mut self, _ctx: &mut RequestCtx, _head: &mut ResponseHead) -> ProviderResult<()> {
        Ok(())
    }

    /// Transforms one logical chunk. `None` swallows it.
    async fn on_body_chunk(
        &mut self,
        ctx: &mut RequestCtx,
        head: &ResponseHead,
        chunk: Bytes,
        index: usize,
    ) -> ProviderResult<Option<Bytes>>;

    /// Runs exactly once per response, including after an error.
    async fn on_complete(
        &mut self,
        _ctx: &mut RequestCtx,
        _head: &ResponseHead,
    ) -> ProviderResult<Option<Bytes>> {
        Ok(None)
    }
}

pub trait Filter: Send {
    fn name(&self) -> &str;

    fn as_request_filter(&mut self) -> Option<&mut dyn RequestFilter> {
        None
    }

    fn as_response_filter(&mut self) -> Option<&mut dyn ResponseFilter> {
        None
    }
}
