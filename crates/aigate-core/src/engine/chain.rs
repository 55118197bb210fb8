//! One request's filter instances and the order they run in.

use aigate_provider_core::{
    Filter, FilterRegistry, FilterSpec, OutboundRequest, ProviderError, ProviderResult,
    RegistryError, RequestCtx, RequestSignal, ResponseHead,
};
use bytes::Bytes;

/// A spec named in both chains is a single instance, so state a director
/// records while rewriting the request is there when its response arrives.
pub(crate) struct FilterChain {
    instances: Vec<Box<dyn Filter>>,
    request: Vec<usize>,
    response: Vec<usize>,
    next_index: usize,
}

impl FilterChain {
    pub(crate) fn build(
        registry: &FilterRegistry,
        request: &[FilterSpec],
        response: &[FilterSpec],
    ) -> Result<Self, RegistryError> {
        let mut instances = Vec::with_capacity(request.len() + response.len());
        for spec in request {
            instances.push(registry.create(spec)?);
        }
        let request_ids: Vec<usize> = (0..request.len()).collect();

        let mut claimed = vec![false; request.len()];
        let mut response_ids = Vec::with_capacity(response.len());
        for spec in response {
            let shared = (0..request.len()).find(|&i| !claimed[i] && &request[i] == spec);
            let id = match shared {
                Some(i) => {
                    claimed[i] = true;
                    i
                }
                None => {
                    instances.push(registry.create(spec)?);
                    instances.len() - 1
                }
            };
            response_ids.push(id);
        }

        Ok(Self {
            instances,
            request: request_ids,
            response: response_ids,
            next_index: 0,
        })
    }

    fn report(&self, id: usize, phase: &'static str, ctx: &RequestCtx, err: &ProviderError) {
        tracing::warn!(
            event = "filter_error",
            request_id = %ctx.request_id,
            call_id = %ctx.call_id,
            filter = self.instances[id].name(),
            phase,
            error = %err,
        );
    }

    pub(crate) async fn run_request(
        &mut self,
        ctx: &mut RequestCtx,
        req: &mut OutboundRequest,
    ) -> ProviderResult<RequestSignal> {
        for pos in 0..self.request.len() {
            let id = self.request[pos];
            let result = match self.instances[id].as_request_filter() {
                Some(filter) => filter.on_request(ctx, req).await,
                None => continue,
            };
            match result {
                Ok(RequestSignal::Continue) => {}
                Ok(signal @ RequestSignal::Respond(_)) => return Ok(signal),
                Err(err) => {
                    self.report(id, "on_request", ctx, &err);
                    return Err(err);
                }
            }
        }
        Ok(RequestSignal::Continue)
    }

    pub(crate) async fn run_headers(
        &mut self,
        ctx: &mut RequestCtx,
        head: &mut ResponseHead,
    ) -> ProviderResult<()> {
        for pos in 0..self.response.len() {
            let id = self.response[pos];
            let result = match self.instances[id].as_response_filter() {
                Some(filter) => filter.on_headers(ctx, head).await,
                None => continue,
            };
            if let Err(err) = result {
                self.report(id, "on_headers", ctx, &err);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Runs one logical upstream chunk through the whole response chain.
    pub(crate) async fn run_chunk(
        &mut self,
        ctx: &mut RequestCtx,
        head: &ResponseHead,
        chunk: Bytes,
    ) -> ProviderResult<Option<Bytes>> {
        let index = self.next_index;
        self.next_index += 1;
        self.feed_from(0, ctx, head, chunk, index).await
    }

    async fn feed_from(
        &mut self,
        start: usize,
        ctx: &mut RequestCtx,
        head: &ResponseHead,
        chunk: Bytes,
        index: usize,
    ) -> ProviderResult<Option<Bytes>> {
        let mut current = chunk;
        for pos in start..self.response.len() {
            let id = self.response[pos];
            let result = match self.instances[id].as_response_filter() {
                Some(filter) => filter.on_body_chunk(ctx, head, current.clone(), index).await,
                None => continue,
            };
            match result {
                Ok(Some(next)) => current = next,
                Ok(None) => return Ok(None),
                Err(err) => {
                    self.report(id, "on_body_chunk", ctx, &err);
                    return Err(err);
                }
            }
        }
        Ok(Some(current))
    }

    /// Calls every `on_complete` once, in order. Each output is fed through
    /// the filters after the one that produced it. Returns the outputs and
    /// the first error met.
    pub(crate) async fn run_complete(
        &mut self,
        ctx: &mut RequestCtx,
        head: &ResponseHead,
    ) -> (Vec<Bytes>, Option<ProviderError>) {
        let mut outputs = Vec::new();
        let mut first_error = None;
        for pos in 0..self.response.len() {
            let id = self.response[pos];
            let result = match self.instances[id].as_response_filter() {
                Some(filter) => filter.on_complete(ctx, head).await,
                None => continue,
            };
            match result {
                Ok(Some(tail)) => {
                    let index = self.next_index;
                    self.next_index += 1;
                    match self.feed_from(pos + 1, ctx, head, tail, index).await {
                        Ok(Some(out)) => outputs.push(out),
                        Ok(None) => {}
                        Err(err) => {
                            first_error.get_or_insert(err);
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    self.report(id, "on_complete", ctx, &err);
                    first_error.get_or_insert(err);
                }
            }
        }
        (outputs, first_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aigate_provider_core::{FilterRegistryBuilder, RequestFilter, ResponseFilter};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    /// Tags chunks with its name and records every call.
    struct Tagger {
        name: String,
        log: Log,
        seen_request: bool,
        tail: Option<String>,
        swallow: bool,
    }

    impl Filter for Tagger {
        fn name(&self) -> &str {
            &self.name
        }

        fn as_request_filter(&mut self) -> Option<&mut dyn RequestFilter> {
            Some(self)
        }

        fn as_response_filter(&mut self) -> Option<&mut dyn ResponseFilter> {
            Some(self)
        }
    }

    #[async_trait]
    impl RequestFilter for Tagger {
        async fn on_request(&mut self, _ctx: &mut RequestCtx, _req: &mut OutboundRequest) -> ProviderResult<RequestSignal> {
            self.seen_request = true;
            Ok(RequestSignal::Continue)
        }
    }

    #[async_trait]
    impl ResponseFilter for Tagger {
        async fn on_body_chunk(
            &mut self,
            _ctx: &mut RequestCtx,
            _head: &ResponseHead,
            chunk: Bytes,
            index: usize,
        ) -> ProviderResult<Option<Bytes>> {
            self.log.lock().unwrap().push(format!(
                "{}:{}:{}:{}",
                self.name,
                index,
                self.seen_request,
                String::from_utf8_lossy(&chunk)
            ));
            if self.swallow {
                return Ok(None);
            }
            let mut out = chunk.to_vec();
            out.extend_from_slice(self.name.as_bytes());
            Ok(Some(Bytes::from(out)))
        }

        async fn on_complete(&mut self, ctx: &mut RequestCtx, _head: &ResponseHead) -> ProviderResult<Option<Bytes>> {
            self.log.lock().unwrap().push(format!("{}:complete:{}", self.name, ctx.stream_error.is_some()));
            Ok(self.tail.clone().map(Bytes::from))
        }
    }

    fn registry(log: &Log) -> Arc<FilterRegistry> {
        let mut builder = FilterRegistryBuilder::new();
        let log = log.clone();
        builder
            .register("tag", move |_: &str, config: &Value| -> ProviderResult<Box<dyn Filter>> {
                Ok(Box::new(Tagger {
                    name: config["name"].as_str().unwrap_or("t").to_string(),
                    log: log.clone(),
                    seen_request: false,
                    tail: config["tail"].as_str().map(str::to_string),
                    swallow: config["swallow"].as_bool().unwrap_or(false),
                }))
            })
            .unwrap();
        builder.build()
    }

    fn spec(config: Value) -> FilterSpec {
        FilterSpec {
            name: "tag".into(),
            config,
        }
    }

    #[tokio::test]
    async fn shares_instances_named_in_both_chains() {
        let log = Log::default();
        let a = spec(serde_json::json!({"name": "a"}));
        let b = spec(serde_json::json!({"name": "b"}));
        let mut chain = FilterChain::build(&registry(&log), &[a.clone()], &[a, b]).unwrap();
        let mut ctx = RequestCtx::new("POST", "/x", 0);
        let mut req = OutboundRequest::default();
        chain.run_request(&mut ctx, &mut req).await.unwrap();

        let head = ResponseHead { status: 200, headers: Vec::new() };
        let out = chain.run_chunk(&mut ctx, &head, Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(out.as_deref(), Some(&b"xab"[..]));
        let log = log.lock().unwrap();
        assert_eq!(log[0], "a:0:true:x");
        assert_eq!(log[1], "b:0:false:xa");
    }

    #[tokio::test]
    async fn completion_output_flows_through_later_filters_only() {
        let log = Log::default();
        let first = spec(serde_json::json!({"name": "a", "tail": "[end]"}));
        let second = spec(serde_json::json!({"name": "b"}));
        let mut chain = FilterChain::build(&registry(&log), &[], &[first, second]).unwrap();
        let mut ctx = RequestCtx::new("POST", "/x", 0);
        let head = ResponseHead { status: 200, headers: Vec::new() };

        chain.run_chunk(&mut ctx, &head, Bytes::from_static(b"1")).await.unwrap();
        let (tail, err) = chain.run_complete(&mut ctx, &head).await;
        assert!(err.is_none());
        assert_eq!(tail, vec![Bytes::from_static(b"[end]b")]);
        let log = log.lock().unwrap();
        assert!(log.contains(&"b:1:false:[end]".to_string()));
        assert!(log.contains(&"a:complete:false".to_string()));
        assert!(log.contains(&"b:complete:false".to_string()));
    }

    #[tokio::test]
    async fn swallowed_chunks_stop_the_chain() {
        let log = Log::default();
        let first = spec(serde_json::json!({"name": "a", "swallow": true}));
        let second = spec(serde_json::json!({"name": "b"}));
        let mut chain = FilterChain::build(&registry(&log), &[], &[first, second]).unwrap();
        let mut ctx = RequestCtx::new("POST", "/x", 0);
        let head = ResponseHead { status: 200, headers: Vec::new() };
        let out = chain.run_chunk(&mut ctx, &head, Bytes::from_static(b"1")).await.unwrap();
        assert!(out.is_none());
        assert_eq!(log.lock().unwrap().len(), 1);
    }
}
