use std::sync::Arc;

use axum::Router;

use crate::engine::Gateway;
use crate::handler::gateway_handler;

pub struct CoreState {
    pub gateway: Gateway,
    pub max_body_bytes: usize,
}

pub struct Core {
    state: Arc<CoreState>,
}

impl Core {
    pub fn new(gateway: Gateway, max_body_bytes: usize) -> Self {
        Self {
            state: Arc::new(CoreState {
                gateway,
                max_body_bytes,
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .fallback(gateway_handler)
            .with_state(self.state.clone())
    }

    pub fn state(&self) -> Arc<CoreState> {
        self.state.clone()
    }
}
