//! Shared gateway runtime state.
//!
//! All collaborators are supplied at construction and shared behind one
//! `Arc`; there is no ambient global state beyond the process-wide telemetry
//! recorder.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use {
    parley_auth::AuthValidator,
    parley_history::HistoryBuffer,
    parley_limits::RateLimiter,
    parley_protocol::close_codes,
    parley_providers::LlmBridge,
};

use crate::{registry::Registry, repo::MessageRepository};

pub struct GatewayState {
    pub registry: Registry,
    pub limiter: RateLimiter,
    pub history: HistoryBuffer,
    pub auth: AuthValidator,
    pub bridge: LlmBridge,
    pub messages: Arc<dyn MessageRepository>,
    /// Cancelled when the server begins shutting down; every session watches
    /// it and closes with 1000.
    pub shutdown: CancellationToken,
}

impl GatewayState {
    pub fn new(
        limiter: RateLimiter,
        history: HistoryBuffer,
        auth: AuthValidator,
        bridge: LlmBridge,
        messages: Arc<dyn MessageRepository>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: Registry::new(),
            limiter,
            history,
            auth,
            bridge,
            messages,
            shutdown: CancellationToken::new(),
        })
    }

    /// Signal shutdown and ask every live connection to close normally.
    pub async fn begin_shutdown(&self) {
        self.shutdown.cancel();
        self.registry
            .close_all(close_codes::NORMAL, "server shutting down")
            .await;
    }
}
