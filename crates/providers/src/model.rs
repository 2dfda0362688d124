use std::pin::Pin;

use tokio_stream::Stream;

use parley_protocol::FailureKind;

/// Events emitted while streaming a completion from the upstream provider.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Text content delta.
    Delta(String),
    /// Stream completed normally.
    Done,
    /// The upstream call failed; no further events follow.
    Error(UpstreamError),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("upstream throttled: {0}")]
    Throttled(String),
}

impl UpstreamError {
    #[must_use]
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Unavailable(_) => FailureKind::UpstreamUnavailable,
            Self::Throttled(_) => FailureKind::UpstreamThrottled,
        }
    }
}

/// Sampling parameters forwarded upstream. The response cache is only
/// authoritative for deterministic sets (temperature 0).
#[derive(Debug, Clone, PartialEq)]
pub struct RequestParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl RequestParams {
    #[must_use]
    pub fn deterministic(&self) -> bool {
        self.temperature == 0.0
    }
}

/// An upstream LLM endpoint.
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Model identifier sent upstream and used in cache fingerprints.
    fn id(&self) -> &str;

    /// Stream a completion, yielding deltas and a terminating `Done` or
    /// `Error` event.
    fn stream(
        &self,
        messages: Vec<serde_json::Value>,
        params: &RequestParams,
    ) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + '_>>;
}
