//! LLM provider integration and the streaming bridge.
//!
//! [`LlmProvider`] abstracts the upstream model API as a lazy, terminating
//! sequence of text deltas. [`LlmBridge`] turns one inbound user message into
//! a sequenced stream of `chat_chunk` envelopes over a bounded channel, with
//! cooperative cancellation and a content-addressed response cache for
//! deterministic parameter sets.

mod bridge;
mod cache;
mod format;
mod model;
mod openai_compat;

pub use {
    bridge::{LlmBridge, StreamHandle},
    cache::ResponseCache,
    format::format_messages,
    model::{LlmProvider, RequestParams, StreamEvent, UpstreamError},
    openai_compat::OpenAiCompatProvider,
};
