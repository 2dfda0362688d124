//! Metric name definitions.
//!
//! All names used through the telemetry sink, grouped by component.

/// WebSocket session metrics
pub mod ws {
    /// Total number of WebSocket connections accepted
    pub const CONNECTIONS_TOTAL: &str = "parley_ws_connections_total";
    /// Number of currently active WebSocket connections
    pub const CONNECTIONS_ACTIVE: &str = "parley_ws_connections_active";
    /// Total number of envelopes received from clients
    pub const ENVELOPES_RECEIVED_TOTAL: &str = "parley_ws_envelopes_received_total";
    /// Total number of envelopes sent to clients
    pub const ENVELOPES_SENT_TOTAL: &str = "parley_ws_envelopes_sent_total";
    /// Total malformed inbound frames
    pub const MALFORMED_TOTAL: &str = "parley_ws_malformed_total";
    /// Connections closed after saturating their outgoing queue
    pub const UNRESPONSIVE_TOTAL: &str = "parley_ws_unresponsive_total";
    /// Session duration in seconds
    pub const SESSION_DURATION_SECONDS: &str = "parley_ws_session_duration_seconds";
}

/// Authentication metrics
pub mod auth {
    /// Total token validations that produced a principal
    pub const ACCEPTED_TOTAL: &str = "parley_auth_accepted_total";
    /// Total token validations rejected, labeled by failure kind
    pub const REJECTED_TOTAL: &str = "parley_auth_rejected_total";
}

/// Rate limiter metrics
pub mod limiter {
    /// Messages denied by a window limit
    pub const MESSAGES_DENIED_TOTAL: &str = "parley_limiter_messages_denied_total";
    /// Connections denied by a connection-count limit
    pub const CONNECTIONS_DENIED_TOTAL: &str = "parley_limiter_connections_denied_total";
    /// Admissions granted fail-open because the KV store was unavailable
    pub const KV_UNAVAILABLE_TOTAL: &str = "parley_limiter_kv_unavailable_total";
    /// Admin `system` envelopes that bypassed message counting
    pub const SYSTEM_BYPASS_TOTAL: &str = "parley_limiter_system_bypass_total";
    /// Connection-count rollbacks that themselves failed
    pub const ROLLBACK_FAILED_TOTAL: &str = "parley_limiter_rollback_failed_total";
}

/// KV store adapter metrics
pub mod kv {
    /// Total KV operations that failed
    pub const ERRORS_TOTAL: &str = "parley_kv_errors_total";
}

/// History buffer metrics
pub mod history {
    /// Messages appended to conversation rings
    pub const APPENDED_TOTAL: &str = "parley_history_appended_total";
    /// Range reads served from the local cache
    pub const CACHE_HITS_TOTAL: &str = "parley_history_cache_hits_total";
}

/// LLM bridge metrics
pub mod llm {
    /// Streams started against the upstream provider
    pub const STREAMS_TOTAL: &str = "parley_llm_streams_total";
    /// Chunks forwarded to clients
    pub const CHUNKS_TOTAL: &str = "parley_llm_chunks_total";
    /// Streams that ended in an upstream error, labeled by kind
    pub const STREAM_ERRORS_TOTAL: &str = "parley_llm_stream_errors_total";
    /// Streams cancelled by the client
    pub const CANCELLED_TOTAL: &str = "parley_llm_cancelled_total";
    /// Response cache hits
    pub const CACHE_HITS_TOTAL: &str = "parley_llm_cache_hits_total";
    /// Time to first chunk in seconds
    pub const TIME_TO_FIRST_CHUNK_SECONDS: &str = "parley_llm_time_to_first_chunk_seconds";
}
