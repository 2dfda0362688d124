//! Wire protocol for the parley WebSocket session layer.
//!
//! All communication uses JSON text frames, one envelope per frame. Every
//! envelope carries a `type` discriminator; unknown discriminators fail
//! decoding and are reported as `invalid_message_format`.
//!
//! The failure-kind → close-code / error-code mapping lives in
//! [`FailureKind`]; close codes terminate the transport, error envelopes are
//! in-band and non-terminal unless followed by an explicit close.

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

// ── Constants ────────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_PAYLOAD_BYTES: usize = 65_536; // 64 KB
/// Capacity of the per-connection outgoing channel. Overflow marks the
/// connection UNRESPONSIVE rather than dropping frames.
pub const OUTGOING_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_MAX_HISTORY: usize = 100;

// ── Close codes ──────────────────────────────────────────────────────────────

pub mod close_codes {
    pub const NORMAL: u16 = 1000;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const INTERNAL_ERROR: u16 = 1011;
}

// ── Failure kinds ────────────────────────────────────────────────────────────

/// Internal failure kinds with their wire-level mapping.
///
/// | Kind | Close code | Error envelope code |
/// |------|-----------|---------------------|
/// | authentication_required | 1008 | 4401 |
/// | invalid_message_format  | —    | 4001 |
/// | rate_limit_exceeded     | —    | 4002 |
/// | connection_limit_exceeded | 1008 | 4003 |
/// | upstream_unavailable    | —    | 5011 |
/// | upstream_throttled      | —    | 5012 |
/// | server_error            | 1011 | 5000 |
/// | normal_shutdown         | 1000 | —    |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    AuthenticationRequired,
    InvalidMessageFormat,
    RateLimitExceeded,
    ConnectionLimitExceeded,
    UpstreamUnavailable,
    UpstreamThrottled,
    ServerError,
    NormalShutdown,
}

impl FailureKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthenticationRequired => "authentication_required",
            Self::InvalidMessageFormat => "invalid_message_format",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::ConnectionLimitExceeded => "connection_limit_exceeded",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::UpstreamThrottled => "upstream_throttled",
            Self::ServerError => "server_error",
            Self::NormalShutdown => "normal_shutdown",
        }
    }

    /// Transport close code, if this failure terminates the connection.
    #[must_use]
    pub fn close_code(self) -> Option<u16> {
        match self {
            Self::AuthenticationRequired | Self::ConnectionLimitExceeded => {
                Some(close_codes::POLICY_VIOLATION)
            },
            Self::ServerError => Some(close_codes::INTERNAL_ERROR),
            Self::NormalShutdown => Some(close_codes::NORMAL),
            _ => None,
        }
    }

    /// In-band error envelope code, if this failure is reported in-band.
    #[must_use]
    pub fn envelope_code(self) -> Option<u16> {
        match self {
            Self::AuthenticationRequired => Some(4401),
            Self::InvalidMessageFormat => Some(4001),
            Self::RateLimitExceeded => Some(4002),
            Self::ConnectionLimitExceeded => Some(4003),
            Self::UpstreamUnavailable => Some(5011),
            Self::UpstreamThrottled => Some(5012),
            Self::ServerError => Some(5000),
            Self::NormalShutdown => None,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Message roles and presence ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Online,
    Typing,
    Offline,
}

// ── Envelope payloads ────────────────────────────────────────────────────────

pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub conversation_id: String,
    /// Server-assigned on receipt; clients may omit it.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl ChatMessage {
    /// Build a user message with a server-assigned id and the current time.
    #[must_use]
    pub fn user(content: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::User,
            content: content.into(),
            conversation_id: conversation_id.into(),
            timestamp: Utc::now(),
            metadata: Metadata::new(),
        }
    }
}

/// One delta of a streaming response. All chunks of one response share the
/// id of the inbound `chat_message`; `sequence` starts at 0 and increases by
/// 1; exactly one chunk per id carries `final = true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChunk {
    pub id: String,
    pub sequence: u64,
    pub delta: String,
    #[serde(rename = "final")]
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    pub server_time: DateTime<Utc>,
    pub connection_id: String,
    pub limits: LimitsSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: String,
    pub state: PresenceState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub nonce: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub nonce: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub details: Metadata,
}

/// Server-originated control traffic. Bypasses rate limits when sent by an
/// admin principal; the bypass is audited through the telemetry sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemBody {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

/// Client request to cancel the in-flight response with the given id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cancel {
    pub id: String,
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// The unit exchanged over the wire, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    ChatMessage(ChatMessage),
    ChatChunk(ChatChunk),
    Welcome(Welcome),
    History(History),
    Presence(Presence),
    Ping(Ping),
    Pong(Pong),
    Error(ErrorBody),
    System(SystemBody),
    Cancel(Cancel),
}

impl Envelope {
    /// The discriminator string this envelope serializes under.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ChatMessage(_) => "chat_message",
            Self::ChatChunk(_) => "chat_chunk",
            Self::Welcome(_) => "welcome",
            Self::History(_) => "history",
            Self::Presence(_) => "presence",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::Error(_) => "error",
            Self::System(_) => "system",
            Self::Cancel(_) => "cancel",
        }
    }

    /// Build an in-band error envelope for a failure kind.
    ///
    /// Falls back to the `server_error` code for kinds that have no in-band
    /// code of their own.
    #[must_use]
    pub fn error(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Error(ErrorBody {
            code: kind.envelope_code().unwrap_or(5000),
            kind: kind.as_str().to_string(),
            message: message.into(),
            details: Metadata::new(),
        })
    }

    /// Like [`Envelope::error`] but with structured details attached.
    #[must_use]
    pub fn error_with_details(
        kind: FailureKind,
        message: impl Into<String>,
        details: Metadata,
    ) -> Self {
        Self::Error(ErrorBody {
            code: kind.envelope_code().unwrap_or(5000),
            kind: kind.as_str().to_string(),
            message: message.into(),
            details,
        })
    }
}

// ── Limits snapshot ──────────────────────────────────────────────────────────

/// Snapshot of the rate-limiter configuration and current counters, sent in
/// the `welcome` envelope and exposed to admin listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsSnapshot {
    pub max_connections_per_ip: u32,
    pub max_connections_per_user: u32,
    pub messages_per_second: u32,
    pub messages_per_minute: u32,
    pub messages_per_hour: u32,
    pub messages_per_day: u32,
    pub counts: WindowCounts,
}

/// Current counter values per window for one scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCounts {
    pub second: i64,
    pub minute: i64,
    pub hour: i64,
    pub day: i64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sample_message() -> ChatMessage {
        ChatMessage {
            id: "m-1".into(),
            role: Role::User,
            content: "hi".into(),
            conversation_id: "k-1".into(),
            timestamp: "2026-01-01T00:00:00Z".parse().unwrap(),
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn chat_message_round_trips() {
        let env = Envelope::ChatMessage(sample_message());
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn chat_chunk_serializes_final_keyword() {
        let env = Envelope::ChatChunk(ChatChunk {
            id: "m-1".into(),
            sequence: 3,
            delta: String::new(),
            is_final: true,
            metadata: Metadata::new(),
        });
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "chat_chunk");
        assert_eq!(json["final"], true);
        assert_eq!(json["sequence"], 3);
    }

    #[test]
    fn all_variants_round_trip() {
        let envelopes = vec![
            Envelope::ChatMessage(sample_message()),
            Envelope::ChatChunk(ChatChunk {
                id: "m-1".into(),
                sequence: 0,
                delta: "he".into(),
                is_final: false,
                metadata: Metadata::new(),
            }),
            Envelope::History(History {
                messages: vec![sample_message()],
            }),
            Envelope::Presence(Presence {
                user_id: "u-1".into(),
                state: PresenceState::Typing,
            }),
            Envelope::Ping(Ping { nonce: "n".into() }),
            Envelope::Pong(Pong { nonce: "n".into() }),
            Envelope::Error(ErrorBody {
                code: 4002,
                kind: "rate_limit_exceeded".into(),
                message: "slow down".into(),
                details: Metadata::new(),
            }),
            Envelope::System(SystemBody {
                id: "s-1".into(),
                content: "maintenance at noon".into(),
                conversation_id: None,
                metadata: Metadata::new(),
            }),
            Envelope::Cancel(Cancel { id: "m-7".into() }),
        ];
        for env in envelopes {
            let json = serde_json::to_string(&env).unwrap();
            let back: Envelope = serde_json::from_str(&json).unwrap();
            assert_eq!(env, back, "round trip failed for {json}");
        }
    }

    #[test]
    fn unknown_discriminator_is_rejected() {
        let result = serde_json::from_str::<Envelope>(r#"{"type":"telepathy","id":"x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn missing_discriminator_is_rejected() {
        assert!(serde_json::from_str::<Envelope>(r#"{"id":"x"}"#).is_err());
    }

    #[test]
    fn failure_kind_wire_table() {
        use FailureKind::*;
        let table: &[(FailureKind, Option<u16>, Option<u16>)] = &[
            (AuthenticationRequired, Some(1008), Some(4401)),
            (InvalidMessageFormat, None, Some(4001)),
            (RateLimitExceeded, None, Some(4002)),
            (ConnectionLimitExceeded, Some(1008), Some(4003)),
            (UpstreamUnavailable, None, Some(5011)),
            (UpstreamThrottled, None, Some(5012)),
            (ServerError, Some(1011), Some(5000)),
            (NormalShutdown, Some(1000), None),
        ];
        for (kind, close, code) in table {
            assert_eq!(kind.close_code(), *close, "close code for {kind}");
            assert_eq!(kind.envelope_code(), *code, "envelope code for {kind}");
        }
    }

    #[test]
    fn error_envelope_carries_kind_and_code() {
        let env = Envelope::error(FailureKind::RateLimitExceeded, "too fast");
        let Envelope::Error(body) = &env else {
            panic!("expected error envelope");
        };
        assert_eq!(body.code, 4002);
        assert_eq!(body.kind, "rate_limit_exceeded");
    }
}
