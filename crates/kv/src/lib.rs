//! Capability interface over the shared key-value store.
//!
//! All distributed state (rate counters, history rings, the response cache)
//! flows through [`KvStore`]. The trait normalizes the underlying store's
//! conventions so callers never see protocol quirks:
//!
//! - `set` returns `bool`, never a raw protocol "OK" string.
//! - `ttl` returns [`KeyTtl`] instead of the -1/-2 sentinel integers.
//! - An absent counter key is equivalent to count 0; `incr` creates it at 1.
//!
//! Batched mutations go through [`KvStore::exec`], which executes the queued
//! commands atomically and returns one reply per command in submission order.
//! [`Pipeline`] is a small builder over `exec`.
//!
//! Failures surface as [`KvError::Unavailable`] (connection/timeout) or
//! [`KvError::TypeError`] (wrong type at key).

mod memory;
mod redis_store;

pub use {memory::MemoryKv, redis_store::RedisKv};

use std::time::Duration;

use async_trait::async_trait;

// ── Errors ───────────────────────────────────────────────────────────────────

pub type Result<T> = std::result::Result<T, KvError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum KvError {
    /// The store could not be reached or timed out.
    #[error("kv unavailable: {0}")]
    Unavailable(String),

    /// The key holds a value of the wrong type for the operation.
    #[error("wrong value type at key {key}")]
    TypeError { key: String },
}

impl KvError {
    /// Stable wire/telemetry name for this error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "kv_unavailable",
            Self::TypeError { .. } => "kv_type_error",
        }
    }
}

// ── TTL normalization ────────────────────────────────────────────────────────

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key exists and expires in this many seconds.
    Remaining(u64),
    /// Key exists and has no expiry.
    NoExpiry,
    /// Key does not exist.
    Missing,
}

// ── Batch commands ───────────────────────────────────────────────────────────

/// A single command queued into a pipelined batch.
#[derive(Debug, Clone)]
pub enum KvCommand {
    Get(String),
    Set {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    Incr(String),
    Decr(String),
    Expire {
        key: String,
        ttl: Duration,
    },
    RPush {
        key: String,
        value: Vec<u8>,
    },
    LTrim {
        key: String,
        start: i64,
        stop: i64,
    },
    Del(String),
}

/// Reply to one batched command, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvReply {
    Bytes(Option<Vec<u8>>),
    Int(i64),
    Bool(bool),
    Unit,
}

impl KvReply {
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

// ── Store trait ──────────────────────────────────────────────────────────────

/// The shared key-value store capability.
///
/// Operations are logically synchronous from the caller's view; backends are
/// non-blocking. All methods are safe for concurrent callers.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set a value, optionally with a TTL. Returns `true` on success.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool>;

    /// Atomically increment an integer value; an absent key is created at 1.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Atomically decrement an integer value; an absent key is created at -1.
    async fn decr(&self, key: &str) -> Result<i64>;

    /// Set a TTL on an existing key. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<bool>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;

    /// Push to the left of a list; returns the new length.
    async fn lpush(&self, key: &str, value: &[u8]) -> Result<i64>;

    /// Push to the right of a list; returns the new length.
    async fn rpush(&self, key: &str, value: &[u8]) -> Result<i64>;

    /// Inclusive range, 0-indexed from the oldest entry; negative indices
    /// count from the end.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>>;

    /// Trim a list to the inclusive range.
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()>;

    /// Delete a key. Returns `false` if the key was absent.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Glob-style key scan. Admin surface only; may be slow.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Execute a batch atomically, preserving command order in the replies.
    async fn exec(&self, commands: Vec<KvCommand>) -> Result<Vec<KvReply>>;
}

// ── Pipeline builder ─────────────────────────────────────────────────────────

/// Builder that queues commands for a single atomic [`KvStore::exec`] call.
#[derive(Debug, Default)]
pub struct Pipeline {
    commands: Vec<KvCommand>,
}

impl Pipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(mut self, key: impl Into<String>) -> Self {
        self.commands.push(KvCommand::Get(key.into()));
        self
    }

    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: Vec<u8>, ttl: Option<Duration>) -> Self {
        self.commands.push(KvCommand::Set {
            key: key.into(),
            value,
            ttl,
        });
        self
    }

    #[must_use]
    pub fn incr(mut self, key: impl Into<String>) -> Self {
        self.commands.push(KvCommand::Incr(key.into()));
        self
    }

    #[must_use]
    pub fn decr(mut self, key: impl Into<String>) -> Self {
        self.commands.push(KvCommand::Decr(key.into()));
        self
    }

    #[must_use]
    pub fn expire(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.commands.push(KvCommand::Expire {
            key: key.into(),
            ttl,
        });
        self
    }

    #[must_use]
    pub fn rpush(mut self, key: impl Into<String>, value: Vec<u8>) -> Self {
        self.commands.push(KvCommand::RPush {
            key: key.into(),
            value,
        });
        self
    }

    #[must_use]
    pub fn ltrim(mut self, key: impl Into<String>, start: i64, stop: i64) -> Self {
        self.commands.push(KvCommand::LTrim {
            key: key.into(),
            start,
            stop,
        });
        self
    }

    #[must_use]
    pub fn del(mut self, key: impl Into<String>) -> Self {
        self.commands.push(KvCommand::Del(key.into()));
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub async fn run(self, store: &dyn KvStore) -> Result<Vec<KvReply>> {
        store.exec(self.commands).await
    }
}
