//! Distributed rate limiter over the shared KV store.
//!
//! Connection and message quotas are counted per scope (client id, user id,
//! or ip) without any coordination beyond the store's atomic `incr`. Message
//! windows are fixed windows: counters carry a TTL equal to the window size
//! and stay incremented even when an admission is denied.
//!
//! Failure policy is asymmetric: when the KV store is unreachable, message
//! admission fails open and connection admission fails closed. Accepting an
//! extra connection is costlier than dropping one message.

use std::{sync::Arc, time::Duration};

use tracing::warn;

use {
    parley_kv::{KvError, KvReply, KvStore, Pipeline},
    parley_metrics::{counter, names},
    parley_protocol::{FailureKind, LimitsSnapshot, WindowCounts},
};

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_connections_per_ip: u32,
    pub max_connections_per_user: u32,
    pub messages_per_second: u32,
    pub messages_per_minute: u32,
    pub messages_per_hour: u32,
    pub messages_per_day: u32,
    /// Handshake-to-READY deadline.
    pub connect_timeout: Duration,
    /// Idle detection and outgoing-queue saturation deadline.
    pub message_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_connections_per_ip: 2,
            max_connections_per_user: 5,
            messages_per_second: 5,
            messages_per_minute: 60,
            messages_per_hour: 1000,
            messages_per_day: 10_000,
            connect_timeout: Duration::from_secs(10),
            message_timeout: Duration::from_secs(30),
        }
    }
}

// ── Scopes and windows ───────────────────────────────────────────────────────

/// An identifier axis along which the limiter counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Client(String),
    User(String),
    Ip(String),
}

impl Scope {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Client(_) => "client",
            Self::User(_) => "user",
            Self::Ip(_) => "ip",
        }
    }

    fn identifier(&self) -> &str {
        match self {
            Self::Client(id) | Self::User(id) | Self::Ip(id) => id,
        }
    }
}

/// A counting window. `Connections` has no TTL; it is decremented on
/// disconnect instead of expiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Second,
    Minute,
    Hour,
    Day,
    Connections,
}

impl Window {
    const MESSAGE_WINDOWS: [Window; 4] = [Self::Second, Self::Minute, Self::Hour, Self::Day];

    fn suffix(self) -> &'static str {
        match self {
            Self::Second => "sec",
            Self::Minute => "min",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Connections => "conn",
        }
    }

    fn ttl(self) -> Duration {
        match self {
            Self::Second => Duration::from_secs(1),
            Self::Minute => Duration::from_secs(60),
            Self::Hour => Duration::from_secs(3600),
            Self::Day => Duration::from_secs(86_400),
            Self::Connections => Duration::ZERO,
        }
    }

    fn limit(self, config: &RateLimitConfig) -> u32 {
        match self {
            Self::Second => config.messages_per_second,
            Self::Minute => config.messages_per_minute,
            Self::Hour => config.messages_per_hour,
            Self::Day => config.messages_per_day,
            Self::Connections => 0,
        }
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.suffix())
    }
}

fn counter_key(scope: &Scope, window: Window) -> String {
    format!(
        "rl:{}:{}:{}",
        scope.prefix(),
        scope.identifier(),
        window.suffix()
    )
}

// ── Decisions ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(Denial),
}

impl Decision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub kind: FailureKind,
    /// The window whose limit was exceeded, for message denials.
    pub window: Option<Window>,
    pub limit: u32,
}

// ── Limiter ──────────────────────────────────────────────────────────────────

pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, config: RateLimitConfig) -> Self {
        Self { kv, config }
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admit or deny a new connection for (user, ip).
    ///
    /// Both conn counters are incremented in one batch; on denial they are
    /// rolled back in a second batch. A failed rollback is audited and the
    /// original rejection stands — conn keys have no TTL and are only ever
    /// decremented by disconnects, so reconciliation happens there.
    pub async fn admit_connection(&self, user_id: &str, ip: &str) -> Decision {
        let ip_key = counter_key(&Scope::Ip(ip.into()), Window::Connections);
        let user_key = counter_key(&Scope::User(user_id.into()), Window::Connections);

        let replies = Pipeline::new()
            .incr(ip_key.as_str())
            .incr(user_key.as_str())
            .run(self.kv.as_ref())
            .await;

        let replies = match replies {
            Ok(replies) => replies,
            Err(err) => {
                // Fail closed: an uncounted connection could exceed limits
                // for the whole lifetime of the socket.
                counter!(names::limiter::KV_UNAVAILABLE_TOTAL).increment(1);
                warn!(error = %err, "limiter: kv failure during connection admission, denying");
                return Decision::Denied(Denial {
                    kind: FailureKind::ServerError,
                    window: None,
                    limit: 0,
                });
            },
        };

        let ip_count = replies.first().and_then(KvReply::as_int).unwrap_or(i64::MAX);
        let user_count = replies.get(1).and_then(KvReply::as_int).unwrap_or(i64::MAX);

        let over_ip = ip_count > i64::from(self.config.max_connections_per_ip);
        let over_user = user_count > i64::from(self.config.max_connections_per_user);
        if !(over_ip || over_user) {
            return Decision::Allowed;
        }

        let rollback = Pipeline::new()
            .decr(ip_key.as_str())
            .decr(user_key.as_str())
            .run(self.kv.as_ref())
            .await;
        if let Err(err) = rollback {
            counter!(names::limiter::ROLLBACK_FAILED_TOTAL).increment(1);
            warn!(error = %err, ip, user_id, "limiter: connection rollback failed");
        }

        counter!(names::limiter::CONNECTIONS_DENIED_TOTAL).increment(1);
        let limit = if over_ip {
            self.config.max_connections_per_ip
        } else {
            self.config.max_connections_per_user
        };
        Decision::Denied(Denial {
            kind: FailureKind::ConnectionLimitExceeded,
            window: None,
            limit,
        })
    }

    /// Decrement the conn counters for a terminated connection.
    pub async fn release_connection(&self, user_id: &str, ip: &str) {
        let result = Pipeline::new()
            .decr(counter_key(&Scope::Ip(ip.into()), Window::Connections))
            .decr(counter_key(
                &Scope::User(user_id.into()),
                Window::Connections,
            ))
            .run(self.kv.as_ref())
            .await;
        if let Err(err) = result {
            warn!(error = %err, ip, user_id, "limiter: connection release failed");
        }
    }

    /// Admit or deny one message for a scope across all four windows.
    ///
    /// Fixed-window semantics: the counters stay incremented on denial. Each
    /// `expire` is best-effort; a lost key is recreated (with its TTL) by the
    /// next successful admission.
    pub async fn admit_message(&self, scope: &Scope) -> Decision {
        let mut pipeline = Pipeline::new();
        for window in Window::MESSAGE_WINDOWS {
            let key = counter_key(scope, window);
            pipeline = pipeline.incr(key.as_str()).expire(key.as_str(), window.ttl());
        }

        let replies = match pipeline.run(self.kv.as_ref()).await {
            Ok(replies) => replies,
            Err(KvError::Unavailable(err)) => {
                // Fail open: dropping a user's message is worse than letting
                // one through uncounted.
                counter!(names::limiter::KV_UNAVAILABLE_TOTAL).increment(1);
                warn!(error = %err, "limiter: kv unavailable during message admission, allowing");
                return Decision::Allowed;
            },
            Err(err @ KvError::TypeError { .. }) => {
                warn!(error = %err, "limiter: corrupt counter key, allowing");
                return Decision::Allowed;
            },
        };

        for (i, window) in Window::MESSAGE_WINDOWS.iter().enumerate() {
            // Replies interleave incr/expire pairs; counts sit at even slots.
            let count = replies.get(i * 2).and_then(KvReply::as_int).unwrap_or(0);
            let limit = window.limit(&self.config);
            if count > i64::from(limit) {
                counter!(names::limiter::MESSAGES_DENIED_TOTAL).increment(1);
                return Decision::Denied(Denial {
                    kind: FailureKind::RateLimitExceeded,
                    window: Some(*window),
                    limit,
                });
            }
        }
        Decision::Allowed
    }

    /// Audit one admin `system` envelope that skipped message counting.
    pub fn record_system_bypass(&self) {
        counter!(names::limiter::SYSTEM_BYPASS_TOTAL).increment(1);
    }

    /// Current limits and window counters for a scope (welcome frame, admin
    /// listings). Counter reads are best-effort; unreadable counts report 0.
    pub async fn snapshot(&self, scope: &Scope) -> LimitsSnapshot {
        let mut pipeline = Pipeline::new();
        for window in Window::MESSAGE_WINDOWS {
            pipeline = pipeline.get(counter_key(scope, window));
        }
        let replies = pipeline.run(self.kv.as_ref()).await.unwrap_or_default();

        let count_at = |i: usize| -> i64 {
            match replies.get(i) {
                Some(KvReply::Bytes(Some(bytes))) => std::str::from_utf8(bytes)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
                _ => 0,
            }
        };

        LimitsSnapshot {
            max_connections_per_ip: self.config.max_connections_per_ip,
            max_connections_per_user: self.config.max_connections_per_user,
            messages_per_second: self.config.messages_per_second,
            messages_per_minute: self.config.messages_per_minute,
            messages_per_hour: self.config.messages_per_hour,
            messages_per_day: self.config.messages_per_day,
            counts: WindowCounts {
                second: count_at(0),
                minute: count_at(1),
                hour: count_at(2),
                day: count_at(3),
            },
        }
    }

    /// Clear window counters for one user, or all scopes when `user_id` is
    /// `None`. Conn counters are left alone: they are maintained exclusively
    /// by connect/disconnect and a reset would desynchronize them from the
    /// live connections. Returns the number of keys deleted.
    pub async fn reset(&self, user_id: Option<&str>) -> parley_kv::Result<u64> {
        let keys: Vec<String> = match user_id {
            Some(user_id) => {
                let scope = Scope::User(user_id.into());
                Window::MESSAGE_WINDOWS
                    .iter()
                    .map(|w| counter_key(&scope, *w))
                    .collect()
            },
            None => self
                .kv
                .keys("rl:*")
                .await?
                .into_iter()
                .filter(|k| !k.ends_with(":conn"))
                .collect(),
        };

        let mut deleted = 0;
        let mut pipeline = Pipeline::new();
        for key in &keys {
            pipeline = pipeline.del(key.as_str());
        }
        if !pipeline.is_empty() {
            for reply in pipeline.run(self.kv.as_ref()).await? {
                if reply.as_bool() == Some(true) {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }
}
