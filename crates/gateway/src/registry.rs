//! Authoritative in-process map of active connections.
//!
//! Each entry holds connection metadata plus the bounded sender feeding the
//! connection's write loop. Broadcast snapshots the recipient set under the
//! read lock and delivers outside it through `try_send`; a full queue marks
//! the recipient UNRESPONSIVE with a disconnect deadline instead of blocking
//! or silently dropping.

use std::collections::{HashMap, HashSet};

use {
    chrono::{DateTime, Utc},
    serde::Serialize,
    tokio::sync::{RwLock, broadcast, mpsc},
    tracing::{debug, warn},
};

use {
    parley_auth::Principal,
    parley_metrics::{counter, names},
    parley_protocol::Envelope,
};

// ── Connection states ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Initial,
    Connecting,
    Authenticating,
    Authenticated,
    Ready,
    Streaming,
    Unresponsive,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Whether the lifecycle permits moving to `next` from this state.
    ///
    /// CLOSING is reachable from every live state; CLOSED only from CLOSING.
    /// UNRESPONSIVE may recover to READY when the outgoing queue drains.
    #[must_use]
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closing) => true,
            (Closing, Closed) => true,
            (Initial, Connecting)
            | (Connecting, Authenticating)
            | (Authenticating, Authenticated)
            | (Authenticated, Ready)
            | (Ready, Streaming)
            | (Streaming, Ready)
            | (Ready | Streaming, Unresponsive)
            | (Unresponsive, Ready) => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Ready => "ready",
            Self::Streaming => "streaming",
            Self::Unresponsive => "unresponsive",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("unknown connection {0}")]
    UnknownConnection(String),

    #[error("invalid transition {from:?} -> {to:?}")]
    Invalid {
        from: ConnectionState,
        to: ConnectionState,
    },
}

// ── Outbound frames ──────────────────────────────────────────────────────────

/// What flows through a connection's outgoing channel to its write loop.
#[derive(Debug, Clone)]
pub enum Outbound {
    Envelope(Envelope),
    Close { code: u16, reason: String },
}

// ── Entries and snapshots ────────────────────────────────────────────────────

#[derive(Debug)]
struct ConnectionEntry {
    conn_id: String,
    principal: Option<Principal>,
    remote_ip: String,
    created_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    state: ConnectionState,
    typing: bool,
    last_message_id: Option<String>,
    conversation_id: Option<String>,
    sender: mpsc::Sender<Outbound>,
    unresponsive_since: Option<tokio::time::Instant>,
}

/// Serializable projection of a connection for cross-process observability.
/// Never holds transport handles.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub conn_id: String,
    pub user_id: Option<String>,
    pub remote_ip: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub state: ConnectionState,
    pub typing: bool,
    pub last_message_id: Option<String>,
    pub conversation_id: Option<String>,
}

impl ConnectionEntry {
    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            conn_id: self.conn_id.clone(),
            user_id: self.principal.as_ref().map(|p| p.user_id.clone()),
            remote_ip: self.remote_ip.clone(),
            created_at: self.created_at,
            last_seen: self.last_seen,
            state: self.state,
            typing: self.typing,
            last_message_id: self.last_message_id.clone(),
            conversation_id: self.conversation_id.clone(),
        }
    }
}

// ── Lifecycle events ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered { conn_id: String },
    StateChanged {
        conn_id: String,
        state: ConnectionState,
    },
    Unregistered { conn_id: String },
}

// ── Registry ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Inner {
    connections: HashMap<String, ConnectionEntry>,
    by_user: HashMap<String, HashSet<String>>,
    by_ip: HashMap<String, HashSet<String>>,
}

pub struct Registry {
    inner: RwLock<Inner>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: RwLock::new(Inner::default()),
            events,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }

    /// Insert a new connection in state CONNECTING.
    pub async fn register(
        &self,
        conn_id: &str,
        remote_ip: &str,
        conversation_id: Option<String>,
        sender: mpsc::Sender<Outbound>,
    ) {
        let now = Utc::now();
        let entry = ConnectionEntry {
            conn_id: conn_id.to_string(),
            principal: None,
            remote_ip: remote_ip.to_string(),
            created_at: now,
            last_seen: now,
            state: ConnectionState::Connecting,
            typing: false,
            last_message_id: None,
            conversation_id,
            sender,
            unresponsive_since: None,
        };
        let mut inner = self.inner.write().await;
        inner
            .by_ip
            .entry(remote_ip.to_string())
            .or_default()
            .insert(conn_id.to_string());
        inner.connections.insert(conn_id.to_string(), entry);
        drop(inner);
        self.publish(RegistryEvent::Registered {
            conn_id: conn_id.to_string(),
        });
    }

    /// Bind the authenticated principal to a connection.
    pub async fn set_principal(&self, conn_id: &str, principal: Principal) {
        let mut inner = self.inner.write().await;
        inner
            .by_user
            .entry(principal.user_id.clone())
            .or_default()
            .insert(conn_id.to_string());
        if let Some(entry) = inner.connections.get_mut(conn_id) {
            entry.principal = Some(principal);
        }
    }

    /// Validated state change. Returns the previous state.
    pub async fn transition(
        &self,
        conn_id: &str,
        next: ConnectionState,
    ) -> Result<ConnectionState, TransitionError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .connections
            .get_mut(conn_id)
            .ok_or_else(|| TransitionError::UnknownConnection(conn_id.to_string()))?;
        if !entry.state.can_transition_to(next) {
            return Err(TransitionError::Invalid {
                from: entry.state,
                to: next,
            });
        }
        let previous = entry.state;
        entry.state = next;
        if next != ConnectionState::Unresponsive {
            entry.unresponsive_since = None;
        }
        drop(inner);
        debug!(conn_id, from = previous.as_str(), to = next.as_str(), "state transition");
        self.publish(RegistryEvent::StateChanged {
            conn_id: conn_id.to_string(),
            state: next,
        });
        Ok(previous)
    }

    pub async fn state(&self, conn_id: &str) -> Option<ConnectionState> {
        self.inner
            .read()
            .await
            .connections
            .get(conn_id)
            .map(|e| e.state)
    }

    /// Update last-seen to now.
    pub async fn heartbeat(&self, conn_id: &str) {
        if let Some(entry) = self.inner.write().await.connections.get_mut(conn_id) {
            entry.last_seen = Utc::now();
        }
    }

    /// Set the typing flag, returning the previous value.
    pub async fn set_typing(&self, conn_id: &str, typing: bool) -> Option<bool> {
        let mut inner = self.inner.write().await;
        let entry = inner.connections.get_mut(conn_id)?;
        let previous = entry.typing;
        entry.typing = typing;
        Some(previous)
    }

    pub async fn set_conversation(&self, conn_id: &str, conversation_id: &str) {
        if let Some(entry) = self.inner.write().await.connections.get_mut(conn_id) {
            entry.conversation_id = Some(conversation_id.to_string());
        }
    }

    pub async fn conversation(&self, conn_id: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .connections
            .get(conn_id)
            .and_then(|e| e.conversation_id.clone())
    }

    pub async fn set_last_message(&self, conn_id: &str, message_id: &str) {
        if let Some(entry) = self.inner.write().await.connections.get_mut(conn_id) {
            entry.last_message_id = Some(message_id.to_string());
        }
    }

    pub async fn count_by_user(&self, user_id: &str) -> usize {
        self.inner
            .read()
            .await
            .by_user
            .get(user_id)
            .map_or(0, HashSet::len)
    }

    pub async fn count_by_ip(&self, ip: &str) -> usize {
        self.inner
            .read()
            .await
            .by_ip
            .get(ip)
            .map_or(0, HashSet::len)
    }

    pub async fn snapshot(&self, conn_id: &str) -> Option<ConnectionSnapshot> {
        self.inner
            .read()
            .await
            .connections
            .get(conn_id)
            .map(ConnectionEntry::snapshot)
    }

    pub async fn snapshots(&self) -> Vec<ConnectionSnapshot> {
        self.inner
            .read()
            .await
            .connections
            .values()
            .map(ConnectionEntry::snapshot)
            .collect()
    }

    /// How long a connection has been UNRESPONSIVE, if it is.
    pub async fn unresponsive_for(&self, conn_id: &str) -> Option<tokio::time::Duration> {
        self.inner
            .read()
            .await
            .connections
            .get(conn_id)
            .and_then(|e| e.unresponsive_since)
            .map(|since| since.elapsed())
    }

    /// Deliver an envelope to every connection joined to `conversation_id`,
    /// except `except`. Returns the number of queues the envelope reached.
    ///
    /// Recipients are snapshotted under the read lock; delivery happens
    /// outside it. A full outgoing queue marks that recipient UNRESPONSIVE —
    /// one slow consumer never affects the others.
    pub async fn broadcast(
        &self,
        conversation_id: &str,
        envelope: &Envelope,
        except: Option<&str>,
    ) -> usize {
        let recipients: Vec<(String, mpsc::Sender<Outbound>)> = {
            let inner = self.inner.read().await;
            inner
                .connections
                .values()
                .filter(|entry| {
                    entry.conversation_id.as_deref() == Some(conversation_id)
                        && except != Some(entry.conn_id.as_str())
                        && matches!(
                            entry.state,
                            ConnectionState::Ready | ConnectionState::Streaming
                        )
                })
                .map(|entry| (entry.conn_id.clone(), entry.sender.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (conn_id, sender) in recipients {
            match sender.try_send(Outbound::Envelope(envelope.clone())) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(conn_id, "broadcast: outgoing queue full, marking unresponsive");
                    self.mark_unresponsive(&conn_id).await;
                },
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Teardown in progress; unregister will reap the entry.
                },
            }
        }
        delivered
    }

    /// Mark a connection UNRESPONSIVE and start its disconnect clock.
    pub async fn mark_unresponsive(&self, conn_id: &str) {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.connections.get_mut(conn_id) else {
            return;
        };
        if !entry.state.can_transition_to(ConnectionState::Unresponsive) {
            return;
        }
        entry.state = ConnectionState::Unresponsive;
        if entry.unresponsive_since.is_none() {
            entry.unresponsive_since = Some(tokio::time::Instant::now());
        }
        drop(inner);
        counter!(names::ws::UNRESPONSIVE_TOTAL).increment(1);
        self.publish(RegistryEvent::StateChanged {
            conn_id: conn_id.to_string(),
            state: ConnectionState::Unresponsive,
        });
    }

    /// Remove a connection and its index entries. The caller releases the
    /// limiter's conn counts.
    pub async fn unregister(&self, conn_id: &str) -> Option<ConnectionSnapshot> {
        let mut inner = self.inner.write().await;
        let entry = inner.connections.remove(conn_id)?;
        if let Some(ids) = inner.by_ip.get_mut(&entry.remote_ip) {
            ids.remove(conn_id);
            if ids.is_empty() {
                inner.by_ip.remove(&entry.remote_ip);
            }
        }
        if let Some(principal) = &entry.principal
            && let Some(ids) = inner.by_user.get_mut(&principal.user_id)
        {
            ids.remove(conn_id);
            if ids.is_empty() {
                inner.by_user.remove(&principal.user_id);
            }
        }
        drop(inner);
        self.publish(RegistryEvent::Unregistered {
            conn_id: conn_id.to_string(),
        });
        Some(entry.snapshot())
    }

    /// Ask every live connection to close. Used at server shutdown.
    pub async fn close_all(&self, code: u16, reason: &str) {
        let senders: Vec<mpsc::Sender<Outbound>> = {
            let inner = self.inner.read().await;
            inner
                .connections
                .values()
                .map(|e| e.sender.clone())
                .collect()
        };
        for sender in senders {
            let _ = sender.try_send(Outbound::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }
}
