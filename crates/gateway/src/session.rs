//! Per-connection session state machine.
//!
//! One task owns each connection end to end: handshake (token from the query
//! string) → auth → connection admission → welcome + history replay → the
//! steady-state loop → teardown. The loop multiplexes three event sources —
//! inbound envelopes, chunks from the in-flight LLM stream, and the
//! heartbeat timer — in a single thread of control; broadcasts from other
//! connections enter through the bounded outgoing channel, whose write loop
//! is the sole writer to the transport.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use {
    axum::extract::ws::{CloseFrame, Message, WebSocket},
    chrono::Utc,
    futures::{
        SinkExt, StreamExt,
        stream::{SplitSink, SplitStream},
    },
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
    uuid::Uuid,
};

use {
    parley_auth::Principal,
    parley_limits::{Decision, Scope},
    parley_metrics::{counter, gauge, histogram, names},
    parley_protocol::{
        ChatMessage, Envelope, FailureKind, History, MAX_PAYLOAD_BYTES, Metadata,
        OUTGOING_QUEUE_CAPACITY, Pong, Presence, PresenceState, Role, SystemBody, Welcome,
        close_codes,
    },
    parley_providers::StreamHandle,
};

use crate::{
    registry::{ConnectionState, Outbound},
    state::GatewayState,
};

const MALFORMED_BURST_LIMIT: usize = 5;
const MALFORMED_BURST_WINDOW: Duration = Duration::from_secs(1);

// ── Entry point ──────────────────────────────────────────────────────────────

/// Drive one WebSocket connection through its full lifecycle.
pub async fn handle_socket(
    socket: WebSocket,
    state: Arc<GatewayState>,
    remote_ip: String,
    token: Option<String>,
    conversation_id: Option<String>,
) {
    let conn_id = Uuid::new_v4().to_string();
    counter!(names::ws::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::ws::CONNECTIONS_ACTIVE).increment(1.0);
    let started = std::time::Instant::now();
    info!(conn_id, remote_ip, "ws: new connection");

    let (ws_tx, ws_rx) = socket.split();
    let (outgoing, outgoing_rx) = mpsc::channel::<Outbound>(OUTGOING_QUEUE_CAPACITY);
    let mut write_handle = tokio::spawn(write_loop(ws_tx, outgoing_rx, conn_id.clone()));

    state
        .registry
        .register(&conn_id, &remote_ip, conversation_id.clone(), outgoing.clone())
        .await;
    let _ = state
        .registry
        .transition(&conn_id, ConnectionState::Authenticating)
        .await;

    let release_limits = match establish(
        &state,
        &conn_id,
        &remote_ip,
        token.as_deref(),
        conversation_id.as_deref(),
        &outgoing,
    )
    .await
    {
        Ok(principal) => {
            let mut session = Session {
                conn_id: conn_id.clone(),
                state: Arc::clone(&state),
                outgoing: outgoing.clone(),
                principal,
                in_flight: None,
                pending: VecDeque::new(),
                malformed_at: VecDeque::new(),
                last_activity: tokio::time::Instant::now(),
            };
            let reason = session.run(ws_rx).await;
            session.announce_close(&reason).await;
            if let Some(flight) = &session.in_flight {
                flight.handle.cancel();
            }
            true
        },
        Err(failed) => failed.release_limits,
    };

    // ── Teardown ─────────────────────────────────────────────────────────

    let _ = state
        .registry
        .transition(&conn_id, ConnectionState::Closing)
        .await;
    let _ = state
        .registry
        .transition(&conn_id, ConnectionState::Closed)
        .await;

    let snapshot = state.registry.unregister(&conn_id).await;
    if let Some(snapshot) = &snapshot
        && let (Some(user_id), Some(conversation)) =
            (&snapshot.user_id, &snapshot.conversation_id)
    {
        let offline = Envelope::Presence(Presence {
            user_id: user_id.clone(),
            state: PresenceState::Offline,
        });
        state.registry.broadcast(conversation, &offline, None).await;
    }

    if release_limits && let Some(user_id) = snapshot.as_ref().and_then(|s| s.user_id.clone()) {
        state.limiter.release_connection(&user_id, &remote_ip).await;
    }

    drop(outgoing);
    if tokio::time::timeout(Duration::from_secs(1), &mut write_handle)
        .await
        .is_err()
    {
        debug!(conn_id, "ws: write loop did not drain in time");
        write_handle.abort();
    }

    gauge!(names::ws::CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(names::ws::SESSION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    info!(conn_id, duration_secs = started.elapsed().as_secs(), "ws: connection closed");
}

// ── Write loop ───────────────────────────────────────────────────────────────

/// Sole writer to the transport: forwards queued envelopes, terminates on a
/// close instruction or a dead socket.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    conn_id: String,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Envelope(envelope) => {
                let json = match serde_json::to_string(&envelope) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(conn_id, error = %e, "ws: envelope serialization failed");
                        continue;
                    },
                };
                counter!(names::ws::ENVELOPES_SENT_TOTAL).increment(1);
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    debug!(conn_id, "ws: write loop closed");
                    break;
                }
            },
            Outbound::Close { code, reason } => {
                let _ = ws_tx
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            },
        }
    }
}

// ── Handshake phase ──────────────────────────────────────────────────────────

/// A rejected handshake. The error frame and close have already been sent;
/// `release_limits` says whether connection admission had completed and the
/// conn counters must be decremented on teardown.
struct HandshakeFailed {
    release_limits: bool,
}

/// Authenticate, admit, and bring the connection to READY. One deadline of
/// `connect_timeout` covers the whole path, so a stalled dependency can never
/// hold a connection in AUTHENTICATING past the budget: auth, admission, and
/// the welcome/history sends each run under `timeout_at` the same instant.
async fn establish(
    state: &Arc<GatewayState>,
    conn_id: &str,
    remote_ip: &str,
    token: Option<&str>,
    conversation_id: Option<&str>,
    outgoing: &mpsc::Sender<Outbound>,
) -> Result<Principal, HandshakeFailed> {
    let deadline = tokio::time::Instant::now() + state.limiter.config().connect_timeout;
    let not_admitted = HandshakeFailed {
        release_limits: false,
    };

    let Some(token) = token else {
        warn!(conn_id, "ws: missing token");
        reject(outgoing, FailureKind::AuthenticationRequired, "token required", None).await;
        return Err(not_admitted);
    };

    let validated = tokio::time::timeout_at(deadline, state.auth.validate(token)).await;
    let principal = match validated {
        Ok(Ok(principal)) => principal,
        Ok(Err(failure)) => {
            warn!(conn_id, reason = failure.as_str(), "ws: auth failed");
            let mut details = Metadata::new();
            details.insert("reason".into(), failure.as_str().into());
            reject(
                outgoing,
                FailureKind::AuthenticationRequired,
                "authentication failed",
                Some(details),
            )
            .await;
            return Err(not_admitted);
        },
        Err(_) => {
            warn!(conn_id, "ws: authentication timed out");
            reject(outgoing, FailureKind::AuthenticationRequired, "handshake timeout", None)
                .await;
            return Err(not_admitted);
        },
    };

    let admitted = tokio::time::timeout_at(
        deadline,
        state.limiter.admit_connection(&principal.user_id, remote_ip),
    )
    .await;
    match admitted {
        Ok(Decision::Allowed) => {},
        Ok(Decision::Denied(denial)) => {
            info!(conn_id, user_id = %principal.user_id, kind = denial.kind.as_str(), "ws: connection denied");
            reject(outgoing, denial.kind, "connection limit exceeded", None).await;
            return Err(not_admitted);
        },
        Err(_) => {
            // The admission batch was abandoned mid-flight; the conn counters
            // may hold an uncounted excess for this attempt.
            warn!(conn_id, user_id = %principal.user_id, "ws: deadline hit during connection admission");
            reject(outgoing, FailureKind::ServerError, "handshake timeout", None).await;
            return Err(not_admitted);
        },
    }

    state.registry.set_principal(conn_id, principal.clone()).await;
    let _ = state
        .registry
        .transition(conn_id, ConnectionState::Authenticated)
        .await;

    let greeted = tokio::time::timeout_at(
        deadline,
        send_welcome_and_history(state, conn_id, &principal, conversation_id, outgoing),
    )
    .await;
    if greeted.is_err() {
        warn!(conn_id, user_id = %principal.user_id, "ws: deadline hit before welcome");
        reject(outgoing, FailureKind::ServerError, "handshake timeout", None).await;
        return Err(HandshakeFailed {
            release_limits: true,
        });
    }

    let _ = state
        .registry
        .transition(conn_id, ConnectionState::Ready)
        .await;

    if let Some(conversation) = conversation_id {
        let online = Envelope::Presence(Presence {
            user_id: principal.user_id.clone(),
            state: PresenceState::Online,
        });
        state
            .registry
            .broadcast(conversation, &online, Some(conn_id))
            .await;
    }

    info!(conn_id, user_id = %principal.user_id, "ws: session ready");
    Ok(principal)
}

/// The limits snapshot + welcome frame, then the history replay frame.
async fn send_welcome_and_history(
    state: &Arc<GatewayState>,
    conn_id: &str,
    principal: &Principal,
    conversation_id: Option<&str>,
    outgoing: &mpsc::Sender<Outbound>,
) {
    let limits = state
        .limiter
        .snapshot(&Scope::User(principal.user_id.clone()))
        .await;
    let welcome = Envelope::Welcome(Welcome {
        server_time: Utc::now(),
        connection_id: conn_id.to_string(),
        limits,
    });
    let _ = outgoing.send(Outbound::Envelope(welcome)).await;

    let messages = match conversation_id {
        Some(conversation) => state
            .history
            .range(conversation, 0, -1)
            .await
            .unwrap_or_else(|e| {
                warn!(conn_id, error = %e, "ws: history replay failed");
                Vec::new()
            }),
        None => Vec::new(),
    };
    let _ = outgoing
        .send(Outbound::Envelope(Envelope::History(History { messages })))
        .await;
}

/// Send an in-band error followed by the mapped close code.
async fn reject(
    outgoing: &mpsc::Sender<Outbound>,
    kind: FailureKind,
    message: &str,
    details: Option<Metadata>,
) {
    let envelope = match details {
        Some(details) => Envelope::error_with_details(kind, message, details),
        None => Envelope::error(kind, message),
    };
    let _ = outgoing.send(Outbound::Envelope(envelope)).await;
    let _ = outgoing
        .send(Outbound::Close {
            code: kind.close_code().unwrap_or(close_codes::POLICY_VIOLATION),
            reason: kind.as_str().to_string(),
        })
        .await;
}

// ── Steady state ─────────────────────────────────────────────────────────────

/// Why the session loop ended.
#[derive(Debug)]
enum CloseReason {
    /// Peer closed or the transport died; nothing left to send.
    Peer,
    /// Server is shutting down.
    Shutdown,
    /// Too many malformed frames in a burst.
    MalformedBurst,
    /// Outgoing queue stayed saturated past the grace period.
    Unresponsive,
    /// In-flight stream stalled with no activity.
    Stalled,
}

struct InFlight {
    request_id: String,
    conversation_id: String,
    handle: StreamHandle,
    collected: String,
}

struct Session {
    conn_id: String,
    state: Arc<GatewayState>,
    outgoing: mpsc::Sender<Outbound>,
    principal: Principal,
    in_flight: Option<InFlight>,
    pending: VecDeque<ChatMessage>,
    malformed_at: VecDeque<tokio::time::Instant>,
    last_activity: tokio::time::Instant,
}

/// Resolve the next chunk of the in-flight stream, or park forever when
/// there is none.
async fn next_chunk(in_flight: &mut Option<InFlight>) -> Option<Envelope> {
    match in_flight {
        Some(flight) => flight.handle.receiver.recv().await,
        None => std::future::pending().await,
    }
}

impl Session {
    async fn run(&mut self, mut ws_rx: SplitStream<WebSocket>) -> CloseReason {
        let message_timeout = self.state.limiter.config().message_timeout;
        let ping_period = message_timeout / 2;
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + ping_period,
            ping_period,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                inbound = ws_rx.next() => match inbound {
                    None => return CloseReason::Peer,
                    Some(Err(e)) => {
                        debug!(conn_id = %self.conn_id, error = %e, "ws: read error");
                        return CloseReason::Peer;
                    },
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reason) = self.handle_text(text.to_string()).await {
                            return reason;
                        }
                    },
                    Some(Ok(Message::Binary(_))) => {
                        if let Some(reason) =
                            self.protocol_error("binary frames are not supported").await
                        {
                            return reason;
                        }
                    },
                    Some(Ok(Message::Close(_))) => return CloseReason::Peer,
                    Some(Ok(_)) => {},
                },

                chunk = next_chunk(&mut self.in_flight) => {
                    self.on_chunk(chunk).await;
                },

                _ = ticker.tick() => {
                    if let Some(reason) = self.on_tick(message_timeout).await {
                        return reason;
                    }
                },

                () = self.state.shutdown.cancelled() => return CloseReason::Shutdown,
            }
        }
    }

    // ── Inbound dispatch ─────────────────────────────────────────────────

    async fn handle_text(&mut self, text: String) -> Option<CloseReason> {
        if text.len() > MAX_PAYLOAD_BYTES {
            warn!(conn_id = %self.conn_id, size = text.len(), "ws: payload too large");
            return self.protocol_error("payload too large").await;
        }

        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(conn_id = %self.conn_id, error = %e, "ws: invalid envelope");
                return self.protocol_error("invalid envelope").await;
            },
        };

        counter!(names::ws::ENVELOPES_RECEIVED_TOTAL).increment(1);
        self.touch().await;

        match envelope {
            Envelope::ChatMessage(message) => self.handle_chat(message).await,
            Envelope::Cancel(cancel) => {
                self.pending.retain(|m| m.id != cancel.id);
                match &self.in_flight {
                    Some(flight) if flight.request_id == cancel.id => flight.handle.cancel(),
                    _ => debug!(conn_id = %self.conn_id, id = %cancel.id, "ws: cancel for idle id"),
                }
                None
            },
            Envelope::Ping(ping) => {
                self.send(Envelope::Pong(Pong { nonce: ping.nonce })).await;
                None
            },
            Envelope::Pong(_) => None,
            Envelope::Presence(presence) => {
                self.handle_presence(presence).await;
                None
            },
            Envelope::System(system) => self.handle_system(system).await,
            Envelope::Welcome(_)
            | Envelope::History(_)
            | Envelope::ChatChunk(_)
            | Envelope::Error(_) => {
                self.protocol_error("server-originated envelope type").await
            },
        }
    }

    async fn handle_chat(&mut self, mut message: ChatMessage) -> Option<CloseReason> {
        if message.id.is_empty() || message.conversation_id.is_empty() {
            return self.protocol_error("chat_message requires id and conversation_id").await;
        }

        let scope = Scope::User(self.principal.user_id.clone());
        if let Decision::Denied(denial) = self.state.limiter.admit_message(&scope).await {
            let mut details = Metadata::new();
            if let Some(window) = denial.window {
                details.insert("window".into(), window.to_string().into());
            }
            details.insert("limit".into(), denial.limit.into());
            self.send(Envelope::error_with_details(
                denial.kind,
                "message rate limit exceeded",
                details,
            ))
            .await;
            return None;
        }

        // Server order is authoritative; inbound traffic is always the user.
        message.timestamp = Utc::now();
        message.role = Role::User;

        if self.state.registry.conversation(&self.conn_id).await.is_none() {
            self.state
                .registry
                .set_conversation(&self.conn_id, &message.conversation_id)
                .await;
        }
        self.state
            .registry
            .set_last_message(&self.conn_id, &message.id)
            .await;

        if let Err(e) = self
            .state
            .history
            .append(&message.conversation_id, &message)
            .await
        {
            warn!(conn_id = %self.conn_id, error = %e, "history append failed");
        }

        self.fan_out_and_persist(&message).await;

        if self.in_flight.is_some() {
            self.pending.push_back(message);
        } else {
            self.start_stream(message).await;
        }
        None
    }

    async fn handle_presence(&mut self, presence: Presence) {
        let typing = presence.state == PresenceState::Typing;
        self.state.registry.set_typing(&self.conn_id, typing).await;

        if let Some(conversation) = self.state.registry.conversation(&self.conn_id).await {
            // The principal's identity, not whatever the client claimed.
            let envelope = Envelope::Presence(Presence {
                user_id: self.principal.user_id.clone(),
                state: presence.state,
            });
            self.state
                .registry
                .broadcast(&conversation, &envelope, Some(&self.conn_id))
                .await;
        }
    }

    async fn handle_system(&mut self, system: SystemBody) -> Option<CloseReason> {
        if !self.principal.admin {
            return self.protocol_error("system envelopes are server-originated").await;
        }
        self.state.limiter.record_system_bypass();

        let conversation = match system.conversation_id.clone() {
            Some(conversation) => Some(conversation),
            None => self.state.registry.conversation(&self.conn_id).await,
        };
        if let Some(conversation) = conversation {
            self.state
                .registry
                .broadcast(&conversation, &Envelope::System(system), Some(&self.conn_id))
                .await;
        }
        None
    }

    // ── Streaming ────────────────────────────────────────────────────────

    async fn start_stream(&mut self, message: ChatMessage) {
        let conversation_id = message.conversation_id.clone();
        let context = match self.state.history.range(&conversation_id, 0, -1).await {
            Ok(messages) if !messages.is_empty() => messages,
            Ok(_) => vec![message.clone()],
            Err(e) => {
                warn!(conn_id = %self.conn_id, error = %e, "history read failed, using lone prompt");
                vec![message.clone()]
            },
        };

        let handle = self.state.bridge.spawn(message.id.clone(), context);
        let _ = self
            .state
            .registry
            .transition(&self.conn_id, ConnectionState::Streaming)
            .await;
        self.in_flight = Some(InFlight {
            request_id: message.id,
            conversation_id,
            handle,
            collected: String::new(),
        });
    }

    async fn on_chunk(&mut self, envelope: Option<Envelope>) {
        match envelope {
            Some(Envelope::ChatChunk(chunk)) => {
                self.last_activity = tokio::time::Instant::now();
                let is_final = chunk.is_final;
                let cancelled = chunk
                    .metadata
                    .get("cancelled")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if let Some(flight) = &mut self.in_flight {
                    flight.collected.push_str(&chunk.delta);
                }
                self.send(Envelope::ChatChunk(chunk)).await;
                if is_final {
                    self.finish_stream(cancelled).await;
                }
            },
            Some(other) => {
                // Upstream error envelope; the terminating chunk follows.
                self.send(other).await;
            },
            None => {
                debug!(conn_id = %self.conn_id, "bridge channel closed without final chunk");
                self.finish_stream(true).await;
            },
        }
    }

    /// Release the in-flight stream. Unless it was cancelled or aborted, the
    /// collected response joins the conversation as an assistant message.
    async fn finish_stream(&mut self, aborted: bool) {
        let Some(flight) = self.in_flight.take() else {
            return;
        };
        let _ = self
            .state
            .registry
            .transition(&self.conn_id, ConnectionState::Ready)
            .await;

        if !aborted && !flight.collected.is_empty() {
            let reply = ChatMessage {
                id: Uuid::new_v4().to_string(),
                role: Role::Assistant,
                content: flight.collected,
                conversation_id: flight.conversation_id.clone(),
                timestamp: Utc::now(),
                metadata: Metadata::new(),
            };
            if let Err(e) = self
                .state
                .history
                .append(&flight.conversation_id, &reply)
                .await
            {
                warn!(conn_id = %self.conn_id, error = %e, "assistant append failed");
            }
            self.fan_out_and_persist(&reply).await;
        }

        if let Some(next) = self.pending.pop_front() {
            self.start_stream(next).await;
        }
    }

    /// Broadcast to the conversation, then persist fire-and-forget.
    async fn fan_out_and_persist(&self, message: &ChatMessage) {
        self.state
            .registry
            .broadcast(
                &message.conversation_id,
                &Envelope::ChatMessage(message.clone()),
                Some(&self.conn_id),
            )
            .await;

        let repo = Arc::clone(&self.state.messages);
        let message = message.clone();
        tokio::spawn(async move {
            if let Err(e) = repo.persist(&message).await {
                warn!(message_id = %message.id, error = %e, "message persist failed");
            }
        });
    }

    // ── Timers ───────────────────────────────────────────────────────────

    async fn on_tick(&mut self, message_timeout: Duration) -> Option<CloseReason> {
        let registry_state = self.state.registry.state(&self.conn_id).await;

        if registry_state == Some(ConnectionState::Unresponsive) {
            if self
                .state
                .registry
                .unresponsive_for(&self.conn_id)
                .await
                .is_some_and(|elapsed| elapsed > message_timeout)
            {
                return Some(CloseReason::Unresponsive);
            }
            // Queue drained again: recover.
            if self.outgoing.capacity() > 0 {
                let _ = self
                    .state
                    .registry
                    .transition(&self.conn_id, ConnectionState::Ready)
                    .await;
            }
            return None;
        }

        let idle_for = self.last_activity.elapsed();
        if self.in_flight.is_some() && idle_for > message_timeout {
            warn!(conn_id = %self.conn_id, "ws: stream stalled");
            return Some(CloseReason::Stalled);
        }

        if idle_for >= message_timeout / 2 {
            let nonce = format!("{:08x}", rand::random::<u32>());
            self.send(Envelope::Ping(parley_protocol::Ping { nonce })).await;
        }
        None
    }

    // ── Plumbing ─────────────────────────────────────────────────────────

    async fn touch(&mut self) {
        self.last_activity = tokio::time::Instant::now();
        self.state.registry.heartbeat(&self.conn_id).await;
    }

    /// Queue an envelope for the write loop. A full queue marks this
    /// connection UNRESPONSIVE; the tick handler closes it if it never
    /// recovers.
    async fn send(&mut self, envelope: Envelope) -> bool {
        match self.outgoing.try_send(Outbound::Envelope(envelope)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.state.registry.mark_unresponsive(&self.conn_id).await;
                false
            },
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Report a malformed/unexpected envelope and escalate on a burst.
    async fn protocol_error(&mut self, message: &str) -> Option<CloseReason> {
        counter!(names::ws::MALFORMED_TOTAL).increment(1);
        self.send(Envelope::error(FailureKind::InvalidMessageFormat, message))
            .await;

        let now = tokio::time::Instant::now();
        self.malformed_at.push_back(now);
        while self
            .malformed_at
            .front()
            .is_some_and(|at| now.duration_since(*at) > MALFORMED_BURST_WINDOW)
        {
            self.malformed_at.pop_front();
        }
        if self.malformed_at.len() > MALFORMED_BURST_LIMIT {
            warn!(conn_id = %self.conn_id, "ws: malformed input burst");
            return Some(CloseReason::MalformedBurst);
        }
        None
    }

    /// Emit the terminal frames for a close reason, best-effort.
    async fn announce_close(&mut self, reason: &CloseReason) {
        let close = match reason {
            CloseReason::Peer => None,
            CloseReason::Shutdown => {
                Some((close_codes::NORMAL, "server shutting down"))
            },
            CloseReason::MalformedBurst => {
                Some((close_codes::POLICY_VIOLATION, "malformed input"))
            },
            CloseReason::Unresponsive => {
                Some((close_codes::INTERNAL_ERROR, "outgoing queue saturated"))
            },
            CloseReason::Stalled => Some((close_codes::INTERNAL_ERROR, "stream stalled")),
        };
        if let Some((code, reason)) = close {
            let _ = self.outgoing.try_send(Outbound::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }
}
