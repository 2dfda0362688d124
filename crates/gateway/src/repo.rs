//! Message persistence collaborator.
//!
//! Persistence is fire-and-forget after fan-out; failures are logged, never
//! surfaced to the client.

use std::sync::Mutex;

use parley_protocol::ChatMessage;

use crate::error::Result;

#[async_trait::async_trait]
pub trait MessageRepository: Send + Sync {
    async fn persist(&self, message: &ChatMessage) -> Result<()>;
}

/// Drops every message. Default when no store is wired up.
#[derive(Debug, Default)]
pub struct NoopMessageRepository;

#[async_trait::async_trait]
impl MessageRepository for NoopMessageRepository {
    async fn persist(&self, _message: &ChatMessage) -> Result<()> {
        Ok(())
    }
}

/// Collects messages in memory; used by tests to observe persistence.
#[derive(Debug, Default)]
pub struct MemoryMessageRepository {
    messages: Mutex<Vec<ChatMessage>>,
}

impl MemoryMessageRepository {
    #[must_use]
    pub fn messages(&self) -> Vec<ChatMessage> {
        match self.messages.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait::async_trait]
impl MessageRepository for MemoryMessageRepository {
    async fn persist(&self, message: &ChatMessage) -> Result<()> {
        match self.messages.lock() {
            Ok(mut guard) => guard.push(message.clone()),
            Err(poisoned) => poisoned.into_inner().push(message.clone()),
        }
        Ok(())
    }
}
