//! Per-conversation bounded history ring.
//!
//! Recent `chat_message` envelopes live in a KV list keyed by conversation so
//! every process sees the same window; each append trims the list to the
//! configured maximum in the same atomic batch. Append order is the
//! authoritative order for a conversation. Entries that share a server
//! timestamp are a race between writers; every decode orders such runs by id
//! lexicographically, so all readers see the same sequence without touching
//! the order of distinct timestamps.
//!
//! A read-through local cache holds the most recent full window per
//! conversation. It is refreshed on every successful full-window read or
//! local append, and only ever *served* when the KV store is unreachable, so
//! a stale cache can degrade availability but never ordering.

use std::{sync::Arc, time::Duration};

use {dashmap::DashMap, tracing::warn};

use {
    parley_kv::{KvError, KvStore, Pipeline},
    parley_metrics::{counter, names},
    parley_protocol::ChatMessage,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("malformed history entry: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Ring length cap per conversation.
    pub max_length: usize,
    /// Optional retention TTL refreshed on every append.
    pub retention: Option<Duration>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_length: parley_protocol::DEFAULT_MAX_HISTORY,
            retention: None,
        }
    }
}

fn ring_key(conversation_id: &str) -> String {
    format!("hist:{conversation_id}")
}

/// Order runs of identical timestamps by id so ties decode deterministically.
fn order_ties(messages: &mut [ChatMessage]) {
    let mut start = 0;
    while start < messages.len() {
        let mut end = start + 1;
        while end < messages.len() && messages[end].timestamp == messages[start].timestamp {
            end += 1;
        }
        if end - start > 1 {
            messages[start..end].sort_by(|a, b| a.id.cmp(&b.id));
        }
        start = end;
    }
}

pub struct HistoryBuffer {
    kv: Arc<dyn KvStore>,
    config: HistoryConfig,
    cache: DashMap<String, Vec<ChatMessage>>,
}

impl HistoryBuffer {
    pub fn new(kv: Arc<dyn KvStore>, config: HistoryConfig) -> Self {
        Self {
            kv,
            config,
            cache: DashMap::new(),
        }
    }

    #[must_use]
    pub fn max_length(&self) -> usize {
        self.config.max_length
    }

    /// Append a message and trim the ring, as one atomic batch.
    pub async fn append(&self, conversation_id: &str, message: &ChatMessage) -> Result<()> {
        let key = ring_key(conversation_id);
        let encoded = serde_json::to_vec(message)?;

        let mut pipeline = Pipeline::new()
            .rpush(key.as_str(), encoded)
            .ltrim(key.as_str(), -(self.config.max_length as i64), -1);
        if let Some(retention) = self.config.retention {
            pipeline = pipeline.expire(key.as_str(), retention);
        }
        pipeline.run(self.kv.as_ref()).await?;

        counter!(names::history::APPENDED_TOTAL).increment(1);

        let mut cached = self
            .cache
            .entry(conversation_id.to_string())
            .or_default();
        cached.push(message.clone());
        let len = cached.len();
        if len > self.config.max_length {
            cached.drain(..len - self.config.max_length);
        }
        order_ties(&mut cached);
        Ok(())
    }

    /// Inclusive range, 0-indexed from the oldest entry; negative indices
    /// count from the end. `range(_, 0, -1)` is the full current window.
    pub async fn range(
        &self,
        conversation_id: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<ChatMessage>> {
        let key = ring_key(conversation_id);
        let raw = match self.kv.lrange(&key, start, stop).await {
            Ok(raw) => raw,
            Err(err @ KvError::Unavailable(_)) if start == 0 && stop == -1 => {
                if let Some(cached) = self.cache.get(conversation_id) {
                    warn!(conversation_id, error = %err, "history: serving cached window");
                    counter!(names::history::CACHE_HITS_TOTAL).increment(1);
                    return Ok(cached.clone());
                }
                return Err(err.into());
            },
            Err(err) => return Err(err.into()),
        };

        let mut messages = raw
            .iter()
            .map(|bytes| serde_json::from_slice(bytes))
            .collect::<std::result::Result<Vec<ChatMessage>, _>>()?;
        order_ties(&mut messages);

        if start == 0 && stop == -1 {
            self.cache
                .insert(conversation_id.to_string(), messages.clone());
        }
        Ok(messages)
    }

    /// Find a message by id within the current window. Linear scan; the
    /// window is capped at `max_length` entries.
    pub async fn get(&self, conversation_id: &str, id: &str) -> Result<Option<ChatMessage>> {
        let window = self.range(conversation_id, 0, -1).await?;
        Ok(window.into_iter().find(|m| m.id == id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};

    use {
        parley_kv::{KeyTtl, KvCommand, KvReply, MemoryKv},
        parley_protocol::Role,
    };

    fn message(id: &str) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            role: Role::User,
            content: format!("content of {id}"),
            conversation_id: "k-1".into(),
            timestamp: "2026-01-01T00:00:00Z".parse().unwrap(),
            metadata: parley_protocol::Metadata::new(),
        }
    }

    fn buffer_with_max(kv: Arc<dyn KvStore>, max_length: usize) -> HistoryBuffer {
        HistoryBuffer::new(kv, HistoryConfig {
            max_length,
            retention: None,
        })
    }

    #[tokio::test]
    async fn append_then_full_range_preserves_order() {
        let history = buffer_with_max(Arc::new(MemoryKv::new()), 100);
        for id in ["m-1", "m-2", "m-3"] {
            history.append("k-1", &message(id)).await.unwrap();
        }
        let window = history.range("k-1", 0, -1).await.unwrap();
        let ids: Vec<&str> = window.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m-1", "m-2", "m-3"]);
    }

    #[tokio::test]
    async fn ring_evicts_oldest_beyond_max() {
        let history = buffer_with_max(Arc::new(MemoryKv::new()), 3);
        for id in ["m-1", "m-2", "m-3", "m-4", "m-5"] {
            history.append("k-1", &message(id)).await.unwrap();
        }
        let window = history.range("k-1", 0, -1).await.unwrap();
        let ids: Vec<&str> = window.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m-3", "m-4", "m-5"]);
    }

    #[tokio::test]
    async fn negative_indices_count_from_end() {
        let history = buffer_with_max(Arc::new(MemoryKv::new()), 10);
        for id in ["m-1", "m-2", "m-3", "m-4"] {
            history.append("k-1", &message(id)).await.unwrap();
        }
        let tail = history.range("k-1", -2, -1).await.unwrap();
        let ids: Vec<&str> = tail.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m-3", "m-4"]);
    }

    #[tokio::test]
    async fn same_timestamp_ties_read_in_id_order() {
        let history = buffer_with_max(Arc::new(MemoryKv::new()), 10);
        // Arrival order loses the race; ids settle it.
        for id in ["m-b", "m-a", "m-c"] {
            history.append("k-1", &message(id)).await.unwrap();
        }
        let window = history.range("k-1", 0, -1).await.unwrap();
        let ids: Vec<&str> = window.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m-a", "m-b", "m-c"]);
    }

    #[tokio::test]
    async fn distinct_timestamps_keep_append_order() {
        let history = buffer_with_max(Arc::new(MemoryKv::new()), 10);
        let mut early = message("m-z");
        early.timestamp = "2026-01-01T00:00:01Z".parse().unwrap();
        let mut late = message("m-a");
        late.timestamp = "2026-01-01T00:00:02Z".parse().unwrap();
        history.append("k-1", &early).await.unwrap();
        history.append("k-1", &late).await.unwrap();

        let window = history.range("k-1", 0, -1).await.unwrap();
        let ids: Vec<&str> = window.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m-z", "m-a"]);
    }

    #[tokio::test]
    async fn empty_conversation_ranges_empty() {
        let history = buffer_with_max(Arc::new(MemoryKv::new()), 10);
        assert!(history.range("nope", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_finds_by_id_within_window() {
        let history = buffer_with_max(Arc::new(MemoryKv::new()), 10);
        for id in ["m-1", "m-2"] {
            history.append("k-1", &message(id)).await.unwrap();
        }
        assert_eq!(
            history.get("k-1", "m-2").await.unwrap().map(|m| m.id),
            Some("m-2".to_string())
        );
        assert!(history.get("k-1", "m-9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retention_ttl_is_set_on_append() {
        let kv = Arc::new(MemoryKv::new());
        let history = HistoryBuffer::new(Arc::clone(&kv) as Arc<dyn KvStore>, HistoryConfig {
            max_length: 10,
            retention: Some(Duration::from_secs(3600)),
        });
        history.append("k-1", &message("m-1")).await.unwrap();
        assert_eq!(
            kv.ttl("hist:k-1").await.unwrap(),
            KeyTtl::Remaining(3600)
        );
    }

    // ── Cache fallback ───────────────────────────────────────────────────

    /// Delegates to a real store until `fail` flips, then reports outage.
    struct FlakyKv {
        inner: MemoryKv,
        fail: AtomicBool,
    }

    #[async_trait::async_trait]
    impl KvStore for FlakyKv {
        async fn get(&self, key: &str) -> parley_kv::Result<Option<Vec<u8>>> {
            self.check()?;
            self.inner.get(key).await
        }
        async fn set(
            &self,
            key: &str,
            value: &[u8],
            ttl: Option<Duration>,
        ) -> parley_kv::Result<bool> {
            self.check()?;
            self.inner.set(key, value, ttl).await
        }
        async fn incr(&self, key: &str) -> parley_kv::Result<i64> {
            self.check()?;
            self.inner.incr(key).await
        }
        async fn decr(&self, key: &str) -> parley_kv::Result<i64> {
            self.check()?;
            self.inner.decr(key).await
        }
        async fn expire(&self, key: &str, ttl: Duration) -> parley_kv::Result<bool> {
            self.check()?;
            self.inner.expire(key, ttl).await
        }
        async fn ttl(&self, key: &str) -> parley_kv::Result<KeyTtl> {
            self.check()?;
            self.inner.ttl(key).await
        }
        async fn hset(&self, key: &str, field: &str, value: &[u8]) -> parley_kv::Result<bool> {
            self.check()?;
            self.inner.hset(key, field, value).await
        }
        async fn hget(&self, key: &str, field: &str) -> parley_kv::Result<Option<Vec<u8>>> {
            self.check()?;
            self.inner.hget(key, field).await
        }
        async fn hdel(&self, key: &str, field: &str) -> parley_kv::Result<bool> {
            self.check()?;
            self.inner.hdel(key, field).await
        }
        async fn lpush(&self, key: &str, value: &[u8]) -> parley_kv::Result<i64> {
            self.check()?;
            self.inner.lpush(key, value).await
        }
        async fn rpush(&self, key: &str, value: &[u8]) -> parley_kv::Result<i64> {
            self.check()?;
            self.inner.rpush(key, value).await
        }
        async fn lrange(&self, key: &str, start: i64, stop: i64) -> parley_kv::Result<Vec<Vec<u8>>> {
            self.check()?;
            self.inner.lrange(key, start, stop).await
        }
        async fn ltrim(&self, key: &str, start: i64, stop: i64) -> parley_kv::Result<()> {
            self.check()?;
            self.inner.ltrim(key, start, stop).await
        }
        async fn del(&self, key: &str) -> parley_kv::Result<bool> {
            self.check()?;
            self.inner.del(key).await
        }
        async fn keys(&self, pattern: &str) -> parley_kv::Result<Vec<String>> {
            self.check()?;
            self.inner.keys(pattern).await
        }
        async fn exec(&self, commands: Vec<KvCommand>) -> parley_kv::Result<Vec<KvReply>> {
            self.check()?;
            self.inner.exec(commands).await
        }
    }

    impl FlakyKv {
        fn check(&self) -> parley_kv::Result<()> {
            if self.fail.load(Ordering::Relaxed) {
                Err(KvError::Unavailable("injected outage".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn full_window_served_from_cache_during_outage() {
        let kv = Arc::new(FlakyKv {
            inner: MemoryKv::new(),
            fail: AtomicBool::new(false),
        });
        let history = buffer_with_max(Arc::clone(&kv) as Arc<dyn KvStore>, 10);
        for id in ["m-1", "m-2"] {
            history.append("k-1", &message(id)).await.unwrap();
        }

        kv.fail.store(true, Ordering::Relaxed);
        let window = history.range("k-1", 0, -1).await.unwrap();
        assert_eq!(window.len(), 2);

        // Partial ranges have no cache to fall back on.
        assert!(history.range("k-1", 0, 0).await.is_err());
    }
}
