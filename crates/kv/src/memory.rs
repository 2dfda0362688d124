//! In-memory [`KvStore`] backend.
//!
//! Used by tests and single-process deployments where no external store is
//! configured. TTLs are tracked on [`tokio::time::Instant`] so paused-clock
//! tests can drive expiry; expired entries are evicted lazily on access.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use tokio::time::Instant;

use crate::{KeyTtl, KvCommand, KvError, KvReply, KvStore, Result};

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Hash(HashMap<String, Vec<u8>>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn bytes(value: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            value: Value::Bytes(value),
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // A poisoned lock means a panic mid-mutation; propagate the inner map
        // anyway since every mutation below is single-step.
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn apply(
        map: &mut HashMap<String, Entry>,
        command: &KvCommand,
        now: Instant,
    ) -> Result<KvReply> {
        match command {
            KvCommand::Get(key) => Ok(KvReply::Bytes(get_bytes(map, key, now)?)),
            KvCommand::Set { key, value, ttl } => {
                map.insert(key.clone(), Entry::bytes(value.clone(), *ttl));
                Ok(KvReply::Bool(true))
            },
            KvCommand::Incr(key) => Ok(KvReply::Int(incr_by(map, key, 1, now)?)),
            KvCommand::Decr(key) => Ok(KvReply::Int(incr_by(map, key, -1, now)?)),
            KvCommand::Expire { key, ttl } => {
                let live = live_entry(map, key, now);
                match live {
                    Some(entry) => {
                        entry.expires_at = Some(now + *ttl);
                        Ok(KvReply::Bool(true))
                    },
                    None => Ok(KvReply::Bool(false)),
                }
            },
            KvCommand::RPush { key, value } => {
                let list = list_entry(map, key, now)?;
                list.push_back(value.clone());
                Ok(KvReply::Int(list.len() as i64))
            },
            KvCommand::LTrim { key, start, stop } => {
                if let Some(entry) = live_entry(map, key, now) {
                    let Value::List(list) = &mut entry.value else {
                        return Err(KvError::TypeError { key: key.clone() });
                    };
                    let (lo, hi) = resolve_range(*start, *stop, list.len());
                    let kept: VecDeque<Vec<u8>> = if lo > hi {
                        VecDeque::new()
                    } else {
                        list.iter().skip(lo).take(hi - lo + 1).cloned().collect()
                    };
                    if kept.is_empty() {
                        map.remove(key);
                    } else {
                        *list = kept;
                    }
                }
                Ok(KvReply::Unit)
            },
            KvCommand::Del(key) => Ok(KvReply::Bool(map.remove(key).is_some())),
        }
    }
}

fn live_entry<'a>(
    map: &'a mut HashMap<String, Entry>,
    key: &str,
    now: Instant,
) -> Option<&'a mut Entry> {
    if map.get(key).is_some_and(|e| e.expired(now)) {
        map.remove(key);
    }
    map.get_mut(key)
}

fn get_bytes(
    map: &mut HashMap<String, Entry>,
    key: &str,
    now: Instant,
) -> Result<Option<Vec<u8>>> {
    match live_entry(map, key, now) {
        Some(entry) => match &entry.value {
            Value::Bytes(b) => Ok(Some(b.clone())),
            _ => Err(KvError::TypeError { key: key.into() }),
        },
        None => Ok(None),
    }
}

fn incr_by(map: &mut HashMap<String, Entry>, key: &str, delta: i64, now: Instant) -> Result<i64> {
    match live_entry(map, key, now) {
        Some(entry) => {
            let Value::Bytes(bytes) = &entry.value else {
                return Err(KvError::TypeError { key: key.into() });
            };
            let current: i64 = std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| KvError::TypeError { key: key.into() })?;
            let next = current + delta;
            entry.value = Value::Bytes(next.to_string().into_bytes());
            Ok(next)
        },
        None => {
            map.insert(
                key.into(),
                Entry {
                    value: Value::Bytes(delta.to_string().into_bytes()),
                    expires_at: None,
                },
            );
            Ok(delta)
        },
    }
}

fn list_entry<'a>(
    map: &'a mut HashMap<String, Entry>,
    key: &str,
    now: Instant,
) -> Result<&'a mut VecDeque<Vec<u8>>> {
    if live_entry(map, key, now).is_none() {
        map.insert(
            key.into(),
            Entry {
                value: Value::List(VecDeque::new()),
                expires_at: None,
            },
        );
    }
    match map.get_mut(key).map(|e| &mut e.value) {
        Some(Value::List(list)) => Ok(list),
        _ => Err(KvError::TypeError { key: key.into() }),
    }
}

/// Resolve an inclusive (start, stop) pair with negative indexing into
/// clamped 0-based offsets.
fn resolve_range(start: i64, stop: i64, len: usize) -> (usize, usize) {
    let len = len as i64;
    let lo = if start < 0 { len + start } else { start }.max(0);
    let hi = if stop < 0 { len + stop } else { stop }.min(len - 1);
    if hi < 0 || lo >= len {
        // Empty range markers; callers treat lo > hi as empty.
        return (1, 0);
    }
    (lo as usize, hi as usize)
}

/// Minimal `*`-only glob matching, enough for key scans like `rl:user:*`.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == candidate;
    }
    let mut rest = candidate;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            let Some(after) = rest.strip_prefix(part) else {
                return false;
            };
            rest = after;
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            let Some(pos) = rest.find(part) else {
                return false;
            };
            rest = &rest[pos + part.len()..];
        }
    }
    parts.last().is_some_and(|p| p.is_empty()) || rest.is_empty()
}

#[async_trait::async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        get_bytes(&mut self.lock(), key, Instant::now())
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool> {
        self.lock()
            .insert(key.into(), Entry::bytes(value.to_vec(), ttl));
        Ok(true)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        incr_by(&mut self.lock(), key, 1, Instant::now())
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        incr_by(&mut self.lock(), key, -1, Instant::now())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut map = self.lock();
        match live_entry(&mut map, key, now) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            },
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let now = Instant::now();
        let mut map = self.lock();
        match live_entry(&mut map, key, now) {
            Some(entry) => match entry.expires_at {
                Some(at) => Ok(KeyTtl::Remaining(at.duration_since(now).as_secs())),
                None => Ok(KeyTtl::NoExpiry),
            },
            None => Ok(KeyTtl::Missing),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<bool> {
        let now = Instant::now();
        let mut map = self.lock();
        if live_entry(&mut map, key, now).is_none() {
            map.insert(
                key.into(),
                Entry {
                    value: Value::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        match map.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Hash(hash)) => Ok(hash.insert(field.into(), value.to_vec()).is_none()),
            _ => Err(KvError::TypeError { key: key.into() }),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let mut map = self.lock();
        match live_entry(&mut map, key, now) {
            Some(entry) => match &entry.value {
                Value::Hash(hash) => Ok(hash.get(field).cloned()),
                _ => Err(KvError::TypeError { key: key.into() }),
            },
            None => Ok(None),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let now = Instant::now();
        let mut map = self.lock();
        match live_entry(&mut map, key, now) {
            Some(entry) => match &mut entry.value {
                Value::Hash(hash) => Ok(hash.remove(field).is_some()),
                _ => Err(KvError::TypeError { key: key.into() }),
            },
            None => Ok(false),
        }
    }

    async fn lpush(&self, key: &str, value: &[u8]) -> Result<i64> {
        let mut map = self.lock();
        let list = list_entry(&mut map, key, Instant::now())?;
        list.push_front(value.to_vec());
        Ok(list.len() as i64)
    }

    async fn rpush(&self, key: &str, value: &[u8]) -> Result<i64> {
        let mut map = self.lock();
        let list = list_entry(&mut map, key, Instant::now())?;
        list.push_back(value.to_vec());
        Ok(list.len() as i64)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        let now = Instant::now();
        let mut map = self.lock();
        match live_entry(&mut map, key, now) {
            Some(entry) => match &entry.value {
                Value::List(list) => {
                    let (lo, hi) = resolve_range(start, stop, list.len());
                    if lo > hi {
                        return Ok(Vec::new());
                    }
                    Ok(list.iter().skip(lo).take(hi - lo + 1).cloned().collect())
                },
                _ => Err(KvError::TypeError { key: key.into() }),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        let mut map = self.lock();
        MemoryKv::apply(
            &mut map,
            &KvCommand::LTrim {
                key: key.into(),
                start,
                stop,
            },
            Instant::now(),
        )?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        Ok(self.lock().remove(key).is_some())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let map = self.lock();
        Ok(map
            .iter()
            .filter(|(k, e)| !e.expired(now) && glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn exec(&self, commands: Vec<KvCommand>) -> Result<Vec<KvReply>> {
        let now = Instant::now();
        let mut map = self.lock();
        let mut replies = Vec::with_capacity(commands.len());
        for command in &commands {
            replies.push(MemoryKv::apply(&mut map, command, now)?);
        }
        Ok(replies)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn incr_creates_absent_key_at_one() {
        let kv = MemoryKv::new();
        assert_eq!(kv.incr("c").await.unwrap(), 1);
        assert_eq!(kv.incr("c").await.unwrap(), 2);
        assert_eq!(kv.decr("c").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn set_returns_bool_true() {
        let kv = MemoryKv::new();
        assert!(kv.set("k", b"v", None).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn expire_on_absent_key_is_false() {
        let kv = MemoryKv::new();
        assert!(!kv.expire("nope", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn keys_expire_after_ttl() {
        let kv = MemoryKv::new();
        kv.set("k", b"v", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(kv.ttl("k").await.unwrap(), KeyTtl::Remaining(5));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
        assert_eq!(kv.ttl("k").await.unwrap(), KeyTtl::Missing);
        // The counter restarts from scratch once the key is gone.
        assert_eq!(kv.incr("k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn ttl_distinguishes_no_expiry() {
        let kv = MemoryKv::new();
        kv.set("k", b"v", None).await.unwrap();
        assert_eq!(kv.ttl("k").await.unwrap(), KeyTtl::NoExpiry);
    }

    #[tokio::test]
    async fn incr_on_non_integer_is_type_error() {
        let kv = MemoryKv::new();
        kv.set("k", b"not a number", None).await.unwrap();
        assert!(matches!(
            kv.incr("k").await,
            Err(KvError::TypeError { .. })
        ));
    }

    #[tokio::test]
    async fn list_ops_preserve_order() {
        let kv = MemoryKv::new();
        for v in ["a", "b", "c"] {
            kv.rpush("l", v.as_bytes()).await.unwrap();
        }
        kv.lpush("l", b"z").await.unwrap();
        let all = kv.lrange("l", 0, -1).await.unwrap();
        assert_eq!(all, vec![b"z".to_vec(), b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[tokio::test]
    async fn ltrim_keeps_inclusive_window() {
        let kv = MemoryKv::new();
        for v in ["1", "2", "3", "4", "5"] {
            kv.rpush("l", v.as_bytes()).await.unwrap();
        }
        kv.ltrim("l", -3, -1).await.unwrap();
        let all = kv.lrange("l", 0, -1).await.unwrap();
        assert_eq!(all, vec![b"3".to_vec(), b"4".to_vec(), b"5".to_vec()]);
    }

    #[tokio::test]
    async fn lrange_negative_indices() {
        let kv = MemoryKv::new();
        for v in ["a", "b", "c", "d"] {
            kv.rpush("l", v.as_bytes()).await.unwrap();
        }
        assert_eq!(
            kv.lrange("l", -2, -1).await.unwrap(),
            vec![b"c".to_vec(), b"d".to_vec()]
        );
        assert_eq!(kv.lrange("l", 5, 9).await.unwrap(), Vec::<Vec<u8>>::new());
    }

    #[tokio::test]
    async fn hash_ops() {
        let kv = MemoryKv::new();
        assert!(kv.hset("h", "f", b"v").await.unwrap());
        assert_eq!(kv.hget("h", "f").await.unwrap(), Some(b"v".to_vec()));
        assert!(kv.hdel("h", "f").await.unwrap());
        assert_eq!(kv.hget("h", "f").await.unwrap(), None);
    }

    #[tokio::test]
    async fn exec_preserves_command_order() {
        let kv = MemoryKv::new();
        let replies = kv
            .exec(vec![
                KvCommand::Incr("a".into()),
                KvCommand::Incr("a".into()),
                KvCommand::Expire {
                    key: "a".into(),
                    ttl: Duration::from_secs(60),
                },
                KvCommand::Incr("b".into()),
            ])
            .await
            .unwrap();
        assert_eq!(
            replies,
            vec![
                KvReply::Int(1),
                KvReply::Int(2),
                KvReply::Bool(true),
                KvReply::Int(1),
            ]
        );
    }

    #[tokio::test]
    async fn keys_glob_scan() {
        let kv = MemoryKv::new();
        kv.incr("rl:user:u1:sec").await.unwrap();
        kv.incr("rl:user:u1:min").await.unwrap();
        kv.incr("rl:ip:1.2.3.4:sec").await.unwrap();
        let mut keys = kv.keys("rl:user:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["rl:user:u1:min", "rl:user:u1:sec"]);
        assert_eq!(kv.keys("rl:*:sec").await.unwrap().len(), 2);
    }

    #[test]
    fn glob_edge_cases() {
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("a*c", "abc"));
        assert!(!glob_match("a*c", "abd"));
    }
}
