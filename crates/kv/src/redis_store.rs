//! Redis-backed [`KvStore`] using a multiplexed connection manager.
//!
//! The manager transparently reconnects; callers only ever see
//! [`KvError::Unavailable`] while the store is unreachable. Batches run as
//! MULTI/EXEC so their replies come back atomically and in order.

use std::time::Duration;

use {redis::AsyncCommands, tracing::debug};

use parley_metrics::{counter, names};

use crate::{KeyTtl, KvCommand, KvError, KvReply, KvStore, Result};

pub struct RedisKv {
    manager: redis::aio::ConnectionManager,
}

impl RedisKv {
    /// Connect to the store at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| KvError::Unavailable(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        debug!(url, "kv: connected");
        Ok(Self { manager })
    }

    fn conn(&self) -> redis::aio::ConnectionManager {
        self.manager.clone()
    }
}

/// A WRONGTYPE response or a conversion failure is a type error at the key;
/// everything else (connect/timeout/protocol) is unavailability.
fn map_err(key: &str, err: redis::RedisError) -> KvError {
    counter!(names::kv::ERRORS_TOTAL).increment(1);
    if err.kind() == redis::ErrorKind::TypeError || err.to_string().contains("WRONGTYPE") {
        KvError::TypeError { key: key.into() }
    } else {
        KvError::Unavailable(err.to_string())
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    // Sub-second TTLs still need to expire; round up so they are never 0
    // (a 0-second expiry deletes the key immediately).
    ttl.as_secs().max(1)
}

fn convert_reply(command: &KvCommand, value: redis::Value) -> Result<KvReply> {
    let reply = match command {
        KvCommand::Get(_) => match value {
            redis::Value::Nil => KvReply::Bytes(None),
            redis::Value::BulkString(bytes) => KvReply::Bytes(Some(bytes)),
            other => KvReply::Bytes(redis::from_redis_value(&other).ok()),
        },
        KvCommand::Set { .. } => KvReply::Bool(matches!(
            value,
            redis::Value::Okay | redis::Value::SimpleString(_)
        )),
        KvCommand::Incr(key) | KvCommand::Decr(key) | KvCommand::RPush { key, .. } => {
            match value {
                redis::Value::Int(n) => KvReply::Int(n),
                _ => return Err(KvError::TypeError { key: key.clone() }),
            }
        },
        KvCommand::Expire { .. } => KvReply::Bool(matches!(
            value,
            redis::Value::Int(1) | redis::Value::Boolean(true)
        )),
        KvCommand::LTrim { .. } => KvReply::Unit,
        KvCommand::Del(_) => KvReply::Bool(matches!(
            value,
            redis::Value::Int(n) if n > 0
        )),
    };
    Ok(reply)
}

#[async_trait::async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.conn()
            .get(key)
            .await
            .map_err(|e| map_err(key, e))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        cmd.query_async::<()>(&mut self.conn())
            .await
            .map_err(|e| map_err(key, e))?;
        Ok(true)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.conn()
            .incr(key, 1i64)
            .await
            .map_err(|e| map_err(key, e))
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        self.conn()
            .decr(key, 1i64)
            .await
            .map_err(|e| map_err(key, e))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.conn()
            .expire(key, ttl_secs(ttl) as i64)
            .await
            .map_err(|e| map_err(key, e))
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let secs: i64 = self
            .conn()
            .ttl(key)
            .await
            .map_err(|e| map_err(key, e))?;
        Ok(match secs {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::NoExpiry,
            s => KeyTtl::Remaining(s.max(0) as u64),
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<bool> {
        self.conn()
            .hset(key, field, value)
            .await
            .map_err(|e| map_err(key, e))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        self.conn()
            .hget(key, field)
            .await
            .map_err(|e| map_err(key, e))
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        self.conn()
            .hdel(key, field)
            .await
            .map_err(|e| map_err(key, e))
    }

    async fn lpush(&self, key: &str, value: &[u8]) -> Result<i64> {
        self.conn()
            .lpush(key, value)
            .await
            .map_err(|e| map_err(key, e))
    }

    async fn rpush(&self, key: &str, value: &[u8]) -> Result<i64> {
        self.conn()
            .rpush(key, value)
            .await
            .map_err(|e| map_err(key, e))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        self.conn()
            .lrange(key, start as isize, stop as isize)
            .await
            .map_err(|e| map_err(key, e))
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        self.conn()
            .ltrim(key, start as isize, stop as isize)
            .await
            .map_err(|e| map_err(key, e))
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.conn()
            .del(key)
            .await
            .map_err(|e| map_err(key, e))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.conn()
            .keys(pattern)
            .await
            .map_err(|e| map_err(pattern, e))
    }

    async fn exec(&self, commands: Vec<KvCommand>) -> Result<Vec<KvReply>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in &commands {
            match command {
                KvCommand::Get(key) => {
                    pipe.get(key);
                },
                KvCommand::Set { key, value, ttl } => {
                    let mut cmd = redis::cmd("SET");
                    cmd.arg(key).arg(value.as_slice());
                    if let Some(ttl) = ttl {
                        cmd.arg("EX").arg(ttl_secs(*ttl));
                    }
                    pipe.add_command(cmd);
                },
                KvCommand::Incr(key) => {
                    pipe.incr(key, 1i64);
                },
                KvCommand::Decr(key) => {
                    pipe.decr(key, 1i64);
                },
                KvCommand::Expire { key, ttl } => {
                    pipe.expire(key, ttl_secs(*ttl) as i64);
                },
                KvCommand::RPush { key, value } => {
                    pipe.rpush(key, value.as_slice());
                },
                KvCommand::LTrim { key, start, stop } => {
                    pipe.ltrim(key, *start as isize, *stop as isize);
                },
                KvCommand::Del(key) => {
                    pipe.del(key);
                },
            }
        }

        let values: Vec<redis::Value> = pipe
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_err("pipeline", e))?;

        commands
            .iter()
            .zip(values)
            .map(|(command, value)| convert_reply(command, value))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn sub_second_ttls_round_up() {
        assert_eq!(ttl_secs(Duration::from_millis(200)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(60)), 60);
    }

    #[test]
    fn set_reply_normalizes_to_bool() {
        let cmd = KvCommand::Set {
            key: "k".into(),
            value: b"v".to_vec(),
            ttl: None,
        };
        assert_eq!(
            convert_reply(&cmd, redis::Value::Okay).unwrap(),
            KvReply::Bool(true)
        );
    }

    #[test]
    fn incr_reply_is_int() {
        let cmd = KvCommand::Incr("k".into());
        assert_eq!(
            convert_reply(&cmd, redis::Value::Int(3)).unwrap(),
            KvReply::Int(3)
        );
        assert!(convert_reply(&cmd, redis::Value::Okay).is_err());
    }
}
