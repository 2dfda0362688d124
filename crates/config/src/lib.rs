//! Environment-driven configuration.
//!
//! Every recognized key is `PARLEY_`-prefixed and carries a default, so an
//! empty environment yields a working local configuration. Values that are
//! present but unparseable are hard errors, never silent defaults.
//!
//! The lookup function is injectable so tests can configure without touching
//! the process environment.

use std::time::Duration;

use secrecy::Secret;

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

// ── Sections ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub listen_addr: String,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token_secret: Secret<String>,
    /// Algorithm identifier, e.g. `HS256`.
    pub token_algorithm: String,
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub max_connections_per_ip: u32,
    pub max_connections_per_user: u32,
    pub messages_per_second: u32,
    pub messages_per_minute: u32,
    pub messages_per_hour: u32,
    pub messages_per_day: u32,
    pub connect_timeout: Duration,
    pub message_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HistorySettings {
    pub max_length: usize,
    pub retention: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<Secret<String>>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub cache_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct KvConfig {
    /// Store endpoint, e.g. `redis://127.0.0.1:6379`. Empty means in-memory.
    pub url: Option<String>,
    pub pool_size: u32,
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParleyConfig {
    pub transport: TransportConfig,
    pub auth: AuthConfig,
    pub limits: RateLimitSettings,
    pub history: HistorySettings,
    pub llm: LlmConfig,
    pub kv: KvConfig,
    pub telemetry: TelemetryConfig,
}

// ── Loading ──────────────────────────────────────────────────────────────────

impl ParleyConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let lookup = &lookup;
        Ok(Self {
            transport: TransportConfig {
                listen_addr: string(lookup, "PARLEY_LISTEN_ADDR", "127.0.0.1:8080"),
                tls_cert: optional(lookup, "PARLEY_TLS_CERT"),
                tls_key: optional(lookup, "PARLEY_TLS_KEY"),
            },
            auth: AuthConfig {
                token_secret: Secret::new(string(
                    lookup,
                    "PARLEY_TOKEN_SECRET",
                    "insecure-dev-secret",
                )),
                token_algorithm: string(lookup, "PARLEY_TOKEN_ALGORITHM", "HS256"),
            },
            limits: RateLimitSettings {
                max_connections_per_ip: parsed(lookup, "PARLEY_MAX_CONNECTIONS_PER_IP", 2)?,
                max_connections_per_user: parsed(lookup, "PARLEY_MAX_CONNECTIONS_PER_USER", 5)?,
                messages_per_second: parsed(lookup, "PARLEY_MESSAGES_PER_SECOND", 5)?,
                messages_per_minute: parsed(lookup, "PARLEY_MESSAGES_PER_MINUTE", 60)?,
                messages_per_hour: parsed(lookup, "PARLEY_MESSAGES_PER_HOUR", 1000)?,
                messages_per_day: parsed(lookup, "PARLEY_MESSAGES_PER_DAY", 10_000)?,
                connect_timeout: Duration::from_secs(parsed(
                    lookup,
                    "PARLEY_CONNECT_TIMEOUT_SECS",
                    10,
                )?),
                message_timeout: Duration::from_secs(parsed(
                    lookup,
                    "PARLEY_MESSAGE_TIMEOUT_SECS",
                    30,
                )?),
            },
            history: HistorySettings {
                max_length: parsed(lookup, "PARLEY_HISTORY_MAX_LENGTH", 100)?,
                retention: parsed_opt::<u64>(lookup, "PARLEY_HISTORY_TTL_SECS")?
                    .map(Duration::from_secs),
            },
            llm: LlmConfig {
                endpoint: string(lookup, "PARLEY_LLM_ENDPOINT", "https://api.openai.com/v1"),
                model: string(lookup, "PARLEY_LLM_MODEL", "gpt-4o-mini"),
                api_key: optional(lookup, "PARLEY_LLM_API_KEY").map(Secret::new),
                temperature: parsed(lookup, "PARLEY_LLM_TEMPERATURE", 0.0)?,
                max_tokens: parsed(lookup, "PARLEY_LLM_MAX_TOKENS", 1024)?,
                cache_enabled: parsed(lookup, "PARLEY_LLM_CACHE", true)?,
            },
            kv: KvConfig {
                url: optional(lookup, "PARLEY_KV_URL"),
                pool_size: parsed(lookup, "PARLEY_KV_POOL_SIZE", 8)?,
            },
            telemetry: TelemetryConfig {
                endpoint: optional(lookup, "PARLEY_TELEMETRY_ENDPOINT"),
            },
        })
    }
}

fn string(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: &str) -> String {
    lookup(key).filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn optional(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Option<String> {
    lookup(key).filter(|v| !v.is_empty())
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parsed_opt(lookup, key)?.unwrap_or(default))
}

fn parsed_opt<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match optional(lookup, key) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value,
                reason: e.to_string(),
            }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn env<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        move |key| map.get(key).map(|v| (*v).to_string())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = ParleyConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.transport.listen_addr, "127.0.0.1:8080");
        assert_eq!(config.limits.max_connections_per_ip, 2);
        assert_eq!(config.limits.messages_per_second, 5);
        assert_eq!(config.limits.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.history.max_length, 100);
        assert!(config.history.retention.is_none());
        assert!(config.llm.cache_enabled);
        assert!(config.kv.url.is_none());
    }

    #[test]
    fn values_override_defaults() {
        let lookup = env(&[
            ("PARLEY_LISTEN_ADDR", "0.0.0.0:9000"),
            ("PARLEY_MESSAGES_PER_SECOND", "50"),
            ("PARLEY_HISTORY_TTL_SECS", "7200"),
            ("PARLEY_KV_URL", "redis://10.0.0.1:6379"),
            ("PARLEY_LLM_TEMPERATURE", "0.7"),
            ("PARLEY_LLM_CACHE", "false"),
        ]);
        let config = ParleyConfig::from_lookup(lookup).unwrap();
        assert_eq!(config.transport.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.limits.messages_per_second, 50);
        assert_eq!(config.history.retention, Some(Duration::from_secs(7200)));
        assert_eq!(config.kv.url.as_deref(), Some("redis://10.0.0.1:6379"));
        assert!((config.llm.temperature - 0.7).abs() < f32::EPSILON);
        assert!(!config.llm.cache_enabled);
    }

    #[test]
    fn unparseable_value_is_an_error() {
        let lookup = env(&[("PARLEY_MESSAGES_PER_SECOND", "plenty")]);
        let err = ParleyConfig::from_lookup(lookup).unwrap_err();
        let ConfigError::Invalid { key, value, .. } = err;
        assert_eq!(key, "PARLEY_MESSAGES_PER_SECOND");
        assert_eq!(value, "plenty");
    }

    #[test]
    fn empty_string_counts_as_unset() {
        let lookup = env(&[("PARLEY_KV_URL", ""), ("PARLEY_TLS_CERT", "")]);
        let config = ParleyConfig::from_lookup(lookup).unwrap();
        assert!(config.kv.url.is_none());
        assert!(config.transport.tls_cert.is_none());
    }
}
