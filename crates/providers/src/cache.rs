//! Content-addressed response cache.
//!
//! Completed responses are stored in the KV store keyed by a fingerprint of
//! (model id, formatted messages, parameters). The cache is consulted and
//! written only for deterministic parameter sets (temperature 0); any other
//! sampling disables it for both reads and writes. KV failures degrade to a
//! cache miss — the upstream call proceeds.

use std::{sync::Arc, time::Duration};

use {sha2::Digest, tracing::warn};

use {
    parley_kv::KvStore,
    parley_metrics::{counter, names},
};

use crate::model::RequestParams;

const CACHE_TTL: Duration = Duration::from_secs(86_400);

fn fingerprint(model: &str, messages: &[serde_json::Value], params: &RequestParams) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0]);
    hasher.update(
        serde_json::to_string(messages)
            .unwrap_or_default()
            .as_bytes(),
    );
    hasher.update([0]);
    hasher.update(params.temperature.to_le_bytes());
    hasher.update(params.max_tokens.to_le_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn cache_key(model: &str, messages: &[serde_json::Value], params: &RequestParams) -> String {
    format!("llm:cache:{}", fingerprint(model, messages, params))
}

pub struct ResponseCache {
    kv: Arc<dyn KvStore>,
    enabled: bool,
}

impl ResponseCache {
    pub fn new(kv: Arc<dyn KvStore>, enabled: bool) -> Self {
        Self { kv, enabled }
    }

    fn usable(&self, params: &RequestParams) -> bool {
        self.enabled && params.deterministic()
    }

    /// Look up a prior full response. Any store failure is a miss.
    pub async fn get(
        &self,
        model: &str,
        messages: &[serde_json::Value],
        params: &RequestParams,
    ) -> Option<String> {
        if !self.usable(params) {
            return None;
        }
        let key = cache_key(model, messages, params);
        match self.kv.get(&key).await {
            Ok(Some(bytes)) => {
                counter!(names::llm::CACHE_HITS_TOTAL).increment(1);
                Some(String::from_utf8_lossy(&bytes).into_owned())
            },
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "llm cache: read failed, treating as miss");
                None
            },
        }
    }

    /// Store a completed response. Best-effort.
    pub async fn put(
        &self,
        model: &str,
        messages: &[serde_json::Value],
        params: &RequestParams,
        response: &str,
    ) {
        if !self.usable(params) {
            return;
        }
        let key = cache_key(model, messages, params);
        if let Err(err) = self
            .kv
            .set(&key, response.as_bytes(), Some(CACHE_TTL))
            .await
        {
            warn!(error = %err, "llm cache: write failed");
        }
    }
}
