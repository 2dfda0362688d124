//! OpenAI-compatible chat-completions provider with SSE streaming.

use std::pin::Pin;

use {
    futures::StreamExt,
    secrecy::{ExposeSecret, Secret},
    tokio_stream::Stream,
    tracing::{debug, warn},
};

use crate::model::{LlmProvider, RequestParams, StreamEvent, UpstreamError};

pub struct OpenAiCompatProvider {
    api_key: Option<Secret<String>>,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    #[must_use]
    pub fn new(base_url: String, model: String, api_key: Option<Secret<String>>) -> Self {
        Self {
            api_key,
            model,
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

/// Extract the text delta from one SSE `data:` payload, if any.
fn delta_from_event(data: &str) -> Option<String> {
    let evt: serde_json::Value = serde_json::from_str(data).ok()?;
    let delta = evt["choices"][0]["delta"]["content"].as_str()?;
    if delta.is_empty() {
        None
    } else {
        Some(delta.to_string())
    }
}

impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai-compat"
    }

    fn id(&self) -> &str {
        &self.model
    }

    fn stream(
        &self,
        messages: Vec<serde_json::Value>,
        params: &RequestParams,
    ) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + '_>> {
        let params = params.clone();
        Box::pin(async_stream::stream! {
            let body = serde_json::json!({
                "model": self.model,
                "messages": messages,
                "temperature": params.temperature,
                "max_tokens": params.max_tokens,
                "stream": true,
            });

            debug!(model = %self.model, messages = messages.len(), "llm: stream request");

            let mut request = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .header("content-type", "application/json")
                .json(&body);
            if let Some(key) = &self.api_key {
                request = request.header(
                    "Authorization",
                    format!("Bearer {}", key.expose_secret()),
                );
            }

            let resp = match request.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    yield StreamEvent::Error(UpstreamError::Unavailable(e.to_string()));
                    return;
                },
            };

            let status = resp.status();
            if !status.is_success() {
                let body_text = resp.text().await.unwrap_or_default();
                warn!(status = %status, body = %body_text, "llm: upstream error");
                let error = if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    UpstreamError::Throttled(format!("HTTP 429: {body_text}"))
                } else {
                    UpstreamError::Unavailable(format!("HTTP {status}: {body_text}"))
                };
                yield StreamEvent::Error(error);
                return;
            }

            let mut byte_stream = resp.bytes_stream();
            let mut buf = String::new();

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield StreamEvent::Error(UpstreamError::Unavailable(e.to_string()));
                        return;
                    },
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim().to_string();
                    buf = buf[pos + 1..].to_string();

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };

                    if data == "[DONE]" {
                        yield StreamEvent::Done;
                        return;
                    }

                    if let Some(delta) = delta_from_event(data) {
                        yield StreamEvent::Delta(delta);
                    }
                }
            }

            // Upstream closed without a [DONE] marker; the stream still
            // terminates exactly once.
            yield StreamEvent::Done;
        })
    }
}
