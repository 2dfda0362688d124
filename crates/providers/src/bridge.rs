//! Bridge from an inbound user message to a sequenced `chat_chunk` stream.
//!
//! Each spawned stream owns one upstream call. Deltas are wrapped into
//! `chat_chunk` envelopes sharing the inbound message id, with sequence
//! numbers from 0 and exactly one `final = true` terminator — also after
//! upstream errors, so the session can always release the request id.
//! Cancellation is cooperative: the bridge stops reading upstream and emits
//! one final chunk marked `cancelled`.

use std::sync::Arc;

use {
    tokio::sync::mpsc,
    tokio_stream::StreamExt,
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use {
    parley_metrics::{counter, histogram, names},
    parley_protocol::{ChatChunk, ChatMessage, Envelope, Metadata},
};

use crate::{
    cache::ResponseCache,
    format::format_messages,
    model::{LlmProvider, RequestParams, StreamEvent},
};

/// Chunks buffered between the bridge task and the session loop.
const CHUNK_CHANNEL_CAPACITY: usize = 32;

/// A live response stream: envelopes on `receiver`, cancellation via
/// [`StreamHandle::cancel`]. Dropping the handle detaches the task, which
/// stops at its next send.
pub struct StreamHandle {
    pub receiver: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
}

impl StreamHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

pub struct LlmBridge {
    provider: Arc<dyn LlmProvider>,
    cache: Arc<ResponseCache>,
    params: RequestParams,
}

impl LlmBridge {
    pub fn new(provider: Arc<dyn LlmProvider>, cache: ResponseCache, params: RequestParams) -> Self {
        Self {
            provider,
            cache: Arc::new(cache),
            params,
        }
    }

    #[must_use]
    pub fn params(&self) -> &RequestParams {
        &self.params
    }

    /// Start streaming a response to `history`'s trailing user message.
    ///
    /// `request_id` is the id of the inbound `chat_message`; every emitted
    /// chunk shares it.
    #[must_use]
    pub fn spawn(&self, request_id: String, history: Vec<ChatMessage>) -> StreamHandle {
        let (tx, receiver) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let provider = Arc::clone(&self.provider);
        let cache = Arc::clone(&self.cache);
        let params = self.params.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            run_stream(provider, cache, params, request_id, history, tx, token).await;
        });

        StreamHandle { receiver, cancel }
    }
}

fn chunk(id: &str, sequence: u64, delta: String, is_final: bool, metadata: Metadata) -> Envelope {
    Envelope::ChatChunk(ChatChunk {
        id: id.to_string(),
        sequence,
        delta,
        is_final,
        metadata,
    })
}

fn final_chunk(id: &str, sequence: u64, metadata: Metadata) -> Envelope {
    chunk(id, sequence, String::new(), true, metadata)
}

#[allow(clippy::too_many_arguments)]
async fn run_stream(
    provider: Arc<dyn LlmProvider>,
    cache: Arc<ResponseCache>,
    params: RequestParams,
    request_id: String,
    history: Vec<ChatMessage>,
    tx: mpsc::Sender<Envelope>,
    token: CancellationToken,
) {
    counter!(names::llm::STREAMS_TOTAL).increment(1);
    let messages = format_messages(&history);

    if let Some(cached) = cache.get(provider.id(), &messages, &params).await {
        let mut metadata = Metadata::new();
        metadata.insert("cached".into(), serde_json::Value::Bool(true));
        let _ = tx.send(chunk(&request_id, 0, cached, true, metadata)).await;
        return;
    }

    let started = std::time::Instant::now();
    let mut stream = provider.stream(messages.clone(), &params);
    let mut sequence: u64 = 0;
    let mut collected = String::new();

    loop {
        tokio::select! {
            biased;

            () = token.cancelled() => {
                debug!(request_id, sequence, "llm: stream cancelled");
                counter!(names::llm::CANCELLED_TOTAL).increment(1);
                let mut metadata = Metadata::new();
                metadata.insert("cancelled".into(), serde_json::Value::Bool(true));
                let _ = tx.send(final_chunk(&request_id, sequence, metadata)).await;
                return;
            },

            event = stream.next() => match event {
                Some(StreamEvent::Delta(delta)) => {
                    if sequence == 0 {
                        histogram!(names::llm::TIME_TO_FIRST_CHUNK_SECONDS)
                            .record(started.elapsed().as_secs_f64());
                    }
                    collected.push_str(&delta);
                    counter!(names::llm::CHUNKS_TOTAL).increment(1);
                    let envelope =
                        chunk(&request_id, sequence, delta, false, Metadata::new());
                    if tx.send(envelope).await.is_err() {
                        // Session is gone; stop reading upstream.
                        return;
                    }
                    sequence += 1;
                },
                Some(StreamEvent::Done) | None => {
                    if !collected.is_empty() {
                        cache.put(provider.id(), &messages, &params, &collected).await;
                    }
                    let _ = tx.send(final_chunk(&request_id, sequence, Metadata::new())).await;
                    return;
                },
                Some(StreamEvent::Error(err)) => {
                    warn!(request_id, error = %err, "llm: upstream error");
                    counter!(
                        names::llm::STREAM_ERRORS_TOTAL,
                        "kind" => err.failure_kind().as_str()
                    )
                    .increment(1);
                    let error = Envelope::error(err.failure_kind(), err.to_string());
                    if tx.send(error).await.is_err() {
                        return;
                    }
                    // Release the request id on the client side.
                    let _ = tx.send(final_chunk(&request_id, sequence, Metadata::new())).await;
                    return;
                },
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    use std::{
        pin::Pin,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use {parley_kv::MemoryKv, tokio_stream::Stream};

    use crate::model::UpstreamError;

    struct FakeProvider {
        script: Vec<StreamEvent>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl FakeProvider {
        fn scripted(script: Vec<StreamEvent>) -> Self {
            Self {
                script,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn slow(script: Vec<StreamEvent>, delay: Duration) -> Self {
            Self {
                script,
                delay,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl LlmProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        fn id(&self) -> &str {
            "fake-model"
        }

        fn stream(
            &self,
            _messages: Vec<serde_json::Value>,
            _params: &RequestParams,
        ) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + '_>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let script = self.script.clone();
            let delay = self.delay;
            Box::pin(async_stream::stream! {
                for event in script {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    yield event;
                }
            })
        }
    }

    fn params(temperature: f32) -> RequestParams {
        RequestParams {
            temperature,
            max_tokens: 256,
        }
    }

    fn bridge_with(
        provider: Arc<FakeProvider>,
        temperature: f32,
        cache_enabled: bool,
    ) -> LlmBridge {
        let cache = ResponseCache::new(Arc::new(MemoryKv::new()), cache_enabled);
        LlmBridge::new(provider, cache, params(temperature))
    }

    fn prompt() -> Vec<ChatMessage> {
        vec![ChatMessage::user("hi", "k-1")]
    }

    async fn collect(mut handle: StreamHandle) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Some(envelope) = handle.receiver.recv().await {
            out.push(envelope);
        }
        out
    }

    fn chunks(envelopes: &[Envelope]) -> Vec<&ChatChunk> {
        envelopes
            .iter()
            .filter_map(|e| match e {
                Envelope::ChatChunk(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn sequences_are_contiguous_with_one_final() {
        let provider = Arc::new(FakeProvider::scripted(vec![
            StreamEvent::Delta("he".into()),
            StreamEvent::Delta("llo".into()),
            StreamEvent::Done,
        ]));
        let bridge = bridge_with(provider, 0.7, false);

        let envelopes = collect(bridge.spawn("m-1".into(), prompt())).await;
        let chunks = chunks(&envelopes);

        assert_eq!(chunks.len(), 3);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.id, "m-1");
            assert_eq!(chunk.sequence, i as u64);
        }
        assert_eq!(chunks.iter().filter(|c| c.is_final).count(), 1);
        let last = chunks.last().unwrap();
        assert!(last.is_final);
        assert!(last.delta.is_empty());
        assert_eq!(
            chunks.iter().map(|c| c.delta.as_str()).collect::<String>(),
            "hello"
        );
    }

    #[tokio::test]
    async fn upstream_error_emits_error_then_final() {
        let provider = Arc::new(FakeProvider::scripted(vec![
            StreamEvent::Delta("par".into()),
            StreamEvent::Error(UpstreamError::Unavailable("boom".into())),
        ]));
        let bridge = bridge_with(provider, 0.7, false);

        let envelopes = collect(bridge.spawn("m-2".into(), prompt())).await;

        let Envelope::Error(error) = &envelopes[1] else {
            panic!("expected error envelope, got {envelopes:?}");
        };
        assert_eq!(error.code, 5011);
        assert_eq!(error.kind, "upstream_unavailable");

        let chunks = chunks(&envelopes);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.last().unwrap().is_final);
    }

    #[tokio::test]
    async fn throttling_maps_to_upstream_throttled() {
        let provider = Arc::new(FakeProvider::scripted(vec![StreamEvent::Error(
            UpstreamError::Throttled("slow down".into()),
        )]));
        let bridge = bridge_with(provider, 0.7, false);

        let envelopes = collect(bridge.spawn("m-3".into(), prompt())).await;
        let Envelope::Error(error) = &envelopes[0] else {
            panic!("expected error envelope first");
        };
        assert_eq!(error.code, 5012);
        assert_eq!(error.kind, "upstream_throttled");
    }

    #[tokio::test]
    async fn cancellation_ends_with_single_marked_final() {
        let provider = Arc::new(FakeProvider::slow(
            vec![
                StreamEvent::Delta("a".into()),
                StreamEvent::Delta("b".into()),
                StreamEvent::Delta("c".into()),
                StreamEvent::Delta("d".into()),
                StreamEvent::Done,
            ],
            Duration::from_millis(30),
        ));
        let bridge = bridge_with(provider, 0.7, false);
        let mut handle = bridge.spawn("m-7".into(), prompt());

        let first = handle.receiver.recv().await.unwrap();
        let Envelope::ChatChunk(first) = first else {
            panic!("expected chunk");
        };
        assert_eq!(first.sequence, 0);

        handle.cancel();

        let mut rest = Vec::new();
        while let Some(envelope) = handle.receiver.recv().await {
            rest.push(envelope);
        }
        // At most one further chunk, and it is the cancelled terminator.
        assert!(rest.len() <= 2, "too many post-cancel envelopes: {rest:?}");
        let Some(Envelope::ChatChunk(last)) = rest.last() else {
            panic!("expected terminating chunk, got {rest:?}");
        };
        assert!(last.is_final);
        assert_eq!(last.metadata.get("cancelled"), Some(&serde_json::Value::Bool(true)));
    }

    #[tokio::test]
    async fn deterministic_responses_are_cached() {
        let provider = Arc::new(FakeProvider::scripted(vec![
            StreamEvent::Delta("hi ".into()),
            StreamEvent::Delta("there".into()),
            StreamEvent::Done,
        ]));
        let cache = ResponseCache::new(Arc::new(MemoryKv::new()), true);
        let bridge = LlmBridge::new(Arc::clone(&provider) as Arc<dyn LlmProvider>, cache, params(0.0));

        let first = collect(bridge.spawn("m-1".into(), prompt())).await;
        assert_eq!(chunks(&first).len(), 3);

        let second = collect(bridge.spawn("m-2".into(), prompt())).await;
        let second_chunks = chunks(&second);
        assert_eq!(second_chunks.len(), 1, "cache hit should be single-chunk");
        let only = second_chunks[0];
        assert_eq!(only.sequence, 0);
        assert!(only.is_final);
        assert_eq!(only.delta, "hi there");
        assert_eq!(only.metadata.get("cached"), Some(&serde_json::Value::Bool(true)));

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sampling_disables_the_cache() {
        let provider = Arc::new(FakeProvider::scripted(vec![
            StreamEvent::Delta("x".into()),
            StreamEvent::Done,
        ]));
        let cache = ResponseCache::new(Arc::new(MemoryKv::new()), true);
        let bridge = LlmBridge::new(Arc::clone(&provider) as Arc<dyn LlmProvider>, cache, params(0.9));

        collect(bridge.spawn("m-1".into(), prompt())).await;
        collect(bridge.spawn("m-2".into(), prompt())).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }
}
