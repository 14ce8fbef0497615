use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use kbgate_contracts::{HistoryResponse, UpstreamHistoryItem};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, debug, error, info, info_span, warn};

pub mod assemble;
pub mod history;
pub mod models;
pub mod prompt;
pub mod sse;

pub use assemble::{
    ApiShape, AssemblerState, BufferedReply, BufferingAssembler, ReplyMeta, SseFrame,
    StreamingAssembler,
};
pub use models::{ModelCatalog, ModelConfig};
pub use sse::FragmentReader;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("upstream request failed with status: {status}")]
    UpstreamStatus { status: u16 },
    #[error("upstream error: {0}")]
    Upstream(String),
}

/// Raw upstream response body.
pub type ByteStream = BoxStream<'static, Result<Bytes, CoreError>>;

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn valid_token(&self) -> Result<String, CoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamChatRequest<'a> {
    pub prompt: &'a str,
    pub session_key: &'a str,
    pub upstream_model_id: &'a str,
}

#[async_trait]
pub trait UpstreamChat: Send + Sync {
    /// Opens a chat call. Anything but HTTP 200 is `UpstreamStatus`.
    async fn send(
        &self,
        request: UpstreamChatRequest<'_>,
        token: &str,
    ) -> Result<ByteStream, CoreError>;

    async fn history(&self, token: &str) -> Result<Vec<Vec<UpstreamHistoryItem>>, CoreError>;
}

/// One inbound call after prompt normalisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRequest {
    pub model: String,
    pub prompt: String,
    pub session_key: String,
    pub wants_stream: bool,
}

pub struct ChatEngine {
    tokens: Arc<dyn TokenProvider>,
    upstream: Arc<dyn UpstreamChat>,
    models: ModelCatalog,
    fallback_message: String,
}

impl ChatEngine {
    pub fn new(
        tokens: Arc<dyn TokenProvider>,
        upstream: Arc<dyn UpstreamChat>,
        models: ModelCatalog,
        fallback_message: impl Into<String>,
    ) -> Self {
        Self { tokens, upstream, models, fallback_message: fallback_message.into() }
    }

    pub fn models(&self) -> &ModelCatalog {
        &self.models
    }

    async fn open(&self, request: &NormalizedRequest) -> Result<FragmentReader, CoreError> {
        let token = self.tokens.valid_token().await?;
        let model = self.models.resolve(&request.model);
        let body = self
            .upstream
            .send(
                UpstreamChatRequest {
                    prompt: &request.prompt,
                    session_key: &request.session_key,
                    upstream_model_id: &model.upstream_model_id,
                },
                &token,
            )
            .await
            .inspect_err(|error| {
                error!(event = "upstream.chat.failed", model = %model.id, %error);
            })?;
        Ok(FragmentReader::new(body))
    }

    /// Reads the whole upstream answer and returns one reply object.
    pub async fn execute(
        &self,
        request: NormalizedRequest,
        meta: ReplyMeta,
    ) -> Result<BufferedReply, CoreError> {
        let mut reader = self.open(&request).await?;
        let mut assembler = BufferingAssembler::new(meta);
        while let Some(fragment) = reader.next_fragment().await {
            let fragment = fragment.inspect_err(|error| {
                error!(event = "upstream.stream.read_failed", %error);
            })?;
            assembler.push(&fragment);
        }
        let reply = assembler.finish(&self.fallback_message);
        info!(event = "reply.completed", response_len = reply.content().len());
        Ok(reply)
    }

    /// Opens the upstream call and returns a stream of SSE frames. Failures
    /// before the upstream answers are returned as errors; once streaming has
    /// begun, read failures only end the stream early.
    pub async fn execute_stream(
        &self,
        request: NormalizedRequest,
        meta: ReplyMeta,
    ) -> Result<ReceiverStream<SseFrame>, CoreError> {
        let reader = self.open(&request).await?;
        let (tx, rx) = mpsc::channel(32);
        let span = info_span!("stream_pump", reply_id = %meta.id, model = %meta.model);
        tokio::spawn(pump_fragments(reader, StreamingAssembler::new(meta), tx).instrument(span));
        Ok(ReceiverStream::new(rx))
    }

    /// Conversation history. Never fails: any problem yields an empty list.
    pub async fn history(&self) -> HistoryResponse {
        let sessions = match self.tokens.valid_token().await {
            Ok(token) => self.upstream.history(&token).await,
            Err(error) => Err(error),
        };
        match sessions {
            Ok(sessions) => history::build_history(sessions),
            Err(error) => {
                warn!(event = "history.degraded", %error, "returning empty history");
                HistoryResponse::empty()
            }
        }
    }
}

async fn pump_fragments(
    mut reader: FragmentReader,
    mut assembler: StreamingAssembler,
    tx: mpsc::Sender<SseFrame>,
) {
    let mut delivered = 0usize;
    while let Some(fragment) = reader.next_fragment().await {
        match fragment {
            Ok(fragment) => {
                let Some(frame) = assembler.push(&fragment) else {
                    continue;
                };
                if tx.send(frame).await.is_err() {
                    debug!(event = "stream.client_gone", delivered);
                    return;
                }
                delivered += 1;
            }
            Err(error) => {
                error!(event = "upstream.stream.read_failed", %error);
                break;
            }
        }
    }

    for frame in assembler.finish() {
        if tx.send(frame).await.is_err() {
            debug!(event = "stream.client_gone", delivered);
            return;
        }
    }
    info!(event = "stream.completed", delivered);
}

pub fn unix_millis() -> i64 {
    let Ok(duration) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    duration.as_millis() as i64
}

pub fn unix_seconds() -> i64 {
    unix_millis() / 1000
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::{StreamExt, stream};
    use serde_json::Value;

    use super::*;

    #[derive(Debug, Clone)]
    enum UpstreamBehavior {
        Lines(Vec<&'static str>),
        BreakAfter(Vec<&'static str>),
        Status(u16),
    }

    struct FakeTokens {
        result: Result<String, CoreError>,
        calls: AtomicUsize,
    }

    impl FakeTokens {
        fn ok() -> Arc<Self> {
            Arc::new(Self { result: Ok("tok".to_string()), calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl TokenProvider for FakeTokens {
        async fn valid_token(&self) -> Result<String, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    struct FakeUpstream {
        behavior: UpstreamBehavior,
        history: Result<Vec<Vec<UpstreamHistoryItem>>, CoreError>,
        seen: Mutex<Vec<(String, String, String, String)>>,
    }

    impl FakeUpstream {
        fn new(behavior: UpstreamBehavior) -> Arc<Self> {
            Arc::new(Self { behavior, history: Ok(Vec::new()), seen: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl UpstreamChat for FakeUpstream {
        async fn send(
            &self,
            request: UpstreamChatRequest<'_>,
            token: &str,
        ) -> Result<ByteStream, CoreError> {
            self.seen.lock().expect("seen lock").push((
                request.prompt.to_string(),
                request.session_key.to_string(),
                request.upstream_model_id.to_string(),
                token.to_string(),
            ));
            let (lines, broken) = match &self.behavior {
                UpstreamBehavior::Status(status) => {
                    return Err(CoreError::UpstreamStatus { status: *status });
                }
                UpstreamBehavior::Lines(lines) => (lines.clone(), false),
                UpstreamBehavior::BreakAfter(lines) => (lines.clone(), true),
            };
            let mut chunks = lines
                .into_iter()
                .map(|line| Ok(Bytes::from(format!("{line}\n"))))
                .collect::<Vec<_>>();
            if broken {
                chunks.push(Err(CoreError::Upstream("connection reset".to_string())));
            }
            Ok(stream::iter(chunks).boxed())
        }

        async fn history(
            &self,
            _token: &str,
        ) -> Result<Vec<Vec<UpstreamHistoryItem>>, CoreError> {
            self.history.clone()
        }
    }

    fn catalog() -> ModelCatalog {
        let doubao = ModelConfig::new("doubao", "2", 1_687_882_411, "ulearning");
        ModelCatalog::new(
            vec![ModelConfig::new("qwen", "1", 1_677_610_602, "ulearning"), doubao.clone()],
            doubao,
        )
    }

    fn engine(upstream: Arc<FakeUpstream>) -> ChatEngine {
        ChatEngine::new(FakeTokens::ok(), upstream, catalog(), "fallback")
    }

    fn request(model: &str, stream: bool) -> NormalizedRequest {
        NormalizedRequest {
            model: model.to_string(),
            prompt: "hello".to_string(),
            session_key: "sk-caller".to_string(),
            wants_stream: stream,
        }
    }

    async fn collect(stream: ReceiverStream<SseFrame>) -> Vec<SseFrame> {
        stream.collect::<Vec<_>>().await
    }

    fn delta_of(frame: &SseFrame) -> Value {
        let value: Value = serde_json::from_str(&frame.data).expect("json frame");
        value["choices"][0]["delta"]["content"].clone()
    }

    #[tokio::test]
    async fn stream_preserves_order_and_terminates() {
        let upstream = FakeUpstream::new(UpstreamBehavior::Lines(vec![
            r#"data: {"data":"He"}"#,
            "keepalive",
            r#"data: {"data":""}"#,
            r#"data: {"data":"llo"}"#,
        ]));
        let engine = engine(upstream.clone());
        let stream = engine
            .execute_stream(request("qwen", true), ReplyMeta::new(ApiShape::ChatCompletions, "qwen"))
            .await
            .expect("stream must open");
        let frames = collect(stream).await;

        assert_eq!(frames.len(), 4);
        assert_eq!(delta_of(&frames[0]), "He");
        assert_eq!(delta_of(&frames[1]), "llo");
        assert!(frames[2].data.contains(r#""finish_reason":"stop""#));
        assert!(frames[3].is_done());

        let seen = upstream.seen.lock().expect("seen lock");
        assert_eq!(
            seen[0],
            ("hello".to_string(), "sk-caller".to_string(), "1".to_string(), "tok".to_string())
        );
    }

    #[tokio::test]
    async fn stream_read_error_still_terminates() {
        let upstream =
            FakeUpstream::new(UpstreamBehavior::BreakAfter(vec![r#"data: {"data":"partial"}"#]));
        let frames = collect(
            engine(upstream)
                .execute_stream(request("qwen", true), ReplyMeta::new(ApiShape::Responses, "qwen"))
                .await
                .expect("stream must open"),
        )
        .await;

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].event, Some("response.output_text.delta"));
        assert_eq!(frames[1].event, Some("response.completed"));
        assert!(frames[2].is_done());
    }

    #[tokio::test]
    async fn stream_open_failure_is_returned_before_streaming() {
        let upstream = FakeUpstream::new(UpstreamBehavior::Status(503));
        let result = engine(upstream)
            .execute_stream(request("qwen", true), ReplyMeta::new(ApiShape::ChatCompletions, "qwen"))
            .await;
        assert!(matches!(result, Err(CoreError::UpstreamStatus { status: 503 })));
    }

    #[tokio::test]
    async fn buffered_reply_concatenates_fragments() {
        let upstream = FakeUpstream::new(UpstreamBehavior::Lines(vec![
            r#"data: {"data":"He"}"#,
            r#"data: {"data":"llo"}"#,
        ]));
        let reply = engine(upstream.clone())
            .execute(request("unknown-model", false), ReplyMeta::new(ApiShape::ChatCompletions, "x"))
            .await
            .expect("reply");
        assert_eq!(reply.content(), "Hello");
        assert_eq!(upstream.seen.lock().expect("seen lock")[0].2, "2");
    }

    #[tokio::test]
    async fn buffered_reply_uses_fallback_without_fragments() {
        let upstream = FakeUpstream::new(UpstreamBehavior::Lines(vec!["keepalive"]));
        let reply = engine(upstream)
            .execute(request("qwen", false), ReplyMeta::new(ApiShape::ChatCompletions, "qwen"))
            .await
            .expect("reply");
        assert_eq!(reply.content(), "fallback");
    }

    #[tokio::test]
    async fn buffered_reply_fails_on_broken_stream() {
        let upstream =
            FakeUpstream::new(UpstreamBehavior::BreakAfter(vec![r#"data: {"data":"partial"}"#]));
        let result = engine(upstream)
            .execute(request("qwen", false), ReplyMeta::new(ApiShape::ChatCompletions, "qwen"))
            .await;
        assert_eq!(result, Err(CoreError::Upstream("connection reset".to_string())));
    }

    #[tokio::test]
    async fn token_failure_stops_before_upstream() {
        let tokens = Arc::new(FakeTokens {
            result: Err(CoreError::Auth("no token cookie".to_string())),
            calls: AtomicUsize::new(0),
        });
        let upstream = FakeUpstream::new(UpstreamBehavior::Lines(Vec::new()));
        let engine = ChatEngine::new(tokens.clone(), upstream.clone(), catalog(), "fallback");
        let result = engine
            .execute(request("qwen", false), ReplyMeta::new(ApiShape::ChatCompletions, "qwen"))
            .await;
        assert!(matches!(result, Err(CoreError::Auth(_))));
        assert_eq!(tokens.calls.load(Ordering::SeqCst), 1);
        assert!(upstream.seen.lock().expect("seen lock").is_empty());
    }

    #[tokio::test]
    async fn history_degrades_to_empty_list() {
        let upstream = Arc::new(FakeUpstream {
            behavior: UpstreamBehavior::Lines(Vec::new()),
            history: Err(CoreError::UpstreamStatus { status: 500 }),
            seen: Mutex::new(Vec::new()),
        });
        let history = engine(upstream).history().await;
        assert_eq!(history, HistoryResponse::empty());
    }

    #[tokio::test]
    async fn history_maps_sessions() {
        let upstream = Arc::new(FakeUpstream {
            behavior: UpstreamBehavior::Lines(Vec::new()),
            history: Ok(vec![vec![UpstreamHistoryItem {
                query: "q".to_string(),
                answer: "a".to_string(),
                create_time: 1_700_000_000_000,
                ..UpstreamHistoryItem::default()
            }]]),
            seen: Mutex::new(Vec::new()),
        });
        let history = engine(upstream).history().await;
        assert_eq!(history.data.len(), 1);
        assert_eq!(history.data[0].messages.len(), 2);
    }
}
