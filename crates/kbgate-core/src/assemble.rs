use kbgate_contracts::{
    AssistantMessage, ChatChoice, ChatCompletionsResponse, CompletionChoice, CompletionsResponse,
    ResponseOutputMessage, ResponseOutputText, ResponsesResponse, Usage,
};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::warn;
use uuid::Uuid;

use crate::unix_seconds;

pub const DONE_SENTINEL: &str = "[DONE]";
pub const FINISH_REASON_STOP: &str = "stop";

/// Which OpenAI API the caller spoke, and therefore which shape replies take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiShape {
    ChatCompletions,
    Responses,
    TextCompletions,
}

impl ApiShape {
    fn id_prefix(self) -> &'static str {
        match self {
            Self::ChatCompletions => "chatcmpl-",
            Self::Responses => "resp_",
            Self::TextCompletions => "cmpl-",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyMeta {
    pub id: String,
    pub created: i64,
    pub model: String,
    pub shape: ApiShape,
}

impl ReplyMeta {
    pub fn new(shape: ApiShape, model: impl Into<String>) -> Self {
        Self {
            id: format!("{}{}", shape.id_prefix(), Uuid::new_v4().simple()),
            created: unix_seconds(),
            model: model.into(),
            shape,
        }
    }
}

/// One server-sent event: optional event name plus the `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<&'static str>,
    pub data: String,
}

impl SseFrame {
    fn json(event: Option<&'static str>, payload: Value) -> Self {
        Self { event, data: payload.to_string() }
    }

    pub fn done() -> Self {
        Self { event: None, data: DONE_SENTINEL.to_string() }
    }

    pub fn is_done(&self) -> bool {
        self.data == DONE_SENTINEL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    Streaming,
    Finished,
}

/// Turns fragments into chunk events as they arrive. After [`finish`] the
/// assembler is inert: further fragments and finishes produce nothing.
///
/// [`finish`]: StreamingAssembler::finish
#[derive(Debug)]
pub struct StreamingAssembler {
    meta: ReplyMeta,
    state: AssemblerState,
}

impl StreamingAssembler {
    pub fn new(meta: ReplyMeta) -> Self {
        Self { meta, state: AssemblerState::Streaming }
    }

    pub fn meta(&self) -> &ReplyMeta {
        &self.meta
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    pub fn push(&mut self, fragment: &str) -> Option<SseFrame> {
        if self.state == AssemblerState::Finished || fragment.is_empty() {
            return None;
        }
        Some(self.delta_frame(fragment))
    }

    /// Terminal `stop` event followed by the `[DONE]` sentinel.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        if self.state == AssemblerState::Finished {
            return Vec::new();
        }
        self.state = AssemblerState::Finished;
        vec![self.terminal_frame(), SseFrame::done()]
    }

    fn delta_frame(&self, fragment: &str) -> SseFrame {
        let meta = &self.meta;
        match meta.shape {
            ApiShape::ChatCompletions => SseFrame::json(
                None,
                json!({
                    "id": meta.id,
                    "object": "chat.completion.chunk",
                    "created": meta.created,
                    "model": meta.model,
                    "choices": [{"index": 0, "delta": {"content": fragment}, "finish_reason": Value::Null}]
                }),
            ),
            ApiShape::Responses => SseFrame::json(
                Some("response.output_text.delta"),
                json!({
                    "id": meta.id,
                    "type": "response.output_text.delta",
                    "output_index": 0,
                    "content_index": 0,
                    "delta": fragment
                }),
            ),
            ApiShape::TextCompletions => SseFrame::json(
                None,
                json!({
                    "id": meta.id,
                    "object": "text_completion",
                    "created": meta.created,
                    "model": meta.model,
                    "choices": [{"text": fragment, "index": 0, "finish_reason": Value::Null}]
                }),
            ),
        }
    }

    fn terminal_frame(&self) -> SseFrame {
        let meta = &self.meta;
        match meta.shape {
            ApiShape::ChatCompletions => SseFrame::json(
                None,
                json!({
                    "id": meta.id,
                    "object": "chat.completion.chunk",
                    "created": meta.created,
                    "model": meta.model,
                    "choices": [{"index": 0, "delta": {}, "finish_reason": FINISH_REASON_STOP}]
                }),
            ),
            ApiShape::Responses => SseFrame::json(
                Some("response.completed"),
                json!({
                    "id": meta.id,
                    "type": "response.completed",
                    "delta": "",
                    "finish_reason": FINISH_REASON_STOP,
                    "response": {
                        "id": meta.id,
                        "object": "response",
                        "status": "completed",
                        "model": meta.model
                    }
                }),
            ),
            ApiShape::TextCompletions => SseFrame::json(
                None,
                json!({
                    "id": meta.id,
                    "object": "text_completion",
                    "created": meta.created,
                    "model": meta.model,
                    "choices": [{"text": "", "index": 0, "finish_reason": FINISH_REASON_STOP}]
                }),
            ),
        }
    }
}

/// Final non-streaming reply, serialised as whichever object the caller expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum BufferedReply {
    Chat(ChatCompletionsResponse),
    Responses(ResponsesResponse),
    Text(CompletionsResponse),
}

impl BufferedReply {
    pub fn content(&self) -> String {
        match self {
            Self::Chat(response) => response
                .choices
                .first()
                .map(|choice| choice.message.content.clone())
                .unwrap_or_default(),
            Self::Responses(response) => response.output_text(),
            Self::Text(response) => {
                response.choices.first().map(|choice| choice.text.clone()).unwrap_or_default()
            }
        }
    }
}

#[derive(Debug)]
pub struct BufferingAssembler {
    meta: ReplyMeta,
    text: String,
}

impl BufferingAssembler {
    pub fn new(meta: ReplyMeta) -> Self {
        Self { meta, text: String::new() }
    }

    pub fn push(&mut self, fragment: &str) {
        self.text.push_str(fragment);
    }

    /// Blank upstream output is replaced by `fallback` so callers never see
    /// an empty answer.
    pub fn finish(self, fallback: &str) -> BufferedReply {
        let Self { meta, text } = self;
        let text = if text.trim().is_empty() {
            warn!(event = "reply.empty_fallback", reply_id = %meta.id, "empty upstream response, using fallback");
            fallback.to_string()
        } else {
            text
        };

        match meta.shape {
            ApiShape::ChatCompletions => BufferedReply::Chat(ChatCompletionsResponse {
                id: meta.id,
                object: "chat.completion".to_string(),
                created: meta.created,
                model: meta.model,
                choices: vec![ChatChoice {
                    index: 0,
                    message: AssistantMessage { role: "assistant".to_string(), content: text },
                    finish_reason: FINISH_REASON_STOP.to_string(),
                }],
                usage: Usage::default(),
            }),
            ApiShape::Responses => BufferedReply::Responses(ResponsesResponse {
                id: meta.id,
                object: "response".to_string(),
                created: meta.created,
                model: meta.model,
                status: "completed".to_string(),
                output: vec![ResponseOutputMessage {
                    id: "msg_1".to_string(),
                    kind: "message".to_string(),
                    role: "assistant".to_string(),
                    content: vec![ResponseOutputText {
                        kind: "output_text".to_string(),
                        text,
                    }],
                }],
                usage: Usage::default(),
            }),
            ApiShape::TextCompletions => BufferedReply::Text(CompletionsResponse {
                id: meta.id,
                object: "text_completion".to_string(),
                created: meta.created,
                model: meta.model,
                choices: vec![CompletionChoice {
                    text,
                    index: 0,
                    finish_reason: FINISH_REASON_STOP.to_string(),
                }],
                usage: Usage::default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(frame: &SseFrame) -> Value {
        serde_json::from_str(&frame.data).expect("frame data must be json")
    }

    #[test]
    fn chat_stream_emits_deltas_then_stop_then_done() {
        let mut assembler =
            StreamingAssembler::new(ReplyMeta::new(ApiShape::ChatCompletions, "qwen"));
        let mut frames = Vec::new();
        for fragment in ["He", "", "llo"] {
            frames.extend(assembler.push(fragment));
        }
        frames.extend(assembler.finish());

        assert_eq!(frames.len(), 4);
        assert_eq!(parse(&frames[0])["choices"][0]["delta"]["content"], "He");
        assert_eq!(parse(&frames[0])["choices"][0]["finish_reason"], Value::Null);
        assert_eq!(parse(&frames[1])["choices"][0]["delta"]["content"], "llo");
        assert_eq!(parse(&frames[2])["choices"][0]["finish_reason"], "stop");
        assert_eq!(parse(&frames[2])["choices"][0]["delta"], json!({}));
        assert!(frames[3].is_done());
        assert_eq!(parse(&frames[0])["object"], "chat.completion.chunk");
        assert_eq!(parse(&frames[0])["id"], parse(&frames[2])["id"]);
    }

    #[test]
    fn responses_stream_uses_named_delta_events() {
        let mut assembler = StreamingAssembler::new(ReplyMeta::new(ApiShape::Responses, "qwen"));
        let delta = assembler.push("hi").expect("delta frame");
        assert_eq!(delta.event, Some("response.output_text.delta"));
        assert_eq!(parse(&delta)["delta"], "hi");

        let tail = assembler.finish();
        assert_eq!(tail[0].event, Some("response.completed"));
        assert_eq!(parse(&tail[0])["finish_reason"], "stop");
        assert!(tail[1].is_done());
    }

    #[test]
    fn finished_assembler_ignores_further_input() {
        let mut assembler =
            StreamingAssembler::new(ReplyMeta::new(ApiShape::TextCompletions, "qwen"));
        assert_eq!(assembler.finish().len(), 2);
        assert_eq!(assembler.state(), AssemblerState::Finished);
        assert_eq!(assembler.push("late"), None);
        assert!(assembler.finish().is_empty());
    }

    #[test]
    fn buffering_concatenates_fragments_without_separator() {
        let mut assembler =
            BufferingAssembler::new(ReplyMeta::new(ApiShape::ChatCompletions, "qwen"));
        assembler.push("He");
        assembler.push("llo");
        let BufferedReply::Chat(response) = assembler.finish("fallback") else {
            panic!("expected chat reply");
        };
        assert_eq!(response.choices[0].message.content, "Hello");
        assert_eq!(response.choices[0].finish_reason, "stop");
        assert_eq!(response.usage, Usage::default());
        assert!(response.id.starts_with("chatcmpl-"));
    }

    #[test]
    fn buffering_substitutes_fallback_for_blank_output() {
        let mut assembler = BufferingAssembler::new(ReplyMeta::new(ApiShape::Responses, "qwen"));
        assembler.push("  \n");
        let reply = assembler.finish("sorry");
        assert_eq!(reply.content(), "sorry");
        let BufferedReply::Responses(response) = reply else {
            panic!("expected responses reply");
        };
        assert_eq!(response.object, "response");
        assert_eq!(response.output[0].content[0].kind, "output_text");
    }

    #[test]
    fn buffered_reply_serialises_without_wrapper() {
        let reply =
            BufferingAssembler::new(ReplyMeta::new(ApiShape::TextCompletions, "qwen")).finish("x");
        let value = serde_json::to_value(&reply).expect("reply must serialise");
        assert_eq!(value["object"], "text_completion");
        assert_eq!(value["choices"][0]["text"], "x");
        assert_eq!(value["usage"]["total_tokens"], 0);
    }
}
