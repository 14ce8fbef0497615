//! Turns the different inbound request shapes into the single query string
//! the upstream accepts.
//!
//! Every wire shape is first adapted into a flat list of [`PromptMessage`]s,
//! then [`compose_prompt`] applies one composition rule to all of them.

use kbgate_contracts::{ChatMessage, MessageContent, ResponsesInput};
use serde_json::Value;

use crate::CoreError;

/// Part type carrying text in chat-completions content lists.
pub const CHAT_TEXT_PART: &str = "text";
/// Part type carrying text in responses input lists.
pub const RESPONSES_TEXT_PART: &str = "input_text";

const SYSTEM_ROLE: &str = "system";
const USER_ROLE: &str = "user";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: String,
    pub text: String,
}

impl PromptMessage {
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self { role: role.into(), text: text.into() }
    }
}

/// Extracts the text of one message. For part lists only the first part of
/// `part_kind` counts; anything unrecognised is rendered as raw JSON.
pub fn extract_text(content: &MessageContent, part_kind: &str) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Parts(parts) => parts
            .iter()
            .filter(|part| part.kind.as_deref() == Some(part_kind))
            .find_map(|part| part.text.clone())
            .unwrap_or_default(),
        MessageContent::Unknown(Value::Null) => String::new(),
        MessageContent::Unknown(Value::String(text)) => text.clone(),
        MessageContent::Unknown(other) => other.to_string(),
    }
}

pub fn chat_messages(messages: &[ChatMessage]) -> Vec<PromptMessage> {
    messages
        .iter()
        .map(|message| {
            PromptMessage::new(message.role.clone(), extract_text(&message.content, CHAT_TEXT_PART))
        })
        .collect()
}

/// Items without a role (reasoning, tool output) are kept with an empty role,
/// so they never count as the user turn.
pub fn responses_messages(input: &ResponsesInput) -> Vec<PromptMessage> {
    match input {
        ResponsesInput::Text(text) => vec![PromptMessage::new(USER_ROLE, text.clone())],
        ResponsesInput::Items(items) => items
            .iter()
            .map(|item| {
                let text = item
                    .content
                    .as_ref()
                    .map(|content| extract_text(content, RESPONSES_TEXT_PART))
                    .unwrap_or_default();
                PromptMessage::new(item.role.clone().unwrap_or_default(), text)
            })
            .collect(),
        ResponsesInput::Unknown(Value::Null) => Vec::new(),
        ResponsesInput::Unknown(other) => {
            let text = match other {
                Value::String(text) => text.clone(),
                value => value.to_string(),
            };
            vec![PromptMessage::new(USER_ROLE, text)]
        }
    }
}

pub fn completion_messages(prompt: &str) -> Vec<PromptMessage> {
    vec![PromptMessage::new(USER_ROLE, prompt)]
}

/// System messages become a `System: ` prefixed block; the last user message
/// wins. With no user text at all the last message is used as-is.
pub fn compose_prompt(messages: &[PromptMessage]) -> Result<String, CoreError> {
    let Some(last) = messages.last() else {
        return Err(CoreError::Validation("messages must not be empty".to_string()));
    };

    let mut prefix = String::new();
    for message in messages.iter().filter(|message| message.role == SYSTEM_ROLE) {
        if message.text.is_empty() {
            continue;
        }
        prefix.push_str("System: ");
        prefix.push_str(&message.text);
        prefix.push_str("\n\n");
    }

    let user_text = messages
        .iter()
        .rev()
        .find(|message| message.role == USER_ROLE)
        .map(|message| message.text.as_str())
        .unwrap_or_default();

    let prompt = if !user_text.is_empty() && !prefix.is_empty() {
        format!("{prefix}User: {user_text}")
    } else if !user_text.is_empty() {
        user_text.to_string()
    } else {
        last.text.clone()
    };

    if prompt.is_empty() {
        return Err(CoreError::Validation("no valid input found".to_string()));
    }
    Ok(prompt)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use kbgate_contracts::{ContentPart, ResponseInputItem};

    use super::*;

    fn part(kind: &str, text: &str) -> ContentPart {
        ContentPart {
            kind: Some(kind.to_string()),
            text: Some(text.to_string()),
            extra: BTreeMap::new(),
        }
    }

    fn chat(role: &str, text: &str) -> ChatMessage {
        ChatMessage { role: role.to_string(), content: MessageContent::Text(text.to_string()) }
    }

    #[test]
    fn system_prefix_and_last_user_message_win() {
        let messages =
            chat_messages(&[chat("system", "A"), chat("user", "B"), chat("user", "C")]);
        assert_eq!(compose_prompt(&messages).as_deref(), Ok("System: A\n\nUser: C"));
    }

    #[test]
    fn multiple_system_messages_concatenate_in_order() {
        let messages = chat_messages(&[
            chat("system", "A"),
            chat("user", "B"),
            chat("system", "S2"),
            chat("assistant", "ok"),
        ]);
        assert_eq!(compose_prompt(&messages).as_deref(), Ok("System: A\n\nSystem: S2\n\nUser: B"));
    }

    #[test]
    fn user_text_without_system_is_verbatim() {
        let messages = chat_messages(&[chat("assistant", "hi"), chat("user", "question")]);
        assert_eq!(compose_prompt(&messages).as_deref(), Ok("question"));
    }

    #[test]
    fn falls_back_to_last_message_without_user_role() {
        let messages = chat_messages(&[chat("assistant", "X")]);
        assert_eq!(compose_prompt(&messages).as_deref(), Ok("X"));
    }

    #[test]
    fn system_only_request_uses_last_message_without_prefix() {
        let messages = chat_messages(&[chat("system", "be brief")]);
        assert_eq!(compose_prompt(&messages).as_deref(), Ok("be brief"));
    }

    #[test]
    fn empty_message_list_is_rejected() {
        assert_eq!(
            compose_prompt(&[]),
            Err(CoreError::Validation("messages must not be empty".to_string()))
        );
    }

    #[test]
    fn messages_without_text_are_rejected() {
        let messages = chat_messages(&[ChatMessage {
            role: "user".to_string(),
            content: MessageContent::Parts(vec![part("image_url", "ignored")]),
        }]);
        assert_eq!(
            compose_prompt(&messages),
            Err(CoreError::Validation("no valid input found".to_string()))
        );
    }

    #[test]
    fn extract_text_takes_first_matching_part() {
        let content = MessageContent::Parts(vec![
            part("image_url", "skip"),
            part("text", "first"),
            part("text", "second"),
        ]);
        assert_eq!(extract_text(&content, CHAT_TEXT_PART), "first");
        assert_eq!(extract_text(&content, RESPONSES_TEXT_PART), "");
    }

    #[test]
    fn extract_text_stringifies_unknown_content() {
        assert_eq!(extract_text(&MessageContent::Unknown(Value::from(42)), CHAT_TEXT_PART), "42");
        assert_eq!(extract_text(&MessageContent::Unknown(Value::Null), CHAT_TEXT_PART), "");
    }

    #[test]
    fn responses_items_use_input_text_parts() {
        let input = ResponsesInput::Items(vec![
            ResponseInputItem {
                kind: None,
                role: Some("system".to_string()),
                content: Some(MessageContent::Text("rules".to_string())),
                extra: BTreeMap::new(),
            },
            ResponseInputItem {
                kind: Some("message".to_string()),
                role: Some("user".to_string()),
                content: Some(MessageContent::Parts(vec![
                    part("text", "wrong kind"),
                    part("input_text", "hello"),
                ])),
                extra: BTreeMap::new(),
            },
        ]);
        let messages = responses_messages(&input);
        assert_eq!(compose_prompt(&messages).as_deref(), Ok("System: rules\n\nUser: hello"));
    }

    #[test]
    fn role_less_responses_items_do_not_hide_the_user_turn() {
        let input: ResponsesInput = serde_json::from_value(serde_json::json!([
            {"role": "user", "content": [{"type": "input_text", "text": "hi"}]},
            {"type": "reasoning", "id": "rs_1", "summary": []},
        ]))
        .expect("input");
        let messages = responses_messages(&input);
        assert_eq!(messages[1].role, "");
        assert_eq!(compose_prompt(&messages).as_deref(), Ok("hi"));
    }

    #[test]
    fn mixed_content_list_yields_its_text_part() {
        let message: ChatMessage = serde_json::from_value(serde_json::json!({
            "role": "user",
            "content": ["stray", {"type": "text", "text": "hi"}],
        }))
        .expect("message");
        assert_eq!(compose_prompt(&chat_messages(&[message])).as_deref(), Ok("hi"));
    }

    #[test]
    fn responses_text_input_is_the_prompt() {
        let messages = responses_messages(&ResponsesInput::Text("plain".to_string()));
        assert_eq!(compose_prompt(&messages).as_deref(), Ok("plain"));
    }

    #[test]
    fn responses_missing_input_is_rejected() {
        let messages = responses_messages(&ResponsesInput::Unknown(Value::Null));
        assert!(matches!(compose_prompt(&messages), Err(CoreError::Validation(_))));
    }

    #[test]
    fn completion_prompt_must_not_be_empty() {
        assert_eq!(compose_prompt(&completion_messages("say hi")).as_deref(), Ok("say hi"));
        assert!(compose_prompt(&completion_messages("")).is_err());
    }
}
