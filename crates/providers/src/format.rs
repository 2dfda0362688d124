//! Conversation → provider message shaping.

use parley_protocol::{ChatMessage, Role};

/// Transform conversation messages into the provider's chat shape.
///
/// The first `system` message becomes the leading system prompt entry;
/// remaining system messages are control traffic, not prompt material, and
/// are dropped. User/assistant messages keep their order.
#[must_use]
pub fn format_messages(history: &[ChatMessage]) -> Vec<serde_json::Value> {
    let mut out = Vec::with_capacity(history.len());

    if let Some(system) = history.iter().find(|m| m.role == Role::System) {
        out.push(serde_json::json!({
            "role": "system",
            "content": system.content,
        }));
    }

    for message in history {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => continue,
        };
        out.push(serde_json::json!({
            "role": role,
            "content": message.content,
        }));
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    use parley_protocol::Metadata;

    fn message(role: Role, content: &str) -> ChatMessage {
        ChatMessage {
            id: format!("m-{}", content.len()),
            role,
            content: content.into(),
            conversation_id: "k-1".into(),
            timestamp: "2026-01-01T00:00:00Z".parse().unwrap(),
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn system_prompt_leads_and_order_is_kept() {
        let history = vec![
            message(Role::User, "hello"),
            message(Role::System, "be terse"),
            message(Role::Assistant, "hi"),
            message(Role::User, "how are you"),
        ];
        let formatted = format_messages(&history);
        assert_eq!(formatted[0]["role"], "system");
        assert_eq!(formatted[0]["content"], "be terse");
        assert_eq!(formatted[1]["role"], "user");
        assert_eq!(formatted[2]["role"], "assistant");
        assert_eq!(formatted[3]["content"], "how are you");
        assert_eq!(formatted.len(), 4);
    }

    #[test]
    fn no_system_message_means_no_system_entry() {
        let formatted = format_messages(&[message(Role::User, "hello")]);
        assert_eq!(formatted.len(), 1);
        assert_eq!(formatted[0]["role"], "user");
    }

    #[test]
    fn later_system_messages_are_dropped() {
        let history = vec![
            message(Role::System, "first"),
            message(Role::System, "second"),
            message(Role::User, "hi"),
        ];
        let formatted = format_messages(&history);
        assert_eq!(formatted.len(), 2);
        assert_eq!(formatted[0]["content"], "first");
    }
}
