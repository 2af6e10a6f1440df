use std::sync::OnceLock;

use regex::Regex;

use forge_types::{ChatMessage, ChatRole};

pub const REDACTED: &str = "[REDACTED]";

fn secret_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r#"(?i)(api[_-]?key|apikey|api[_-]?secret)["\s:=]+[\w-]+"#,
            r#"(?i)(password|passwd|pwd)["\s:=]+\S+"#,
            r#"(?i)(token|auth)["\s:=]+[\w.-]+"#,
            r"sk-[a-zA-Z0-9]{32,}",
            r"ghp_[a-zA-Z0-9]{36}",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// Replaces secret-looking substrings with `[REDACTED]`.
pub fn sanitize_prompt(prompt: &str) -> String {
    let mut sanitized = prompt.to_string();
    for pattern in secret_patterns() {
        if pattern.is_match(&sanitized) {
            sanitized = pattern.replace_all(&sanitized, REDACTED).into_owned();
        }
    }
    sanitized
}

/// Only user-authored content is scrubbed; system and assistant turns are
/// produced by us or by the model.
pub fn sanitize_messages(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|message| match message.role {
            ChatRole::User => ChatMessage::user(sanitize_prompt(&message.content)),
            _ => message.clone(),
        })
        .collect()
}
