//! Prompt construction for the classification request.

use serde::Serialize;

use crate::types::Message;

/// Snippet cap inside the prompt, after the settings-level truncation.
const SNIPPET_PROMPT_CHARS: usize = 600;
/// Body cap inside the prompt, after the settings-level truncation.
const BODY_PROMPT_CHARS: usize = 1200;

/// System + user message pair for one classification request.
#[derive(Debug, Clone)]
pub struct PromptMessages {
    pub system: String,
    pub user: String,
}

/// Compact per-message record the model sees. `i` is the batch position —
/// some models echo it back instead of the identity.
#[derive(Debug, Serialize)]
struct CompactItem {
    i: usize,
    identity: String,
    sender: String,
    subject: String,
    snippet: String,
    body: String,
}

/// Collapse runs of whitespace and trim.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Build the classification prompt for a batch.
///
/// Free-text fields are normalized and truncated to `max_input_chars` first,
/// then capped to the per-field prompt budget.
pub fn build_prompt(messages: &[Message], max_input_chars: usize) -> PromptMessages {
    let compact: Vec<CompactItem> = messages
        .iter()
        .enumerate()
        .map(|(i, msg)| CompactItem {
            i,
            identity: msg.identity.trim().to_string(),
            sender: normalize_text(&msg.sender),
            subject: normalize_text(&msg.subject),
            snippet: truncate_chars(
                &truncate_chars(&normalize_text(&msg.snippet), max_input_chars),
                SNIPPET_PROMPT_CHARS,
            ),
            body: truncate_chars(
                &truncate_chars(&normalize_text(&msg.body_text), max_input_chars),
                BODY_PROMPT_CHARS,
            ),
        })
        .collect();

    let system = "You triage inbox messages by urgency. Return strict JSON only: \
                  {\"items\":[{\"identity\":string,\"level\":\"critical\"|\"high\"|\"medium\"|\"low\"|\"fyi\",\
                  \"score\":0-100,\"reason\":string}]}. \
                  Echo each message's identity unchanged; include its position as \"i\" if the identity is unavailable."
        .to_string();

    let user = format!(
        "Classify these inbox emails by urgency. Use concise reasons under 100 chars. JSON only.\n{}",
        serde_json::to_string(&compact).unwrap_or_else(|_| "[]".to_string())
    );

    PromptMessages { system, user }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(identity: &str, snippet: &str, body: &str) -> Message {
        Message {
            identity: identity.into(),
            sender: "alice@example.com".into(),
            subject: "Weekly sync".into(),
            snippet: snippet.into(),
            body_text: body.into(),
            source_handle: None,
            permalink: None,
            detected_level: None,
        }
    }

    #[test]
    fn prompt_demands_strict_json_shape() {
        let prompt = build_prompt(&[msg("f:1", "hello", "")], 2200);
        assert!(prompt.system.contains("\"items\""));
        assert!(prompt.system.contains("critical"));
        assert!(prompt.system.contains("fyi"));
        assert!(prompt.user.contains("JSON only"));
    }

    #[test]
    fn prompt_carries_identity_and_position() {
        let prompt = build_prompt(&[msg("f:1", "a", ""), msg("f:2", "b", "")], 2200);
        assert!(prompt.user.contains("\"identity\":\"f:1\""));
        assert!(prompt.user.contains("\"i\":0"));
        assert!(prompt.user.contains("\"identity\":\"f:2\""));
        assert!(prompt.user.contains("\"i\":1"));
    }

    #[test]
    fn prompt_truncates_free_text() {
        let long = "x".repeat(20_000);
        let prompt = build_prompt(&[msg("f:1", &long, &long)], 400);
        // snippet and body both capped by max_input_chars (400 < prompt caps)
        assert!(prompt.user.len() < 2_000);
    }

    #[test]
    fn prompt_normalizes_whitespace() {
        let prompt = build_prompt(&[msg("f:1", "hello\n\n  world", "")], 2200);
        assert!(prompt.user.contains("hello world"));
    }
}
