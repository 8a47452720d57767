// SPDX-License-Identifier: MIT OR Apache-2.0
//! Chat messages and token accounting.

use serde::{Deserialize, Serialize};

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// System / instruction turn.
    System,
    /// End-user turn.
    User,
    /// Model turn.
    Assistant,
    /// Tool result turn fed back to the model.
    Tool,
}

impl Role {
    /// Wire representation (`"system"`, `"user"`, …).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// One turn in a conversation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author of the turn.
    pub role: Role,
    /// Text content.
    pub content: String,
    /// Tool-call correlation id, set only on [`Role::Tool`] turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Convenience constructor for a plain turn.
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
        }
    }

    /// A tool-result turn correlated to `tool_call_id`.
    #[must_use]
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// Token counts for one or more model calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt (input side).
    pub prompt_tokens: u64,
    /// Tokens in the completion (output side).
    pub completion_tokens: u64,
    /// Sum of both sides.
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Build a usage record, computing the total.
    #[must_use]
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Accumulate another usage record into this one (saturating).
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

/// Rough token estimate for budgeting and context warnings.
///
/// One token per four characters, rounded up. Deliberately cheap; the
/// provider reports exact usage after the fact.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_new_computes_total() {
        let u = TokenUsage::new(10, 5);
        assert_eq!(u.total_tokens, 15);
    }

    #[test]
    fn usage_add_accumulates() {
        let mut a = TokenUsage::new(10, 5);
        a.add(&TokenUsage::new(3, 2));
        assert_eq!(a.prompt_tokens, 13);
        assert_eq!(a.completion_tokens, 7);
        assert_eq!(a.total_tokens, 20);
    }

    #[test]
    fn usage_add_saturates() {
        let mut a = TokenUsage::new(u64::MAX - 1, 0);
        a.add(&TokenUsage::new(10, 0));
        assert_eq!(a.prompt_tokens, u64::MAX);
    }

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn role_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        assert_eq!(Role::Tool.as_str(), "tool");
    }

    #[test]
    fn tool_result_message_carries_id() {
        let msg = ChatMessage::tool_result("call_1", "{\"ok\":true}");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
    }
}
