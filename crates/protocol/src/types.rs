//! Shared value types for the bridge domain.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! payloads and lifecycle state that flow between the dispatcher, the stream
//! pumps, and the inference client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ErrorEnvelope;

// ---------------------------------------------------------------------------
// Chat payloads
// ---------------------------------------------------------------------------

/// Author of one chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    /// Returns the wire name of the role.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// One `(role, content)` entry of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }
}

/// Generation options forwarded to the inference engine.
///
/// Every field is optional; `None` means "use the engine's default".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatOptions {
    /// Overrides the worker's configured default model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// The body of a `StartRequest`: an ordered conversation plus options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub options: ChatOptions,
}

impl ChatPayload {
    /// Creates a payload with default options.
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            options: ChatOptions::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// One incremental unit of streamed output, numbered by the stream pump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// Position within the request's stream, starting at 0 with no gaps.
    pub seq: u64,
    pub data: String,
}

impl Fragment {
    pub fn new(seq: u64, data: impl Into<String>) -> Self {
        Self {
            seq,
            data: data.into(),
        }
    }
}

/// Token accounting reported by the engine, when available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl UsageStats {
    pub fn total_tokens(self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// The complete result of a non-streaming call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageStats>,
}

impl AggregateResponse {
    pub fn from_content(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of one request.
///
/// `Completed`, `Failed` and `Cancelled` are terminal and sticky: exactly one
/// of them is reached per request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl RequestState {
    /// Returns `true` for `Completed`, `Failed` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Cancelled
        )
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestState::Pending => "pending",
            RequestState::Streaming => "streaming",
            RequestState::Completed => "completed",
            RequestState::Failed => "failed",
            RequestState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The single outcome that ends a request.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalOutcome {
    /// The engine finished. `aggregate` is present only for non-streaming calls.
    Completed { aggregate: Option<AggregateResponse> },
    Failed(ErrorEnvelope),
    Cancelled,
}

impl TerminalOutcome {
    /// The terminal [`RequestState`] this outcome corresponds to.
    pub fn state(&self) -> RequestState {
        match self {
            TerminalOutcome::Completed { .. } => RequestState::Completed,
            TerminalOutcome::Failed(_) => RequestState::Failed,
            TerminalOutcome::Cancelled => RequestState::Cancelled,
        }
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Milliseconds elapsed since this timestamp, clamped at zero.
    pub fn elapsed_ms(self) -> i64 {
        (Utc::now() - self.0).num_milliseconds().max(0)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_options_default_when_absent() {
        let payload: ChatPayload =
            serde_json::from_str(r#"{"messages":[{"role":"user","content":"hi"}]}"#).unwrap();
        assert_eq!(payload.messages, vec![ChatMessage::user("hi")]);
        assert_eq!(payload.options, ChatOptions::default());
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        let result =
            serde_json::from_str::<ChatPayload>(r#"{"messages":[{"role":"robot","content":"x"}]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!RequestState::Pending.is_terminal());
        assert!(!RequestState::Streaming.is_terminal());
        assert!(RequestState::Completed.is_terminal());
        assert!(RequestState::Failed.is_terminal());
        assert!(RequestState::Cancelled.is_terminal());
        assert_eq!(TerminalOutcome::Cancelled.state(), RequestState::Cancelled);
    }

    #[test]
    fn test_aggregate_omits_absent_fields() {
        let json = serde_json::to_value(AggregateResponse::from_content("ok")).unwrap();
        assert_eq!(json, serde_json::json!({"content": "ok"}));
    }
}
