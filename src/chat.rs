//! Framework-free helpers for the chat route.
//!
//! These sit on either side of the guard: [`client_identifier`] and
//! [`ChatRequest::parse`] run before admission, [`Completion::classify`] turns
//! the upstream reply into the [`UpstreamOutcome`] the breaker is told about.

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::guard::UpstreamOutcome;
use crate::telemetry::{GuardEvent, PayloadEvent};

/// Identifier used when the client address is unknown.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Sampling temperature sent upstream.
pub const TEMPERATURE: f64 = 0.4;

/// First entry of a trusted `x-forwarded-for` value, or [`UNKNOWN_CLIENT`].
pub fn client_identifier(forwarded_for: Option<&str>) -> String {
    forwarded_for
        .and_then(|header| header.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty())
        .unwrap_or(UNKNOWN_CLIENT)
        .to_owned()
}

/// Bounds on an inbound conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatLimits {
    /// Messages accepted per request.
    pub max_messages: usize,
    /// Characters accepted per message.
    pub max_message_chars: usize,
}

impl Default for ChatLimits {
    fn default() -> Self {
        Self { max_messages: 20, max_message_chars: 2_000 }
    }
}

/// Roles a client may send. `system` is reserved for the server prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// End user.
    User,
    /// Earlier model reply echoed back as context.
    Assistant,
}

impl ChatRole {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    /// Who said it.
    pub role: ChatRole,
    /// What was said.
    pub content: String,
}

/// Why a chat request body was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    /// The body is not JSON.
    #[error("invalid json: {0}")]
    InvalidJson(String),
    /// `messages` is missing or not an array.
    #[error("messages must be an array")]
    MissingMessages,
    /// `messages` is empty.
    #[error("messages must not be empty")]
    Empty,
    /// Too many turns.
    #[error("{count} messages exceeds the limit of {max}")]
    TooManyMessages {
        /// Messages received.
        count: usize,
        /// Configured cap.
        max: usize,
    },
    /// One entry is malformed.
    #[error("message {index}: {reason}")]
    InvalidMessage {
        /// Position in the list.
        index: usize,
        /// What is wrong with it.
        reason: &'static str,
        /// Messages received.
        count: usize,
    },
}

impl PayloadError {
    /// Message count, when the body carried a message list.
    pub fn size(&self) -> Option<usize> {
        match self {
            PayloadError::InvalidJson(_) | PayloadError::MissingMessages => None,
            PayloadError::Empty => Some(0),
            PayloadError::TooManyMessages { count, .. }
            | PayloadError::InvalidMessage { count, .. } => Some(*count),
        }
    }

    /// The `chat_payload_rejected` event describing this error.
    pub fn event(&self) -> GuardEvent {
        GuardEvent::Payload(PayloadEvent::Rejected { reason: self.to_string(), size: self.size() })
    }
}

/// A validated chat request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatRequest {
    messages: Vec<ChatMessage>,
}

impl ChatRequest {
    /// Parse and validate a raw JSON body.
    pub fn parse(body: &str, limits: &ChatLimits) -> Result<Self, PayloadError> {
        let value: Value = serde_json::from_str(body)
            .map_err(|error| PayloadError::InvalidJson(error.to_string()))?;
        Self::from_value(&value, limits)
    }

    /// Validate an already-decoded body.
    pub fn from_value(value: &Value, limits: &ChatLimits) -> Result<Self, PayloadError> {
        let entries =
            value.get("messages").and_then(Value::as_array).ok_or(PayloadError::MissingMessages)?;
        let count = entries.len();
        if count == 0 {
            return Err(PayloadError::Empty);
        }
        if count > limits.max_messages {
            return Err(PayloadError::TooManyMessages { count, max: limits.max_messages });
        }

        let messages = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                parse_message(entry, limits)
                    .map_err(|reason| PayloadError::InvalidMessage { index, reason, count })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { messages })
    }

    /// Validated turns, oldest first.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Completion request body: the system prompt followed by the client turns.
    pub fn upstream_body(&self, model: &str, system_prompt: &str) -> Value {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        messages.push(json!({ "role": "system", "content": system_prompt }));
        messages.extend(
            self.messages
                .iter()
                .map(|message| json!({ "role": message.role, "content": message.content })),
        );
        json!({ "model": model, "messages": messages, "temperature": TEMPERATURE })
    }
}

fn parse_message(entry: &Value, limits: &ChatLimits) -> Result<ChatMessage, &'static str> {
    let object = entry.as_object().ok_or("not an object")?;
    let content = object.get("content").and_then(Value::as_str).ok_or("content must be a string")?;
    if content.trim().is_empty() {
        return Err("content is blank");
    }
    if content.chars().count() > limits.max_message_chars {
        return Err("content too long");
    }
    let role = object
        .get("role")
        .and_then(Value::as_str)
        .and_then(ChatRole::parse)
        .ok_or("role must be user or assistant")?;
    Ok(ChatMessage { role, content: content.to_owned() })
}

/// What the upstream completion service produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Non-blank reply text.
    Reply(String),
    /// Anything else; `reason` is what the breaker records.
    Failed {
        /// e.g. `status 502` or `payload.error`.
        reason: String,
    },
}

impl Completion {
    /// Classify an upstream HTTP response.
    pub fn classify(status: u16, body: &str) -> Self {
        if !(200..300).contains(&status) {
            return Self::failed(format!("status {status}"));
        }
        let Ok(payload) = serde_json::from_str::<Value>(body) else {
            return Self::failed("payload.invalid_json");
        };
        if payload.get("error").is_some_and(|error| !error.is_null()) {
            return Self::failed("payload.error");
        }

        match payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .filter(|content| !content.trim().is_empty())
        {
            Some(content) => Self::Reply(content.to_owned()),
            None => Self::failed("payload.empty_content"),
        }
    }

    /// Outcome to report to the guard.
    pub fn outcome(&self) -> UpstreamOutcome {
        match self {
            Completion::Reply(_) => UpstreamOutcome::Success,
            Completion::Failed { reason } => UpstreamOutcome::Failure(reason.clone()),
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self::Failed { reason: reason.into() }
    }
}
