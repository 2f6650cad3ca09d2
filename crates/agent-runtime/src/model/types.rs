use std::time::Duration;

use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Map;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// A single piece of message content.
///
/// `FunctionResponse` parts may only appear inside `user` messages, and
/// `FunctionCall` parts only inside `model` messages. The constructors on
/// [Message] uphold this; deserialized histories are checked by the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Part {
    Text(String),
    Thought(ThoughtSummary),
    FunctionCall(FunctionCall),
    FunctionResponse(FunctionResponse),
    InlineData(InlineData),
}

impl Part {
    pub fn text(&self) -> Option<&str> {
        match self {
            Part::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn function_call(&self) -> Option<&FunctionCall> {
        match self {
            Part::FunctionCall(call) => Some(call),
            _ => None,
        }
    }

    pub fn function_response(&self) -> Option<&FunctionResponse> {
        match self {
            Part::FunctionResponse(response) => Some(response),
            _ => None,
        }
    }

    /// Whether the part carries anything the model or user could observe.
    pub fn has_content(&self) -> bool {
        match self {
            Part::Text(text) => !text.is_empty(),
            Part::Thought(_) => false,
            Part::FunctionCall(_) | Part::FunctionResponse(_) => true,
            Part::InlineData(data) => !data.data.is_empty(),
        }
    }
}

impl From<String> for Part {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Part {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Summary of the model's reasoning, parsed from a thought part.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThoughtSummary {
    pub subject: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCall {
    /// Identifier for the call. Providers are not required to send one; the
    /// stream demultiplexer synthesizes an id when it is missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    /// Creates a new message with a generated id.
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            id: Some(Uuid::new_v4().to_string()),
            role,
            parts,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn user(parts: Vec<Part>) -> Self {
        Self::new(Role::User, parts)
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Self::new(Role::Model, parts)
    }

    /// Returns only the text content, joined as a single string.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::text)
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn function_calls(&self) -> impl Iterator<Item = &FunctionCall> {
        self.parts.iter().filter_map(Part::function_call)
    }

    pub fn function_responses(&self) -> impl Iterator<Item = &FunctionResponse> {
        self.parts.iter().filter_map(Part::function_response)
    }

    /// A message is empty when it has no parts, or none of its parts carry
    /// observable content.
    pub fn is_empty(&self) -> bool {
        !self.parts.iter().any(Part::has_content)
    }

    /// Whether every part of this message is a function response.
    ///
    /// Used by the next-speaker shortcut: a user message consisting purely of
    /// function responses means the model must speak next.
    pub fn is_function_response(&self) -> bool {
        self.role == Role::User
            && !self.parts.is_empty()
            && self.parts.iter().all(|p| matches!(p, Part::FunctionResponse(_)))
    }
}

/// A tool declaration included in model requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A raw streaming chunk as emitted by the model transport.
///
/// Mirrors the provider's generate-content convention: a chunk holds zero or
/// more candidates, each wrapping a content object with parts, plus optional
/// usage metadata that arrives with the final chunks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChunk {
    #[serde(default)]
    pub candidates: Vec<RawCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCandidate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<RawContent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default)]
    pub parts: Vec<RawPart>,
}

/// A raw part from the wire. Thought parts are flagged with `thought: true`
/// and carry their summary inside the text field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPart {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub thought: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageInfo {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
    #[serde(default)]
    pub total_token_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_time_ms: Option<u64>,
}

/// An error surfaced by the model transport or the response stream.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct StreamError {
    pub kind: StreamErrorKind,
    pub message: String,
    /// HTTP status code returned by the provider, if available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Provider-suggested delay before retrying, if the response carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
}

impl StreamError {
    pub fn new(kind: StreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// Whether the session-level retry loop should attempt the request again.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, StreamErrorKind::Throttling | StreamErrorKind::ServiceFailure)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamErrorKind {
    /// The client was throttled (HTTP 429). Retried with backoff; persistent
    /// throttling may trigger the fallback-model handler.
    Throttling,
    /// The service failed (HTTP 5xx). Retried with backoff.
    ServiceFailure,
    /// The request was rejected as invalid. Not retryable.
    Validation,
    /// The caller is not authorized. Not retryable; bubbles to the auth
    /// collaborator.
    Auth,
    /// The stream was closed because the cancellation token fired.
    Interrupted,
    /// Catch-all for errors not modeled above.
    Other,
}

/// An item of a raw model response stream.
///
/// Modeled as its own enum rather than `Result` so that scripted mock
/// responses can be serialized to and from JSON test fixtures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result")]
#[serde(rename_all = "lowercase")]
pub enum StreamItem {
    Ok(RawChunk),
    #[serde(rename = "error")]
    Err(StreamError),
}
