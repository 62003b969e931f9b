//! WebSocket message types for the `/ws/chat` protocol. Client ↔ server JSON.
//!
//! Outbound frames are encoded with [`encode`]; inbound frames are decoded with
//! [`decode`], which dispatches on the JSON `"type"` field.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Retrieval scope: search every document or only the listed ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeMode {
    All,
    Selected,
}

/// Client → server: retrieval scope. Passed through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub mode: ScopeMode,
    pub doc_ids: Vec<u64>,
}

impl Scope {
    pub fn all() -> Self {
        Self {
            mode: ScopeMode::All,
            doc_ids: Vec::new(),
        }
    }

    /// Restrict retrieval to `doc_ids`. Returns `None` for an empty list, since
    /// a selected scope with no documents is rejected by the server.
    pub fn selected(doc_ids: Vec<u64>) -> Option<Self> {
        if doc_ids.is_empty() {
            return None;
        }
        Some(Self {
            mode: ScopeMode::Selected,
            doc_ids,
        })
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::all()
    }
}

/// Client → server: one user turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub request_id: String,
    /// `0` asks the server to create a new conversation.
    pub conversation_id: u64,
    pub content: String,
    pub scope: Scope,
    pub k_vec: u32,
    pub k_text: u32,
    pub use_text: bool,
}

impl UserMessage {
    /// A question with default scope (all documents) and retrieval knobs.
    pub fn new(
        request_id: impl Into<String>,
        conversation_id: u64,
        content: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            conversation_id,
            content: content.into(),
            scope: Scope::all(),
            k_vec: 6,
            k_text: 6,
            use_text: false,
        }
    }
}

/// Client → server event; discriminator is JSON "type" field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    UserMessage(UserMessage),
}

impl ClientEvent {
    pub fn request_id(&self) -> &str {
        match self {
            ClientEvent::UserMessage(m) => &m.request_id,
        }
    }
}

/// A source passage backing part of an answer. Carried, never interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub doc_id: u64,
    pub chunk_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_start: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_end: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_path: Option<String>,
    pub score: f64,
}

/// Server → client: conversation id assigned (or confirmed) for a request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatIdMessage {
    pub request_id: String,
    pub conversation_id: u64,
    #[serde(default)]
    pub title: Option<String>,
}

/// Server → client: the assistant began answering.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssistantStartMessage {
    pub request_id: String,
    pub assistant_message_id: String,
}

/// Server → client: answer fragment.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssistantDeltaMessage {
    pub request_id: String,
    pub delta: String,
}

/// Server → client: citations for the answer so far.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssistantCitationsMessage {
    pub request_id: String,
    pub citations: Vec<Citation>,
}

/// Server → client: answer complete. Non-streaming servers put the whole
/// answer and its citations here.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssistantDoneMessage {
    pub request_id: String,
    #[serde(default)]
    pub message_id: Option<u64>,
    #[serde(default)]
    pub timing_ms: Option<u64>,
    #[serde(default)]
    pub conversation_id: Option<u64>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub citations: Option<Vec<Citation>>,
}

/// Server → client: error, for one request or for the whole connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorMessage {
    #[serde(default)]
    pub request_id: Option<String>,
    pub detail: String,
    #[serde(default)]
    pub code: Option<String>,
}

/// One server message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ChatId(ChatIdMessage),
    AssistantStart(AssistantStartMessage),
    AssistantDelta(AssistantDeltaMessage),
    AssistantCitations(AssistantCitationsMessage),
    AssistantDone(AssistantDoneMessage),
    Error(ErrorMessage),
    /// A well-formed frame with a tag this client does not know.
    Unknown { tag: String },
}

impl ServerEvent {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ServerEvent::ChatId(m) => Some(&m.request_id),
            ServerEvent::AssistantStart(m) => Some(&m.request_id),
            ServerEvent::AssistantDelta(m) => Some(&m.request_id),
            ServerEvent::AssistantCitations(m) => Some(&m.request_id),
            ServerEvent::AssistantDone(m) => Some(&m.request_id),
            ServerEvent::Error(m) => m.request_id.as_deref(),
            ServerEvent::Unknown { .. } => None,
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, DecodeError> {
        let typ = match value.get("type") {
            Some(serde_json::Value::String(t)) => t.as_str(),
            Some(_) => return Err(DecodeError::InvalidType),
            None if value.is_object() => return Err(DecodeError::MissingType),
            None => return Err(DecodeError::NotAnObject),
        };
        let field = |e: serde_json::Error| DecodeError::Field {
            tag: typ.to_string(),
            message: e.to_string(),
        };
        match typ {
            "chat_id" => serde_json::from_value(value.clone())
                .map(ServerEvent::ChatId)
                .map_err(field),
            "assistant_start" => serde_json::from_value(value.clone())
                .map(ServerEvent::AssistantStart)
                .map_err(field),
            "assistant_delta" => serde_json::from_value(value.clone())
                .map(ServerEvent::AssistantDelta)
                .map_err(field),
            "assistant_citations" => serde_json::from_value(value.clone())
                .map(ServerEvent::AssistantCitations)
                .map_err(field),
            "assistant_done" => serde_json::from_value(value.clone())
                .map(ServerEvent::AssistantDone)
                .map_err(field),
            "error" => serde_json::from_value(value.clone())
                .map(ServerEvent::Error)
                .map_err(field),
            other => Ok(ServerEvent::Unknown {
                tag: other.to_string(),
            }),
        }
    }
}

/// Outbound event violates the caller contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("request_id must not be empty")]
    EmptyRequestId,
    #[error("content must not be empty")]
    EmptyContent,
    #[error("serialization failed: {0}")]
    Json(String),
}

/// Inbound frame could not be turned into a [`ServerEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("missing type")]
    MissingType,
    #[error("type is not a string")]
    InvalidType,
    #[error("invalid {tag} frame: {message}")]
    Field { tag: String, message: String },
}

/// Serialize a client event to a JSON text frame.
pub fn encode(event: &ClientEvent) -> Result<String, EncodeError> {
    match event {
        ClientEvent::UserMessage(m) => {
            if m.request_id.is_empty() {
                return Err(EncodeError::EmptyRequestId);
            }
            if m.content.is_empty() {
                return Err(EncodeError::EmptyContent);
            }
        }
    }
    serde_json::to_string(event).map_err(|e| EncodeError::Json(e.to_string()))
}

/// Parse one inbound text frame.
pub fn decode(text: &str) -> Result<ServerEvent, DecodeError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Json(e.to_string()))?;
    ServerEvent::from_json(&value)
}
