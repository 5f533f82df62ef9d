//! Wire and domain types
//!
//! `InferenceRequest` and `ResponseFragment` are JSON-serialized with fixed
//! field names; both transports share them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A role-tagged chat message. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    role: Role,
    content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub const fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

/// Session flags forwarded to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionId {
    #[serde(alias = "ee")]
    pub encrypted_execution: bool,
}

impl Default for SessionId {
    fn default() -> Self {
        Self {
            encrypted_execution: true,
        }
    }
}

/// Free-form generation parameters (temperature, max tokens, ...).
pub type ModelParams = serde_json::Map<String, serde_json::Value>;

/// Canonical inference request envelope.
///
/// The correlation id is the only join key between a published request and
/// its streamed results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    correlation_id: Uuid,
    model: String,
    stream: bool,
    messages: Vec<Message>,
    session_id: SessionId,
    model_params: ModelParams,
}

impl InferenceRequest {
    pub(crate) fn new(
        correlation_id: Uuid,
        model: String,
        messages: Vec<Message>,
        session_id: SessionId,
        model_params: ModelParams,
    ) -> Self {
        Self {
            correlation_id,
            model,
            stream: true,
            messages,
            session_id,
            model_params,
        }
    }

    pub const fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Transport-specific model identifier.
    pub fn model(&self) -> &str {
        &self.model
    }

    pub const fn stream(&self) -> bool {
        self.stream
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn model_params(&self) -> &ModelParams {
        &self.model_params
    }

    /// Serialize to the JSON wire form.
    pub fn to_json_bytes(&self) -> crate::error::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Incremental content carried by a choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentDelta {
    #[serde(default)]
    pub content: String,
}

/// One choice inside a response fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentChoice {
    pub delta: FragmentDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// One wire frame or broker message worth of response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFragment {
    pub choices: Vec<FragmentChoice>,
}

impl ResponseFragment {
    /// Build a single-choice fragment.
    pub fn new(content: impl Into<String>, finish_reason: Option<&str>) -> Self {
        Self {
            choices: vec![FragmentChoice {
                delta: FragmentDelta {
                    content: content.into(),
                },
                finish_reason: finish_reason.map(str::to_string),
            }],
        }
    }

    /// Content delta of the first choice.
    pub fn content(&self) -> &str {
        self.choices
            .first()
            .map(|c| c.delta.content.as_str())
            .unwrap_or_default()
    }

    /// Finish reason of the first choice, ignoring empty strings.
    pub fn finish_reason(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.finish_reason.as_deref())
            .filter(|r| !r.is_empty())
    }

    /// Whether this fragment ends the stream.
    pub fn is_terminal(&self) -> bool {
        self.finish_reason().is_some()
    }
}
