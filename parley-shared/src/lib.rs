use serde::{Deserialize, Serialize};
use std::fmt;

/// Caller-assigned id of one chat message; correlates a whole streaming session.
pub type MessageId = u64;

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 2000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: MessageRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: MessageRole::Assistant, content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self { role: MessageRole::System, content: content.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Snapshot of a model configuration, copied into every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl ModelConfig {
    pub fn effective_temperature(&self) -> f32 {
        self.temperature.unwrap_or(DEFAULT_TEMPERATURE)
    }

    pub fn effective_max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }

    pub fn has_credential(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

/// Machine-readable failure classes shared by both sides of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    MissingCredential,
    ChannelUnavailable,
    NetworkOrTimeout,
    ProviderRejected,
    Cancelled,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MissingCredential => "missing_credential",
            ErrorCode::ChannelUnavailable => "channel_unavailable",
            ErrorCode::NetworkOrTimeout => "network_or_timeout",
            ErrorCode::ProviderRejected => "provider_rejected",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages from client to host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    SendMessage {
        conversation_id: u64,
        message_id: MessageId,
        model_config: ModelConfig,
        messages: Vec<ChatMessage>,
    },
    CancelStream {
        message_id: MessageId,
    },
    TestConnection {
        request_id: String,
        model_config: ModelConfig,
    },
    AnalyzeImage {
        request_id: String,
        model_config: ModelConfig,
        /// Data URL (`data:image/png;base64,...`) or remote image URL
        image_url: String,
        prompt: String,
    },
}

/// Messages from host to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    StreamChunk {
        message_id: MessageId,
        content: String,
        timestamp: i64,
    },
    StreamDone {
        message_id: MessageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_tokens: Option<u32>,
        timestamp: i64,
    },
    StreamError {
        message_id: MessageId,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
        /// Error code reported by the provider itself, e.g. `invalid_api_key`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_code: Option<String>,
        timestamp: i64,
    },
    TestResult(TestResult),
    VisionResult(VisionResult),
}

impl ServerMessage {
    /// The streaming session this event belongs to, if any.
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            ServerMessage::StreamChunk { message_id, .. }
            | ServerMessage::StreamDone { message_id, .. }
            | ServerMessage::StreamError { message_id, .. } => Some(*message_id),
            ServerMessage::TestResult(_) | ServerMessage::VisionResult(_) => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServerMessage::StreamDone { .. } | ServerMessage::StreamError { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub request_id: String,
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionResult {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub analysis_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

/// Body of the one-shot `POST /chat` route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model_config: ModelConfig,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub finish_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: ErrorCode,
}

/// Unix epoch milliseconds, the timestamp format of every stream event.
pub fn timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
