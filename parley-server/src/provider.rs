use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestMessageContentPartImageArgs,
        ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequest,
        CreateChatCompletionRequestArgs, CreateChatCompletionResponse, FinishReason, ImageUrlArgs,
    },
    Client,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use parley_shared::{ChatMessage, Completion, ErrorCode, MessageRole, ModelConfig, TokenUsage};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const TEST_PROMPT: &str = "Hello";
const TEST_MAX_TOKENS: u32 = 10;
const TEST_TEMPERATURE: f32 = 0.7;

/// One item of a streamed completion.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Delta(String),
    /// Completion marker, always the last `Ok` item of a stream.
    Finished {
        finish_reason: Option<String>,
        total_tokens: Option<u32>,
    },
}

pub type ProviderStream = mpsc::UnboundedReceiver<Result<ProviderEvent, ProviderError>>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("API key is not configured")]
    MissingCredential,
    #[error("Network error: {0}")]
    Network(String),
    #[error("{message}")]
    Rejected {
        message: String,
        code: Option<String>,
        status: Option<u16>,
    },
    #[error("Request cancelled by user")]
    Cancelled,
    #[error("{0}")]
    Unknown(String),
}

impl ProviderError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProviderError::MissingCredential => ErrorCode::MissingCredential,
            ProviderError::Network(_) => ErrorCode::NetworkOrTimeout,
            ProviderError::Rejected { .. } => ErrorCode::ProviderRejected,
            ProviderError::Cancelled => ErrorCode::Cancelled,
            ProviderError::Unknown(_) => ErrorCode::Unknown,
        }
    }

    /// The provider's own error code. Streamed rejections only carry the
    /// HTTP status, reported as `http_<status>`.
    pub fn provider_code(&self) -> Option<String> {
        match self {
            ProviderError::Rejected { code, status, .. } => code
                .clone()
                .or_else(|| status.map(|status| format!("http_{}", status))),
            _ => None,
        }
    }
}

impl From<OpenAIError> for ProviderError {
    fn from(err: OpenAIError) -> Self {
        match err {
            OpenAIError::Reqwest(e) => {
                if let Some(status) = e.status() {
                    ProviderError::Rejected {
                        message: e.to_string(),
                        code: None,
                        status: Some(status.as_u16()),
                    }
                } else if e.is_decode() {
                    ProviderError::Unknown(e.to_string())
                } else {
                    ProviderError::Network(e.to_string())
                }
            }
            OpenAIError::ApiError(api_err) => ProviderError::Rejected {
                message: api_err.message,
                code: api_err.code.map(|code| code.to_string()),
                status: None,
            },
            OpenAIError::StreamError(message) => classify_stream_error(message),
            other => ProviderError::Unknown(other.to_string()),
        }
    }
}

/// Stream failures only reach us as the event-source error text.
fn classify_stream_error(message: String) -> ProviderError {
    if let Some(rest) = message.strip_prefix("Invalid status code: ") {
        let status = rest
            .split_whitespace()
            .next()
            .and_then(|digits| digits.parse::<u16>().ok());
        ProviderError::Rejected {
            message,
            code: None,
            status,
        }
    } else if message.starts_with("Transport error") {
        ProviderError::Network(message)
    } else {
        ProviderError::Unknown(message)
    }
}

/// Outbound calls to an AI provider. One invocation, one request, no retries.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Starts a streamed chat completion. The returned receiver yields deltas
    /// followed by exactly one terminal item: `Ok(Finished)` or `Err(_)`.
    /// Firing `cancel` aborts the request and yields `Err(Cancelled)`.
    async fn stream_chat(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> Result<ProviderStream, ProviderError>;

    async fn complete_chat(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> Result<Completion, ProviderError>;

    async fn analyze_image(
        &self,
        config: &ModelConfig,
        image_url: &str,
        prompt: &str,
    ) -> Result<Completion, ProviderError>;

    /// Minimal completion used to validate a configuration.
    async fn test_connection(&self, config: &ModelConfig) -> Result<(), ProviderError>;
}

/// OpenAI-compatible provider; base URL and key come from each request's config.
pub struct OpenAiProvider {
    http: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(connect_timeout: Duration) -> reqwest::Result<Self> {
        info!("Initializing OpenAI-compatible provider (connect timeout {:?})", connect_timeout);
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { http })
    }

    fn client_for(&self, config: &ModelConfig) -> Result<Client<OpenAIConfig>, ProviderError> {
        if !config.has_credential() {
            return Err(ProviderError::MissingCredential);
        }

        let mut openai = OpenAIConfig::new().with_api_key(config.api_key.trim());
        let base_url = config.base_url.trim().trim_end_matches('/');
        if !base_url.is_empty() {
            openai = openai.with_api_base(base_url);
        }

        Ok(Client::with_config(openai)
            .with_http_client(self.http.clone())
            .with_backoff(no_retry()))
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn stream_chat(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> Result<ProviderStream, ProviderError> {
        let client = self.client_for(config)?;
        let request = build_request(config, build_messages(config, messages)?, true)?;
        debug!(
            "Opening stream: model={} base_url={} messages={}",
            config.model,
            config.base_url,
            request.messages.len()
        );

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Provider stream aborted by cancellation");
                    let _ = tx.send(Err(ProviderError::Cancelled));
                }
                _ = pump_stream(client, request, &tx) => {}
            }
        });

        Ok(rx)
    }

    async fn complete_chat(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> Result<Completion, ProviderError> {
        let client = self.client_for(config)?;
        let request = build_request(config, build_messages(config, messages)?, false)?;
        let response = client.chat().create(request).await?;
        completion_from(response)
    }

    async fn analyze_image(
        &self,
        config: &ModelConfig,
        image_url: &str,
        prompt: &str,
    ) -> Result<Completion, ProviderError> {
        let client = self.client_for(config)?;

        let user_message = ChatCompletionRequestUserMessageArgs::default()
            .content(vec![
                ChatCompletionRequestMessageContentPartImageArgs::default()
                    .image_url(ImageUrlArgs::default().url(image_url).build()?)
                    .build()?
                    .into(),
                ChatCompletionRequestMessageContentPartTextArgs::default()
                    .text(prompt)
                    .build()?
                    .into(),
            ])
            .build()?;

        let request = build_request(
            config,
            vec![ChatCompletionRequestMessage::User(user_message)],
            false,
        )?;
        let response = client.chat().create(request).await?;
        completion_from(response)
    }

    async fn test_connection(&self, config: &ModelConfig) -> Result<(), ProviderError> {
        let client = self.client_for(config)?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&config.model)
            .messages(vec![ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(TEST_PROMPT)
                    .build()?,
            )])
            .max_tokens(TEST_MAX_TOKENS)
            .temperature(TEST_TEMPERATURE)
            .build()?;

        client.chat().create(request).await?;
        Ok(())
    }
}

async fn pump_stream(
    client: Client<OpenAIConfig>,
    request: CreateChatCompletionRequest,
    tx: &mpsc::UnboundedSender<Result<ProviderEvent, ProviderError>>,
) {
    let mut stream = match client.chat().create_stream(request).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to create provider stream: {:?}", e);
            let _ = tx.send(Err(e.into()));
            return;
        }
    };

    let mut total_tokens = None;
    while let Some(result) = stream.next().await {
        match result {
            Ok(response) => {
                if let Some(usage) = &response.usage {
                    total_tokens = Some(usage.total_tokens);
                }
                let Some(choice) = response.choices.first() else {
                    continue;
                };

                if let Some(delta) = &choice.delta.content {
                    if !delta.is_empty() && tx.send(Ok(ProviderEvent::Delta(delta.clone()))).is_err() {
                        // consumer is gone, dropping the stream closes the request
                        return;
                    }
                }

                if let Some(reason) = &choice.finish_reason {
                    let _ = tx.send(Ok(ProviderEvent::Finished {
                        finish_reason: Some(finish_reason_label(reason)),
                        total_tokens,
                    }));
                    return;
                }
            }
            Err(e) => {
                error!("Provider stream error: {:?}", e);
                let _ = tx.send(Err(e.into()));
                return;
            }
        }
    }

    let _ = tx.send(Ok(ProviderEvent::Finished {
        finish_reason: None,
        total_tokens,
    }));
}

fn no_retry() -> backoff::ExponentialBackoff {
    backoff::ExponentialBackoffBuilder::new()
        .with_max_elapsed_time(Some(Duration::ZERO))
        .build()
}

fn build_messages(
    config: &ModelConfig,
    messages: Vec<ChatMessage>,
) -> Result<Vec<ChatCompletionRequestMessage>, ProviderError> {
    let system_prompt = config
        .system_prompt
        .as_deref()
        .map(str::trim)
        .filter(|prompt| !prompt.is_empty());

    let mut converted = Vec::with_capacity(messages.len() + usize::from(system_prompt.is_some()));
    if let Some(prompt) = system_prompt {
        converted.push(convert_message(ChatMessage::system(prompt))?);
    }
    for message in messages {
        converted.push(convert_message(message)?);
    }
    Ok(converted)
}

fn convert_message(msg: ChatMessage) -> Result<ChatCompletionRequestMessage, ProviderError> {
    let message = match msg.role {
        MessageRole::System => ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(msg.content)
                .build()?,
        ),
        MessageRole::User => ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(msg.content)
                .build()?,
        ),
        MessageRole::Assistant => ChatCompletionRequestMessage::Assistant(
            ChatCompletionRequestAssistantMessageArgs::default()
                .content(msg.content)
                .build()?,
        ),
    };
    Ok(message)
}

fn build_request(
    config: &ModelConfig,
    messages: Vec<ChatCompletionRequestMessage>,
    stream: bool,
) -> Result<CreateChatCompletionRequest, ProviderError> {
    Ok(CreateChatCompletionRequestArgs::default()
        .model(&config.model)
        .messages(messages)
        .temperature(config.effective_temperature())
        .max_tokens(config.effective_max_tokens())
        .stream(stream)
        .build()?)
}

fn completion_from(response: CreateChatCompletionResponse) -> Result<Completion, ProviderError> {
    let choice = response
        .choices
        .first()
        .ok_or_else(|| ProviderError::Unknown("Provider returned no choices".to_string()))?;

    Ok(Completion {
        content: choice.message.content.clone().unwrap_or_default(),
        finish_reason: choice
            .finish_reason
            .as_ref()
            .map(finish_reason_label)
            .unwrap_or_else(|| "unknown".to_string()),
        usage: response.usage.map(|usage| TokenUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }),
    })
}

fn finish_reason_label(reason: &FinishReason) -> String {
    serde_json::to_value(reason)
        .ok()
        .and_then(|value| value.as_str().map(str::to_owned))
        .unwrap_or_else(|| format!("{:?}", reason).to_lowercase())
}
