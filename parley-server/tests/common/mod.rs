#![allow(dead_code)]

use async_trait::async_trait;
use parley_server::provider::{Provider, ProviderError, ProviderEvent, ProviderStream};
use parley_shared::{ChatMessage, Completion, ModelConfig, TokenUsage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Provider whose behaviour is scripted by the last message of the history:
/// `hold` streams nothing until cancelled, anything else is split on `|`
/// into deltas followed by a `stop` completion.
pub struct ScriptedProvider;

#[async_trait]
impl Provider for ScriptedProvider {
    async fn stream_chat(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> Result<ProviderStream, ProviderError> {
        if !config.has_credential() {
            return Err(ProviderError::MissingCredential);
        }
        let script = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            if script == "hold" {
                cancel.cancelled().await;
                let _ = tx.send(Err(ProviderError::Cancelled));
                return;
            }
            for part in script.split('|') {
                let _ = tx.send(Ok(ProviderEvent::Delta(part.to_string())));
            }
            let _ = tx.send(Ok(ProviderEvent::Finished {
                finish_reason: Some("stop".to_string()),
                total_tokens: Some(12),
            }));
        });
        Ok(rx)
    }

    async fn complete_chat(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> Result<Completion, ProviderError> {
        if !config.has_credential() {
            return Err(ProviderError::MissingCredential);
        }
        let script = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        Ok(Completion {
            content: script.split('|').collect(),
            finish_reason: "stop".to_string(),
            usage: Some(TokenUsage {
                prompt_tokens: 5,
                completion_tokens: 7,
                total_tokens: 12,
            }),
        })
    }

    async fn analyze_image(
        &self,
        config: &ModelConfig,
        _image_url: &str,
        prompt: &str,
    ) -> Result<Completion, ProviderError> {
        if !config.has_credential() {
            return Err(ProviderError::MissingCredential);
        }
        Ok(Completion {
            content: format!("described: {}", prompt),
            finish_reason: "stop".to_string(),
            usage: None,
        })
    }

    async fn test_connection(&self, config: &ModelConfig) -> Result<(), ProviderError> {
        if !config.has_credential() {
            return Err(ProviderError::MissingCredential);
        }
        if config.base_url.contains("unreachable") {
            return Err(ProviderError::Network("connection refused".to_string()));
        }
        Ok(())
    }
}

pub fn model_config(api_key: &str) -> ModelConfig {
    ModelConfig {
        provider: "openai".to_string(),
        base_url: "http://provider.test/v1".to_string(),
        api_key: api_key.to_string(),
        model: "scripted".to_string(),
        temperature: None,
        max_tokens: None,
        system_prompt: None,
    }
}
