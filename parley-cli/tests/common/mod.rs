use async_trait::async_trait;
use parley_server::provider::{Provider, ProviderError, ProviderEvent, ProviderStream};
use parley_shared::{ChatMessage, Completion, ModelConfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Host-side provider for end-to-end runs. The last user message drives the
/// stream: `hold` waits for cancellation, anything else is split on `|`.
/// Connection tests fail on a missing key or an `unreachable` base URL.
pub struct ScriptedProvider;

#[async_trait]
impl Provider for ScriptedProvider {
    async fn stream_chat(
        &self,
        _config: &ModelConfig,
        messages: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> Result<ProviderStream, ProviderError> {
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

    async fn complete_chat(&self, _: &ModelConfig, _: Vec<ChatMessage>) -> Result<Completion, ProviderError> {
        Err(ProviderError::Unknown("not scripted".to_string()))
    }

    async fn analyze_image(
        &self,
        _config: &ModelConfig,
        _image_url: &str,
        prompt: &str,
    ) -> Result<Completion, ProviderError> {
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
