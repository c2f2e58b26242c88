use anyhow::{Context, Result, bail};
use parley_shared::ModelConfig;
use std::path::PathBuf;
use url::Url;

const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:3000/ws/chat";
const DEFAULT_LOG_DIR: &str = "conversation_logs";
const DEFAULT_PROVIDER: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub server_url: Url,
    pub log_dir: PathBuf,
    /// Snapshot cloned into every request.
    pub model: ModelConfig,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let raw_url = get("PARLEY_SERVER_URL").unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
        let server_url = Url::parse(&raw_url).with_context(|| format!("PARLEY_SERVER_URL is not a valid URL: {}", raw_url))?;
        if !matches!(server_url.scheme(), "ws" | "wss") {
            bail!("PARLEY_SERVER_URL must use ws:// or wss://, got {}", server_url.scheme());
        }

        let temperature = get("AI_TEMPERATURE")
            .map(|raw| raw.parse::<f32>().context("AI_TEMPERATURE must be a number"))
            .transpose()?;
        let max_tokens = get("AI_MAX_TOKENS")
            .map(|raw| raw.parse::<u32>().context("AI_MAX_TOKENS must be a positive whole number"))
            .transpose()?;

        let model = ModelConfig {
            provider: get("AI_PROVIDER").unwrap_or_else(|| DEFAULT_PROVIDER.to_string()),
            base_url: get("AI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: get("AI_API_KEY").or_else(|| get("OPENAI_API_KEY")).unwrap_or_default(),
            model: get("AI_MODEL")
                .or_else(|| get("OPENAI_MODEL"))
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            temperature,
            max_tokens,
            system_prompt: get("AI_SYSTEM_PROMPT"),
        };

        Ok(Self {
            server_url,
            log_dir: PathBuf::from(get("PARLEY_LOG_DIR").unwrap_or_else(|| DEFAULT_LOG_DIR.to_string())),
            model,
        })
    }
}
