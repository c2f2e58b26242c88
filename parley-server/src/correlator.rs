use crate::provider::{Provider, ProviderError};
use parley_shared::{ModelConfig, TestResult, VisionResult};
use std::time::Instant;
use tracing::{info, warn};

pub const DEFAULT_VISION_PROMPT: &str =
    "Describe this image in detail, including the main objects, scene, colors and spatial relationships.";

/// Runs one connectivity test and builds the single `TestResult` for it.
pub async fn run_test(provider: &dyn Provider, request_id: String, config: &ModelConfig) -> TestResult {
    if !config.has_credential() {
        info!(%request_id, "Test connection rejected: no API key");
        return TestResult {
            request_id,
            success: false,
            message: ProviderError::MissingCredential.to_string(),
            response_time_ms: None,
            error: Some(ProviderError::MissingCredential.code()),
        };
    }

    let started = Instant::now();
    let outcome = provider.test_connection(config).await;
    let response_time_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(()) => {
            info!(%request_id, response_time_ms, model = %config.model, "Test connection succeeded");
            TestResult {
                request_id,
                success: true,
                message: "Connection succeeded".to_string(),
                response_time_ms: Some(response_time_ms),
                error: None,
            }
        }
        Err(e) => {
            warn!(%request_id, response_time_ms, code = %e.code(), "Test connection failed: {}", e);
            TestResult {
                request_id,
                success: false,
                message: format!("Connection failed: {}", e),
                response_time_ms: Some(response_time_ms),
                error: Some(e.code()),
            }
        }
    }
}

/// Runs one image analysis and builds the single `VisionResult` for it.
pub async fn run_vision(
    provider: &dyn Provider,
    request_id: String,
    config: &ModelConfig,
    image_url: &str,
    prompt: &str,
) -> VisionResult {
    let prompt = match prompt.trim() {
        "" => DEFAULT_VISION_PROMPT,
        prompt => prompt,
    };

    let started = Instant::now();
    let outcome = provider.analyze_image(config, image_url, prompt).await;
    let analysis_time_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(completion) => {
            info!(%request_id, analysis_time_ms, chars = completion.content.len(), "Image analysis finished");
            VisionResult {
                request_id,
                success: true,
                description: Some(completion.content),
                model: Some(config.model.clone()),
                analysis_time_ms,
                error: None,
                code: None,
            }
        }
        Err(e) => {
            warn!(%request_id, analysis_time_ms, code = %e.code(), "Image analysis failed: {}", e);
            VisionResult {
                request_id,
                success: false,
                description: None,
                model: None,
                analysis_time_ms,
                error: Some(e.to_string()),
                code: Some(e.code()),
            }
        }
    }
}
