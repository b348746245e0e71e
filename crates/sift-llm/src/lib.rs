pub mod providers;
pub mod retry;

use std::sync::Arc;

use sift_core::config::{AppConfig, ModelConfig};
use sift_core::error::{Result, SiftError};
use sift_core::traits::InferenceService;

pub use providers::anthropic::AnthropicClient;
pub use providers::openai::OpenAiClient;
pub use retry::RetryingClient;

/// Fill base URL and headers from a provider preset, keeping user values.
pub fn apply_preset_defaults(config: &mut ModelConfig) {
    if let Some(preset) = providers::presets::get_preset(&config.provider) {
        if config.base_url.is_none() {
            config.base_url = Some(preset.default_base_url.to_string());
        }
        config.extra_headers = providers::presets::build_extra_headers(&preset, &config.extra_headers);
    }
}

/// Create an inference client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Result<Box<dyn InferenceService>> {
    let mut config = config.clone();
    apply_preset_defaults(&mut config);

    match config.provider.as_str() {
        "anthropic" | "claude" => Ok(Box::new(AnthropicClient::new(config))),
        "openai" => Ok(Box::new(OpenAiClient::new(config))),
        name if providers::presets::get_preset(name).is_some() => {
            Ok(Box::new(OpenAiClient::new(config)))
        }
        // Unknown names still work against an explicit OpenAI-compatible endpoint
        _ if config.base_url.is_some() => Ok(Box::new(OpenAiClient::new(config))),
        other => Err(SiftError::UnsupportedProvider(other.to_string())),
    }
}

/// Build the primary client wrapped with retries and fallback models.
pub fn build_inference(config: &AppConfig) -> Result<Arc<dyn InferenceService>> {
    let primary = create_client(&config.model)?;
    let fallbacks = config
        .fallback_models
        .iter()
        .map(create_client)
        .collect::<Result<Vec<_>>>()?;
    let retry = config.model.retry.clone().unwrap_or_default();
    Ok(Arc::new(RetryingClient::new(primary, fallbacks, retry)))
}
