use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use sift_core::config::ModelConfig;
use sift_core::error::{Result, SiftError};
use sift_core::traits::InferenceService;
use sift_core::types::*;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

const JSON_ONLY: &str = "Respond with a single JSON value and nothing else. No prose, no code fences.";

/// Anthropic messages API client bound to one model.
pub struct AnthropicClient {
    http: Client,
    config: ModelConfig,
}

impl AnthropicClient {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize, Debug)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<ContentBlockInfo>,
    #[serde(default)]
    usage: Option<UsageInfo>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum ContentBlockInfo {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
struct UsageInfo {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

fn build_request(config: &ModelConfig, request: InferenceRequest) -> AnthropicRequest {
    let system = match (request.system, request.shape) {
        (Some(s), OutputShape::Json) => Some(format!("{}\n\n{}", s, JSON_ONLY)),
        (None, OutputShape::Json) => Some(JSON_ONLY.to_string()),
        (s, OutputShape::Text) => s,
    };
    AnthropicRequest {
        model: config.model_id.clone(),
        max_tokens: request.max_output_tokens.min(config.max_tokens),
        temperature: if config.temperature > 0.0 {
            Some(config.temperature)
        } else {
            None
        },
        messages: vec![ApiMessage {
            role: "user",
            content: request.prompt,
        }],
        system,
    }
}

pub(crate) fn parse_response(body: &str) -> Result<InferenceResponse> {
    let parsed: AnthropicResponse =
        serde_json::from_str(body).map_err(|e| SiftError::InferenceParse(e.to_string()))?;
    let text = parsed
        .content
        .into_iter()
        .filter_map(|b| match b {
            ContentBlockInfo::Text { text } => Some(text),
            ContentBlockInfo::Other => None,
        })
        .collect::<Vec<_>>()
        .join("");
    if let Some(reason) = parsed.stop_reason.as_deref() {
        debug!(stop_reason = reason, "Anthropic response complete");
    }
    let (input_tokens, output_tokens) = parsed
        .usage
        .map(|u| (u.input_tokens, u.output_tokens))
        .unwrap_or((0, 0));
    Ok(InferenceResponse {
        text,
        input_tokens,
        output_tokens,
    })
}

impl InferenceService for AnthropicClient {
    fn infer(&self, request: InferenceRequest) -> BoxFuture<'_, Result<InferenceResponse>> {
        Box::pin(async move {
            let api_key = self
                .config
                .api_key
                .as_deref()
                .ok_or_else(|| SiftError::Config("Anthropic API key not set".into()))?;

            let base_url = self.config.base_url.as_deref().unwrap_or(ANTHROPIC_API_URL);
            let body = build_request(&self.config, request);

            let mut req = self
                .http
                .post(base_url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json");
            for (k, v) in &self.config.extra_headers {
                req = req.header(k.as_str(), v.as_str());
            }

            let response = req
                .json(&body)
                .send()
                .await
                .map_err(|e| SiftError::InferenceRequest(e.to_string()))?;

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| SiftError::InferenceRequest(e.to_string()))?;
            if !status.is_success() {
                return Err(SiftError::InferenceRequest(format!("HTTP {}: {}", status, text)));
            }
            parse_response(&text)
        })
    }

    fn name(&self) -> &str {
        &self.config.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ModelConfig {
        ModelConfig {
            provider: "anthropic".into(),
            model_id: "claude-sonnet-4-20250514".into(),
            api_key: Some("k".into()),
            base_url: None,
            max_tokens: 1024,
            temperature: 0.0,
            retry: None,
            extra_headers: Default::default(),
        }
    }

    #[test]
    fn test_parse_text_and_usage() {
        let body = r#"{
            "id": "msg_1", "type": "message", "role": "assistant",
            "content": [{"type": "text", "text": "Hello"}, {"type": "text", "text": " there"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 3}
        }"#;
        let resp = parse_response(body).unwrap();
        assert_eq!(resp.text, "Hello there");
        assert_eq!(resp.input_tokens, 12);
        assert_eq!(resp.output_tokens, 3);
    }

    #[test]
    fn test_parse_skips_unknown_blocks() {
        let body = r#"{"content": [{"type": "thinking", "thinking": "hm"}, {"type": "text", "text": "ok"}]}"#;
        assert_eq!(parse_response(body).unwrap().text, "ok");
    }

    #[test]
    fn test_json_shape_adds_system_instruction() {
        let req = build_request(&config(), InferenceRequest::json("plan this", 4096));
        assert_eq!(req.system.as_deref(), Some(JSON_ONLY));
        assert_eq!(req.max_tokens, 1024);
        assert!(req.temperature.is_none());
    }
}
