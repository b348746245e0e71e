use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use sift_core::config::ModelConfig;
use sift_core::error::{Result, SiftError};
use sift_core::traits::InferenceService;
use sift_core::types::*;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible client. Works with OpenAI, Ollama, Groq, OpenRouter, etc.
pub struct OpenAiClient {
    http: Client,
    config: ModelConfig,
}

impl OpenAiClient {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct OaiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<OaiUsage>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct OaiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn is_o_series(model_id: &str) -> bool {
    model_id.starts_with("o1") || model_id.starts_with("o3") || model_id.starts_with("o4")
}

fn build_request(config: &ModelConfig, request: InferenceRequest) -> ChatRequest {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = request.system {
        messages.push(OaiMessage {
            role: "system",
            content: system,
        });
    }
    messages.push(OaiMessage {
        role: "user",
        content: request.prompt,
    });

    // Only the first-party API is known to honour json_object mode
    let response_format = match (request.shape, config.provider.as_str()) {
        (OutputShape::Json, "openai") => Some(serde_json::json!({"type": "json_object"})),
        _ => None,
    };

    ChatRequest {
        model: config.model_id.clone(),
        messages,
        max_tokens: request.max_output_tokens.min(config.max_tokens),
        temperature: if is_o_series(&config.model_id) || config.temperature <= 0.0 {
            None
        } else {
            Some(config.temperature)
        },
        response_format,
    }
}

pub(crate) fn parse_response(body: &str) -> Result<InferenceResponse> {
    let parsed: ChatResponse =
        serde_json::from_str(body).map_err(|e| SiftError::InferenceParse(e.to_string()))?;
    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| SiftError::InferenceParse("response has no message content".into()))?;
    let (input_tokens, output_tokens) = parsed
        .usage
        .map(|u| (u.prompt_tokens, u.completion_tokens))
        .unwrap_or((0, 0));
    Ok(InferenceResponse {
        text,
        input_tokens,
        output_tokens,
    })
}

impl InferenceService for OpenAiClient {
    fn infer(&self, request: InferenceRequest) -> BoxFuture<'_, Result<InferenceResponse>> {
        Box::pin(async move {
            let base_url = self.config.base_url.as_deref().unwrap_or(OPENAI_API_URL);
            let body = build_request(&self.config, request);

            let mut req = self.http.post(base_url).json(&body);
            if let Some(api_key) = &self.config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }
            for (k, v) in &self.config.extra_headers {
                req = req.header(k.as_str(), v.as_str());
            }

            let response = req
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
