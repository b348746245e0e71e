use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use sift_core::error::{Result, SiftError};
use sift_core::traits::InferenceService;
use sift_core::types::{InferenceRequest, InferenceResponse};

enum Outcome {
    Reply(String),
    Fail(String),
}

struct Rule {
    needle: String,
    outcome: Outcome,
    delay: Option<Duration>,
}

/// Scripted inference service.
///
/// Rules are matched in insertion order against the prompt (and system text);
/// the first rule whose needle appears wins. Unmatched prompts get the default
/// reply. Every call is recorded.
pub struct MockInference {
    rules: Vec<Rule>,
    default_reply: String,
    usage: (u64, u64),
    calls: Arc<Mutex<Vec<InferenceRequest>>>,
}

impl MockInference {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            default_reply: "ok".to_string(),
            usage: (100, 20),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Reply with `text` when the prompt contains `needle`.
    pub fn on(mut self, needle: &str, text: impl Into<String>) -> Self {
        self.rules.push(Rule {
            needle: needle.to_string(),
            outcome: Outcome::Reply(text.into()),
            delay: None,
        });
        self
    }

    /// Reply after a delay.
    pub fn on_slow(mut self, needle: &str, text: impl Into<String>, delay: Duration) -> Self {
        self.rules.push(Rule {
            needle: needle.to_string(),
            outcome: Outcome::Reply(text.into()),
            delay: Some(delay),
        });
        self
    }

    /// Fail with a (non-transient) inference error when the prompt contains `needle`.
    pub fn fail_on(mut self, needle: &str, message: impl Into<String>) -> Self {
        self.rules.push(Rule {
            needle: needle.to_string(),
            outcome: Outcome::Fail(message.into()),
            delay: None,
        });
        self
    }

    pub fn default_reply(mut self, text: impl Into<String>) -> Self {
        self.default_reply = text.into();
        self
    }

    /// Token usage reported for every call.
    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = (input_tokens, output_tokens);
        self
    }

    /// Shared handle on the recorded calls.
    pub fn calls(&self) -> Arc<Mutex<Vec<InferenceRequest>>> {
        self.calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl Default for MockInference {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceService for MockInference {
    fn infer(&self, request: InferenceRequest) -> BoxFuture<'_, Result<InferenceResponse>> {
        Box::pin(async move {
            let haystack = format!("{}\n{}", request.system.as_deref().unwrap_or(""), request.prompt);
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(request);
            }

            let rule = self.rules.iter().find(|r| haystack.contains(&r.needle));
            if let Some(delay) = rule.and_then(|r| r.delay) {
                tokio::time::sleep(delay).await;
            }
            let text = match rule.map(|r| &r.outcome) {
                Some(Outcome::Fail(message)) => {
                    return Err(SiftError::InferenceRequest(message.clone()));
                }
                Some(Outcome::Reply(text)) => text.clone(),
                None => self.default_reply.clone(),
            };
            Ok(InferenceResponse {
                text,
                input_tokens: self.usage.0,
                output_tokens: self.usage.1,
            })
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}
