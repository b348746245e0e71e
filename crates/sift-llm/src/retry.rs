use futures::future::BoxFuture;
use tracing::{info, warn};

use sift_core::config::RetryConfig;
use sift_core::error::{Result, SiftError};
use sift_core::traits::InferenceService;
use sift_core::types::*;

/// An inference client that retries failed requests and falls back to alternative models.
pub struct RetryingClient {
    primary: Box<dyn InferenceService>,
    fallbacks: Vec<Box<dyn InferenceService>>,
    retry_config: RetryConfig,
}

impl RetryingClient {
    pub fn new(
        primary: Box<dyn InferenceService>,
        fallbacks: Vec<Box<dyn InferenceService>>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            primary,
            fallbacks,
            retry_config,
        }
    }
}

impl InferenceService for RetryingClient {
    fn infer(&self, request: InferenceRequest) -> BoxFuture<'_, Result<InferenceResponse>> {
        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;

            let mut last_err = None;
            for attempt in 0..=max_retries {
                match self.primary.infer(request.clone()).await {
                    Ok(response) => return Ok(response),
                    Err(e) => {
                        if e.is_transient() && attempt < max_retries {
                            let backoff = self.retry_config.backoff(attempt);
                            warn!(
                                attempt = attempt + 1,
                                max_retries,
                                backoff_ms = backoff.as_millis() as u64,
                                error = %e,
                                "Retrying inference request"
                            );
                            tokio::time::sleep(backoff).await;
                            last_err = Some(e);
                            continue;
                        }
                        last_err = Some(e);
                        break;
                    }
                }
            }

            if !self.fallbacks.is_empty() {
                info!("Primary model exhausted, trying fallback models");
            }
            for fallback in &self.fallbacks {
                match fallback.infer(request.clone()).await {
                    Ok(response) => {
                        info!(model = %fallback.name(), "Fell back to alternative model");
                        return Ok(response);
                    }
                    Err(e) => {
                        warn!(model = %fallback.name(), error = %e, "Fallback model also failed");
                    }
                }
            }

            Err(last_err.unwrap_or_else(|| SiftError::InferenceRequest("All providers failed".into())))
        })
    }

    fn name(&self) -> &str {
        self.primary.name()
    }
}
