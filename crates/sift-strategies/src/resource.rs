use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use sift_core::config::ResourcesConfig;
use sift_core::error::{Result, SiftError};
use sift_core::traits::{ResourceRequest, ResourceService};

/// Operation prefixes that change external state.
const WRITE_PREFIXES: &[&str] = &[
    "send_", "create_", "update_", "delete_", "reply_", "archive_", "move_", "label_", "accept_", "decline_",
];

/// Whether an operation name denotes a write.
pub fn is_write_operation(operation: &str) -> bool {
    WRITE_PREFIXES.iter().any(|p| operation.starts_with(p))
}

/// Resource gateway reached over HTTP: `POST {base_url}/{operation}` with the
/// params as the JSON body.
pub struct HttpResourceClient {
    http: Client,
    base_url: String,
}

impl HttpResourceClient {
    pub fn new(config: &ResourcesConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SiftError::Config(format!("resource client: {}", e)))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, operation: &str) -> Result<String> {
        if operation.is_empty() || !operation.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(SiftError::StrategyValidation(format!(
                "invalid operation name '{}'",
                operation
            )));
        }
        Ok(format!("{}/{}", self.base_url, operation))
    }
}

fn status_error(operation: &str, status: u16, body: &str) -> SiftError {
    let message: String = body.chars().take(300).collect();
    SiftError::Resource {
        operation: operation.to_string(),
        status: Some(status),
        message: if message.is_empty() {
            format!("HTTP {}", status)
        } else {
            message
        },
    }
}

impl ResourceService for HttpResourceClient {
    fn call(&self, request: ResourceRequest) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let url = self.url_for(&request.operation)?;
            debug!(operation = %request.operation, request_id = %request.request_id, "Resource call");

            let mut req = self
                .http
                .post(&url)
                .header("X-Request-Id", request.request_id.to_string())
                .json(&request.params);
            if let Some(token) = &request.authorization {
                req = req.header("Authorization", format!("Bearer {}", token));
            }

            let response = req.send().await.map_err(|e| SiftError::Resource {
                operation: request.operation.clone(),
                status: None,
                message: if e.is_timeout() {
                    format!("timeout: {}", e)
                } else if e.is_connect() {
                    format!("connection failed: {}", e)
                } else {
                    e.to_string()
                },
            })?;

            let status = response.status();
            let body = response.text().await.map_err(|e| SiftError::Resource {
                operation: request.operation.clone(),
                status: Some(status.as_u16()),
                message: e.to_string(),
            })?;
            if !status.is_success() {
                return Err(status_error(&request.operation, status.as_u16(), &body));
            }
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_str(&body).map_err(|e| SiftError::Resource {
                operation: request.operation.clone(),
                status: Some(status.as_u16()),
                message: format!("invalid JSON: {}", e),
            })
        })
    }
}

/// Stand-in when no resource gateway is configured; every call fails.
pub struct UnconfiguredResources;

impl ResourceService for UnconfiguredResources {
    fn call(&self, request: ResourceRequest) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            Err(SiftError::Resource {
                operation: request.operation,
                status: None,
                message: "no [resources] gateway configured".into(),
            })
        })
    }
}
