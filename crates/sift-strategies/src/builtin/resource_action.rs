use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::info;

use sift_core::error::{Result, SiftError};
use sift_core::traits::{Strategy, StrategyContext, StrategyOutput};
use sift_core::types::{CostMetadata, Payload};

use crate::resource::is_write_operation;
use crate::util::{require_str, truncate_chars};

/// One write against the resource service (send, create, update).
///
/// Never retried: a repeated write could duplicate its effect.
pub struct ResourceActionStrategy;

impl Strategy for ResourceActionStrategy {
    fn name(&self) -> &str {
        "resource-action"
    }

    fn description(&self) -> &str {
        "Perform one change: send a message, create or update an event. \
         Plans containing this step always require the user's confirmation."
    }

    fn params_hint(&self) -> Value {
        json!({
            "operation": "send_message | create_event | update_event | reply_thread",
            "payload": {"to": ["alice@example.com"], "subject": "...", "body": "..."}
        })
    }

    fn is_mutating(&self) -> bool {
        true
    }

    fn execute(&self, params: Value, ctx: StrategyContext) -> BoxFuture<'_, Result<StrategyOutput>> {
        Box::pin(async move {
            let operation = require_str(&params, "operation")?;
            if !is_write_operation(operation) {
                return Err(SiftError::StrategyValidation(format!(
                    "'{}' is not a write operation",
                    operation
                )));
            }
            let payload = match &params["payload"] {
                Value::Object(map) if !map.is_empty() => Value::Object(map.clone()),
                _ => {
                    return Err(SiftError::StrategyValidation(
                        "'payload' must be a non-empty object".into(),
                    ))
                }
            };

            let mut cost = CostMetadata::default();
            cost.record_external_call();
            let response = ctx
                .resources
                .call(ctx.resource_request(operation, payload))
                .await?;
            info!(operation, request_id = %ctx.execution.request_id, "Resource action performed");

            let status = response["status"].as_str().unwrap_or("done");
            let text = match response["summary"].as_str() {
                Some(summary) => format!("{} {}: {}", operation.replace('_', " "), status, summary),
                None => format!("{} {}", operation.replace('_', " "), status),
            };
            Ok(StrategyOutput {
                payload: Payload::Text {
                    text: truncate_chars(&text, ctx.limits.max_text_chars),
                },
                cost,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use sift_test_utils::{fixtures, MockInference, MockResource};

    #[tokio::test]
    async fn test_performs_single_write() {
        let resources = Arc::new(MockResource::new().respond(
            "send_message",
            json!({"id": "m-991", "status": "sent", "summary": "to alice@example.com"}),
        ));
        let ctx = fixtures::strategy_context(Arc::new(MockInference::new()), resources.clone());
        let out = ResourceActionStrategy
            .execute(
                json!({"operation": "send_message", "payload": {"to": ["alice@example.com"], "body": "Hi"}}),
                ctx,
            )
            .await
            .unwrap();
        assert_eq!(
            out.payload,
            Payload::Text {
                text: "send message sent: to alice@example.com".into()
            }
        );
        assert_eq!(resources.call_count("send_message"), 1);
    }

    #[tokio::test]
    async fn test_write_failure_is_not_retried() {
        let resources = Arc::new(MockResource::new().handle("create_event", |_| {
            Err(SiftError::Resource {
                operation: "create_event".into(),
                status: Some(503),
                message: "busy".into(),
            })
        }));
        let ctx = fixtures::strategy_context(Arc::new(MockInference::new()), resources.clone());
        let result = ResourceActionStrategy
            .execute(json!({"operation": "create_event", "payload": {"title": "Sync"}}), ctx)
            .await;
        assert!(result.is_err());
        assert_eq!(resources.call_count("create_event"), 1);
    }

    #[tokio::test]
    async fn test_read_operation_rejected() {
        let ctx = fixtures::strategy_context(Arc::new(MockInference::new()), Arc::new(MockResource::new()));
        let result = ResourceActionStrategy
            .execute(json!({"operation": "list_events", "payload": {"x": 1}}), ctx)
            .await;
        assert!(matches!(result, Err(SiftError::StrategyValidation(_))));
    }
}
