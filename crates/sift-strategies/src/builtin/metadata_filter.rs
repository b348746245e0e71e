use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use sift_core::error::{Result, SiftError};
use sift_core::traits::{Strategy, StrategyContext, StrategyOutput};
use sift_core::types::{CostMetadata, Payload};

use crate::resource::is_write_operation;
use crate::util::{bound_items, fetch, items_from_response, require_str};

/// Structured listing query against the resource service. No inference.
pub struct MetadataFilterStrategy;

impl Strategy for MetadataFilterStrategy {
    fn name(&self) -> &str {
        "metadata-filter"
    }

    fn description(&self) -> &str {
        "List items matching structured filters (dates, sender, unread/unreplied flags, calendar). \
         One service call, no model call."
    }

    fn params_hint(&self) -> Value {
        json!({
            "operation": "list_events | list_threads | list_messages | list_contacts",
            "filters": {"date": "YYYY-MM-DD", "since": "YYYY-MM-DD", "unreplied": true, "calendar": "Work"},
            "limit": 20
        })
    }

    fn execute(&self, params: Value, ctx: StrategyContext) -> BoxFuture<'_, Result<StrategyOutput>> {
        Box::pin(async move {
            let operation = require_str(&params, "operation")?;
            if is_write_operation(operation) {
                return Err(SiftError::StrategyValidation(format!(
                    "'{}' is a write operation; metadata-filter is read-only",
                    operation
                )));
            }

            let limit = params["limit"]
                .as_u64()
                .map(|l| l as usize)
                .unwrap_or(ctx.limits.max_items)
                .min(ctx.limits.max_items.max(1) * 5);
            let mut query = match &params["filters"] {
                Value::Object(map) => Value::Object(map.clone()),
                Value::Null => json!({}),
                _ => {
                    return Err(SiftError::StrategyValidation("'filters' must be an object".into()));
                }
            };
            query["limit"] = json!(limit);

            let mut cost = CostMetadata::default();
            let response = fetch(&ctx, &mut cost, operation, query).await?;
            let (items, total) = items_from_response(response)?;
            debug!(operation, returned = items.len(), total, "Metadata filter complete");

            let mut payload = bound_items(items, &ctx.limits);
            if let Payload::Items { total: t, .. } = &mut payload {
                *t = (*t).max(total);
            }
            Ok(StrategyOutput { payload, cost })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use sift_test_utils::{fixtures, MockInference, MockResource};

    #[tokio::test]
    async fn test_lists_and_bounds_items() {
        let resources = Arc::new(MockResource::new().respond("list_threads", fixtures::threads(30)));
        let ctx = fixtures::strategy_context(Arc::new(MockInference::new()), resources.clone());
        let out = MetadataFilterStrategy
            .execute(json!({"operation": "list_threads", "filters": {"unreplied": true}}), ctx)
            .await
            .unwrap();
        match out.payload {
            Payload::Items { items, total } => {
                assert_eq!(items.len(), 20);
                assert_eq!(total, 30);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(out.cost.external_calls, 1);
        assert_eq!(out.cost.inference_calls, 0);

        let calls = resources.calls();
        let calls = calls.lock().unwrap();
        assert_eq!(calls[0].params["unreplied"], true);
        assert_eq!(calls[0].params["limit"], 20);
        assert_eq!(calls[0].authorization.as_deref(), Some("test-token"));
    }

    #[tokio::test]
    async fn test_refuses_write_operation() {
        let ctx = fixtures::strategy_context(Arc::new(MockInference::new()), Arc::new(MockResource::new()));
        let err = MetadataFilterStrategy
            .execute(json!({"operation": "send_message"}), ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, SiftError::StrategyValidation(_)));
    }
}
