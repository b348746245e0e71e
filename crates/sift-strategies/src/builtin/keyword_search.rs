use futures::future::BoxFuture;
use serde_json::{json, Value};

use sift_core::error::{Result, SiftError};
use sift_core::traits::{Strategy, StrategyContext, StrategyOutput};
use sift_core::types::{CostMetadata, Payload};

use crate::util::{bound_items, fetch, items_from_response, optional_str, require_str};

const SCOPES: &[&str] = &["mail", "calendar", "contacts"];

/// Search-operator query (e.g. `from:alice subject:budget`) against one service.
pub struct KeywordSearchStrategy;

impl Strategy for KeywordSearchStrategy {
    fn name(&self) -> &str {
        "keyword-search"
    }

    fn description(&self) -> &str {
        "Full-text search using the service's search-operator syntax. One service call, no model call."
    }

    fn params_hint(&self) -> Value {
        json!({"query": "from:alice subject:budget newer_than:7d", "scope": "mail | calendar | contacts", "limit": 20})
    }

    fn execute(&self, params: Value, ctx: StrategyContext) -> BoxFuture<'_, Result<StrategyOutput>> {
        Box::pin(async move {
            let query = require_str(&params, "query")?;
            let scope = optional_str(&params, "scope").unwrap_or("mail");
            if !SCOPES.contains(&scope) {
                return Err(SiftError::StrategyValidation(format!(
                    "unknown scope '{}', expected one of {}",
                    scope,
                    SCOPES.join(", ")
                )));
            }
            let limit = params["limit"]
                .as_u64()
                .map(|l| (l as usize).min(ctx.limits.max_items))
                .unwrap_or(ctx.limits.max_items);

            let mut cost = CostMetadata::default();
            let response = fetch(
                &ctx,
                &mut cost,
                "search",
                json!({"query": query, "scope": scope, "limit": limit}),
            )
            .await?;
            let (items, total) = items_from_response(response)?;

            let mut payload = bound_items(items, &ctx.limits);
            if let Payload::Items { total: t, .. } = &mut payload {
                *t = (*t).max(total);
            }
            Ok(StrategyOutput { payload, cost })
        })
    }
}
