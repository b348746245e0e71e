use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, warn};

use sift_core::error::{Result, SiftError};
use sift_core::traits::{Strategy, StrategyContext, StrategyOutput};
use sift_core::types::{CostMetadata, InferenceRequest, Payload, UnitSummary};

use crate::util::{fetch, infer, optional_str, render_for_prompt, require_array, truncate_chars};

const DEFAULT_FETCH: &str = "fetch_thread";
const DEFAULT_INSTRUCTION: &str = "Summarize this item in one or two sentences.";
const ID_FIELDS: &[&str] = &["id", "thread_id", "message_id", "event_id"];

/// Per-unit fetch + analysis, run as a bounded-concurrency batch.
///
/// A unit that cannot be fetched or analysed is listed in `failed`; the node
/// only fails when every unit does.
pub struct BatchContentAnalysisStrategy;

fn unit_id(unit: &Value) -> Option<String> {
    match unit {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => ID_FIELDS
            .iter()
            .find_map(|f| map.get(*f).and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}

fn title_of(content: &Value) -> Option<String> {
    ["subject", "title", "name"]
        .iter()
        .find_map(|f| content.get(*f).and_then(Value::as_str))
        .map(str::to_string)
}

async fn analyse_unit(
    ctx: &StrategyContext,
    operation: &str,
    instruction: &str,
    id: &str,
    cost: &mut CostMetadata,
) -> Result<UnitSummary> {
    let content = fetch(ctx, cost, operation, json!({"id": id})).await?;
    let body = render_for_prompt(&content, ctx.limits.max_text_chars);
    let prompt = format!(
        "{}\n\nReply with plain text only, at most {} characters.\n\n---\n{}",
        instruction, ctx.limits.unit_summary_chars, body
    );
    let max_tokens = (ctx.limits.unit_summary_chars / 3).max(64) as u32;
    let response = infer(ctx, cost, InferenceRequest::text(prompt, max_tokens)).await?;
    let summary = response.text.trim();
    if summary.is_empty() {
        return Err(SiftError::InferenceParse("empty summary".into()));
    }
    Ok(UnitSummary {
        unit: id.to_string(),
        title: title_of(&content).map(|t| truncate_chars(&t, ctx.limits.max_item_chars)),
        summary: truncate_chars(summary, ctx.limits.unit_summary_chars),
    })
}

impl Strategy for BatchContentAnalysisStrategy {
    fn name(&self) -> &str {
        "batch-content-analysis"
    }

    fn description(&self) -> &str {
        "Fetch each unit (e.g. a mail thread) and run one model call per unit with the given instruction. \
         Use for reading and summarizing a list of items found by an earlier step."
    }

    fn params_hint(&self) -> Value {
        json!({
            "units": {"$ref": "n1.items[*].thread_id"},
            "instruction": "Summarize what the sender needs from me",
            "fetch_operation": "fetch_thread | fetch_message | fetch_event"
        })
    }

    fn uses_inference(&self) -> bool {
        true
    }

    fn execute(&self, params: Value, ctx: StrategyContext) -> BoxFuture<'_, Result<StrategyOutput>> {
        Box::pin(async move {
            let units = require_array(&params, "units")?;
            let operation = optional_str(&params, "fetch_operation").unwrap_or(DEFAULT_FETCH);
            let instruction = optional_str(&params, "instruction").unwrap_or(DEFAULT_INSTRUCTION);

            let mut ids = Vec::new();
            let mut failed = Vec::new();
            for unit in units.iter().take(ctx.limits.max_units) {
                match unit_id(unit) {
                    Some(id) => ids.push(id),
                    None => failed.push(truncate_chars(&unit.to_string(), 40)),
                }
            }
            let total = units.len();
            let skipped = total.saturating_sub(ctx.limits.max_units);
            if skipped > 0 {
                debug!(
                    requested = total,
                    cap = ctx.limits.max_units,
                    skipped,
                    "Batch analysis capped"
                );
            }

            let mut outcomes: Vec<(usize, String, Result<UnitSummary>, CostMetadata)> =
                stream::iter(ids.into_iter().enumerate())
                    .map(|(idx, id)| {
                        let ctx = &ctx;
                        async move {
                            let mut cost = CostMetadata::default();
                            let result = analyse_unit(ctx, operation, instruction, &id, &mut cost).await;
                            (idx, id, result, cost)
                        }
                    })
                    .buffer_unordered(ctx.limits.unit_concurrency.max(1))
                    .collect()
                    .await;
            outcomes.sort_by_key(|(idx, ..)| *idx);

            let mut cost = CostMetadata::default();
            let mut summaries = Vec::new();
            for (_, id, result, unit_cost) in outcomes {
                cost.add(&unit_cost);
                match result {
                    Ok(summary) => summaries.push(summary),
                    Err(SiftError::Cancelled) => return Err(SiftError::Cancelled),
                    Err(e) => {
                        warn!(unit = %id, error = %e, "Unit analysis failed");
                        failed.push(id);
                    }
                }
            }

            let attempted = total - skipped;
            if summaries.is_empty() && attempted > 0 {
                return Err(SiftError::NodeExecution {
                    node: self.name().to_string(),
                    message: format!("all {} units failed", attempted),
                });
            }

            Ok(StrategyOutput {
                payload: Payload::Analysis {
                    units: summaries,
                    failed,
                    skipped,
                    total,
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

    use sift_test_utils::{fixtures, not_found, MockInference, MockResource};

    fn resources_failing(bad: &'static [&'static str]) -> MockResource {
        MockResource::new().handle("fetch_thread", move |params| {
            let id = params["id"].as_str().unwrap_or_default();
            if bad.iter().any(|b| *b == id) {
                Err(not_found("fetch_thread", id))
            } else {
                Ok(fixtures::thread_body(id))
            }
        })
    }

    #[tokio::test]
    async fn test_partial_unit_failure_is_recorded() {
        let units: Vec<String> = (1..=20).map(|i| format!("t{}", i)).collect();
        let inference = Arc::new(MockInference::new().default_reply("Needs a decision on the offsite."));
        let ctx = fixtures::strategy_context(inference.clone(), Arc::new(resources_failing(&["t4", "t17"])));

        let out = BatchContentAnalysisStrategy
            .execute(json!({"units": units}), ctx)
            .await
            .unwrap();
        match &out.payload {
            Payload::Analysis {
                units,
                failed,
                skipped,
                total,
            } => {
                assert_eq!(*total, 20);
                assert_eq!(*skipped, 0);
                assert_eq!(units.len(), 18);
                assert_eq!(failed, &vec!["t4".to_string(), "t17".to_string()]);
                assert_eq!(units[0].unit, "t1");
                assert_eq!(units[0].title.as_deref(), Some("Subject of t1"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(out.cost.inference_calls, 18);
        assert_eq!(out.cost.external_calls, 20);
        assert_eq!(inference.call_count(), 18);
    }

    #[tokio::test]
    async fn test_units_are_capped() {
        let units: Vec<String> = (1..=50).map(|i| format!("t{}", i)).collect();
        let ctx = fixtures::strategy_context(Arc::new(MockInference::new()), Arc::new(resources_failing(&[])));
        let out = BatchContentAnalysisStrategy
            .execute(json!({"units": units}), ctx)
            .await
            .unwrap();
        match &out.payload {
            Payload::Analysis {
                units,
                failed,
                skipped,
                total,
            } => {
                assert_eq!(units.len(), 20);
                assert!(failed.is_empty());
                assert_eq!(*skipped, 30);
                assert_eq!(*total, 50);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(out.cost.external_calls, 20);
    }

    #[tokio::test]
    async fn test_capped_units_show_in_digest() {
        let units: Vec<String> = (1..=25).map(|i| format!("t{}", i)).collect();
        let ctx = fixtures::strategy_context(Arc::new(MockInference::new()), Arc::new(resources_failing(&["t2"])));
        let out = BatchContentAnalysisStrategy
            .execute(json!({"units": units}), ctx)
            .await
            .unwrap();
        let rendered = out.payload.render_compact();
        assert!(rendered.contains("(1 of 25 could not be read)"));
        assert!(rendered.contains("(5 of 25 were over the limit and not read)"));
    }

    #[tokio::test]
    async fn test_summaries_are_truncated() {
        let long = "word ".repeat(500);
        let ctx = fixtures::strategy_context(
            Arc::new(MockInference::new().default_reply(long)),
            Arc::new(resources_failing(&[])),
        );
        let limit = ctx.limits.unit_summary_chars;
        let out = BatchContentAnalysisStrategy
            .execute(json!({"units": ["t1"]}), ctx)
            .await
            .unwrap();
        match out.payload {
            Payload::Analysis { units, .. } => assert!(units[0].summary.chars().count() <= limit + 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_all_units_failing_fails_the_node() {
        let ctx = fixtures::strategy_context(
            Arc::new(MockInference::new()),
            Arc::new(resources_failing(&["t1", "t2"])),
        );
        let err = BatchContentAnalysisStrategy
            .execute(json!({"units": ["t1", "t2"]}), ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("all 2 units failed"));
    }

    #[test]
    fn test_unit_id_from_objects() {
        assert_eq!(unit_id(&json!({"thread_id": "t9"})), Some("t9".into()));
        assert_eq!(unit_id(&json!("t3")), Some("t3".into()));
        assert_eq!(unit_id(&json!(42)), None);
    }
}
