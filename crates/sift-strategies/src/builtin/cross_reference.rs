use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use sift_core::error::{Result, SiftError};
use sift_core::traits::{Strategy, StrategyContext, StrategyOutput};
use sift_core::types::{CostMetadata, InferenceRequest, Payload};

use crate::util::{bound_items, extract_json, infer, optional_str, render_for_prompt, require_array, truncate_chars};

const MODES: &[&str] = &["rank", "merge", "intersect"];

/// One model call that ranks, merges or intersects earlier nodes' outputs.
///
/// Inputs are always placeholders to earlier results, so only already
/// bounded summaries reach the prompt.
pub struct CrossReferenceStrategy;

fn build_prompt(mode: &str, instruction: &str, inputs: &[String]) -> String {
    let mut prompt = format!(
        "Task ({}): {}\n\nReply with JSON: {{\"items\": [{{\"title\": string, \"detail\": string}}]}} \
         ordered by relevance. Use only the information below; do not invent items.\n",
        mode, instruction
    );
    for (i, input) in inputs.iter().enumerate() {
        prompt.push_str(&format!("\n### Input {}\n{}", i + 1, input));
    }
    prompt
}

impl Strategy for CrossReferenceStrategy {
    fn name(&self) -> &str {
        "cross-reference"
    }

    fn description(&self) -> &str {
        "Rank, merge or intersect the outputs of earlier steps with one model call. \
         Inputs must be references to earlier nodes, never raw data."
    }

    fn params_hint(&self) -> Value {
        json!({
            "inputs": [{"$ref": "n1"}, {"$ref": "n2"}],
            "mode": "rank | merge | intersect",
            "instruction": "Which of these threads relate to tomorrow's meetings?"
        })
    }

    fn uses_inference(&self) -> bool {
        true
    }

    fn execute(&self, params: Value, ctx: StrategyContext) -> BoxFuture<'_, Result<StrategyOutput>> {
        Box::pin(async move {
            let inputs = require_array(&params, "inputs")?;
            if inputs.is_empty() {
                return Err(SiftError::StrategyValidation("'inputs' must not be empty".into()));
            }
            let mode = optional_str(&params, "mode").unwrap_or("rank");
            if !MODES.contains(&mode) {
                return Err(SiftError::StrategyValidation(format!("unknown mode '{}'", mode)));
            }
            let instruction = optional_str(&params, "instruction").unwrap_or("Combine the inputs.");

            let per_input = ctx.limits.max_text_chars / inputs.len().max(1);
            let rendered: Vec<String> = inputs.iter().map(|v| render_for_prompt(v, per_input)).collect();
            let prompt = build_prompt(mode, instruction, &rendered);

            let mut cost = CostMetadata::default();
            let max_tokens = (ctx.limits.max_items * ctx.limits.max_item_chars / 3).max(256) as u32;
            let response = infer(&ctx, &mut cost, InferenceRequest::json(prompt, max_tokens)).await?;

            let payload = match extract_json(&response.text) {
                Ok(Value::Object(mut map)) => match map.remove("items") {
                    Some(Value::Array(items)) => bound_items(items, &ctx.limits),
                    _ => Payload::Text {
                        text: truncate_chars(&response.text, ctx.limits.max_text_chars),
                    },
                },
                Ok(Value::Array(items)) => bound_items(items, &ctx.limits),
                _ => {
                    debug!("Cross-reference reply was not JSON, keeping text");
                    Payload::Text {
                        text: truncate_chars(response.text.trim(), ctx.limits.max_text_chars),
                    }
                }
            };
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
    async fn test_ranks_earlier_outputs() {
        let inference = Arc::new(MockInference::new().on(
            "Task (rank)",
            r#"{"items": [{"title": "Budget thread", "detail": "Meeting at 10"}]}"#,
        ));
        let ctx = fixtures::strategy_context(inference.clone(), Arc::new(MockResource::new()));
        let params = json!({
            "inputs": [
                {"kind": "items", "items": [{"id": "t1", "subject": "Budget"}], "total": 1},
                {"kind": "text", "text": "Meeting with finance at 10"}
            ],
            "instruction": "Match threads to meetings"
        });
        let out = CrossReferenceStrategy.execute(params, ctx).await.unwrap();
        assert!(matches!(out.payload, Payload::Items { total: 1, .. }));
        assert_eq!(out.cost.inference_calls, 1);
        assert_eq!(out.cost.external_calls, 0);

        let calls = inference.calls();
        let prompt = calls.lock().unwrap()[0].prompt.clone();
        assert!(prompt.contains("subject: Budget"));
        assert!(!prompt.contains("t1"));
    }

    #[tokio::test]
    async fn test_non_json_reply_becomes_text() {
        let inference = Arc::new(MockInference::new().default_reply("Both mention the offsite."));
        let ctx = fixtures::strategy_context(inference, Arc::new(MockResource::new()));
        let out = CrossReferenceStrategy
            .execute(json!({"inputs": ["a", "b"], "mode": "intersect"}), ctx)
            .await
            .unwrap();
        assert_eq!(
            out.payload,
            Payload::Text {
                text: "Both mention the offsite.".into()
            }
        );
    }

    #[tokio::test]
    async fn test_empty_inputs_rejected() {
        let ctx = fixtures::strategy_context(Arc::new(MockInference::new()), Arc::new(MockResource::new()));
        assert!(CrossReferenceStrategy.execute(json!({"inputs": []}), ctx).await.is_err());
    }
}
