use std::collections::HashMap;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use sift_core::error::{Result, SiftError};
use sift_core::traits::{Strategy, StrategyContext, StrategyOutput};
use sift_core::types::{CostMetadata, InferenceRequest, Payload};

use crate::util::{bound_items, bound_value, extract_json, infer, optional_str, require_array};

const UNCLASSIFIED: &str = "unclassified";

/// Labels a batch of items with one model call.
pub struct ClassificationStrategy;

fn build_prompt(labels: &[&str], instruction: &str, items: &[Value]) -> String {
    let mut prompt = format!(
        "Assign exactly one label to each numbered item. Allowed labels: {}.\n{}\n\
         Reply with JSON: {{\"labels\": [{{\"index\": number, \"label\": string}}]}}\n",
        labels.join(", "),
        instruction
    );
    for (i, item) in items.iter().enumerate() {
        prompt.push_str(&format!("\n[{}] {}", i, item));
    }
    prompt
}

/// Map item index to label, keeping only allowed labels.
fn parse_labels(reply: &Value, allowed: &[&str]) -> HashMap<usize, String> {
    let entries = match reply {
        Value::Object(map) => map.get("labels").and_then(Value::as_array).cloned().unwrap_or_default(),
        Value::Array(arr) => arr.clone(),
        _ => Vec::new(),
    };
    entries
        .iter()
        .filter_map(|e| {
            let idx = e["index"].as_u64()? as usize;
            let label = e["label"].as_str()?;
            allowed
                .iter()
                .find(|a| a.eq_ignore_ascii_case(label))
                .map(|a| (idx, a.to_string()))
        })
        .collect()
}

impl Strategy for ClassificationStrategy {
    fn name(&self) -> &str {
        "classification"
    }

    fn description(&self) -> &str {
        "Label a list of items (from an earlier step) with one of the given categories, in one model call."
    }

    fn params_hint(&self) -> Value {
        json!({
            "items": {"$ref": "n1.items"},
            "labels": ["urgent", "needs-reply", "fyi"],
            "instruction": "Urgent means a deadline within 48 hours"
        })
    }

    fn uses_inference(&self) -> bool {
        true
    }

    fn execute(&self, params: Value, ctx: StrategyContext) -> BoxFuture<'_, Result<StrategyOutput>> {
        Box::pin(async move {
            let items = require_array(&params, "items")?;
            let labels: Vec<&str> = require_array(&params, "labels")?
                .iter()
                .filter_map(Value::as_str)
                .collect();
            if labels.is_empty() {
                return Err(SiftError::StrategyValidation("'labels' must list at least one label".into()));
            }
            let instruction = optional_str(&params, "instruction").unwrap_or("");

            let batch: Vec<Value> = items
                .iter()
                .take(ctx.limits.max_items)
                .map(|v| bound_value(v.clone(), ctx.limits.max_item_chars))
                .collect();

            let mut cost = CostMetadata::default();
            if batch.is_empty() {
                return Ok(StrategyOutput {
                    payload: bound_items(vec![], &ctx.limits),
                    cost,
                });
            }

            let prompt = build_prompt(&labels, instruction, &batch);
            let max_tokens = (batch.len() * 16).max(128) as u32;
            let response = infer(&ctx, &mut cost, InferenceRequest::json(prompt, max_tokens)).await?;
            let reply = extract_json(&response.text)?;
            let assigned = parse_labels(&reply, &labels);

            let labelled: Vec<Value> = batch
                .into_iter()
                .enumerate()
                .map(|(i, item)| {
                    let label = assigned.get(&i).map(String::as_str).unwrap_or(UNCLASSIFIED);
                    match item {
                        Value::Object(mut map) => {
                            map.insert("label".into(), json!(label));
                            Value::Object(map)
                        }
                        other => json!({"item": other, "label": label}),
                    }
                })
                .collect();

            let mut payload = bound_items(labelled, &ctx.limits);
            if let Payload::Items { total, .. } = &mut payload {
                *total = items.len();
            }
            Ok(StrategyOutput { payload, cost })
        })
    }
}
