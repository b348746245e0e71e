//! Output bounding, JSON extraction, and retry helpers shared by strategies.

use std::future::Future;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use sift_core::config::{OutputLimits, RetryConfig};
use sift_core::error::{Result, SiftError};
use sift_core::traits::StrategyContext;
use sift_core::types::{CostMetadata, InferenceRequest, InferenceResponse, Payload};

/// Truncate to `max` characters, marking the cut with an ellipsis.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        None => s.to_string(),
        Some((idx, _)) => {
            let mut out = s[..idx].trim_end().to_string();
            out.push('…');
            out
        }
    }
}

/// Shorten every string inside `value` to at most `max_chars`.
pub fn bound_value(value: Value, max_chars: usize) -> Value {
    match value {
        Value::String(s) => Value::String(truncate_chars(&s, max_chars)),
        Value::Array(items) => Value::Array(items.into_iter().map(|v| bound_value(v, max_chars)).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, bound_value(v, max_chars)))
                .collect(),
        ),
        other => other,
    }
}

/// Cap a list of items by count and per-field length.
pub fn bound_items(items: Vec<Value>, limits: &OutputLimits) -> Payload {
    let total = items.len();
    let items = items
        .into_iter()
        .take(limits.max_items)
        .map(|v| bound_value(v, limits.max_item_chars))
        .collect();
    Payload::Items { items, total }
}

/// Pull the item list out of a resource response.
///
/// Accepts a bare array or an object with an `items` array; a reported
/// `total` larger than the list is kept.
pub fn items_from_response(response: Value) -> Result<(Vec<Value>, usize)> {
    match response {
        Value::Array(items) => {
            let n = items.len();
            Ok((items, n))
        }
        Value::Object(mut map) => {
            let reported = map.get("total").and_then(Value::as_u64).map(|t| t as usize);
            match map.remove("items") {
                Some(Value::Array(items)) => {
                    let n = items.len();
                    Ok((items, reported.unwrap_or(n).max(n)))
                }
                _ => Err(SiftError::Resource {
                    operation: "list".into(),
                    status: None,
                    message: "response has no 'items' array".into(),
                }),
            }
        }
        other => Err(SiftError::Resource {
            operation: "list".into(),
            status: None,
            message: format!("unexpected response shape: {}", truncate_chars(&other.to_string(), 80)),
        }),
    }
}

/// Parse the first JSON object or array in a model reply.
///
/// Tolerates code fences and prose around the JSON.
pub fn extract_json(text: &str) -> Result<Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Ok(v);
    }
    let start = trimmed
        .find(['{', '['])
        .ok_or_else(|| SiftError::InferenceParse("no JSON found in model output".into()))?;
    let close = if trimmed[start..].starts_with('{') { '}' } else { ']' };
    let end = trimmed
        .rfind(close)
        .filter(|&e| e > start)
        .ok_or_else(|| SiftError::InferenceParse("unterminated JSON in model output".into()))?;
    serde_json::from_str(&trimmed[start..=end]).map_err(|e| SiftError::InferenceParse(e.to_string()))
}

/// Render a value as compact prompt text, bounded to `max_chars`.
pub fn render_for_prompt(value: &Value, max_chars: usize) -> String {
    if let Ok(payload) = serde_json::from_value::<Payload>(value.clone()) {
        return truncate_chars(&payload.render_compact(), max_chars);
    }
    match value {
        Value::String(s) => truncate_chars(s, max_chars),
        other => truncate_chars(&other.to_string(), max_chars),
    }
}

/// Run `op` with bounded retries on transient errors.
///
/// Sleeps between attempts are interrupted by `cancel`.
pub async fn with_retry<T, F, Fut>(
    what: &str,
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                let wait = config.backoff(attempt);
                warn!(
                    operation = what,
                    attempt = attempt + 1,
                    backoff_ms = wait.as_millis() as u64,
                    error = %e,
                    "Retrying resource call"
                );
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancel.cancelled() => return Err(SiftError::Cancelled),
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Call a read operation with retries, counting every attempt.
pub async fn fetch(
    ctx: &StrategyContext,
    cost: &mut CostMetadata,
    operation: &str,
    params: Value,
) -> Result<Value> {
    let mut attempts = 0u32;
    let result = with_retry(operation, &ctx.retry, &ctx.cancel, || {
        attempts += 1;
        ctx.resources.call(ctx.resource_request(operation, params.clone()))
    })
    .await;
    cost.external_calls += attempts;
    result
}

/// One inference call, with its usage recorded into `cost`.
pub async fn infer(
    ctx: &StrategyContext,
    cost: &mut CostMetadata,
    request: InferenceRequest,
) -> Result<InferenceResponse> {
    let response = ctx.inference.infer(request).await?;
    cost.record_inference(&response);
    Ok(response)
}

pub fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    params[key]
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| SiftError::StrategyValidation(format!("'{}' must be a non-empty string", key)))
}

pub fn optional_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params[key].as_str().filter(|s| !s.trim().is_empty())
}

pub fn require_array<'a>(params: &'a Value, key: &str) -> Result<&'a Vec<Value>> {
    params[key]
        .as_array()
        .ok_or_else(|| SiftError::StrategyValidation(format!("'{}' must be an array", key)))
}
