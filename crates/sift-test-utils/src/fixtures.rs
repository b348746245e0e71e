use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use sift_core::config::AppConfig;
use sift_core::traits::{InferenceService, ResourceService, StrategyContext};
use sift_core::types::{Account, ExecutionContext};

/// A fixed, fully-populated execution context.
pub fn context() -> ExecutionContext {
    let now = Utc
        .with_ymd_and_hms(2024, 3, 12, 9, 30, 0)
        .single()
        .unwrap_or_else(Utc::now);
    ExecutionContext::new(now)
        .with_timezone("Europe/Berlin")
        .with_accounts(vec![
            Account {
                id: "acct-mail".into(),
                kind: "mail".into(),
                address: "sam@example.com".into(),
            },
            Account {
                id: "acct-cal".into(),
                kind: "calendar".into(),
                address: "sam@example.com".into(),
            },
        ])
        .with_calendars(vec!["Work".into(), "Personal".into()])
        .with_authorization("test-token")
}

/// Default configuration with fast timeouts for tests.
pub fn config() -> AppConfig {
    let mut config = AppConfig::parse(
        r#"
[model]
provider = "anthropic"
model_id = "test-model"
"#,
    )
    .expect("fixture config parses");
    config.execution.node_timeout_secs = 5;
    config.execution.pipeline_timeout_secs = 30;
    config.execution.cancel_drain_ms = 50;
    config.model.retry = None;
    config
}

pub fn strategy_context(
    inference: Arc<dyn InferenceService>,
    resources: Arc<dyn ResourceService>,
) -> StrategyContext {
    let config = config();
    StrategyContext {
        execution: Arc::new(context()),
        inference,
        resources,
        limits: config.limits.clone(),
        retry: sift_core::config::RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        },
        cancel: CancellationToken::new(),
    }
}

/// `n` candidate threads as a list operation would return them.
pub fn threads(n: usize) -> Value {
    Value::Array(
        (1..=n)
            .map(|i| {
                json!({
                    "thread_id": format!("t{}", i),
                    "subject": format!("Thread number {}", i),
                    "from": format!("person{}@example.com", i),
                    "snippet": "Could you get back to me on this?",
                })
            })
            .collect(),
    )
}

/// Full content of one thread, as a fetch operation would return it.
pub fn thread_body(id: &str) -> Value {
    json!({
        "thread_id": id,
        "subject": format!("Subject of {}", id),
        "messages": [
            {"from": "colleague@example.com", "body": format!("Body text of {} asking for a reply.", id)}
        ]
    })
}

/// Today's events, as a calendar list operation would return them.
pub fn events_today() -> Value {
    json!([
        {"event_id": "evt_1", "title": "Standup", "start": "09:00", "end": "09:15"},
        {"event_id": "evt_2", "title": "Design review", "start": "14:00", "end": "15:00"},
    ])
}

/// Planner output for "What's on my calendar today?".
pub fn calendar_today_plan() -> Value {
    json!({
        "classification": {"query_type": "lookup", "domains": ["calendar"]},
        "nodes": [{
            "id": "n1",
            "description": "List today's events",
            "type": "metadata-filter",
            "params": {"operation": "list_events", "filters": {"date": "2024-03-12"}},
            "stage": 1,
            "estimate": {"external_calls": 1, "time_ms": 400}
        }],
        "synthesis_instructions": {"focus": "List today's events with times", "format": "short list"},
        "resource_estimate": {"tokens": 0, "external_calls": 1, "inference_calls": 0,
                              "time_ms": 400, "cost_usd": 0.0, "requires_confirmation": false}
    })
}

/// Planner output for "Find emails I haven't replied to this week and summarize them".
///
/// Estimates assume 20 threads at 120 tokens per analysis call.
pub fn unreplied_summary_plan() -> Value {
    json!({
        "classification": {"query_type": "summarize", "domains": ["mail"]},
        "nodes": [
            {
                "id": "n1",
                "description": "Find unreplied threads from this week",
                "type": "metadata-filter",
                "params": {"operation": "list_threads", "filters": {"unreplied": true, "since": "2024-03-11"}, "limit": 20},
                "stage": 1,
                "estimate": {"external_calls": 1, "time_ms": 500}
            },
            {
                "id": "n2",
                "description": "Summarize each unreplied thread",
                "type": "batch-content-analysis",
                "params": {
                    "units": {"$ref": "n1.items[*].thread_id"},
                    "instruction": "Summarize what the sender needs from me"
                },
                "depends_on": ["n1"],
                "stage": 2,
                "estimate": {"tokens": 2400, "external_calls": 20, "inference_calls": 20, "time_ms": 6000, "cost_usd": 0.01}
            }
        ],
        "synthesis_instructions": "List every thread with a one-line summary",
        "resource_estimate": {"tokens": 2400, "external_calls": 21, "inference_calls": 20,
                              "time_ms": 6500, "cost_usd": 0.01, "requires_confirmation": false}
    })
}

/// A plan made only of `strategy` nodes, given as (id, stage, depends_on, params).
///
/// Every node is estimated at one external call, and the totals add up.
pub fn stub_plan(strategy: &str, nodes: &[(&str, u32, Vec<&str>, Value)]) -> Value {
    let entries: Vec<Value> = nodes
        .iter()
        .map(|(id, stage, deps, params)| {
            json!({
                "id": id,
                "description": format!("Stub {}", id),
                "type": strategy,
                "params": params,
                "depends_on": deps,
                "stage": stage,
                "estimate": {"external_calls": 1, "time_ms": 10}
            })
        })
        .collect();
    json!({
        "classification": {"query_type": "lookup", "domains": ["mail"]},
        "nodes": entries,
        "synthesis_instructions": "Report the stub values",
        "resource_estimate": {"tokens": 0, "external_calls": nodes.len(), "inference_calls": 0,
                              "time_ms": 10 * nodes.len(), "cost_usd": 0.0, "requires_confirmation": false}
    })
}
