use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::time::Instant;

use sift_core::error::{Result, SiftError};
use sift_core::traits::{Strategy, StrategyContext, StrategyOutput};
use sift_core::types::{CostMetadata, Payload};

/// One recorded stub invocation.
#[derive(Debug, Clone)]
pub struct StubCall {
    pub tag: String,
    pub params: Value,
    pub started: Instant,
    pub finished: Option<Instant>,
}

/// Shared log of stub invocations.
#[derive(Debug, Clone, Default)]
pub struct StubLog(Arc<Mutex<Vec<StubCall>>>);

impl StubLog {
    pub fn calls(&self) -> Vec<StubCall> {
        self.0.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn get(&self, tag: &str) -> Option<StubCall> {
        self.calls().into_iter().find(|c| c.tag == tag)
    }

    fn start(&self, tag: String, params: Value) -> usize {
        let mut calls = self.0.lock().unwrap_or_else(|e| e.into_inner());
        calls.push(StubCall {
            tag,
            params,
            started: Instant::now(),
            finished: None,
        });
        calls.len() - 1
    }

    fn finish(&self, idx: usize) {
        let mut calls = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(call) = calls.get_mut(idx) {
            call.finished = Some(Instant::now());
        }
    }
}

/// A strategy that records when it ran and with which params.
///
/// Params may carry `"tag"` (echoed back), `"delay_ms"` (overrides the
/// default delay) and `"fail": true`.
pub struct StubStrategy {
    name: String,
    delay: Duration,
    mutating: bool,
    log: StubLog,
}

impl StubStrategy {
    pub fn new(name: &str, log: StubLog) -> Self {
        Self {
            name: name.to_string(),
            delay: Duration::from_millis(10),
            mutating: false,
            log,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn mutating(mut self) -> Self {
        self.mutating = true;
        self
    }
}

impl Strategy for StubStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Test stub"
    }

    fn params_hint(&self) -> Value {
        json!({"tag": "string"})
    }

    fn is_mutating(&self) -> bool {
        self.mutating
    }

    fn execute(&self, params: Value, _ctx: StrategyContext) -> BoxFuture<'_, Result<StrategyOutput>> {
        Box::pin(async move {
            let tag = params["tag"].as_str().unwrap_or("").to_string();
            let delay = params["delay_ms"]
                .as_u64()
                .map(Duration::from_millis)
                .unwrap_or(self.delay);
            let fail = params["fail"].as_bool().unwrap_or(false);

            let idx = self.log.start(tag.clone(), params.clone());
            tokio::time::sleep(delay).await;
            self.log.finish(idx);

            if fail {
                return Err(SiftError::NodeExecution {
                    node: tag,
                    message: "stub asked to fail".into(),
                });
            }
            Ok(StrategyOutput {
                payload: Payload::Items {
                    items: vec![json!({"tag": tag, "value": format!("value-of-{}", tag)})],
                    total: 1,
                },
                cost: CostMetadata {
                    external_calls: 1,
                    ..Default::default()
                },
            })
        })
    }
}
