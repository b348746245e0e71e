use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::config::{OutputLimits, RetryConfig};
use crate::error::Result;
use crate::record::ExecutionRecord;
use crate::types::*;

/// Language-model inference service.
pub trait InferenceService: Send + Sync + 'static {
    /// Run one inference call and report its token usage.
    fn infer(&self, request: InferenceRequest) -> BoxFuture<'_, Result<InferenceResponse>>;

    /// Identifier used in logs.
    fn name(&self) -> &str {
        "inference"
    }
}

/// One capability-scoped operation against the caller's resources.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    /// Operation name, e.g. "list_events", "fetch_thread", "send_message".
    pub operation: String,
    pub params: serde_json::Value,
    pub request_id: RequestId,
    /// Opaque, already-authorized credential from the caller.
    pub authorization: Option<String>,
}

/// Resource access service (mail, calendar, contacts).
pub trait ResourceService: Send + Sync + 'static {
    fn call(&self, request: ResourceRequest) -> BoxFuture<'_, Result<serde_json::Value>>;
}

/// Everything a strategy may use while executing one node.
#[derive(Clone)]
pub struct StrategyContext {
    pub execution: Arc<ExecutionContext>,
    pub inference: Arc<dyn InferenceService>,
    pub resources: Arc<dyn ResourceService>,
    pub limits: OutputLimits,
    pub retry: RetryConfig,
    pub cancel: CancellationToken,
}

impl StrategyContext {
    /// Build a resource request scoped to this execution.
    pub fn resource_request(&self, operation: &str, params: serde_json::Value) -> ResourceRequest {
        ResourceRequest {
            operation: operation.to_string(),
            params,
            request_id: self.execution.request_id.clone(),
            authorization: self.execution.authorization.clone(),
        }
    }
}

impl std::fmt::Debug for StrategyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyContext")
            .field("execution", &self.execution)
            .field("inference", &self.inference.name())
            .field("limits", &self.limits)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// What a strategy hands back: a bounded payload plus what it cost.
#[derive(Debug, Clone)]
pub struct StrategyOutput {
    pub payload: Payload,
    pub cost: CostMetadata,
}

/// Strategy: executor for exactly one capability type.
pub trait Strategy: Send + Sync + 'static {
    /// Capability name referenced by a node's `type`.
    fn name(&self) -> &str;

    /// Human-readable description for the planner's catalog.
    fn description(&self) -> &str;

    /// Example/shape of accepted params, shown to the planner.
    fn params_hint(&self) -> serde_json::Value;

    /// Execute with resolved params. Must bound its own output size.
    fn execute(
        &self,
        params: serde_json::Value,
        ctx: StrategyContext,
    ) -> BoxFuture<'_, Result<StrategyOutput>>;

    /// Whether this strategy changes external state.
    fn is_mutating(&self) -> bool {
        false
    }

    /// Whether this strategy calls the inference service.
    fn uses_inference(&self) -> bool {
        false
    }
}

/// Destination for the per-request execution record.
pub trait RecordSink: Send + Sync + 'static {
    fn record(&self, record: &ExecutionRecord) -> BoxFuture<'_, Result<()>>;
}
