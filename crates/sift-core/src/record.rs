use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::{BudgetVariance, ExecutionGraph, ResourceEstimate};
use crate::state::PipelineState;
use crate::types::{CostMetadata, ExecutionReport, ExecutionStatus, NodeError, RequestId};

/// Per-node line of an execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub strategy: String,
    pub stage: u32,
    pub depends_on: Vec<String>,
    /// None until the node has run.
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
    #[serde(default)]
    pub cost: CostMetadata,
}

/// One structured record per request: graph shape, per-node cost and
/// timing, and the final outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub request_id: RequestId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub query_chars: usize,
    pub final_state: PipelineState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_type: Option<String>,
    pub stages: usize,
    pub nodes: Vec<NodeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_status: Option<ExecutionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<ResourceEstimate>,
    #[serde(default)]
    pub actual: CostMetadata,
    /// Tokens spent outside nodes (planning and synthesis).
    #[serde(default)]
    pub overhead: CostMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variance: Option<BudgetVariance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub within_tolerance: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub fn new(request_id: RequestId, query: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            request_id,
            started_at,
            finished_at: started_at,
            query_chars: query.chars().count(),
            final_state: PipelineState::Decomposing,
            query_type: None,
            stages: 0,
            nodes: Vec::new(),
            execution_status: None,
            estimate: None,
            actual: CostMetadata::default(),
            overhead: CostMetadata::default(),
            variance: None,
            within_tolerance: None,
            error: None,
        }
    }

    /// Record the graph's shape before anything runs.
    pub fn with_graph(mut self, graph: &ExecutionGraph) -> Self {
        self.query_type = Some(graph.classification().query_type.clone());
        self.stages = graph.stage_count();
        self.estimate = Some(*graph.resource_estimate());
        self.nodes = graph
            .nodes()
            .map(|n| NodeRecord {
                node_id: n.id.clone(),
                strategy: n.strategy.clone(),
                stage: n.stage,
                depends_on: n.depends_on.clone(),
                success: None,
                error: None,
                cost: CostMetadata::default(),
            })
            .collect();
        self
    }

    /// Fold node results and the budget comparison into the record.
    pub fn with_report(mut self, report: &ExecutionReport, tolerance_pct: u32) -> Self {
        for node in &mut self.nodes {
            if let Some(result) = report.results.get(&node.node_id) {
                node.success = Some(result.success);
                node.error = result.error.clone();
                node.cost = result.cost;
            }
        }
        self.execution_status = Some(report.status);
        self.actual = report.total_cost();
        if let Some(estimate) = self.estimate {
            let variance = estimate.variance(&self.actual);
            self.within_tolerance = Some(variance.within(tolerance_pct));
            self.variance = Some(variance);
        }
        self
    }

    pub fn finish(mut self, state: PipelineState, error: Option<String>) -> Self {
        self.final_state = state;
        self.error = error;
        self.finished_at = Utc::now();
        self
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}
