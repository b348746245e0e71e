use tracing::{debug, warn};

use sift_core::config::BudgetConfig;
use sift_core::graph::ExecutionGraph;

/// Outcome of checking a plan against the configured budget.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetDecision {
    /// Execute right away.
    Proceed,
    /// Pause until the caller confirms. Each entry explains one trigger.
    NeedsConfirmation(Vec<String>),
    /// Above an absolute ceiling; never executed.
    Reject(String),
}

/// Decides whether a validated plan may run, must be confirmed, or is refused.
pub struct BudgetPolicy {
    config: BudgetConfig,
}

impl BudgetPolicy {
    pub fn new(config: BudgetConfig) -> Self {
        Self { config }
    }

    pub fn tolerance_pct(&self) -> u32 {
        self.config.tolerance_pct
    }

    /// Assess `graph`. `is_mutating` reports whether a strategy changes data.
    pub fn assess<F>(&self, graph: &ExecutionGraph, is_mutating: F) -> BudgetDecision
    where
        F: Fn(&str) -> bool,
    {
        let est = graph.resource_estimate();
        let nodes = graph.node_count();
        let c = &self.config;

        let mut ceilings = Vec::new();
        if est.tokens > c.reject_above_tokens {
            ceilings.push(format!("{} tokens (limit {})", est.tokens, c.reject_above_tokens));
        }
        if est.external_calls > c.reject_above_external_calls {
            ceilings.push(format!(
                "{} service calls (limit {})",
                est.external_calls, c.reject_above_external_calls
            ));
        }
        if nodes > c.reject_above_nodes {
            ceilings.push(format!("{} steps (limit {})", nodes, c.reject_above_nodes));
        }
        if !ceilings.is_empty() {
            let reason = ceilings.join(", ");
            warn!(%reason, "Plan exceeds budget ceiling");
            return BudgetDecision::Reject(reason);
        }

        let mut reasons = Vec::new();
        if est.requires_confirmation {
            reasons.push("the plan asks for confirmation".to_string());
        }
        let writes: Vec<&str> = graph
            .nodes()
            .filter(|n| is_mutating(&n.strategy))
            .map(|n| n.description.as_str())
            .collect();
        if !writes.is_empty() {
            reasons.push(format!("it changes data: {}", writes.join("; ")));
        }
        if est.tokens > c.confirm_above_tokens {
            reasons.push(format!("about {} tokens", est.tokens));
        }
        if est.external_calls > c.confirm_above_external_calls {
            reasons.push(format!("{} service calls", est.external_calls));
        }
        if nodes > c.confirm_above_nodes {
            reasons.push(format!("{} steps", nodes));
        }
        if est.cost_usd > c.confirm_above_cost_usd {
            reasons.push(format!("about ${:.2}", est.cost_usd));
        }

        if reasons.is_empty() {
            debug!(tokens = est.tokens, calls = est.external_calls, nodes, "Plan within budget");
            BudgetDecision::Proceed
        } else {
            BudgetDecision::NeedsConfirmation(reasons)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sift_test_utils::fixtures;

    fn graph(plan: serde_json::Value) -> ExecutionGraph {
        ExecutionGraph::from_json(plan, |_| true).unwrap()
    }

    #[test]
    fn test_small_plan_proceeds() {
        let policy = BudgetPolicy::new(BudgetConfig::default());
        let decision = policy.assess(&graph(fixtures::calendar_today_plan()), |_| false);
        assert_eq!(decision, BudgetDecision::Proceed);
    }

    #[test]
    fn test_threshold_needs_confirmation() {
        let policy = BudgetPolicy::new(BudgetConfig {
            confirm_above_external_calls: 10,
            ..Default::default()
        });
        match policy.assess(&graph(fixtures::unreplied_summary_plan()), |_| false) {
            BudgetDecision::NeedsConfirmation(reasons) => {
                assert_eq!(reasons, vec!["21 service calls".to_string()])
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_flag_and_writes_need_confirmation() {
        let mut plan = fixtures::calendar_today_plan();
        plan["resource_estimate"]["requires_confirmation"] = true.into();
        let policy = BudgetPolicy::new(BudgetConfig::default());
        match policy.assess(&graph(plan), |name| name == "metadata-filter") {
            BudgetDecision::NeedsConfirmation(reasons) => {
                assert_eq!(reasons.len(), 2);
                assert!(reasons[1].contains("List today's events"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ceiling_rejects() {
        let policy = BudgetPolicy::new(BudgetConfig {
            reject_above_tokens: 1000,
            ..Default::default()
        });
        match policy.assess(&graph(fixtures::unreplied_summary_plan()), |_| false) {
            BudgetDecision::Reject(reason) => assert!(reason.contains("2400 tokens")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
