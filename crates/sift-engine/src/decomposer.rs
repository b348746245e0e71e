use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use sift_core::config::DecomposerConfig;
use sift_core::error::{Result, SiftError};
use sift_core::graph::ExecutionGraph;
use sift_core::traits::InferenceService;
use sift_core::types::{ConversationTurn, CostMetadata, ExecutionContext, ExecutionReport, InferenceRequest, Role};
use sift_strategies::util::{extract_json, truncate_chars};
use sift_strategies::StrategyRegistry;

const PRIOR_RESULT_CHARS: usize = 600;

const SYSTEM_PROMPT: &str = "\
You plan how to answer questions about the user's mail, calendar and contacts. \
You never answer the question yourself. You reply with one JSON object describing \
an execution graph, and nothing else.";

const PLAN_FORMAT: &str = r#"Plan format:
{
  "classification": {"query_type": "lookup | summarize | compare | action", "domains": ["mail", "calendar", "contacts"]},
  "nodes": [
    {
      "id": "n1",
      "description": "what this step finds, in plain words",
      "type": "<one of the step types above>",
      "params": { ... },
      "depends_on": [],
      "stage": 1,
      "estimate": {"tokens": 0, "external_calls": 1, "inference_calls": 0, "time_ms": 500, "cost_usd": 0.0}
    }
  ],
  "synthesis_instructions": {"focus": "what the final answer must cover", "format": "list | prose | table", "notes": []},
  "resource_estimate": {"tokens": 0, "external_calls": 1, "inference_calls": 0, "time_ms": 500, "cost_usd": 0.0, "requires_confirmation": false}
}
Rules:
- Use as few steps as possible. Steps in the same stage run in parallel.
- Stages are numbered 1, 2, 3 ... without gaps.
- A step may only depend on steps in an earlier stage, and must list them in depends_on.
- To use an earlier step's output, write {"$ref": "n1.items[*].thread_id"} (node id, then a path into its output).
  Outputs look like {"kind": "items", "items": [...], "total": n}, {"kind": "text", "text": "..."}
  or {"kind": "analysis", "units": [...], "failed": [...], "total": n}.
- resource_estimate must equal the sum of the node estimates.
- Set requires_confirmation to true if the plan changes any data."#;

/// Output of a successful planning call.
#[derive(Debug, Clone)]
pub struct Decomposition {
    pub graph: ExecutionGraph,
    /// Cost of the planning call itself.
    pub cost: CostMetadata,
}

/// Turns a request into a validated ExecutionGraph with one inference call.
///
/// Plans that fail validation are rejected, never repaired.
pub struct Decomposer {
    inference: Arc<dyn InferenceService>,
    registry: Arc<StrategyRegistry>,
    config: DecomposerConfig,
}

impl Decomposer {
    pub fn new(
        inference: Arc<dyn InferenceService>,
        registry: Arc<StrategyRegistry>,
        config: DecomposerConfig,
    ) -> Self {
        Self {
            inference,
            registry,
            config,
        }
    }

    #[instrument(skip_all, fields(request_id = %ctx.request_id))]
    pub async fn decompose(
        &self,
        query: &str,
        history: &[ConversationTurn],
        ctx: &ExecutionContext,
    ) -> Result<Decomposition> {
        let prompt = self.build_prompt(query, history, ctx, None);
        self.plan(prompt).await
    }

    /// Plan again with the results of an earlier run as extra context.
    ///
    /// The earlier graph is left untouched; a new graph is produced.
    #[instrument(skip_all, fields(request_id = %ctx.request_id))]
    pub async fn replan(
        &self,
        query: &str,
        history: &[ConversationTurn],
        ctx: &ExecutionContext,
        prior: &ExecutionReport,
    ) -> Result<Decomposition> {
        let prompt = self.build_prompt(query, history, ctx, Some(prior));
        self.plan(prompt).await
    }

    async fn plan(&self, prompt: String) -> Result<Decomposition> {
        let request =
            InferenceRequest::json(prompt, self.config.max_output_tokens).with_system(SYSTEM_PROMPT);
        let response = self.inference.infer(request).await?;
        let mut cost = CostMetadata::default();
        cost.record_inference(&response);

        let value = extract_json(&response.text).map_err(|e| {
            warn!(error = %e, "Planner reply was not JSON");
            SiftError::Decomposition {
                reason: format!("planner reply was not a JSON plan ({})", e),
                violations: vec![],
            }
        })?;
        let graph = ExecutionGraph::from_json(value, |name| self.registry.contains(name))?;

        info!(
            nodes = graph.node_count(),
            stages = graph.stage_count(),
            query_type = %graph.classification().query_type,
            "Plan validated"
        );
        Ok(Decomposition { graph, cost })
    }

    fn build_prompt(
        &self,
        query: &str,
        history: &[ConversationTurn],
        ctx: &ExecutionContext,
        prior: Option<&ExecutionReport>,
    ) -> String {
        let mut prompt = String::new();
        prompt.push_str("## Available step types\n");
        prompt.push_str(&self.registry.catalog());
        prompt.push_str("\n## Resources\n");
        prompt.push_str(&ctx.describe_resources());

        let skip = history.len().saturating_sub(self.config.max_context_turns);
        let recent = &history[skip..];
        if !recent.is_empty() {
            prompt.push_str("\n## Recent conversation\n");
            for turn in recent {
                let who = match turn.role {
                    Role::User => "User",
                    Role::Assistant => "Assistant",
                };
                prompt.push_str(&format!("{}: {}\n", who, truncate_chars(&turn.text, 500)));
            }
        }

        if let Some(report) = prior {
            debug!(results = report.results.len(), "Including earlier results");
            prompt.push_str("\n## Already known from an earlier run\n");
            prompt.push_str("Do not repeat these lookups; plan only the additional work.\n");
            for result in report.results.values() {
                match (&result.payload, &result.error) {
                    (Some(payload), _) if result.success => prompt.push_str(&format!(
                        "- {}:\n{}\n",
                        result.description,
                        truncate_chars(payload.render_compact().trim_end(), PRIOR_RESULT_CHARS)
                    )),
                    (_, Some(error)) => prompt.push_str(&format!(
                        "- {}: unavailable because {}\n",
                        result.description,
                        error.detail()
                    )),
                    _ => {}
                }
            }
        }

        prompt.push('\n');
        prompt.push_str(PLAN_FORMAT);
        prompt.push_str(&format!("\n\n## Request\n{}\n", query.trim()));
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use sift_core::types::{ExecutionStatus, NodeError, NodeResult, Payload};
    use sift_test_utils::{fixtures, MockInference};

    fn decomposer(inference: Arc<MockInference>, turns: usize) -> Decomposer {
        Decomposer::new(
            inference,
            Arc::new(StrategyRegistry::with_builtins()),
            DecomposerConfig {
                max_context_turns: turns,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_single_node_calendar_plan() {
        let inference =
            Arc::new(MockInference::new().default_reply(fixtures::calendar_today_plan().to_string()));
        let out = decomposer(inference, 4)
            .decompose("What's on my calendar today?", &[], &fixtures::context())
            .await
            .unwrap();
        assert_eq!(out.graph.node_count(), 1);
        assert_eq!(out.graph.stage_count(), 1);
        assert_eq!(out.graph.resource_estimate().inference_calls, 0);
        assert_eq!(out.cost.inference_calls, 1);
    }

    #[tokio::test]
    async fn test_prompt_carries_catalog_resources_and_recent_turns() {
        let inference =
            Arc::new(MockInference::new().default_reply(fixtures::calendar_today_plan().to_string()));
        let history = vec![
            ConversationTurn::user("oldest question"),
            ConversationTurn::assistant("old answer"),
            ConversationTurn::user("latest question"),
        ];
        decomposer(inference.clone(), 2)
            .decompose("And tomorrow?", &history, &fixtures::context())
            .await
            .unwrap();

        let calls = inference.calls();
        let request = calls.lock().unwrap()[0].clone();
        assert!(request.prompt.contains("\"metadata-filter\""));
        assert!(request.prompt.contains("Europe/Berlin"));
        assert!(request.prompt.contains("latest question"));
        assert!(!request.prompt.contains("oldest question"));
        assert!(request.prompt.ends_with("And tomorrow?\n"));
        assert!(request.system.is_some());
    }

    #[tokio::test]
    async fn test_non_json_reply_is_decomposition_error() {
        let inference = Arc::new(MockInference::new().default_reply("I'd check your calendar."));
        let err = decomposer(inference, 4)
            .decompose("What's on today?", &[], &fixtures::context())
            .await
            .unwrap_err();
        assert!(matches!(err, SiftError::Decomposition { .. }));
    }

    #[tokio::test]
    async fn test_unknown_strategy_rejected_at_planning() {
        let mut plan = fixtures::calendar_today_plan();
        plan["nodes"][0]["type"] = "telepathy".into();
        let inference = Arc::new(MockInference::new().default_reply(plan.to_string()));
        let err = decomposer(inference, 4)
            .decompose("What's on today?", &[], &fixtures::context())
            .await
            .unwrap_err();
        match err {
            SiftError::Decomposition { violations, .. } => {
                assert!(violations.iter().any(|v| v.contains("telepathy")))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_replan_includes_prior_results() {
        let inference =
            Arc::new(MockInference::new().default_reply(fixtures::calendar_today_plan().to_string()));
        let graph = ExecutionGraph::from_json(fixtures::unreplied_summary_plan(), |_| true).unwrap();
        let n1 = graph.node("n1").unwrap();
        let n2 = graph.node("n2").unwrap();
        let mut results = BTreeMap::new();
        results.insert(
            "n1".to_string(),
            NodeResult::succeeded(
                n1,
                Payload::Items {
                    items: vec![serde_json::json!({"thread_id": "thr-zq9x", "subject": "Quarterly numbers"})],
                    total: 1,
                },
                CostMetadata::default(),
            ),
        );
        results.insert(
            "n2".to_string(),
            NodeResult::failed(n2, NodeError::Timeout { after_ms: 5000 }, CostMetadata::default()),
        );
        let prior = ExecutionReport {
            results,
            status: ExecutionStatus::Partial,
            stages_completed: 2,
            total_stages: 2,
            elapsed_ms: 10,
        };

        decomposer(inference.clone(), 4)
            .replan("Summarize the rest", &[], &fixtures::context(), &prior)
            .await
            .unwrap();
        let calls = inference.calls();
        let prompt = calls.lock().unwrap()[0].prompt.clone();
        assert!(prompt.contains("Already known from an earlier run"));
        assert!(prompt.contains("subject: Quarterly numbers"));
        assert!(prompt.contains("unavailable because it took longer than 5s"));
        assert!(!prompt.contains("thr-zq9x"));
    }
}
