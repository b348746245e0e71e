use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SiftError};
use crate::placeholder;
use crate::types::CostMetadata;

/// Per-node projected cost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeEstimate {
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub external_calls: u32,
    #[serde(default)]
    pub inference_calls: u32,
    #[serde(default)]
    pub time_ms: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

/// Projected totals for a whole graph.
///
/// `time_ms` is a wall-clock projection and is not required to equal the
/// per-node sum, since nodes in one stage overlap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceEstimate {
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub external_calls: u32,
    #[serde(default)]
    pub inference_calls: u32,
    #[serde(default)]
    pub time_ms: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub requires_confirmation: bool,
}

const COST_EPSILON_USD: f64 = 0.0005;

impl ResourceEstimate {
    /// Differences between the declared totals and the per-node sums.
    fn inconsistencies(&self, nodes: &[InformationNode]) -> Vec<String> {
        let tokens = nodes.iter().try_fold(0u64, |acc, n| acc.checked_add(n.estimate.tokens));
        let external = nodes
            .iter()
            .try_fold(0u32, |acc, n| acc.checked_add(n.estimate.external_calls));
        let inference = nodes
            .iter()
            .try_fold(0u32, |acc, n| acc.checked_add(n.estimate.inference_calls));
        let cost: f64 = nodes.iter().map(|n| n.estimate.cost_usd).sum();

        let mut out = Vec::new();
        match tokens {
            None => out.push("node token estimates overflow".to_string()),
            Some(tokens) if tokens != self.tokens => out.push(format!(
                "resource_estimate.tokens is {} but nodes sum to {}",
                self.tokens, tokens
            )),
            Some(_) => {}
        }
        match external {
            None => out.push("node external_calls estimates overflow".to_string()),
            Some(external) if external != self.external_calls => out.push(format!(
                "resource_estimate.external_calls is {} but nodes sum to {}",
                self.external_calls, external
            )),
            Some(_) => {}
        }
        match inference {
            None => out.push("node inference_calls estimates overflow".to_string()),
            Some(inference) if inference != self.inference_calls => out.push(format!(
                "resource_estimate.inference_calls is {} but nodes sum to {}",
                self.inference_calls, inference
            )),
            Some(_) => {}
        }
        if !cost.is_finite() {
            out.push("node cost_usd estimates are not finite".to_string());
        }
        if (cost - self.cost_usd).abs() > COST_EPSILON_USD {
            out.push(format!(
                "resource_estimate.cost_usd is {:.4} but nodes sum to {:.4}",
                self.cost_usd, cost
            ));
        }
        out
    }

    /// Compare this estimate with the costs actually incurred.
    pub fn variance(&self, actual: &CostMetadata) -> BudgetVariance {
        BudgetVariance {
            estimated_tokens: self.tokens,
            actual_tokens: actual.tokens(),
            estimated_external_calls: self.external_calls,
            actual_external_calls: actual.external_calls,
            estimated_inference_calls: self.inference_calls,
            actual_inference_calls: actual.inference_calls,
            token_deviation_pct: deviation_pct(self.tokens, actual.tokens()),
            call_deviation_pct: deviation_pct(
                u64::from(self.external_calls) + u64::from(self.inference_calls),
                u64::from(actual.external_calls) + u64::from(actual.inference_calls),
            ),
        }
    }
}

fn deviation_pct(estimated: u64, actual: u64) -> f64 {
    if estimated == actual {
        return 0.0;
    }
    let base = estimated.max(1) as f64;
    (actual as f64 - estimated as f64).abs() / base * 100.0
}

/// Post-hoc comparison of estimate and actual cost.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetVariance {
    pub estimated_tokens: u64,
    pub actual_tokens: u64,
    pub estimated_external_calls: u32,
    pub actual_external_calls: u32,
    pub estimated_inference_calls: u32,
    pub actual_inference_calls: u32,
    pub token_deviation_pct: f64,
    pub call_deviation_pct: f64,
}

impl BudgetVariance {
    pub fn within(&self, tolerance_pct: u32) -> bool {
        let tol = f64::from(tolerance_pct);
        self.token_deviation_pct <= tol && self.call_deviation_pct <= tol
    }
}

/// What kind of request this is and which services it touches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    #[serde(default)]
    pub query_type: String,
    #[serde(default)]
    pub domains: Vec<String>,
}

/// Guidance the planner leaves for the synthesis step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SynthesisInstructions {
    #[serde(default)]
    pub focus: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub notes: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InstructionsDraft {
    Plain(String),
    Full(SynthesisInstructions),
}

impl Default for InstructionsDraft {
    fn default() -> Self {
        Self::Full(SynthesisInstructions::default())
    }
}

impl From<InstructionsDraft> for SynthesisInstructions {
    fn from(draft: InstructionsDraft) -> Self {
        match draft {
            InstructionsDraft::Plain(focus) => Self {
                focus,
                ..Default::default()
            },
            InstructionsDraft::Full(full) => full,
        }
    }
}

/// One unit of work: a strategy invocation with dependencies and a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InformationNode {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub strategy: String,
    #[serde(default = "empty_params")]
    pub params: serde_json::Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub stage: u32,
    #[serde(default)]
    pub estimate: NodeEstimate,
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl InformationNode {
    pub fn has_placeholders(&self) -> bool {
        placeholder::contains_placeholder(&self.params)
    }
}

/// Nodes that may run concurrently.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stage {
    pub number: u32,
    pub nodes: Vec<InformationNode>,
}

/// Plan as emitted by the decomposition model, before validation.
#[derive(Debug, Deserialize)]
pub struct GraphDraft {
    #[serde(default)]
    pub classification: Classification,
    #[serde(default)]
    pub nodes: Vec<InformationNode>,
    #[serde(default)]
    synthesis_instructions: InstructionsDraft,
    #[serde(default)]
    pub resource_estimate: Option<ResourceEstimate>,
}

impl GraphDraft {
    /// Validate the draft and group its nodes into stages.
    ///
    /// Every violation is collected; the draft is rejected if any is found.
    /// Nothing is repaired.
    pub fn into_graph<F>(self, is_known_strategy: F) -> Result<ExecutionGraph>
    where
        F: Fn(&str) -> bool,
    {
        let mut violations = Vec::new();

        if self.nodes.is_empty() {
            violations.push("plan contains no nodes".to_string());
        }

        let mut stage_of: HashMap<&str, u32> = HashMap::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                violations.push("a node has an empty id".to_string());
                continue;
            }
            if stage_of.insert(node.id.as_str(), node.stage).is_some() {
                violations.push(format!("duplicate node id '{}'", node.id));
            }
        }

        let stages: BTreeSet<u32> = self.nodes.iter().map(|n| n.stage).collect();
        if stages.contains(&0) {
            violations.push("stage numbers must start at 1".to_string());
        }
        if let Some(&max) = stages.iter().next_back() {
            let missing: Vec<String> = (1..=max)
                .filter(|s| !stages.contains(s))
                .map(|s| s.to_string())
                .collect();
            if !missing.is_empty() {
                violations.push(format!("stage numbers have gaps: missing {}", missing.join(", ")));
            }
        }

        for node in &self.nodes {
            if !is_known_strategy(&node.strategy) {
                violations.push(format!("node '{}' has unknown type '{}'", node.id, node.strategy));
            }

            let mut seen = BTreeSet::new();
            for dep in &node.depends_on {
                if !seen.insert(dep.as_str()) {
                    violations.push(format!("node '{}' lists dependency '{}' twice", node.id, dep));
                    continue;
                }
                match stage_of.get(dep.as_str()) {
                    None => violations.push(format!(
                        "node '{}' depends on unknown node '{}'",
                        node.id, dep
                    )),
                    Some(&dep_stage) if dep_stage >= node.stage => violations.push(format!(
                        "node '{}' (stage {}) depends on '{}' which is not in an earlier stage ({})",
                        node.id, node.stage, dep, dep_stage
                    )),
                    Some(_) => {}
                }
            }

            match placeholder::collect(&node.params) {
                Ok(refs) => {
                    for r in refs {
                        if !node.depends_on.contains(&r.node_id) {
                            violations.push(format!(
                                "node '{}' references '{}' which is not in its depends_on",
                                node.id, r
                            ));
                        }
                    }
                }
                Err(e) => violations.push(format!("node '{}': {}", node.id, e)),
            }
        }

        let resource_estimate = match self.resource_estimate {
            Some(est) => {
                violations.extend(est.inconsistencies(&self.nodes));
                est
            }
            None => {
                violations.push("resource_estimate is missing".to_string());
                ResourceEstimate::default()
            }
        };

        if !violations.is_empty() {
            return Err(SiftError::invalid_plan(violations));
        }

        let mut grouped: BTreeMap<u32, Vec<InformationNode>> = BTreeMap::new();
        for node in self.nodes {
            grouped.entry(node.stage).or_default().push(node);
        }
        let stages = grouped
            .into_iter()
            .map(|(number, nodes)| Stage { number, nodes })
            .collect();

        Ok(ExecutionGraph {
            classification: self.classification,
            stages,
            synthesis_instructions: self.synthesis_instructions.into(),
            resource_estimate,
        })
    }
}

/// A validated, stage-grouped plan. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionGraph {
    classification: Classification,
    stages: Vec<Stage>,
    synthesis_instructions: SynthesisInstructions,
    resource_estimate: ResourceEstimate,
}

impl ExecutionGraph {
    /// Parse and validate the decomposition model's JSON plan.
    pub fn from_json<F>(value: serde_json::Value, is_known_strategy: F) -> Result<Self>
    where
        F: Fn(&str) -> bool,
    {
        let draft: GraphDraft = serde_json::from_value(value).map_err(|e| SiftError::Decomposition {
            reason: format!("plan is not well-formed: {}", e),
            violations: vec![e.to_string()],
        })?;
        draft.into_graph(is_known_strategy)
    }

    pub fn classification(&self) -> &Classification {
        &self.classification
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn synthesis_instructions(&self) -> &SynthesisInstructions {
        &self.synthesis_instructions
    }

    pub fn resource_estimate(&self) -> &ResourceEstimate {
        &self.resource_estimate
    }

    pub fn nodes(&self) -> impl Iterator<Item = &InformationNode> {
        self.stages.iter().flat_map(|s| s.nodes.iter())
    }

    pub fn node(&self, id: &str) -> Option<&InformationNode> {
        self.nodes().find(|n| n.id == id)
    }

    pub fn node_count(&self) -> usize {
        self.stages.iter().map(|s| s.nodes.len()).sum()
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Distinct strategy names used by this plan.
    pub fn strategies(&self) -> BTreeSet<&str> {
        self.nodes().map(|n| n.strategy.as_str()).collect()
    }

    /// Human-readable overview, shown when asking the caller to confirm.
    pub fn summary(&self) -> String {
        let est = &self.resource_estimate;
        let mut out = format!(
            "{} step(s) in {} stage(s); about {} tokens, {} service call(s), {} model call(s), ~{}s",
            self.node_count(),
            self.stage_count(),
            est.tokens,
            est.external_calls,
            est.inference_calls,
            est.time_ms.div_ceil(1000),
        );
        if est.cost_usd > 0.0 {
            out.push_str(&format!(", ~${:.2}", est.cost_usd));
        }
        out.push('\n');
        for stage in &self.stages {
            for node in &stage.nodes {
                out.push_str(&format!("  {}. {} [{}]\n", stage.number, node.description, node.strategy));
            }
        }
        out
    }
}
