use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SiftError;
use crate::graph::InformationNode;
use crate::state::PipelineState;

/// Unique identifier for one request's pipeline run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn of recent conversation supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// A connected account the caller has authorized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    /// Service kind, e.g. "mail" or "calendar".
    pub kind: String,
    pub address: String,
}

/// Request-scoped, already-authorized context handed in by the caller.
///
/// The core never manages credentials: `authorization` is forwarded verbatim
/// to the resource service.
#[derive(Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub request_id: RequestId,
    pub now: DateTime<Utc>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub calendars: Vec<String>,
    #[serde(default, skip_serializing)]
    pub authorization: Option<String>,
}

impl ExecutionContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            request_id: RequestId::new(),
            now,
            timezone: None,
            accounts: vec![],
            calendars: vec![],
            authorization: None,
        }
    }

    pub fn with_accounts(mut self, accounts: Vec<Account>) -> Self {
        self.accounts = accounts;
        self
    }

    pub fn with_calendars(mut self, calendars: Vec<String>) -> Self {
        self.calendars = calendars;
        self
    }

    pub fn with_timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = Some(tz.into());
        self
    }

    pub fn with_authorization(mut self, token: impl Into<String>) -> Self {
        self.authorization = Some(token.into());
        self
    }

    /// Describe available resources for the planning prompt.
    pub fn describe_resources(&self) -> String {
        let mut out = format!("Current time: {}\n", self.now.to_rfc3339());
        if let Some(ref tz) = self.timezone {
            out.push_str(&format!("Timezone: {}\n", tz));
        }
        if self.accounts.is_empty() {
            out.push_str("Accounts: none connected\n");
        } else {
            out.push_str("Accounts:\n");
            for account in &self.accounts {
                out.push_str(&format!("- {} ({}): {}\n", account.id, account.kind, account.address));
            }
        }
        if !self.calendars.is_empty() {
            out.push_str(&format!("Calendars: {}\n", self.calendars.join(", ")));
        }
        out
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("request_id", &self.request_id)
            .field("now", &self.now)
            .field("timezone", &self.timezone)
            .field("accounts", &self.accounts.len())
            .field("calendars", &self.calendars)
            .field("authorization", &self.authorization.is_some())
            .finish()
    }
}

/// Expected shape of an inference result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputShape {
    Text,
    Json,
}

/// A single inference call.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub shape: OutputShape,
    pub max_output_tokens: u32,
}

impl InferenceRequest {
    pub fn text(prompt: impl Into<String>, max_output_tokens: u32) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            shape: OutputShape::Text,
            max_output_tokens,
        }
    }

    pub fn json(prompt: impl Into<String>, max_output_tokens: u32) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            shape: OutputShape::Json,
            max_output_tokens,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Result of an inference call, with token usage.
#[derive(Debug, Clone, Default)]
pub struct InferenceResponse {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Cost actually incurred (or estimated) by a unit of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostMetadata {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub inference_calls: u32,
    #[serde(default)]
    pub external_calls: u32,
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl CostMetadata {
    pub fn tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    /// Record one inference call's usage.
    pub fn record_inference(&mut self, response: &InferenceResponse) {
        self.inference_calls = self.inference_calls.saturating_add(1);
        self.input_tokens = self.input_tokens.saturating_add(response.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(response.output_tokens);
    }

    pub fn record_external_call(&mut self) {
        self.external_calls = self.external_calls.saturating_add(1);
    }

    pub fn add(&mut self, other: &CostMetadata) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.inference_calls = self.inference_calls.saturating_add(other.inference_calls);
        self.external_calls = self.external_calls.saturating_add(other.external_calls);
        self.elapsed_ms = self.elapsed_ms.saturating_add(other.elapsed_ms);
    }
}

/// Summary of one analysed content unit (e.g. one mail thread).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSummary {
    pub unit: String,
    #[serde(default)]
    pub title: Option<String>,
    pub summary: String,
}

/// Size-bounded result payload of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// A list of items, truncated; `total` is the count before truncation.
    Items {
        items: Vec<serde_json::Value>,
        total: usize,
    },
    /// Free text, truncated.
    Text { text: String },
    /// Per-unit analyses, with the units that could not be processed.
    /// `total` counts every requested unit, including `skipped` ones past the
    /// per-node cap that were never attempted.
    Analysis {
        units: Vec<UnitSummary>,
        failed: Vec<String>,
        #[serde(default)]
        skipped: usize,
        total: usize,
    },
}

impl Payload {
    /// Whether the payload carries any information at all.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Items { items, .. } => items.is_empty(),
            Self::Text { text } => text.trim().is_empty(),
            Self::Analysis { units, .. } => units.is_empty(),
        }
    }

    /// Units that were requested but could not be processed.
    pub fn failed_units(&self) -> usize {
        match self {
            Self::Analysis { failed, .. } => failed.len(),
            _ => 0,
        }
    }

    /// Render a compact, human-readable digest for synthesis.
    ///
    /// Only display-oriented fields are rendered; identifiers stay behind.
    pub fn render_compact(&self) -> String {
        match self {
            Self::Items { items, total } => {
                let mut out = String::new();
                for item in items {
                    out.push_str("- ");
                    out.push_str(&render_item(item));
                    out.push('\n');
                }
                if *total > items.len() {
                    out.push_str(&format!("({} more not shown)\n", total - items.len()));
                }
                if items.is_empty() {
                    out.push_str("(no matching items)\n");
                }
                out
            }
            Self::Text { text } => format!("{}\n", text.trim()),
            Self::Analysis {
                units,
                failed,
                skipped,
                total,
            } => {
                let mut out = String::new();
                for unit in units {
                    match unit.title {
                        Some(ref title) => out.push_str(&format!("- {}: {}\n", title, unit.summary)),
                        None => out.push_str(&format!("- {}\n", unit.summary)),
                    }
                }
                if !failed.is_empty() {
                    out.push_str(&format!("({} of {} could not be read)\n", failed.len(), total));
                }
                if *skipped > 0 {
                    out.push_str(&format!("({} of {} were over the limit and not read)\n", skipped, total));
                }
                out
            }
        }
    }
}

/// Fields that carry identifiers and are never shown to synthesis.
const HIDDEN_FIELDS: &[&str] = &["id", "thread_id", "message_id", "event_id", "account_id", "etag", "uid"];

fn render_item(item: &serde_json::Value) -> String {
    match item {
        serde_json::Value::Object(map) => map
            .iter()
            .filter(|(k, _)| !HIDDEN_FIELDS.contains(&k.as_str()))
            .filter_map(|(k, v)| {
                let shown = match v {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Null => return None,
                    serde_json::Value::Array(arr) => arr
                        .iter()
                        .map(|x| x.as_str().map(str::to_string).unwrap_or_else(|| x.to_string()))
                        .collect::<Vec<_>>()
                        .join(", "),
                    other => other.to_string(),
                };
                Some(format!("{}: {}", k, shown))
            })
            .collect::<Vec<_>>()
            .join("; "),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Why a node did not produce a successful result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeError {
    /// The strategy call itself failed.
    Execution { message: String },
    /// The strategy call exceeded the per-node timeout.
    Timeout { after_ms: u64 },
    /// A dependency failed, so the node was never dispatched.
    DependencyUnavailable { dependencies: Vec<String> },
    /// Unknown strategy or unresolved placeholder at dispatch time.
    Configuration { message: String },
    /// Cancelled by signal or pipeline deadline.
    Cancelled,
}

impl NodeError {
    /// Short explanation suitable for a user-facing gap note.
    ///
    /// Carries no text from the failing service; see [`NodeError::detail`].
    pub fn reason(&self) -> String {
        match self {
            Self::Execution { .. } => "the lookup failed".to_string(),
            Self::Timeout { after_ms } => format!("it took longer than {}s", after_ms.div_ceil(1000)),
            Self::DependencyUnavailable { .. } => {
                "it depended on information that could not be retrieved".to_string()
            }
            Self::Configuration { .. } => "the plan for it was malformed".to_string(),
            Self::Cancelled => "the request was stopped before it finished".to_string(),
        }
    }
}

impl NodeError {
    /// The reason plus the first line of the underlying error, for model
    /// prompts and logs.
    pub fn detail(&self) -> String {
        match self {
            Self::Execution { message } => format!("the lookup failed ({})", first_line(message)),
            Self::Configuration { message } => {
                format!("the plan for it was malformed ({})", first_line(message))
            }
            other => other.reason(),
        }
    }
}

fn first_line(s: &str) -> &str {
    let line = s.lines().next().unwrap_or("");
    match line.char_indices().nth(120) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

impl From<SiftError> for NodeError {
    fn from(e: SiftError) -> Self {
        match e {
            SiftError::Timeout { after_ms, .. } => Self::Timeout { after_ms },
            SiftError::Cancelled => Self::Cancelled,
            SiftError::DependencyUnavailable { dependencies, .. } => {
                Self::DependencyUnavailable { dependencies }
            }
            SiftError::Configuration(message) => Self::Configuration { message },
            SiftError::StrategyNotFound(name) => Self::Configuration {
                message: format!("unknown strategy '{}'", name),
            },
            other => Self::Execution {
                message: other.to_string(),
            },
        }
    }
}

/// Outcome of executing one InformationNode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: String,
    pub strategy: String,
    pub description: String,
    pub stage: u32,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
    pub cost: CostMetadata,
}

impl NodeResult {
    pub fn succeeded(node: &InformationNode, payload: Payload, cost: CostMetadata) -> Self {
        Self {
            node_id: node.id.clone(),
            strategy: node.strategy.clone(),
            description: node.description.clone(),
            stage: node.stage,
            success: true,
            payload: Some(payload),
            error: None,
            cost,
        }
    }

    pub fn failed(node: &InformationNode, error: NodeError, cost: CostMetadata) -> Self {
        Self {
            node_id: node.id.clone(),
            strategy: node.strategy.clone(),
            description: node.description.clone(),
            stage: node.stage,
            success: false,
            payload: None,
            error: Some(error),
            cost,
        }
    }

    /// Successful with a payload. An empty listing still answers the question.
    pub fn is_useful(&self) -> bool {
        self.success && self.payload.is_some()
    }
}

/// Why execution stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Explicit caller signal.
    Signal,
    /// The global pipeline timeout elapsed.
    Deadline,
}

/// How far execution got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Every node succeeded.
    Complete,
    /// All stages ran but some nodes failed.
    Partial,
    /// Execution was interrupted; results so far are retained.
    Cancelled { reason: CancelReason },
}

/// The coordinator's output: every node's result plus overall status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub results: BTreeMap<String, NodeResult>,
    pub status: ExecutionStatus,
    pub stages_completed: u32,
    pub total_stages: u32,
    pub elapsed_ms: u64,
}

impl ExecutionReport {
    pub fn successes(&self) -> impl Iterator<Item = &NodeResult> {
        self.results.values().filter(|r| r.success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &NodeResult> {
        self.results.values().filter(|r| !r.success)
    }

    pub fn useful_count(&self) -> usize {
        self.results.values().filter(|r| r.is_useful()).count()
    }

    pub fn success_count(&self) -> usize {
        self.successes().count()
    }

    /// Sum of the costs actually incurred by all nodes.
    pub fn total_cost(&self) -> CostMetadata {
        let mut total = CostMetadata::default();
        for result in self.results.values() {
            total.add(&result.cost);
        }
        total
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.status, ExecutionStatus::Cancelled { .. })
    }
}

/// Pipeline event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A request entered the pipeline.
    RequestStarted { request_id: RequestId, query: String },
    /// The pipeline moved between states.
    StateChanged {
        request_id: RequestId,
        from: PipelineState,
        to: PipelineState,
    },
    /// A validated plan is ready.
    PlanReady {
        request_id: RequestId,
        stages: usize,
        nodes: usize,
    },
    /// A stage's nodes are being dispatched.
    StageStarted {
        request_id: RequestId,
        stage: u32,
        nodes: usize,
    },
    /// One node reached a terminal state.
    NodeFinished {
        request_id: RequestId,
        node_id: String,
        success: bool,
        elapsed_ms: u64,
    },
    /// Every node of a stage reached a terminal state.
    StageFinished {
        request_id: RequestId,
        stage: u32,
        succeeded: usize,
        failed: usize,
    },
    /// The request left the pipeline.
    RequestFinished {
        request_id: RequestId,
        state: PipelineState,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_items_hides_identifiers() {
        let payload = Payload::Items {
            items: vec![json!({"id": "evt_8f2a", "title": "Standup", "start": "09:00"})],
            total: 3,
        };
        let rendered = payload.render_compact();
        assert!(rendered.contains("title: Standup"));
        assert!(!rendered.contains("evt_8f2a"));
        assert!(rendered.contains("(2 more not shown)"));
    }

    #[test]
    fn test_render_analysis_mentions_failures() {
        let payload = Payload::Analysis {
            units: vec![UnitSummary {
                unit: "t1".into(),
                title: Some("Budget review".into()),
                summary: "Asks for Q3 numbers".into(),
            }],
            failed: vec!["t2".into()],
            skipped: 0,
            total: 2,
        };
        let rendered = payload.render_compact();
        assert!(rendered.contains("Budget review: Asks for Q3 numbers"));
        assert!(rendered.contains("(1 of 2 could not be read)"));
        assert!(!rendered.contains("over the limit"));
        assert_eq!(payload.failed_units(), 1);
    }

    #[test]
    fn test_render_analysis_mentions_skipped_units() {
        let payload = Payload::Analysis {
            units: vec![UnitSummary {
                unit: "t1".into(),
                title: None,
                summary: "Asks for Q3 numbers".into(),
            }],
            failed: vec![],
            skipped: 4,
            total: 5,
        };
        let rendered = payload.render_compact();
        assert!(rendered.contains("(4 of 5 were over the limit and not read)"));
        assert!(!rendered.contains("could not be read"));
    }

    #[test]
    fn test_analysis_without_skipped_field_parses() {
        let payload: Payload = serde_json::from_value(serde_json::json!({
            "kind": "analysis",
            "units": [],
            "failed": ["t1"],
            "total": 1
        }))
        .unwrap();
        assert!(matches!(payload, Payload::Analysis { skipped: 0, total: 1, .. }));
    }

    #[test]
    fn test_node_error_from_sift_error() {
        let e: NodeError = SiftError::StrategyNotFound("telepathy".into()).into();
        assert!(matches!(e, NodeError::Configuration { .. }));

        let e: NodeError = SiftError::Timeout {
            scope: "node n1".into(),
            after_ms: 1500,
        }
        .into();
        assert_eq!(e, NodeError::Timeout { after_ms: 1500 });
        assert!(e.reason().contains("2s"));
    }

    #[test]
    fn test_reason_hides_service_text() {
        let e = NodeError::Execution {
            message: "GET https://gateway.example.com/threads/thr_8f2a9c failed\nstack".into(),
        };
        assert_eq!(e.reason(), "the lookup failed");
        assert_eq!(
            e.detail(),
            "the lookup failed (GET https://gateway.example.com/threads/thr_8f2a9c failed)"
        );
    }

    #[test]
    fn test_payload_serde_tagging() {
        let payload = Payload::Text { text: "hi".into() };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value, json!({"kind": "text", "text": "hi"}));
    }

    #[test]
    fn test_cost_accumulation() {
        let mut cost = CostMetadata::default();
        cost.record_inference(&InferenceResponse {
            text: String::new(),
            input_tokens: 100,
            output_tokens: 20,
        });
        cost.record_external_call();
        assert_eq!(cost.tokens(), 120);
        assert_eq!(cost.inference_calls, 1);
        assert_eq!(cost.external_calls, 1);
    }

    #[test]
    fn test_context_debug_redacts_authorization() {
        let ctx = ExecutionContext::new(Utc::now()).with_authorization("secret-token");
        let debug = format!("{:?}", ctx);
        assert!(!debug.contains("secret-token"));
        let json = serde_json::to_string(&ctx).unwrap();
        assert!(!json.contains("secret-token"));
    }
}
