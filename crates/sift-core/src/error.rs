use thiserror::Error;

#[derive(Debug, Error)]
pub enum SiftError {
    // Planning errors
    #[error("Could not decompose request: {reason}")]
    Decomposition {
        reason: String,
        violations: Vec<String>,
    },

    #[error("Resource budget exceeded: {0}")]
    ResourceBudgetExceeded(String),

    #[error("Plan rejected by caller: {0}")]
    ConfirmationRejected(String),

    // Node-level errors (converted to NodeResult by the coordinator)
    #[error("Node {node} failed: {message}")]
    NodeExecution { node: String, message: String },

    #[error("Node {node} skipped, dependencies unavailable: {}", dependencies.join(", "))]
    DependencyUnavailable {
        node: String,
        dependencies: Vec<String>,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Timed out after {after_ms}ms: {scope}")]
    Timeout { scope: String, after_ms: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("Illegal pipeline transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // Inference errors
    #[error("Inference request failed: {0}")]
    InferenceRequest(String),

    #[error("Inference response parse error: {0}")]
    InferenceParse(String),

    #[error("Inference provider not supported: {0}")]
    UnsupportedProvider(String),

    // Resource access errors
    #[error("Resource operation {operation} failed: {message}")]
    Resource {
        operation: String,
        status: Option<u16>,
        message: String,
    },

    // Strategy errors
    #[error("Strategy not found: {0}")]
    StrategyNotFound(String),

    #[error("Strategy parameter validation failed: {0}")]
    StrategyValidation(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SiftError {
    /// Build a decomposition error from a list of graph violations.
    pub fn invalid_plan(violations: Vec<String>) -> Self {
        let reason = match violations.len() {
            0 => "plan failed validation".to_string(),
            1 => violations[0].clone(),
            n => format!("{} (and {} more violations)", violations[0], n - 1),
        };
        Self::Decomposition { reason, violations }
    }

    /// Whether a resource or inference failure is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Resource { status: Some(code), .. } => *code == 429 || *code >= 500,
            Self::Resource { status: None, message, .. } => {
                message.contains("timeout") || message.contains("connection")
            }
            Self::InferenceRequest(msg) => {
                msg.contains("429")
                    || msg.contains("500")
                    || msg.contains("502")
                    || msg.contains("503")
                    || msg.contains("529")
                    || msg.contains("timeout")
                    || msg.contains("connection")
            }
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SiftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_plan_reason() {
        let err = SiftError::invalid_plan(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(err.to_string(), "Could not decompose request: a (and 2 more violations)");
        match err {
            SiftError::Decomposition { violations, .. } => assert_eq!(violations.len(), 3),
            _ => panic!("expected Decomposition"),
        }
    }

    #[test]
    fn test_transient_classification() {
        let throttled = SiftError::Resource {
            operation: "search".into(),
            status: Some(429),
            message: "slow down".into(),
        };
        assert!(throttled.is_transient());

        let not_found = SiftError::Resource {
            operation: "fetch_thread".into(),
            status: Some(404),
            message: "missing".into(),
        };
        assert!(!not_found.is_transient());

        assert!(SiftError::InferenceRequest("HTTP 503: overloaded".into()).is_transient());
        assert!(!SiftError::Configuration("bad".into()).is_transient());
    }

    #[test]
    fn test_dependency_unavailable_display() {
        let err = SiftError::DependencyUnavailable {
            node: "n3".into(),
            dependencies: vec!["n1".into(), "n2".into()],
        };
        assert_eq!(err.to_string(), "Node n3 skipped, dependencies unavailable: n1, n2");
    }
}
