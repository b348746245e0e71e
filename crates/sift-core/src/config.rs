use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SiftError};

/// Top-level sift configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub decomposer: DecomposerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub limits: OutputLimits,
    #[serde(default)]
    pub resources: Option<ResourcesConfig>,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

fn default_data_dir() -> String { "~/.sift".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// Extra HTTP headers, merged over any provider preset headers.
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

fn default_provider() -> String { "anthropic".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }

/// Retry configuration shared by inference and resource calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl RetryConfig {
    /// Exponential backoff before retry `attempt` (0-based), capped at
    /// `max_backoff_ms`, with 0.8x-1.2x jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ms = self
            .initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_backoff_ms);
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        Duration::from_millis((ms as f64 * jitter) as u64)
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 10_000 }

/// Query decomposition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecomposerConfig {
    /// How many recent conversation turns are passed as context.
    #[serde(default = "default_max_context_turns")]
    pub max_context_turns: usize,
    /// Output cap for the planning call.
    #[serde(default = "default_plan_output_tokens")]
    pub max_output_tokens: u32,
}

impl Default for DecomposerConfig {
    fn default() -> Self {
        Self {
            max_context_turns: default_max_context_turns(),
            max_output_tokens: default_plan_output_tokens(),
        }
    }
}

fn default_max_context_turns() -> usize { 6 }
fn default_plan_output_tokens() -> u32 { 2048 }

/// Coordinator scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum number of strategy calls in flight at once.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    /// Upper bound on a single strategy call.
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
    /// Upper bound on the whole execution phase.
    #[serde(default = "default_pipeline_timeout")]
    pub pipeline_timeout_secs: u64,
    /// How long in-flight nodes may take to wind down after cancellation.
    #[serde(default = "default_cancel_drain")]
    pub cancel_drain_ms: u64,
    /// Executions with fewer successful nodes than this are failures.
    #[serde(default = "default_min_successful_nodes")]
    pub min_successful_nodes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallelism: default_max_parallelism(),
            node_timeout_secs: default_node_timeout(),
            pipeline_timeout_secs: default_pipeline_timeout(),
            cancel_drain_ms: default_cancel_drain(),
            min_successful_nodes: default_min_successful_nodes(),
        }
    }
}

impl ExecutionConfig {
    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }

    pub fn pipeline_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline_timeout_secs)
    }

    pub fn cancel_drain(&self) -> Duration {
        Duration::from_millis(self.cancel_drain_ms)
    }
}

fn default_max_parallelism() -> usize { 4 }
fn default_node_timeout() -> u64 { 30 }
fn default_pipeline_timeout() -> u64 { 120 }
fn default_cancel_drain() -> u64 { 500 }
fn default_min_successful_nodes() -> usize { 1 }

/// Resource budget thresholds.
///
/// `confirm_above_*` pause the pipeline for an explicit confirmation;
/// `reject_above_*` are absolute ceilings that reject the plan outright.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_confirm_tokens")]
    pub confirm_above_tokens: u64,
    #[serde(default = "default_confirm_calls")]
    pub confirm_above_external_calls: u32,
    #[serde(default = "default_confirm_nodes")]
    pub confirm_above_nodes: usize,
    #[serde(default = "default_confirm_cost")]
    pub confirm_above_cost_usd: f64,
    #[serde(default = "default_reject_tokens")]
    pub reject_above_tokens: u64,
    #[serde(default = "default_reject_calls")]
    pub reject_above_external_calls: u32,
    #[serde(default = "default_reject_nodes")]
    pub reject_above_nodes: usize,
    /// Allowed deviation of actual cost from the estimate, in percent.
    #[serde(default = "default_tolerance_pct")]
    pub tolerance_pct: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            confirm_above_tokens: default_confirm_tokens(),
            confirm_above_external_calls: default_confirm_calls(),
            confirm_above_nodes: default_confirm_nodes(),
            confirm_above_cost_usd: default_confirm_cost(),
            reject_above_tokens: default_reject_tokens(),
            reject_above_external_calls: default_reject_calls(),
            reject_above_nodes: default_reject_nodes(),
            tolerance_pct: default_tolerance_pct(),
        }
    }
}

fn default_confirm_tokens() -> u64 { 60_000 }
fn default_confirm_calls() -> u32 { 60 }
fn default_confirm_nodes() -> usize { 12 }
fn default_confirm_cost() -> f64 { 0.50 }
fn default_reject_tokens() -> u64 { 500_000 }
fn default_reject_calls() -> u32 { 400 }
fn default_reject_nodes() -> usize { 40 }
fn default_tolerance_pct() -> u32 { 50 }

/// Size caps applied at every compression-funnel boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputLimits {
    /// Items kept in a list payload.
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    /// Characters kept per string field of an item.
    #[serde(default = "default_max_item_chars")]
    pub max_item_chars: usize,
    /// Characters kept in a free-text payload.
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
    /// Content units analysed by one batch node.
    #[serde(default = "default_max_units")]
    pub max_units: usize,
    /// Concurrent inference calls inside one batch node.
    #[serde(default = "default_unit_concurrency")]
    pub unit_concurrency: usize,
    /// Characters kept per analysed unit.
    #[serde(default = "default_unit_summary_chars")]
    pub unit_summary_chars: usize,
    /// Token cap for the digest handed to synthesis.
    #[serde(default = "default_synthesis_input_tokens")]
    pub synthesis_input_tokens: usize,
    #[serde(default = "default_synthesis_output_tokens")]
    pub synthesis_max_output_tokens: u32,
    /// Hard cap on the final response.
    #[serde(default = "default_max_response_chars")]
    pub max_response_chars: usize,
}

impl Default for OutputLimits {
    fn default() -> Self {
        Self {
            max_items: default_max_items(),
            max_item_chars: default_max_item_chars(),
            max_text_chars: default_max_text_chars(),
            max_units: default_max_units(),
            unit_concurrency: default_unit_concurrency(),
            unit_summary_chars: default_unit_summary_chars(),
            synthesis_input_tokens: default_synthesis_input_tokens(),
            synthesis_max_output_tokens: default_synthesis_output_tokens(),
            max_response_chars: default_max_response_chars(),
        }
    }
}

fn default_max_items() -> usize { 20 }
fn default_max_item_chars() -> usize { 240 }
fn default_max_text_chars() -> usize { 2_000 }
fn default_max_units() -> usize { 20 }
fn default_unit_concurrency() -> usize { 4 }
fn default_unit_summary_chars() -> usize { 400 }
fn default_synthesis_input_tokens() -> usize { 6_000 }
fn default_synthesis_output_tokens() -> u32 { 1_024 }
fn default_max_response_chars() -> usize { 4_000 }

/// Resource access service endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfig {
    pub base_url: String,
    #[serde(default = "default_resource_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_resource_timeout() -> u64 { 20 }

/// JSONL execution-record configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable the record file (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for record files. Default: <data_dir>/records
    #[serde(default)]
    pub log_dir: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
        }
    }
}

fn default_log_enabled() -> bool { true }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| SiftError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = toml::from_str(&expanded).map_err(|e| SiftError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Reject values the scheduler cannot work with.
    pub fn check(&self) -> Result<()> {
        if self.execution.max_parallelism == 0 {
            return Err(SiftError::Config("execution.max_parallelism must be at least 1".into()));
        }
        if self.limits.unit_concurrency == 0 {
            return Err(SiftError::Config("limits.unit_concurrency must be at least 1".into()));
        }
        if self.limits.max_response_chars < 200 {
            return Err(SiftError::Config("limits.max_response_chars must be at least 200".into()));
        }
        if self.execution.node_timeout_secs >= self.execution.pipeline_timeout_secs {
            warn!(
                node_timeout_secs = self.execution.node_timeout_secs,
                pipeline_timeout_secs = self.execution.pipeline_timeout_secs,
                "Node timeout is not shorter than the pipeline timeout; the pipeline deadline will cut nodes off first"
            );
        }
        Ok(())
    }

    /// Resolve the data directory (expand ~).
    pub fn data_dir(&self) -> PathBuf {
        let dir = &self.data_dir;
        if let Some(rest) = dir.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(dir)
    }

    /// Directory for JSONL execution records, if enabled.
    pub fn record_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref()?;
        if !log.enabled {
            return None;
        }
        Some(
            log.log_dir
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| self.data_dir().join("records")),
        )
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => {
                    warn!(var = %var_name, "Config references an unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_SIFT_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_SIFT_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_SIFT_VAR");
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 500,
            max_backoff_ms: 2000,
        };
        let first = config.backoff(0);
        assert!(first >= Duration::from_millis(400) && first <= Duration::from_millis(600));
        let second = config.backoff(1);
        assert!(second >= Duration::from_millis(800) && second <= Duration::from_millis(1200));
        let capped = config.backoff(40);
        assert!(capped >= Duration::from_millis(1600) && capped <= Duration::from_millis(2400));
    }

    #[test]
    fn test_long_node_timeout_is_only_a_warning() {
        let mut config = AppConfig::parse("[model]\nmodel_id = \"m\"\n").unwrap();
        config.execution.node_timeout_secs = 300;
        config.execution.pipeline_timeout_secs = 120;
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_SIFT_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_SIFT_VAR}\"");
    }

    #[test]
    fn test_defaults_from_minimal_toml() {
        let config = AppConfig::parse(
            r#"
[model]
model_id = "claude-sonnet-4-20250514"
"#,
        )
        .unwrap();
        assert_eq!(config.model.provider, "anthropic");
        assert_eq!(config.execution.max_parallelism, 4);
        assert_eq!(config.execution.node_timeout(), Duration::from_secs(30));
        assert_eq!(config.execution.min_successful_nodes, 1);
        assert_eq!(config.budget.confirm_above_nodes, 12);
        assert_eq!(config.limits.max_units, 20);
        assert!(config.resources.is_none());
        assert!(config.record_dir().is_none());
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let err = AppConfig::parse(
            r#"
[model]
model_id = "m"

[execution]
max_parallelism = 0
"#,
        )
        .unwrap_err();
        assert!(matches!(err, SiftError::Config(_)));
    }

    #[test]
    fn test_record_dir_defaults_under_data_dir() {
        let config = AppConfig::parse(
            r#"
data_dir = "/tmp/sift-data"

[model]
model_id = "m"

[log]
"#,
        )
        .unwrap();
        assert_eq!(config.record_dir(), Some(PathBuf::from("/tmp/sift-data/records")));
    }
}
