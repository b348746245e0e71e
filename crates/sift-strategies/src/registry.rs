use std::collections::BTreeMap;
use std::sync::Arc;

use sift_core::error::{Result, SiftError};
use sift_core::traits::Strategy;

/// Registry of available strategies, keyed by capability name.
///
/// Lookups fail closed: an unknown name is an error, never a default.
pub struct StrategyRegistry {
    strategies: BTreeMap<String, Arc<dyn Strategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            strategies: BTreeMap::new(),
        }
    }

    /// Register a strategy.
    pub fn register(&mut self, strategy: impl Strategy) {
        let name = strategy.name().to_string();
        self.strategies.insert(name, Arc::new(strategy));
    }

    /// Unregister a strategy by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.strategies.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Strategy>> {
        self.strategies.get(name).cloned()
    }

    /// Get a strategy or fail with `StrategyNotFound`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Strategy>> {
        self.get(name)
            .ok_or_else(|| SiftError::StrategyNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.strategies.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<&str> {
        self.strategies.keys().map(|s| s.as_str()).collect()
    }

    pub fn is_mutating(&self, name: &str) -> bool {
        self.strategies.get(name).is_some_and(|s| s.is_mutating())
    }

    /// Catalog text embedded in the planning prompt.
    pub fn catalog(&self) -> String {
        let mut out = String::new();
        for strategy in self.strategies.values() {
            out.push_str(&format!("- type \"{}\": {}", strategy.name(), strategy.description()));
            if strategy.is_mutating() {
                out.push_str(" [changes data; requires confirmation]");
            }
            if strategy.uses_inference() {
                out.push_str(" [uses model calls]");
            }
            out.push_str(&format!("\n  params: {}\n", strategy.params_hint()));
        }
        out
    }

    /// Create a registry with all built-in strategies registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        // Pure service queries
        registry.register(crate::builtin::metadata_filter::MetadataFilterStrategy);
        registry.register(crate::builtin::keyword_search::KeywordSearchStrategy);

        // Model-backed
        registry.register(crate::builtin::batch_analysis::BatchContentAnalysisStrategy);
        registry.register(crate::builtin::cross_reference::CrossReferenceStrategy);
        registry.register(crate::builtin::classification::ClassificationStrategy);

        // Writes
        registry.register(crate::builtin::resource_action::ResourceActionStrategy);

        registry
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
