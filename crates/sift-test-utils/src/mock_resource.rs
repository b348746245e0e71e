use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use sift_core::error::{Result, SiftError};
use sift_core::traits::{ResourceRequest, ResourceService};

type Handler = Box<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

/// In-memory resource service keyed by operation name.
pub struct MockResource {
    handlers: HashMap<String, Handler>,
    delays: HashMap<String, Duration>,
    calls: Arc<Mutex<Vec<ResourceRequest>>>,
}

impl MockResource {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            delays: HashMap::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Always answer `operation` with `value`.
    pub fn respond(self, operation: &str, value: Value) -> Self {
        self.handle(operation, move |_| Ok(value.clone()))
    }

    /// Answer `operation` by running `handler` on the request params.
    pub fn handle<F>(mut self, operation: &str, handler: F) -> Self
    where
        F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.handlers.insert(operation.to_string(), Box::new(handler));
        self
    }

    /// Delay every call to `operation`.
    pub fn delay(mut self, operation: &str, delay: Duration) -> Self {
        self.delays.insert(operation.to_string(), delay);
        self
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<ResourceRequest>>> {
        self.calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|r| r.operation == operation).count())
            .unwrap_or(0)
    }
}

impl Default for MockResource {
    fn default() -> Self {
        Self::new()
    }
}

/// Error a mock handler can return for a missing item.
pub fn not_found(operation: &str, what: &str) -> SiftError {
    SiftError::Resource {
        operation: operation.to_string(),
        status: Some(404),
        message: format!("{} not found", what),
    }
}

impl ResourceService for MockResource {
    fn call(&self, request: ResourceRequest) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(request.clone());
            }
            if let Some(delay) = self.delays.get(&request.operation) {
                tokio::time::sleep(*delay).await;
            }
            match self.handlers.get(&request.operation) {
                Some(handler) => handler(&request.params),
                None => Err(SiftError::Resource {
                    operation: request.operation.clone(),
                    status: Some(400),
                    message: "operation not supported".to_string(),
                }),
            }
        })
    }
}
