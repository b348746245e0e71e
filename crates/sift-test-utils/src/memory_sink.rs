use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use sift_core::error::Result;
use sift_core::record::ExecutionRecord;
use sift_core::traits::RecordSink;

/// Keeps every emitted record in memory.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<ExecutionRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl RecordSink for MemorySink {
    fn record(&self, record: &ExecutionRecord) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();
        Box::pin(async move {
            self.records
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(record);
            Ok(())
        })
    }
}
