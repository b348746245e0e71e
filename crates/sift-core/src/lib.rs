pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod placeholder;
pub mod record;
pub mod state;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, SiftError};
pub use event::EventBus;
pub use graph::{BudgetVariance, ExecutionGraph, GraphDraft, InformationNode, ResourceEstimate, Stage};
pub use record::ExecutionRecord;
pub use state::{PipelineState, StateTracker};
pub use types::*;
