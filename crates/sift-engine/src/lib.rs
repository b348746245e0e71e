pub mod budget;
pub mod coordinator;
pub mod decomposer;
pub mod orchestrator;
pub mod run_log;
pub mod synthesis;
pub mod tokens;

pub use budget::{BudgetDecision, BudgetPolicy};
pub use coordinator::Coordinator;
pub use decomposer::{Decomposer, Decomposition};
pub use orchestrator::{
    ConfirmationDecision, Orchestrator, OrchestratorBuilder, PendingConfirmation, RequestOutcome, Response,
};
pub use run_log::{JsonlRecordSink, TracingRecordSink};
pub use synthesis::{Synthesis, Synthesizer};
