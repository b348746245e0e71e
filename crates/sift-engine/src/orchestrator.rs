use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use sift_core::config::AppConfig;
use sift_core::error::{Result, SiftError};
use sift_core::event::EventBus;
use sift_core::graph::ExecutionGraph;
use sift_core::record::ExecutionRecord;
use sift_core::state::{PipelineState, StateTracker};
use sift_core::traits::{InferenceService, RecordSink, ResourceService};
use sift_core::types::{
    ConversationTurn, ExecutionContext, ExecutionReport, ExecutionStatus, PipelineEvent, RequestId,
};
use sift_strategies::StrategyRegistry;

use crate::budget::{BudgetDecision, BudgetPolicy};
use crate::coordinator::Coordinator;
use crate::decomposer::Decomposer;
use crate::synthesis::Synthesizer;

const NOT_UNDERSTOOD: &str = "Sorry, I couldn't work out how to answer that. Could you rephrase it?";
const CANCELLED_EARLY: &str = "The request was cancelled before any work was done.";
const PLANNING_TIMED_OUT: &str = "The request ran out of time before a plan was ready.";
const DECLINED: &str = "Okay, I won't go ahead with that.";

/// Final answer for a request.
#[derive(Debug, Clone)]
pub struct Response {
    pub request_id: RequestId,
    pub text: String,
    /// Terminal state: done, failed or cancelled.
    pub state: PipelineState,
    pub report: Option<ExecutionReport>,
    pub error: Option<String>,
}

impl Response {
    /// Some planned step did not contribute: it failed, or execution was
    /// interrupted before it finished.
    pub fn is_partial(&self) -> bool {
        self.report.as_ref().is_some_and(|r| {
            matches!(
                r.status,
                ExecutionStatus::Partial | ExecutionStatus::Cancelled { .. }
            )
        })
    }

    /// Execution was stopped by a cancel signal or the pipeline deadline.
    pub fn is_interrupted(&self) -> bool {
        self.report.as_ref().is_some_and(|r| r.is_cancelled())
    }

    pub fn status(&self) -> Option<ExecutionStatus> {
        self.report.as_ref().map(|r| r.status)
    }
}

/// A validated plan paused until the caller confirms it.
///
/// Owns everything needed to continue; nothing about it is kept elsewhere.
#[derive(Debug)]
pub struct PendingConfirmation {
    pub request_id: RequestId,
    /// Why confirmation is needed.
    pub reasons: Vec<String>,
    query: String,
    graph: ExecutionGraph,
    context: Arc<ExecutionContext>,
    record: ExecutionRecord,
    /// Pipeline time used before pausing. Waiting for the decision is not counted.
    spent: Duration,
}

impl PendingConfirmation {
    pub fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    /// Text shown to the person asked to confirm.
    pub fn summary(&self) -> String {
        let mut out = self.graph.summary();
        if !self.reasons.is_empty() {
            out.push_str(&format!("Confirmation needed because: {}\n", self.reasons.join("; ")));
        }
        out
    }
}

/// The caller's answer to a confirmation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationDecision {
    Approved,
    Rejected,
}

#[derive(Debug)]
pub enum RequestOutcome {
    Answered(Response),
    AwaitingConfirmation(PendingConfirmation),
}

/// Runs requests through decompose → (confirm) → execute → synthesize.
///
/// Holds no per-request state; every request's graph, results and state
/// tracker live on the call stack of the call handling it.
pub struct Orchestrator {
    decomposer: Decomposer,
    policy: BudgetPolicy,
    coordinator: Coordinator,
    synthesizer: Synthesizer,
    registry: Arc<StrategyRegistry>,
    events: Arc<EventBus>,
    sinks: Vec<Arc<dyn RecordSink>>,
    min_successful_nodes: usize,
    pipeline_timeout: Duration,
}

impl Orchestrator {
    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    /// Plan only: decompose and validate without executing anything.
    pub async fn plan(
        &self,
        query: &str,
        history: &[ConversationTurn],
        ctx: &ExecutionContext,
    ) -> Result<(ExecutionGraph, BudgetDecision)> {
        let decomposition = self.decomposer.decompose(query, history, ctx).await?;
        let decision = self
            .policy
            .assess(&decomposition.graph, |name| self.registry.is_mutating(name));
        Ok((decomposition.graph, decision))
    }

    /// Handle one request end to end.
    ///
    /// Returns `AwaitingConfirmation` when the plan needs an explicit
    /// approval; continue with [`Orchestrator::resume`].
    #[instrument(skip_all, fields(request_id = %ctx.request_id))]
    pub async fn process_request(
        &self,
        query: &str,
        history: &[ConversationTurn],
        ctx: ExecutionContext,
        cancel: CancellationToken,
    ) -> Result<RequestOutcome> {
        self.start(query, history, ctx, None, cancel).await
    }

    /// Handle a follow-up that builds on an earlier run's results.
    ///
    /// A new graph is planned with the earlier results as context.
    #[instrument(skip_all, fields(request_id = %ctx.request_id))]
    pub async fn follow_up(
        &self,
        query: &str,
        history: &[ConversationTurn],
        ctx: ExecutionContext,
        prior: &ExecutionReport,
        cancel: CancellationToken,
    ) -> Result<RequestOutcome> {
        self.start(query, history, ctx, Some(prior), cancel).await
    }

    /// Continue a paused plan with the caller's decision.
    #[instrument(skip_all, fields(request_id = %pending.request_id))]
    pub async fn resume(
        &self,
        pending: PendingConfirmation,
        decision: ConfirmationDecision,
        cancel: CancellationToken,
    ) -> Result<RequestOutcome> {
        let mut tracker = StateTracker::resume_at(PipelineState::AwaitingConfirmation);
        let PendingConfirmation {
            request_id,
            query,
            graph,
            context,
            record,
            spent,
            ..
        } = pending;

        match decision {
            ConfirmationDecision::Approved => {
                info!("Plan confirmed");
                let deadline = Instant::now() + self.pipeline_timeout.saturating_sub(spent);
                self.execute(&query, &graph, context, &mut tracker, record, cancel, deadline)
                    .await
            }
            ConfirmationDecision::Rejected => {
                info!("Plan declined");
                let err = SiftError::ConfirmationRejected(format!("{} step(s) not run", graph.node_count()));
                self.conclude(
                    &mut tracker,
                    &request_id,
                    record,
                    PipelineState::Cancelled,
                    DECLINED.to_string(),
                    None,
                    Some(err.to_string()),
                )
                .await
            }
        }
    }

    async fn start(
        &self,
        query: &str,
        history: &[ConversationTurn],
        ctx: ExecutionContext,
        prior: Option<&ExecutionReport>,
        cancel: CancellationToken,
    ) -> Result<RequestOutcome> {
        let started = Instant::now();
        let deadline = started + self.pipeline_timeout;
        let ctx = Arc::new(ctx);
        let request_id = ctx.request_id.clone();
        let mut tracker = StateTracker::new();
        let mut record = ExecutionRecord::new(request_id.clone(), query, Utc::now());
        info!(query_chars = query.chars().count(), history = history.len(), "Request received");
        self.events.publish(PipelineEvent::RequestStarted {
            request_id: request_id.clone(),
            query: query.to_string(),
        });

        let planning = async {
            match prior {
                Some(report) => self.decomposer.replan(query, history, &ctx, report).await,
                None => self.decomposer.decompose(query, history, &ctx).await,
            }
        };
        let planned = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SiftError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Err(SiftError::Timeout {
                scope: "planning".to_string(),
                after_ms: self.pipeline_timeout.as_millis() as u64,
            }),
            planned = planning => planned,
        };

        let decomposition = match planned {
            Ok(d) => d,
            Err(SiftError::Cancelled) => {
                return self
                    .conclude(
                        &mut tracker,
                        &request_id,
                        record,
                        PipelineState::Cancelled,
                        CANCELLED_EARLY.to_string(),
                        None,
                        Some(SiftError::Cancelled.to_string()),
                    )
                    .await;
            }
            Err(e @ SiftError::Timeout { .. }) if Instant::now() >= deadline => {
                warn!(error = %e, "Planning outlived the pipeline deadline");
                return self
                    .conclude(
                        &mut tracker,
                        &request_id,
                        record,
                        PipelineState::Cancelled,
                        PLANNING_TIMED_OUT.to_string(),
                        None,
                        Some(e.to_string()),
                    )
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "Decomposition failed");
                return self
                    .conclude(
                        &mut tracker,
                        &request_id,
                        record,
                        PipelineState::Failed,
                        NOT_UNDERSTOOD.to_string(),
                        None,
                        Some(e.to_string()),
                    )
                    .await;
            }
        };

        let graph = decomposition.graph;
        record.overhead.add(&decomposition.cost);
        let record = record.with_graph(&graph);
        self.events.publish(PipelineEvent::PlanReady {
            request_id: request_id.clone(),
            stages: graph.stage_count(),
            nodes: graph.node_count(),
        });

        match self.policy.assess(&graph, |name| self.registry.is_mutating(name)) {
            BudgetDecision::Proceed => {
                self.execute(query, &graph, ctx, &mut tracker, record, cancel, deadline)
                    .await
            }
            BudgetDecision::NeedsConfirmation(reasons) => {
                info!(reasons = ?reasons, "Plan needs confirmation");
                self.transition(&mut tracker, &request_id, PipelineState::AwaitingConfirmation)?;
                Ok(RequestOutcome::AwaitingConfirmation(PendingConfirmation {
                    request_id,
                    reasons,
                    query: query.to_string(),
                    graph,
                    context: ctx,
                    record,
                    spent: started.elapsed(),
                }))
            }
            BudgetDecision::Reject(reason) => {
                let err = SiftError::ResourceBudgetExceeded(reason.clone());
                let text = format!(
                    "That request would need more resources than I'm allowed to use ({}). \
                     Could you narrow it down?",
                    reason
                );
                self.conclude(
                    &mut tracker,
                    &request_id,
                    record,
                    PipelineState::Failed,
                    text,
                    None,
                    Some(err.to_string()),
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        query: &str,
        graph: &ExecutionGraph,
        ctx: Arc<ExecutionContext>,
        tracker: &mut StateTracker,
        record: ExecutionRecord,
        cancel: CancellationToken,
        deadline: Instant,
    ) -> Result<RequestOutcome> {
        let request_id = ctx.request_id.clone();
        self.transition(tracker, &request_id, PipelineState::Executing)?;

        let report = self
            .coordinator
            .execute_until(graph, ctx, cancel, deadline)
            .await;
        let mut record = record.with_report(&report, self.policy.tolerance_pct());
        info!(
            status = ?report.status,
            succeeded = report.success_count(),
            nodes = report.results.len(),
            elapsed_ms = report.elapsed_ms,
            "Execution finished"
        );

        let succeeded = report.success_count();
        if succeeded < self.min_successful_nodes {
            let (state, error) = if report.is_cancelled() {
                (PipelineState::Cancelled, SiftError::Cancelled.to_string())
            } else {
                (
                    PipelineState::Failed,
                    format!(
                        "{} of {} nodes succeeded, {} required",
                        succeeded,
                        report.results.len(),
                        self.min_successful_nodes
                    ),
                )
            };
            let text = self.synthesizer.apology(&report);
            return self
                .conclude(tracker, &request_id, record, state, text, Some(report), Some(error))
                .await;
        }

        self.transition(tracker, &request_id, PipelineState::Synthesizing)?;
        let synthesis = self
            .synthesizer
            .synthesize_before(query, graph.synthesis_instructions(), &report, deadline)
            .await;
        record.overhead.add(&synthesis.cost);
        if synthesis.used_fallback {
            debug!("Answer built without the synthesis model");
        }
        self.conclude(
            tracker,
            &request_id,
            record,
            PipelineState::Done,
            synthesis.text,
            Some(report),
            None,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn conclude(
        &self,
        tracker: &mut StateTracker,
        request_id: &RequestId,
        record: ExecutionRecord,
        state: PipelineState,
        text: String,
        report: Option<ExecutionReport>,
        error: Option<String>,
    ) -> Result<RequestOutcome> {
        self.transition(tracker, request_id, state)?;
        let record = record.finish(state, error.clone());
        for sink in &self.sinks {
            if let Err(e) = sink.record(&record).await {
                warn!(error = %e, "Failed to emit execution record");
            }
        }
        self.events.publish(PipelineEvent::RequestFinished {
            request_id: request_id.clone(),
            state,
        });
        Ok(RequestOutcome::Answered(Response {
            request_id: request_id.clone(),
            text,
            state,
            report,
            error,
        }))
    }

    fn transition(
        &self,
        tracker: &mut StateTracker,
        request_id: &RequestId,
        to: PipelineState,
    ) -> Result<()> {
        let from = tracker.advance(to)?;
        debug!(%from, %to, "State changed");
        self.events.publish(PipelineEvent::StateChanged {
            request_id: request_id.clone(),
            from,
            to,
        });
        Ok(())
    }
}

/// Builds an [`Orchestrator`] from configuration and its collaborators.
pub struct OrchestratorBuilder {
    config: AppConfig,
    inference: Arc<dyn InferenceService>,
    resources: Arc<dyn ResourceService>,
    registry: Option<Arc<StrategyRegistry>>,
    events: Option<Arc<EventBus>>,
    sinks: Vec<Arc<dyn RecordSink>>,
}

impl OrchestratorBuilder {
    pub fn new(
        config: AppConfig,
        inference: Arc<dyn InferenceService>,
        resources: Arc<dyn ResourceService>,
    ) -> Self {
        Self {
            config,
            inference,
            resources,
            registry: None,
            events: None,
            sinks: Vec::new(),
        }
    }

    /// Use this registry instead of the built-in strategies.
    pub fn with_registry(mut self, registry: Arc<StrategyRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn build(self) -> Orchestrator {
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(StrategyRegistry::with_builtins()));
        let events = self.events.unwrap_or_default();
        let retry = self
            .config
            .resources
            .as_ref()
            .map(|r| r.retry.clone())
            .unwrap_or_default();

        let coordinator = Coordinator::new(
            registry.clone(),
            self.inference.clone(),
            self.resources,
            self.config.execution.clone(),
        )
        .with_limits(self.config.limits.clone())
        .with_retry(retry)
        .with_events(events.clone());

        Orchestrator {
            decomposer: Decomposer::new(
                self.inference.clone(),
                registry.clone(),
                self.config.decomposer.clone(),
            ),
            policy: BudgetPolicy::new(self.config.budget.clone()),
            coordinator,
            synthesizer: Synthesizer::new(self.inference, self.config.limits.clone()),
            registry,
            events,
            sinks: self.sinks,
            min_successful_nodes: self.config.execution.min_successful_nodes,
            pipeline_timeout: self.config.execution.pipeline_timeout(),
        }
    }
}
