use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sift_core::config::{ExecutionConfig, OutputLimits, RetryConfig};
use sift_core::error::SiftError;
use sift_core::event::EventBus;
use sift_core::graph::{ExecutionGraph, InformationNode};
use sift_core::placeholder;
use sift_core::traits::{InferenceService, ResourceService, Strategy, StrategyContext};
use sift_core::types::{
    CancelReason, CostMetadata, ExecutionContext, ExecutionReport, ExecutionStatus, NodeError, NodeResult,
    PipelineEvent, RequestId,
};
use sift_strategies::StrategyRegistry;

/// Executes a validated graph stage by stage.
///
/// Nodes of one stage run concurrently, bounded by `max_parallelism`; a stage
/// starts only once every node of the previous stage is terminal. The
/// coordinator is the only writer of the result map: node tasks hand their
/// `NodeResult` back through the join set. Node failures never escape;
/// they become unsuccessful results.
pub struct Coordinator {
    registry: Arc<StrategyRegistry>,
    inference: Arc<dyn InferenceService>,
    resources: Arc<dyn ResourceService>,
    config: ExecutionConfig,
    limits: OutputLimits,
    retry: RetryConfig,
    events: Option<Arc<EventBus>>,
}

impl Coordinator {
    pub fn new(
        registry: Arc<StrategyRegistry>,
        inference: Arc<dyn InferenceService>,
        resources: Arc<dyn ResourceService>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            registry,
            inference,
            resources,
            config,
            limits: OutputLimits::default(),
            retry: RetryConfig::default(),
            events: None,
        }
    }

    pub fn with_limits(mut self, limits: OutputLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Retry policy handed to strategies for their resource calls.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run every stage of `graph` and collect one result per node, with a
    /// full `pipeline_timeout_secs` budget starting now.
    pub async fn execute(
        &self,
        graph: &ExecutionGraph,
        ctx: Arc<ExecutionContext>,
        cancel: CancellationToken,
    ) -> ExecutionReport {
        let deadline = Instant::now() + self.config.pipeline_timeout();
        self.execute_until(graph, ctx, cancel, deadline).await
    }

    /// Run every stage of `graph` and collect one result per node.
    ///
    /// A signal on `cancel`, or reaching `deadline`, stops dispatching new
    /// stages. In-flight nodes get `cancel_drain_ms` to finish, then are
    /// aborted. Results of finished nodes are always kept.
    pub async fn execute_until(
        &self,
        graph: &ExecutionGraph,
        ctx: Arc<ExecutionContext>,
        cancel: CancellationToken,
        deadline: Instant,
    ) -> ExecutionReport {
        let started = Instant::now();
        // Handed to strategies; fired on signal and on deadline.
        let run_token = cancel.child_token();
        let permits = Arc::new(Semaphore::new(self.config.max_parallelism.max(1)));
        let request_id = ctx.request_id.clone();

        let mut results: BTreeMap<String, NodeResult> = BTreeMap::new();
        let mut stopped: Option<CancelReason> = None;
        let mut stages_completed = 0u32;

        for stage in graph.stages() {
            if stopped.is_none() {
                stopped = stop_reason(&cancel, deadline);
            }
            if stopped.is_some() {
                for node in &stage.nodes {
                    results.insert(
                        node.id.clone(),
                        NodeResult::failed(node, NodeError::Cancelled, CostMetadata::default()),
                    );
                }
                continue;
            }

            info!(stage = stage.number, nodes = stage.nodes.len(), "Dispatching stage");
            self.publish(PipelineEvent::StageStarted {
                request_id: request_id.clone(),
                stage: stage.number,
                nodes: stage.nodes.len(),
            });

            let mut tasks: JoinSet<NodeResult> = JoinSet::new();
            let mut in_flight: HashMap<String, &InformationNode> = HashMap::new();
            for node in &stage.nodes {
                match self.prepare(node, &results) {
                    Ok((strategy, params)) => {
                        debug!(node_id = %node.id, strategy = %node.strategy, "Dispatching node");
                        let sctx = StrategyContext {
                            execution: ctx.clone(),
                            inference: self.inference.clone(),
                            resources: self.resources.clone(),
                            limits: self.limits.clone(),
                            retry: self.retry.clone(),
                            cancel: run_token.clone(),
                        };
                        in_flight.insert(node.id.clone(), node);
                        tasks.spawn(run_node(
                            node.clone(),
                            strategy,
                            params,
                            sctx,
                            permits.clone(),
                            self.config.node_timeout(),
                        ));
                    }
                    Err(error) => {
                        let result = NodeResult::failed(node, error, CostMetadata::default());
                        self.accept(&request_id, result, &mut in_flight, &mut results);
                    }
                }
            }

            stopped = self
                .await_stage(&mut tasks, &mut in_flight, &mut results, &cancel, &run_token, deadline, &request_id)
                .await;

            // Whatever never reported was aborted, or its task panicked.
            for (id, node) in in_flight.drain() {
                let error = match stopped {
                    Some(_) => NodeError::Cancelled,
                    None => NodeError::Execution {
                        message: "node task ended without a result".into(),
                    },
                };
                results.insert(id, NodeResult::failed(node, error, CostMetadata::default()));
            }

            let succeeded = stage
                .nodes
                .iter()
                .filter(|n| results.get(&n.id).is_some_and(|r| r.success))
                .count();
            let failed = stage.nodes.len() - succeeded;
            info!(stage = stage.number, succeeded, failed, "Stage finished");
            self.publish(PipelineEvent::StageFinished {
                request_id: request_id.clone(),
                stage: stage.number,
                succeeded,
                failed,
            });
            if stopped.is_none() {
                stages_completed += 1;
            }
        }

        let status = match stopped {
            Some(reason) => ExecutionStatus::Cancelled { reason },
            None if results.values().all(|r| r.success) => ExecutionStatus::Complete,
            None => ExecutionStatus::Partial,
        };
        ExecutionReport {
            results,
            status,
            stages_completed,
            total_stages: graph.stage_count() as u32,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Check dependencies, look up the strategy and resolve placeholders.
    fn prepare(
        &self,
        node: &InformationNode,
        results: &BTreeMap<String, NodeResult>,
    ) -> std::result::Result<(Arc<dyn Strategy>, Value), NodeError> {
        let unavailable: Vec<String> = node
            .depends_on
            .iter()
            .filter(|dep| !results.get(dep.as_str()).is_some_and(|r| r.success))
            .cloned()
            .collect();
        if !unavailable.is_empty() {
            return Err(NodeError::DependencyUnavailable {
                dependencies: unavailable,
            });
        }

        let strategy = self.registry.resolve(&node.strategy)?;

        let mut sources = HashMap::new();
        for dep in &node.depends_on {
            if let Some(payload) = results.get(dep).and_then(|r| r.payload.as_ref()) {
                let value = serde_json::to_value(payload).map_err(SiftError::from)?;
                sources.insert(dep.clone(), value);
            }
        }
        let params = placeholder::resolve(&node.params, &sources)?;
        Ok((strategy, params))
    }

    /// Wait until the stage is drained, or until a signal or the deadline.
    #[allow(clippy::too_many_arguments)]
    async fn await_stage<'g>(
        &self,
        tasks: &mut JoinSet<NodeResult>,
        in_flight: &mut HashMap<String, &'g InformationNode>,
        results: &mut BTreeMap<String, NodeResult>,
        cancel: &CancellationToken,
        run_token: &CancellationToken,
        deadline: Instant,
        request_id: &RequestId,
    ) -> Option<CancelReason> {
        let reason = loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(result)) => self.accept(request_id, result, in_flight, results),
                    Some(Err(e)) => warn!(error = %e, "Node task did not complete"),
                    None => return None,
                },
                _ = cancel.cancelled() => break CancelReason::Signal,
                _ = tokio::time::sleep_until(deadline) => break CancelReason::Deadline,
            }
        };

        warn!(?reason, in_flight = tasks.len(), "Execution interrupted, draining in-flight nodes");
        // Strategies watch the run token; a deadline only fires it here.
        run_token.cancel();
        let drained = tokio::time::timeout(self.config.cancel_drain(), async {
            while let Some(joined) = tasks.join_next().await {
                if let Ok(result) = joined {
                    self.accept(request_id, result, in_flight, results);
                }
            }
        })
        .await;
        if drained.is_err() {
            debug!(aborted = tasks.len(), "Aborting nodes still running after drain");
            tasks.abort_all();
            while let Some(joined) = tasks.join_next().await {
                if let Ok(result) = joined {
                    self.accept(request_id, result, in_flight, results);
                }
            }
        }
        Some(reason)
    }

    fn accept<'g>(
        &self,
        request_id: &RequestId,
        result: NodeResult,
        in_flight: &mut HashMap<String, &'g InformationNode>,
        results: &mut BTreeMap<String, NodeResult>,
    ) {
        in_flight.remove(&result.node_id);
        match result.error {
            None => info!(
                node_id = %result.node_id,
                strategy = %result.strategy,
                elapsed_ms = result.cost.elapsed_ms,
                "Node succeeded"
            ),
            Some(ref error) => warn!(
                node_id = %result.node_id,
                strategy = %result.strategy,
                error = ?error,
                "Node failed"
            ),
        }
        self.publish(PipelineEvent::NodeFinished {
            request_id: request_id.clone(),
            node_id: result.node_id.clone(),
            success: result.success,
            elapsed_ms: result.cost.elapsed_ms,
        });
        results.insert(result.node_id.clone(), result);
    }

    fn publish(&self, event: PipelineEvent) {
        if let Some(ref events) = self.events {
            events.publish(event);
        }
    }
}

fn stop_reason(cancel: &CancellationToken, deadline: Instant) -> Option<CancelReason> {
    if cancel.is_cancelled() {
        Some(CancelReason::Signal)
    } else if Instant::now() >= deadline {
        Some(CancelReason::Deadline)
    } else {
        None
    }
}

/// One node task: wait for a permit, then run the strategy under the node timeout.
async fn run_node(
    node: InformationNode,
    strategy: Arc<dyn Strategy>,
    params: Value,
    ctx: StrategyContext,
    permits: Arc<Semaphore>,
    timeout: Duration,
) -> NodeResult {
    let cancel = ctx.cancel.clone();
    let _permit = tokio::select! {
        permit = permits.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return NodeResult::failed(&node, NodeError::Cancelled, CostMetadata::default()),
        },
        _ = cancel.cancelled() => {
            return NodeResult::failed(&node, NodeError::Cancelled, CostMetadata::default());
        }
    };

    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, strategy.execute(params, ctx)).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(Ok(output)) => {
            let cost = CostMetadata {
                elapsed_ms,
                ..output.cost
            };
            NodeResult::succeeded(&node, output.payload, cost)
        }
        Ok(Err(e)) => NodeResult::failed(
            &node,
            e.into(),
            CostMetadata {
                elapsed_ms,
                ..Default::default()
            },
        ),
        Err(_) => NodeResult::failed(
            &node,
            NodeError::Timeout {
                after_ms: timeout.as_millis() as u64,
            },
            CostMetadata {
                elapsed_ms,
                ..Default::default()
            },
        ),
    }
}
