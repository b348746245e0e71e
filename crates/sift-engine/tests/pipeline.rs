use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use sift_core::config::AppConfig;
use sift_core::state::PipelineState;
use sift_core::types::{
    CancelReason, ExecutionContext, ExecutionStatus, NodeError, Payload, PipelineEvent, RequestId,
};
use sift_engine::{ConfirmationDecision, Orchestrator, OrchestratorBuilder, RequestOutcome, Response};
use sift_strategies::StrategyRegistry;
use sift_test_utils::{fixtures, not_found, MemorySink, MockInference, MockResource, StubLog, StubStrategy};

const PLANNER: &str = "You plan how";
const WRITER: &str = "You answer the user's question";

struct Harness {
    orchestrator: Orchestrator,
    inference: Arc<MockInference>,
    resources: Arc<MockResource>,
    sink: MemorySink,
}

fn harness(inference: MockInference, resources: MockResource, config: AppConfig) -> Harness {
    harness_with(inference, resources, config, None)
}

fn harness_with(
    inference: MockInference,
    resources: MockResource,
    config: AppConfig,
    registry: Option<StrategyRegistry>,
) -> Harness {
    let inference = Arc::new(inference);
    let resources = Arc::new(resources);
    let sink = MemorySink::new();
    let mut builder = OrchestratorBuilder::new(config, inference.clone(), resources.clone())
        .with_sink(Arc::new(sink.clone()));
    if let Some(registry) = registry {
        builder = builder.with_registry(Arc::new(registry));
    }
    Harness {
        orchestrator: builder.build(),
        inference,
        resources,
        sink,
    }
}

fn answered(outcome: RequestOutcome) -> Response {
    match outcome {
        RequestOutcome::Answered(response) => response,
        RequestOutcome::AwaitingConfirmation(p) => panic!("unexpected confirmation: {}", p.summary()),
    }
}

fn writer_calls(inference: &MockInference) -> usize {
    let calls = inference.calls();
    let calls = calls.lock().unwrap();
    calls
        .iter()
        .filter(|c| c.system.as_deref().is_some_and(|s| s.starts_with(WRITER)))
        .count()
}

fn unreplied_resources() -> MockResource {
    MockResource::new()
        .respond("list_threads", fixtures::threads(20))
        .handle("fetch_thread", |params| {
            let id = params["id"].as_str().unwrap_or_default();
            if id == "t4" || id == "t17" {
                Err(not_found("fetch_thread", id))
            } else {
                Ok(fixtures::thread_body(id))
            }
        })
}

#[tokio::test]
async fn calendar_today_is_one_node_without_inference() {
    let h = harness(
        MockInference::new()
            .on(PLANNER, fixtures::calendar_today_plan().to_string())
            .on(WRITER, "You have two meetings today: Standup at 09:00 and Design review at 14:00."),
        MockResource::new().respond("list_events", fixtures::events_today()),
        fixtures::config(),
    );
    let mut events = h.orchestrator.events().subscribe();

    let response = answered(
        h.orchestrator
            .process_request("What's on my calendar today?", &[], fixtures::context(), CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(response.state, PipelineState::Done);
    assert!(response.text.starts_with("You have two meetings today"));
    let report = response.report.as_ref().unwrap();
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.status, ExecutionStatus::Complete);
    assert_eq!(report.total_cost().inference_calls, 0);
    assert_eq!(h.resources.call_count("list_events"), 1);

    let records = h.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].final_state, PipelineState::Done);
    assert_eq!(records[0].stages, 1);
    assert_eq!(records[0].overhead.inference_calls, 2);

    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PipelineEvent::StateChanged { from, to, .. } = event {
            transitions.push((from, to));
        }
    }
    assert_eq!(
        transitions,
        vec![
            (PipelineState::Decomposing, PipelineState::Executing),
            (PipelineState::Executing, PipelineState::Synthesizing),
            (PipelineState::Synthesizing, PipelineState::Done),
        ]
    );
}

#[tokio::test]
async fn unreplied_summary_survives_two_failed_reads() {
    let h = harness(
        MockInference::new()
            .on(PLANNER, fixtures::unreplied_summary_plan().to_string())
            .on(WRITER, "Eighteen threads are waiting on you; most ask for a decision on the offsite.")
            .default_reply("Needs a decision on the offsite."),
        unreplied_resources(),
        fixtures::config(),
    );

    let response = answered(
        h.orchestrator
            .process_request(
                "Find emails I haven't replied to this week and summarize them",
                &[],
                fixtures::context(),
                CancellationToken::new(),
            )
            .await
            .unwrap(),
    );

    assert_eq!(response.state, PipelineState::Done);
    assert!(response
        .text
        .ends_with("Summarize each unreplied thread: 2 of 20 items could not be read."));

    let report = response.report.as_ref().unwrap();
    assert_eq!(report.stages_completed, 2);
    match report.results["n2"].payload.as_ref().unwrap() {
        Payload::Analysis {
            units,
            failed,
            skipped,
            total,
        } => {
            assert_eq!(units.len(), 18);
            assert_eq!(failed.len(), 2);
            assert_eq!(*skipped, 0);
            assert_eq!(*total, 20);
        }
        other => panic!("unexpected payload {:?}", other),
    }

    // Actual cost stays within tolerance of the plan's estimate.
    let record = &h.sink.records()[0];
    assert_eq!(record.within_tolerance, Some(true));
    let variance = record.variance.unwrap();
    assert_eq!(variance.actual_external_calls, 21);
    assert_eq!(variance.actual_inference_calls, 18);
}

#[tokio::test]
async fn expensive_plan_waits_for_confirmation() {
    let mut config = fixtures::config();
    config.budget.confirm_above_external_calls = 10;
    let h = harness(
        MockInference::new()
            .on(PLANNER, fixtures::unreplied_summary_plan().to_string())
            .on(WRITER, "Here is the summary.")
            .default_reply("Needs a decision."),
        unreplied_resources(),
        config,
    );
    let mut events = h.orchestrator.events().subscribe();

    let outcome = h
        .orchestrator
        .process_request("Summarize unreplied mail", &[], fixtures::context(), CancellationToken::new())
        .await
        .unwrap();
    let pending = match outcome {
        RequestOutcome::AwaitingConfirmation(p) => p,
        RequestOutcome::Answered(r) => panic!("expected confirmation, got {:?}", r.text),
    };

    assert!(pending.summary().contains("21 service calls"));
    assert_eq!(pending.graph().node_count(), 2);
    assert_eq!(h.resources.call_count("list_threads"), 0);
    assert_eq!(h.resources.call_count("fetch_thread"), 0);
    assert!(h.sink.records().is_empty());
    while let Ok(event) = events.try_recv() {
        if let PipelineEvent::StateChanged { to, .. } = event {
            assert_ne!(to, PipelineState::Executing);
        }
    }

    let response = answered(
        h.orchestrator
            .resume(pending, ConfirmationDecision::Approved, CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(response.state, PipelineState::Done);
    assert_eq!(h.resources.call_count("list_threads"), 1);
    assert_eq!(h.sink.records().len(), 1);
}

#[tokio::test]
async fn declined_plan_never_executes() {
    let mut config = fixtures::config();
    config.budget.confirm_above_external_calls = 10;
    let h = harness(
        MockInference::new().on(PLANNER, fixtures::unreplied_summary_plan().to_string()),
        unreplied_resources(),
        config,
    );

    let pending = match h
        .orchestrator
        .process_request("Summarize unreplied mail", &[], fixtures::context(), CancellationToken::new())
        .await
        .unwrap()
    {
        RequestOutcome::AwaitingConfirmation(p) => p,
        RequestOutcome::Answered(r) => panic!("expected confirmation, got {:?}", r.text),
    };
    let response = answered(
        h.orchestrator
            .resume(pending, ConfirmationDecision::Rejected, CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(response.state, PipelineState::Cancelled);
    assert!(response.error.as_deref().unwrap().contains("rejected"));
    assert!(h.resources.calls().lock().unwrap().is_empty());
    assert_eq!(h.sink.records()[0].final_state, PipelineState::Cancelled);
}

#[tokio::test]
async fn write_actions_always_need_confirmation() {
    let plan = json!({
        "classification": {"query_type": "action", "domains": ["mail"]},
        "nodes": [{
            "id": "n1",
            "description": "Send the note to Alice",
            "type": "resource-action",
            "params": {"operation": "send_message", "payload": {"to": ["alice@example.com"], "body": "On my way"}},
            "stage": 1,
            "estimate": {"external_calls": 1}
        }],
        "synthesis_instructions": "Confirm what was sent",
        "resource_estimate": {"external_calls": 1, "requires_confirmation": false}
    });
    let h = harness(
        MockInference::new().on(PLANNER, plan.to_string()),
        MockResource::new().respond("send_message", json!({"status": "sent"})),
        fixtures::config(),
    );

    match h
        .orchestrator
        .process_request("Tell Alice I'm on my way", &[], fixtures::context(), CancellationToken::new())
        .await
        .unwrap()
    {
        RequestOutcome::AwaitingConfirmation(p) => {
            assert!(p.reasons.iter().any(|r| r.contains("Send the note to Alice")))
        }
        RequestOutcome::Answered(r) => panic!("write ran without confirmation: {}", r.text),
    }
    assert_eq!(h.resources.call_count("send_message"), 0);
}

#[tokio::test]
async fn plan_above_ceiling_is_rejected() {
    let mut config = fixtures::config();
    config.budget.reject_above_tokens = 1000;
    let h = harness(
        MockInference::new().on(PLANNER, fixtures::unreplied_summary_plan().to_string()),
        unreplied_resources(),
        config,
    );

    let response = answered(
        h.orchestrator
            .process_request("Summarize unreplied mail", &[], fixtures::context(), CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(response.state, PipelineState::Failed);
    assert!(response.text.contains("2400 tokens"));
    assert!(response.error.as_deref().unwrap().starts_with("Resource budget exceeded"));
    assert!(h.resources.calls().lock().unwrap().is_empty());
}

#[tokio::test]
async fn invalid_plan_fails_with_apology() {
    let mut plan = fixtures::unreplied_summary_plan();
    plan["nodes"][1]["stage"] = json!(1);
    let h = harness(
        MockInference::new().on(PLANNER, plan.to_string()),
        unreplied_resources(),
        fixtures::config(),
    );

    let response = answered(
        h.orchestrator
            .process_request("Summarize unreplied mail", &[], fixtures::context(), CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(response.state, PipelineState::Failed);
    assert!(response.text.starts_with("Sorry"));
    assert!(response.error.as_deref().unwrap().contains("not in an earlier stage"));
    assert!(h.resources.calls().lock().unwrap().is_empty());
    assert_eq!(h.sink.records()[0].final_state, PipelineState::Failed);
}

#[tokio::test]
async fn zero_successes_apologize_without_synthesis_call() {
    let h = harness(
        MockInference::new().on(PLANNER, fixtures::calendar_today_plan().to_string()),
        MockResource::new(),
        fixtures::config(),
    );

    let response = answered(
        h.orchestrator
            .process_request("What's on today?", &[], fixtures::context(), CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(response.state, PipelineState::Failed);
    assert!(response.text.starts_with("Sorry, I couldn't retrieve"));
    assert!(response.text.contains("List today's events: the lookup failed"));
    assert_eq!(writer_calls(&h.inference), 0);
}

fn stub_harness(inference: MockInference, log: &StubLog) -> Harness {
    let mut registry = StrategyRegistry::new();
    registry.register(StubStrategy::new("stub", log.clone()));
    harness_with(inference, MockResource::new(), fixtures::config(), Some(registry))
}

#[tokio::test]
async fn one_failed_independent_node_still_reaches_done() {
    let plan = fixtures::stub_plan(
        "stub",
        &[
            ("a", 1, vec![], json!({"tag": "a", "fail": true})),
            ("b", 1, vec![], json!({"tag": "b"})),
            ("c", 2, vec!["b"], json!({"tag": "c", "from": {"$ref": "b.items[0].value"}})),
        ],
    );
    let log = StubLog::default();
    let h = stub_harness(
        MockInference::new()
            .on(PLANNER, plan.to_string())
            .on(WRITER, "Stub b and c both returned values."),
        &log,
    );

    let response = answered(
        h.orchestrator
            .process_request("Run the stubs", &[], fixtures::context(), CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(response.state, PipelineState::Done);
    assert_eq!(response.status(), Some(ExecutionStatus::Partial));
    assert!(response.is_partial());
    assert!(!response.is_interrupted());
    assert!(response.text.starts_with("Stub b and c both returned values."));
    assert!(response.text.contains("- Stub a: the lookup failed"));
    assert_eq!(log.get("c").unwrap().params["from"], "value-of-b");
}

#[tokio::test(start_paused = true)]
async fn cancellation_mid_stage_two_yields_partial_answer() {
    let plan = fixtures::stub_plan(
        "stub",
        &[
            ("a", 1, vec![], json!({"tag": "a", "delay_ms": 10})),
            ("b", 2, vec!["a"], json!({"tag": "b", "delay_ms": 60000, "from": {"$ref": "a.items[0].value"}})),
            ("c", 2, vec![], json!({"tag": "c", "delay_ms": 20})),
        ],
    );
    let log = StubLog::default();
    let h = stub_harness(
        MockInference::new()
            .on(PLANNER, plan.to_string())
            .on(WRITER, "Stub a and c returned values."),
        &log,
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let response = answered(
        h.orchestrator
            .process_request("Run the stubs", &[], fixtures::context(), cancel)
            .await
            .unwrap(),
    );

    assert_eq!(response.state, PipelineState::Done);
    assert!(response.is_partial());
    assert!(response.is_interrupted());
    assert_eq!(
        response.status(),
        Some(ExecutionStatus::Cancelled {
            reason: CancelReason::Signal
        })
    );
    let report = response.report.as_ref().unwrap();
    assert!(report.results["a"].success);
    assert!(report.results["c"].success);
    assert_eq!(report.results["b"].error, Some(NodeError::Cancelled));
    assert!(response
        .text
        .contains("This answer is partial: the request was cancelled before every step finished."));
}

fn short_deadline_config() -> AppConfig {
    let mut config = fixtures::config();
    config.execution.pipeline_timeout_secs = 2;
    config
}

#[tokio::test(start_paused = true)]
async fn slow_planner_is_bounded_by_pipeline_deadline() {
    let h = harness(
        MockInference::new().on_slow(
            PLANNER,
            fixtures::calendar_today_plan().to_string(),
            Duration::from_secs(100),
        ),
        MockResource::new().respond("list_events", fixtures::events_today()),
        short_deadline_config(),
    );
    let started = tokio::time::Instant::now();

    let response = answered(
        h.orchestrator
            .process_request("What's on today?", &[], fixtures::context(), CancellationToken::new())
            .await
            .unwrap(),
    );

    assert!(started.elapsed() <= Duration::from_secs(3));
    assert_eq!(response.state, PipelineState::Cancelled);
    assert_eq!(response.text, "The request ran out of time before a plan was ready.");
    assert!(response.error.as_deref().unwrap_or_default().contains("planning"));
    assert!(response.report.is_none());
    assert_eq!(h.resources.call_count("list_events"), 0);

    let records = h.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].final_state, PipelineState::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn slow_writer_falls_back_within_pipeline_deadline() {
    let h = harness(
        MockInference::new()
            .on(PLANNER, fixtures::calendar_today_plan().to_string())
            .on_slow(WRITER, "You have two meetings today.", Duration::from_secs(100)),
        MockResource::new().respond("list_events", fixtures::events_today()),
        short_deadline_config(),
    );
    let started = tokio::time::Instant::now();

    let response = answered(
        h.orchestrator
            .process_request("What's on today?", &[], fixtures::context(), CancellationToken::new())
            .await
            .unwrap(),
    );

    assert!(started.elapsed() <= Duration::from_secs(3));
    assert_eq!(response.state, PipelineState::Done);
    assert_eq!(response.status(), Some(ExecutionStatus::Complete));
    assert!(response.text.starts_with("Here is what I found."));
    assert!(!response.text.contains("You have two meetings today."));
    assert!(response
        .text
        .ends_with("This answer is partial: the request ran out of time before a full answer could be written."));
    assert_eq!(h.sink.records()[0].final_state, PipelineState::Done);
}

#[tokio::test]
async fn cancelled_before_planning_does_nothing() {
    let h = harness(
        MockInference::new().on(PLANNER, fixtures::calendar_today_plan().to_string()),
        MockResource::new(),
        fixtures::config(),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let response = answered(
        h.orchestrator
            .process_request("What's on today?", &[], fixtures::context(), cancel)
            .await
            .unwrap(),
    );
    assert_eq!(response.state, PipelineState::Cancelled);
    assert_eq!(h.inference.call_count(), 0);
}

#[tokio::test]
async fn follow_up_plans_with_earlier_results() {
    let h = harness(
        MockInference::new()
            .on(PLANNER, fixtures::calendar_today_plan().to_string())
            .on(WRITER, "Standup at 09:00."),
        MockResource::new().respond("list_events", fixtures::events_today()),
        fixtures::config(),
    );
    let first = answered(
        h.orchestrator
            .process_request("What's on today?", &[], fixtures::context(), CancellationToken::new())
            .await
            .unwrap(),
    );
    let prior = first.report.unwrap();

    let mut ctx = fixtures::context();
    ctx.request_id = RequestId::new();
    let second = answered(
        h.orchestrator
            .follow_up("Anything after lunch?", &[], ctx, &prior, CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(second.state, PipelineState::Done);

    let calls = h.inference.calls();
    let calls = calls.lock().unwrap();
    let replan = calls
        .iter()
        .filter(|c| c.system.as_deref().is_some_and(|s| s.starts_with(PLANNER)))
        .nth(1)
        .unwrap();
    assert!(replan.prompt.contains("Already known from an earlier run"));
    assert!(replan.prompt.contains("title: Design review"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_requests_are_isolated() {
    let h = harness(
        MockInference::new()
            .on(PLANNER, fixtures::calendar_today_plan().to_string())
            .on(WRITER, "Standup at 09:00."),
        MockResource::new().respond("list_events", fixtures::events_today()),
        fixtures::config(),
    );
    let ctx_a = ExecutionContext::new(chrono::Utc::now());
    let ctx_b = ExecutionContext::new(chrono::Utc::now());
    let (a, b) = tokio::join!(
        h.orchestrator
            .process_request("What's on today?", &[], ctx_a, CancellationToken::new()),
        h.orchestrator
            .process_request("What's on today?", &[], ctx_b, CancellationToken::new()),
    );
    let (a, b) = (answered(a.unwrap()), answered(b.unwrap()));
    assert_ne!(a.request_id, b.request_id);
    assert_eq!(a.state, PipelineState::Done);
    assert_eq!(b.state, PipelineState::Done);
    assert_eq!(h.sink.records().len(), 2);
}
