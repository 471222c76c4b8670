use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::Json;
use futures::StreamExt;
use tempfile::tempdir;

use crate::agent::{Agent, AgentError, AgentStream, LlmAgentBuilder};
use crate::chat::*;
use crate::cli::*;
use crate::config::*;
use crate::error::*;
use crate::model::{ChatMessage, ChatModel, ChatStream, ModelError};
use crate::openai::SseParser;
use crate::pipeline::*;
use crate::profiles::run_profiles_list;
use crate::provider::*;
use crate::server::*;
use crate::streaming::*;
use crate::telemetry::*;
use crate::workflow::*;

fn base_cfg() -> RuntimeConfig {
    RuntimeConfig {
        profile: "default".to_string(),
        config_path: ".counsel/config.toml".to_string(),
        provider: Provider::Auto,
        model: None,
        endpoint: None,
        app_name: "test-app".to_string(),
        stage_timeout_secs: None,
        telemetry_enabled: false,
        telemetry_path: ".counsel/test-telemetry.jsonl".to_string(),
        max_prompt_chars: 32_000,
    }
}

fn test_telemetry(cfg: &RuntimeConfig) -> TelemetrySink {
    TelemetrySink::new(cfg, "test".to_string())
}

fn test_cli(config_path: &str, profile: &str) -> Cli {
    Cli {
        provider: Provider::Auto,
        model: None,
        endpoint: None,
        profile: profile.to_string(),
        config_path: config_path.to_string(),
        app_name: None,
        stage_timeout_secs: None,
        telemetry_enabled: None,
        telemetry_path: None,
        log_filter: "warn".to_string(),
        command: Commands::Doctor,
    }
}

/// Deterministic stage capability: appends "+<name>" to its input.
struct AppendAgent {
    name: String,
}

impl AppendAgent {
    fn arc(name: &str) -> Arc<dyn Agent> {
        Arc::new(Self {
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl Agent for AppendAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, input: &str) -> Result<AgentStream, AgentError> {
        let output = format!("{input}+{}", self.name);
        Ok(Box::pin(futures::stream::iter(vec![Ok::<_, AgentError>(
            output,
        )])))
    }
}

/// Capability that fails on invocation.
struct FailingAgent {
    name: String,
}

impl FailingAgent {
    fn arc(name: &str) -> Arc<dyn Agent> {
        Arc::new(Self {
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl Agent for FailingAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _input: &str) -> Result<AgentStream, AgentError> {
        Err(AgentError::Invocation(
            "simulated capability failure".to_string(),
        ))
    }
}

/// Capability that never completes; used to exercise cancellation/timeouts.
struct BlockingAgent {
    name: String,
}

impl BlockingAgent {
    fn arc(name: &str) -> Arc<dyn Agent> {
        Arc::new(Self {
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl Agent for BlockingAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _input: &str) -> Result<AgentStream, AgentError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Box::pin(futures::stream::empty::<Result<String, AgentError>>()))
    }
}

/// Capability that emits a fixed sequence of increments.
struct ChunksAgent {
    name: String,
    chunks: Vec<&'static str>,
}

impl ChunksAgent {
    fn arc(name: &str, chunks: Vec<&'static str>) -> Arc<dyn Agent> {
        Arc::new(Self {
            name: name.to_string(),
            chunks,
        })
    }
}

#[async_trait]
impl Agent for ChunksAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _input: &str) -> Result<AgentStream, AgentError> {
        let chunks = self
            .chunks
            .iter()
            .map(|chunk| Ok(chunk.to_string()))
            .collect::<Vec<Result<String, AgentError>>>();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

struct MockChatModel {
    response: String,
}

impl MockChatModel {
    fn arc(response: &str) -> Arc<dyn ChatModel> {
        Arc::new(Self {
            response: response.to_string(),
        })
    }
}

#[async_trait]
impl ChatModel for MockChatModel {
    fn name(&self) -> &str {
        "mock-model"
    }

    async fn generate(
        &self,
        _messages: Vec<ChatMessage>,
        _stream: bool,
    ) -> Result<ChatStream, ModelError> {
        let midpoint = self.response.len() / 2;
        let head = self.response[..midpoint].to_string();
        let tail = self.response[midpoint..].to_string();
        Ok(Box::pin(futures::stream::iter(vec![
            Ok::<_, ModelError>(head),
            Ok(tail),
        ])))
    }
}

fn append_chain(ids: &[&str]) -> Arc<Workflow> {
    let mut builder = WorkflowBuilder::new();
    for id in ids {
        builder
            .add_stage(*id, AppendAgent::arc(id))
            .expect("stage should register");
    }
    for pair in ids.windows(2) {
        builder
            .add_edge(pair[0], pair[1])
            .expect("edge should register");
    }
    builder.set_start(ids[0]).expect("start should register");
    Arc::new(builder.build().expect("chain should build"))
}

async fn collect_events(mut stream: RunStream) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }
    events
}

// -------------------------------------------------------------------------
// Workflow graph builder
// -------------------------------------------------------------------------

#[test]
fn linear_chain_build_preserves_registration_order() {
    let workflow = append_chain(&["Plan", "Research", "Advisor"]);
    assert_eq!(workflow.traversal_order(), ["Plan", "Research", "Advisor"]);
    assert_eq!(workflow.start(), "Plan");
    assert_eq!(workflow.terminal_stage(), "Advisor");
    assert_eq!(workflow.stage_count(), 3);
}

#[test]
fn single_stage_workflow_builds() {
    let workflow = append_chain(&["solo"]);
    assert_eq!(workflow.traversal_order(), ["solo"]);
    assert_eq!(workflow.terminal_stage(), "solo");
}

#[test]
fn duplicate_stage_registration_is_rejected_without_side_effects() {
    let mut builder = WorkflowBuilder::new();
    builder
        .add_stage("plan", AppendAgent::arc("plan"))
        .expect("first registration should pass");

    let err = builder
        .add_stage("plan", AppendAgent::arc("plan"))
        .expect_err("duplicate registration should fail");
    assert!(matches!(err, GraphError::DuplicateStage { id } if id == "plan"));

    // Rejection leaves the builder usable with its original state.
    builder.set_start("plan").expect("start should register");
    let workflow = builder.build().expect("builder should still build");
    assert_eq!(workflow.stage_count(), 1);
}

#[test]
fn edge_referencing_unknown_stage_is_rejected() {
    let mut builder = WorkflowBuilder::new();
    builder
        .add_stage("plan", AppendAgent::arc("plan"))
        .expect("stage should register");

    let err = builder
        .add_edge("plan", "missing")
        .expect_err("unknown destination should fail");
    assert!(matches!(err, GraphError::UnknownStage { id } if id == "missing"));

    let err = builder
        .add_edge("ghost", "plan")
        .expect_err("unknown source should fail");
    assert!(matches!(err, GraphError::UnknownStage { id } if id == "ghost"));
}

#[test]
fn start_designation_requires_registered_stage() {
    let mut builder = WorkflowBuilder::new();
    let err = builder
        .set_start("nowhere")
        .expect_err("unknown start should fail");
    assert!(matches!(err, GraphError::UnknownStage { id } if id == "nowhere"));
}

#[test]
fn build_without_start_fails_with_invalid_topology() {
    let mut builder = WorkflowBuilder::new();
    builder
        .add_stage("plan", AppendAgent::arc("plan"))
        .expect("stage should register");

    let err = builder.build().expect_err("missing start should fail");
    assert!(matches!(err, GraphError::InvalidTopology { .. }));
    assert!(err.to_string().contains("no start stage"));
}

#[test]
fn cyclic_edges_fail_with_invalid_topology() {
    let mut builder = WorkflowBuilder::new();
    builder
        .add_stage("a", AppendAgent::arc("a"))
        .expect("stage should register");
    builder
        .add_stage("b", AppendAgent::arc("b"))
        .expect("stage should register");
    builder
        .add_stage("c", AppendAgent::arc("c"))
        .expect("stage should register");
    builder.add_edge("a", "b").expect("edge should register");
    builder.add_edge("b", "c").expect("edge should register");
    builder.add_edge("c", "b").expect("edge should register");
    builder.set_start("a").expect("start should register");

    let err = builder.build().expect_err("cycle should fail");
    assert!(matches!(err, GraphError::InvalidTopology { .. }));
    assert!(err.to_string().contains("cycle"));
}

#[test]
fn unreachable_stage_fails_with_invalid_topology() {
    let mut builder = WorkflowBuilder::new();
    builder
        .add_stage("a", AppendAgent::arc("a"))
        .expect("stage should register");
    builder
        .add_stage("island", AppendAgent::arc("island"))
        .expect("stage should register");
    builder.set_start("a").expect("start should register");

    let err = builder.build().expect_err("unreachable stage should fail");
    assert!(err.to_string().contains("island"));
}

#[test]
fn start_stage_with_incoming_edge_fails() {
    let mut builder = WorkflowBuilder::new();
    builder
        .add_stage("a", AppendAgent::arc("a"))
        .expect("stage should register");
    builder
        .add_stage("b", AppendAgent::arc("b"))
        .expect("stage should register");
    builder.add_edge("a", "b").expect("edge should register");
    builder.add_edge("b", "a").expect("edge should register");
    builder.set_start("a").expect("start should register");

    let err = builder.build().expect_err("incoming edge on start should fail");
    assert!(matches!(err, GraphError::InvalidTopology { .. }));
    assert!(err.to_string().contains("incoming edge"));
}

// -------------------------------------------------------------------------
// Runner
// -------------------------------------------------------------------------

#[tokio::test]
async fn chain_passes_each_output_to_the_next_stage() {
    let workflow = append_chain(&["Plan", "Research", "Advisor"]);
    let runner = Runner::new(workflow);
    let events = collect_events(runner.run("X")).await;

    let completions = events
        .iter()
        .filter_map(|event| match event {
            RunEvent::StageCompleted { stage, output } => {
                Some((stage.as_str(), output.as_str()))
            }
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(
        completions,
        vec![
            ("Plan", "X+Plan"),
            ("Research", "X+Plan+Research"),
            ("Advisor", "X+Plan+Research+Advisor"),
        ]
    );

    let last = events.last().expect("run should emit events");
    assert!(
        matches!(last, RunEvent::WorkflowCompleted { output } if output == "X+Plan+Research+Advisor")
    );
}

#[tokio::test]
async fn stage_events_are_strictly_ordered() {
    let mut builder = WorkflowBuilder::new();
    builder
        .add_stage("first", ChunksAgent::arc("first", vec!["alpha ", "beta"]))
        .expect("stage should register");
    builder
        .add_stage("second", ChunksAgent::arc("second", vec!["gamma"]))
        .expect("stage should register");
    builder.add_edge("first", "second").expect("edge should register");
    builder.set_start("first").expect("start should register");
    let runner = Runner::new(Arc::new(builder.build().expect("chain should build")));

    let events = collect_events(runner.run("ignored")).await;

    // All events for the first stage come before any event of the second.
    let boundary = events
        .iter()
        .position(|event| event.stage() == Some("second"))
        .expect("second stage should run");
    assert!(
        events[..boundary]
            .iter()
            .all(|event| event.stage() == Some("first")),
        "no second-stage event may precede completion of the first"
    );

    let first_deltas = events
        .iter()
        .filter_map(|event| match event {
            RunEvent::StageDelta { stage, delta } if stage == "first" => Some(delta.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(first_deltas, vec!["alpha ", "beta"]);
}

#[tokio::test]
async fn middle_stage_failure_stops_downstream_stages() {
    let mut builder = WorkflowBuilder::new();
    builder
        .add_stage("plan", AppendAgent::arc("plan"))
        .expect("stage should register");
    builder
        .add_stage("research", FailingAgent::arc("research"))
        .expect("stage should register");
    builder
        .add_stage("advise", AppendAgent::arc("advise"))
        .expect("stage should register");
    builder.add_edge("plan", "research").expect("edge should register");
    builder.add_edge("research", "advise").expect("edge should register");
    builder.set_start("plan").expect("start should register");
    let runner = Runner::new(Arc::new(builder.build().expect("chain should build")));

    let events = collect_events(runner.run("X")).await;

    assert!(
        events.iter().all(|event| event.stage() != Some("advise")),
        "no event may be emitted for the downstream stage"
    );
    let last = events.last().expect("run should emit events");
    match last {
        RunEvent::WorkflowFailed { stage, error } => {
            assert_eq!(stage, "research");
            assert!(error.contains("simulated capability failure"));
        }
        other => panic!("expected terminal failure event, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_runs_do_not_share_state() {
    let workflow = append_chain(&["plan", "research", "advise"]);
    let runner = Runner::new(workflow);

    let (left, right) = tokio::join!(
        collect_events(runner.run("left")),
        collect_events(runner.run("right")),
    );

    let final_of = |events: &[RunEvent]| match events.last() {
        Some(RunEvent::WorkflowCompleted { output }) => output.clone(),
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(final_of(&left), "left+plan+research+advise");
    assert_eq!(final_of(&right), "right+plan+research+advise");
}

#[tokio::test]
async fn cancellation_during_a_stage_prevents_downstream_stages() {
    let mut builder = WorkflowBuilder::new();
    builder
        .add_stage("plan", AppendAgent::arc("plan"))
        .expect("stage should register");
    builder
        .add_stage("research", BlockingAgent::arc("research"))
        .expect("stage should register");
    builder
        .add_stage("advise", AppendAgent::arc("advise"))
        .expect("stage should register");
    builder.add_edge("plan", "research").expect("edge should register");
    builder.add_edge("research", "advise").expect("edge should register");
    builder.set_start("plan").expect("start should register");
    let runner = Runner::new(Arc::new(builder.build().expect("chain should build")));

    let mut stream = runner.run("X");
    let handle = stream.cancel_handle();
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        if matches!(&event, RunEvent::StageStarted { stage } if stage == "research") {
            handle.cancel();
        }
        events.push(event);
    }

    assert!(handle.is_cancelled());
    assert!(
        events.iter().all(|event| event.stage() != Some("advise")),
        "cancelled run must never start the downstream stage"
    );
    let last = events.last().expect("run should emit events");
    match last {
        RunEvent::WorkflowFailed { stage, error } => {
            assert_eq!(stage, "research");
            assert!(error.contains("cancelled"));
        }
        other => panic!("expected terminal failure event, got {other:?}"),
    }
}

#[tokio::test]
async fn stage_timeout_fails_the_run() {
    let mut builder = WorkflowBuilder::new();
    builder
        .add_stage("slow", BlockingAgent::arc("slow"))
        .expect("stage should register");
    builder.set_start("slow").expect("start should register");
    let runner = Runner::with_options(
        Arc::new(builder.build().expect("workflow should build")),
        RunOptions {
            stage_timeout: Some(Duration::from_millis(50)),
        },
    );

    let events = collect_events(runner.run("X")).await;
    let last = events.last().expect("run should emit events");
    match last {
        RunEvent::WorkflowFailed { stage, error } => {
            assert_eq!(stage, "slow");
            assert!(error.contains("timed out"));
        }
        other => panic!("expected terminal failure event, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_stage_output_is_reported_as_stage_failure() {
    let mut builder = WorkflowBuilder::new();
    builder
        .add_stage("mute", ChunksAgent::arc("mute", vec![]))
        .expect("stage should register");
    builder.set_start("mute").expect("start should register");
    let runner = Runner::new(Arc::new(builder.build().expect("workflow should build")));

    let events = collect_events(runner.run("X")).await;
    let last = events.last().expect("run should emit events");
    assert!(
        matches!(last, RunEvent::WorkflowFailed { stage, error }
            if stage == "mute" && error.contains("no textual output"))
    );
}

#[tokio::test]
async fn fan_in_stage_receives_joined_upstream_outputs() {
    let mut builder = WorkflowBuilder::new();
    for id in ["a", "b", "c", "d"] {
        builder
            .add_stage(id, AppendAgent::arc(id))
            .expect("stage should register");
    }
    builder.add_edge("a", "b").expect("edge should register");
    builder.add_edge("a", "c").expect("edge should register");
    builder.add_edge("b", "d").expect("edge should register");
    builder.add_edge("c", "d").expect("edge should register");
    builder.set_start("a").expect("start should register");
    let runner = Runner::new(Arc::new(builder.build().expect("diamond should build")));

    let events = collect_events(runner.run("X")).await;
    let last = events.last().expect("run should emit events");
    match last {
        RunEvent::WorkflowCompleted { output } => {
            assert_eq!(output, "X+a+b\n\nX+a+c+d");
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

#[test]
fn run_status_tracks_the_event_sequence() {
    let mut status = RunStatus::Pending;
    status.observe(&RunEvent::StageStarted {
        stage: "plan".to_string(),
    });
    assert_eq!(status, RunStatus::Running("plan".to_string()));
    assert!(!status.is_terminal());

    status.observe(&RunEvent::WorkflowCompleted {
        output: "done".to_string(),
    });
    assert_eq!(status, RunStatus::Completed);
    assert!(status.is_terminal());
}

// -------------------------------------------------------------------------
// Stage output tracking
// -------------------------------------------------------------------------

#[tokio::test]
async fn tracker_collects_stage_outputs_and_final_answer() {
    let cfg = base_cfg();
    let telemetry = test_telemetry(&cfg);
    let runner = Runner::new(append_chain(&["plan", "research", "advise"]));

    let outcome = run_workflow(&runner, "X", &telemetry)
        .await
        .expect("run should complete");
    assert_eq!(outcome.answer, "X+plan+research+advise");
    assert_eq!(outcome.stage_outputs.len(), 3);
    assert_eq!(outcome.stage_outputs[0].0, "plan");
}

#[tokio::test]
async fn tracker_surfaces_failure_with_stage_and_cause() {
    let cfg = base_cfg();
    let telemetry = test_telemetry(&cfg);
    let mut builder = WorkflowBuilder::new();
    builder
        .add_stage("plan", AppendAgent::arc("plan"))
        .expect("stage should register");
    builder
        .add_stage("research", FailingAgent::arc("research"))
        .expect("stage should register");
    builder.add_edge("plan", "research").expect("edge should register");
    builder.set_start("plan").expect("start should register");
    let runner = Runner::new(Arc::new(builder.build().expect("chain should build")));

    let err = run_workflow(&runner, "X", &telemetry)
        .await
        .expect_err("failing stage should surface");
    let message = err.to_string();
    assert!(message.contains("research stage failed"));
    assert!(message.contains("simulated capability failure"));
}

#[test]
fn tracker_status_follows_the_event_stream() {
    let mut tracker = StageOutputTracker::default();
    tracker.observe(&RunEvent::StageStarted {
        stage: "plan".to_string(),
    });
    assert_eq!(tracker.status(), &RunStatus::Running("plan".to_string()));

    tracker.observe(&RunEvent::WorkflowFailed {
        stage: "research".to_string(),
        error: "boom".to_string(),
    });
    assert_eq!(tracker.status(), &RunStatus::Failed);
    assert!(tracker.failure().is_some());
}

// -------------------------------------------------------------------------
// Agents and pipeline
// -------------------------------------------------------------------------

#[tokio::test]
async fn llm_agent_streams_the_model_response() {
    let agent = LlmAgentBuilder::new("echo")
        .instructions("Echo the request.")
        .model(MockChatModel::arc("hello world"))
        .build()
        .expect("agent should build");

    let mut stream = agent.invoke("hi").await.expect("invoke should pass");
    let mut aggregated = String::new();
    while let Some(chunk) = stream.next().await {
        aggregated.push_str(&chunk.expect("chunk should be text"));
    }
    assert_eq!(aggregated, "hello world");
}

#[test]
fn llm_agent_requires_instructions_and_model() {
    let err = LlmAgentBuilder::new("bare")
        .model(MockChatModel::arc("x"))
        .build()
        .expect_err("missing instructions should fail");
    assert!(err.to_string().contains("instruction"));

    let err = LlmAgentBuilder::new("bare")
        .instructions("do things")
        .build()
        .expect_err("missing model should fail");
    assert!(err.to_string().contains("model"));
}

#[test]
fn advisory_pipeline_builds_the_three_stage_chain() {
    let workflow =
        build_advisory_pipeline(MockChatModel::arc("fine")).expect("pipeline should build");
    assert_eq!(
        workflow.traversal_order(),
        [PLANNER_STAGE, RESEARCHER_STAGE, ADVISOR_STAGE]
    );
    assert_eq!(workflow.start(), PLANNER_STAGE);
    assert_eq!(workflow.terminal_stage(), ADVISOR_STAGE);
}

#[tokio::test]
async fn advisory_pipeline_runs_end_to_end_with_a_mock_model() {
    let workflow = Arc::new(
        build_advisory_pipeline(MockChatModel::arc("mock recommendation"))
            .expect("pipeline should build"),
    );
    let runner = Runner::new(workflow);
    let events = collect_events(runner.run("Plan a product launch")).await;

    let last = events.last().expect("run should emit events");
    assert!(
        matches!(last, RunEvent::WorkflowCompleted { output } if output == "mock recommendation")
    );
    let started = events
        .iter()
        .filter(|event| matches!(event, RunEvent::StageStarted { .. }))
        .count();
    assert_eq!(started, 3);
}

// -------------------------------------------------------------------------
// SSE parsing
// -------------------------------------------------------------------------

#[test]
fn sse_parser_extracts_complete_events() {
    let mut parser = SseParser::new();
    let events = parser.feed("data: {\"x\":1}\n\ndata: {\"x\":2}\n\n");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].data, "{\"x\":1}");
    assert_eq!(events[1].data, "{\"x\":2}");
}

#[test]
fn sse_parser_buffers_partial_events_across_feeds() {
    let mut parser = SseParser::new();
    assert!(parser.feed("data: {\"x\":").is_empty());
    let events = parser.feed("1}\n\n");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data, "{\"x\":1}");
}

#[test]
fn sse_parser_handles_done_marker_and_no_space_variant() {
    let mut parser = SseParser::new();
    let events = parser.feed("data:[DONE]\n\n");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data, "[DONE]");
}

// -------------------------------------------------------------------------
// Config and profiles
// -------------------------------------------------------------------------

#[test]
fn default_profile_resolves_without_config_file() {
    let cli = test_cli(".counsel/missing.toml", "default");
    let profiles = load_profiles(&cli.config_path).expect("missing file should default");
    let cfg = resolve_runtime_config(&cli, &profiles).expect("config should resolve");

    assert_eq!(cfg.profile, "default");
    assert_eq!(cfg.app_name, "counsel-cli");
    assert!(cfg.telemetry_enabled);
    assert_eq!(cfg.telemetry_path, ".counsel/telemetry/events.jsonl");
    assert!(cfg.stage_timeout_secs.is_none());
}

#[test]
fn unknown_profile_lists_available_names() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "[profiles.staging]\nprovider = \"local\"\nendpoint = \"http://localhost:5273/v1\"\nmodel = \"phi-4\"\n",
    )
    .expect("config should write");

    let config_path = path.to_string_lossy().to_string();
    let cli = test_cli(&config_path, "production");
    let profiles = load_profiles(&config_path).expect("config should load");

    let err = resolve_runtime_config(&cli, &profiles).expect_err("unknown profile should fail");
    assert!(err.to_string().contains("staging"));
}

#[test]
fn profile_values_apply_and_cli_overrides_win() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "[profiles.local]\nprovider = \"local\"\nendpoint = \"http://localhost:5273/v1\"\nmodel = \"phi-4\"\nstage_timeout_secs = 90\n",
    )
    .expect("config should write");

    let config_path = path.to_string_lossy().to_string();
    let mut cli = test_cli(&config_path, "local");
    let profiles = load_profiles(&config_path).expect("config should load");
    let cfg = resolve_runtime_config(&cli, &profiles).expect("config should resolve");
    assert_eq!(cfg.provider, Provider::Local);
    assert_eq!(cfg.endpoint.as_deref(), Some("http://localhost:5273/v1"));
    assert_eq!(cfg.model.as_deref(), Some("phi-4"));
    assert_eq!(cfg.stage_timeout_secs, Some(90));

    cli.model = Some("phi-4-mini".to_string());
    cli.stage_timeout_secs = Some(30);
    let cfg = resolve_runtime_config(&cli, &profiles).expect("config should resolve");
    assert_eq!(cfg.model.as_deref(), Some("phi-4-mini"));
    assert_eq!(cfg.stage_timeout_secs, Some(30));
}

#[test]
fn invalid_profile_field_fails_to_load() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[profiles.bad]\nnot_a_field = true\n").expect("config should write");

    let err = load_profiles(&path.to_string_lossy()).expect_err("unknown field should fail");
    assert!(err.to_string().contains("invalid profile configuration"));
}

#[test]
fn prompt_limit_is_enforced() {
    assert!(enforce_prompt_limit("short", 16).is_ok());
    let err = enforce_prompt_limit(&"x".repeat(64), 16).expect_err("long prompt should fail");
    assert!(err.to_string().contains("character limit"));
}

#[test]
fn run_options_carry_the_stage_timeout() {
    let mut cfg = base_cfg();
    assert!(cfg.run_options().stage_timeout.is_none());
    cfg.stage_timeout_secs = Some(12);
    assert_eq!(
        cfg.run_options().stage_timeout,
        Some(Duration::from_secs(12))
    );
}

#[test]
fn profiles_list_includes_the_implicit_default() {
    let profiles = ProfilesFile::default();
    let cfg = base_cfg();
    run_profiles_list(&profiles, &cfg).expect("listing should pass");
}

// -------------------------------------------------------------------------
// Provider resolution
// -------------------------------------------------------------------------

#[test]
fn model_validation_matches_provider_families() {
    assert!(validate_model_for_provider(Provider::Openai, "gpt-4o-mini").is_ok());
    assert!(validate_model_for_provider(Provider::Openai, "o3-mini").is_ok());
    assert!(validate_model_for_provider(Provider::Openai, "phi-4").is_err());
    assert!(validate_model_for_provider(Provider::Local, "phi-4").is_ok());
    assert!(validate_model_for_provider(Provider::Local, "  ").is_err());
    assert!(validate_model_for_provider(Provider::Auto, "anything").is_ok());
}

#[test]
fn provider_names_parse_case_insensitively() {
    assert_eq!(
        parse_provider_name("OpenAI").expect("should parse"),
        Provider::Openai
    );
    assert_eq!(
        parse_provider_name("local").expect("should parse"),
        Provider::Local
    );
    assert!(parse_provider_name("bedrock").is_err());
}

// -------------------------------------------------------------------------
// Error rendering
// -------------------------------------------------------------------------

#[test]
fn errors_categorize_by_rendered_message() {
    let provider_err = anyhow::anyhow!("OPENAI_API_KEY is required for OpenAI provider");
    assert_eq!(categorize_error(&provider_err), ErrorCategory::Provider);

    let workflow_err = anyhow::anyhow!("research stage failed: endpoint unreachable");
    assert_eq!(categorize_error(&workflow_err), ErrorCategory::Workflow);

    let input_err = anyhow::anyhow!("profile 'x' not found in '.counsel/config.toml'");
    assert_eq!(categorize_error(&input_err), ErrorCategory::Input);

    let internal_err = anyhow::anyhow!("something odd happened");
    assert_eq!(categorize_error(&internal_err), ErrorCategory::Internal);
}

#[test]
fn cli_errors_render_with_category_and_hint() {
    let err = anyhow::anyhow!("no provider could be auto-detected");
    let rendered = format_cli_error(&err);
    assert!(rendered.contains("[PROVIDER]"));
    assert!(rendered.contains("Hint:"));
}

// -------------------------------------------------------------------------
// Telemetry
// -------------------------------------------------------------------------

#[test]
fn telemetry_sink_appends_jsonl_records() {
    let dir = tempdir().expect("temp directory should create");
    let mut cfg = base_cfg();
    cfg.telemetry_enabled = true;
    cfg.telemetry_path = dir
        .path()
        .join("telemetry/events.jsonl")
        .to_string_lossy()
        .to_string();

    let sink = TelemetrySink::new(&cfg, "test".to_string());
    sink.emit("stage.started", serde_json::json!({ "stage": "plan" }));
    sink.emit("workflow.completed", serde_json::json!({ "chars": 42 }));

    let content = std::fs::read_to_string(&cfg.telemetry_path).expect("file should exist");
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    let first: serde_json::Value = serde_json::from_str(lines[0]).expect("line should parse");
    assert_eq!(first["event"], "stage.started");
    assert_eq!(first["stage"], "plan");
}

#[test]
fn disabled_telemetry_sink_writes_nothing() {
    let dir = tempdir().expect("temp directory should create");
    let mut cfg = base_cfg();
    cfg.telemetry_path = dir
        .path()
        .join("events.jsonl")
        .to_string_lossy()
        .to_string();

    let sink = TelemetrySink::new(&cfg, "test".to_string());
    sink.emit("stage.started", serde_json::json!({}));
    assert!(!std::path::Path::new(&cfg.telemetry_path).exists());
}

#[test]
fn telemetry_summary_counts_lifecycle_events() {
    let lines = vec![
        r#"{"event":"stage.started","run_id":"r1","command":"ask","ts_unix_ms":100}"#.to_string(),
        r#"{"event":"stage.completed","run_id":"r1","command":"ask","ts_unix_ms":200}"#.to_string(),
        r#"{"event":"workflow.completed","run_id":"r1","command":"ask","ts_unix_ms":300}"#
            .to_string(),
        r#"{"event":"workflow.failed","run_id":"r2","command":"chat","ts_unix_ms":400}"#
            .to_string(),
        "not json".to_string(),
    ];

    let summary = summarize_telemetry_lines(lines, 100);
    assert_eq!(summary.total_lines, 5);
    assert_eq!(summary.parsed_events, 4);
    assert_eq!(summary.parse_errors, 1);
    assert_eq!(summary.stage_started, 1);
    assert_eq!(summary.stage_completed, 1);
    assert_eq!(summary.workflow_completed, 1);
    assert_eq!(summary.workflow_failed, 1);
    assert_eq!(summary.unique_runs.len(), 2);
    assert_eq!(summary.last_event_ts_unix_ms, Some(400));
}

// -------------------------------------------------------------------------
// Chat commands
// -------------------------------------------------------------------------

#[test]
fn chat_commands_parse() {
    assert_eq!(
        parse_chat_command("/exit"),
        ParsedChatCommand::Command(ChatCommand::Exit)
    );
    assert_eq!(
        parse_chat_command("exit"),
        ParsedChatCommand::Command(ChatCommand::Exit)
    );
    assert_eq!(
        parse_chat_command("/status"),
        ParsedChatCommand::Command(ChatCommand::Status)
    );
    assert_eq!(
        parse_chat_command("/stages"),
        ParsedChatCommand::Command(ChatCommand::Stages)
    );
    assert_eq!(
        parse_chat_command("/provider local"),
        ParsedChatCommand::Command(ChatCommand::Provider("local".to_string()))
    );
    assert_eq!(
        parse_chat_command("/provider"),
        ParsedChatCommand::MissingArgument {
            usage: "/provider <auto|openai|local>"
        }
    );
    assert_eq!(
        parse_chat_command("/model gpt-4o-mini"),
        ParsedChatCommand::Command(ChatCommand::Model(Some("gpt-4o-mini".to_string())))
    );
    assert_eq!(
        parse_chat_command("/model"),
        ParsedChatCommand::Command(ChatCommand::Model(None))
    );
    assert_eq!(
        parse_chat_command("plain prompt text"),
        ParsedChatCommand::NotACommand
    );
    assert_eq!(
        parse_chat_command("/bogus"),
        ParsedChatCommand::UnknownCommand("/bogus".to_string())
    );
}

// -------------------------------------------------------------------------
// Server
// -------------------------------------------------------------------------

fn test_server_state(auth_token: Option<&str>) -> Arc<ServerState> {
    let cfg = base_cfg();
    let telemetry = test_telemetry(&cfg);
    Arc::new(ServerState {
        cfg,
        workflow: append_chain(&["plan", "research", "advise"]),
        telemetry,
        provider_label: "local".to_string(),
        model_name: "mock-model".to_string(),
        auth_token: auth_token.map(str::to_string),
    })
}

#[tokio::test]
async fn server_health_reports_stage_order() {
    let state = test_server_state(None);
    let response = handle_server_health(State(state)).await;
    assert_eq!(response.0.status, "ok");
    assert_eq!(response.0.stages, ["plan", "research", "advise"]);
}

#[tokio::test]
async fn server_run_returns_answer_and_stage_outputs() {
    let state = test_server_state(None);
    let response = handle_server_run(
        State(state),
        HeaderMap::new(),
        Json(ServerRunRequest {
            prompt: "X".to_string(),
        }),
    )
    .await
    .expect("run should pass");

    assert_eq!(response.0.answer, "X+plan+research+advise");
    assert_eq!(response.0.stages.len(), 3);
    assert_eq!(response.0.stages[2].stage, "advise");
}

#[tokio::test]
async fn server_run_rejects_empty_prompts() {
    let state = test_server_state(None);
    let err = handle_server_run(
        State(state),
        HeaderMap::new(),
        Json(ServerRunRequest {
            prompt: "   ".to_string(),
        }),
    )
    .await
    .expect_err("empty prompt should fail");
    assert_eq!(err.0, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn server_auth_enforces_the_bearer_token() {
    let state = test_server_state(Some("secret-token"));

    let mut headers = HeaderMap::new();
    assert!(check_server_auth(&state, &headers).is_err());

    headers.insert(
        header::AUTHORIZATION,
        "Bearer wrong".parse().expect("header should parse"),
    );
    assert!(check_server_auth(&state, &headers).is_err());

    headers.insert(
        header::AUTHORIZATION,
        "Bearer secret-token".parse().expect("header should parse"),
    );
    assert!(check_server_auth(&state, &headers).is_ok());

    let open_state = test_server_state(None);
    assert!(check_server_auth(&open_state, &HeaderMap::new()).is_ok());
}
