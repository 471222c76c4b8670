use std::collections::HashMap;
use std::io::{self, Write};

use anyhow::{Context, Result};
use futures::StreamExt;
use serde_json::json;

use crate::telemetry::TelemetrySink;
use crate::workflow::{RunEvent, RunStatus, Runner};

pub const NO_TEXTUAL_RESPONSE: &str = "No textual response produced by the pipeline.";

/// Final result of one pipeline run, with every stage's completed output in
/// completion order.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub answer: String,
    pub stage_outputs: Vec<(String, String)>,
}

/// Accumulates run events into per-stage outputs and the terminal result.
#[derive(Default, Debug)]
pub struct StageOutputTracker {
    stage_outputs: Vec<(String, String)>,
    buffers: HashMap<String, String>,
    final_output: Option<String>,
    failure: Option<(String, String)>,
    status: RunStatus,
}

impl StageOutputTracker {
    pub fn observe(&mut self, event: &RunEvent) {
        self.status.observe(event);
        match event {
            RunEvent::StageStarted { .. } => {}
            RunEvent::StageDelta { stage, delta } => {
                self.buffers.entry(stage.clone()).or_default().push_str(delta);
            }
            RunEvent::StageCompleted { stage, output } => {
                self.buffers.remove(stage);
                self.stage_outputs.push((stage.clone(), output.clone()));
            }
            RunEvent::WorkflowCompleted { output } => {
                self.final_output = Some(output.clone());
            }
            RunEvent::WorkflowFailed { stage, error } => {
                self.failure = Some((stage.clone(), error.clone()));
            }
        }
    }

    pub fn failure(&self) -> Option<&(String, String)> {
        self.failure.as_ref()
    }

    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    /// The terminal output, falling back to the last completed stage when the
    /// stream ended without a completion event (consumer-side abort).
    pub fn resolve_final(&self) -> Option<String> {
        if let Some(output) = &self.final_output {
            return Some(output.clone());
        }
        self.stage_outputs
            .last()
            .map(|(_, output)| output.clone())
            .filter(|output| !output.trim().is_empty())
    }

    pub fn into_outcome(self) -> Result<PipelineOutcome> {
        if let Some((stage, error)) = &self.failure {
            return Err(anyhow::anyhow!("{stage} stage failed: {error}"));
        }
        let answer = self
            .resolve_final()
            .unwrap_or_else(|| NO_TEXTUAL_RESPONSE.to_string());
        Ok(PipelineOutcome {
            answer,
            stage_outputs: self.stage_outputs,
        })
    }
}

/// Mirror run events into logs and the telemetry stream.
pub fn emit_run_lifecycle(event: &RunEvent, telemetry: &TelemetrySink) {
    match event {
        RunEvent::StageStarted { stage } => {
            tracing::info!(stage = %stage, "stage started");
            telemetry.emit("stage.started", json!({ "stage": stage }));
        }
        RunEvent::StageCompleted { stage, output } => {
            tracing::info!(stage = %stage, chars = output.len(), "stage completed");
            telemetry.emit(
                "stage.completed",
                json!({ "stage": stage, "chars": output.len() }),
            );
        }
        RunEvent::WorkflowCompleted { output } => {
            tracing::info!(chars = output.len(), "workflow completed");
            telemetry.emit("workflow.completed", json!({ "chars": output.len() }));
        }
        RunEvent::WorkflowFailed { stage, error } => {
            tracing::warn!(stage = %stage, error = %error, "workflow failed");
            telemetry.emit(
                "stage.failed",
                json!({ "stage": stage, "error": error }),
            );
            telemetry.emit(
                "workflow.failed",
                json!({ "stage": stage, "error": error }),
            );
        }
        RunEvent::StageDelta { .. } => {}
    }
}

/// Drive a run to completion without printing, returning the outcome.
pub async fn run_workflow(
    runner: &Runner,
    prompt: &str,
    telemetry: &TelemetrySink,
) -> Result<PipelineOutcome> {
    let mut stream = runner.run(prompt);
    let mut tracker = StageOutputTracker::default();

    while let Some(event) = stream.next().await {
        emit_run_lifecycle(&event, telemetry);
        tracker.observe(&event);
    }

    tracker.into_outcome()
}

/// Drive a run while rendering progress to stdout: a header per stage, then
/// that stage's text as it streams.
pub async fn run_workflow_streaming(
    runner: &Runner,
    prompt: &str,
    telemetry: &TelemetrySink,
) -> Result<PipelineOutcome> {
    let mut stream = runner.run(prompt);
    let mut tracker = StageOutputTracker::default();
    let mut stdout = io::stdout();

    while let Some(event) = stream.next().await {
        emit_run_lifecycle(&event, telemetry);

        match &event {
            RunEvent::StageStarted { stage } => {
                println!("\n--- {stage} ---");
            }
            RunEvent::StageDelta { delta, .. } => {
                print!("{delta}");
                stdout.flush().context("failed to flush stdout")?;
            }
            RunEvent::StageCompleted { .. } => {
                println!();
            }
            RunEvent::WorkflowCompleted { .. } | RunEvent::WorkflowFailed { .. } => {}
        }

        tracker.observe(&event);
    }

    tracker.into_outcome()
}
