use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::agent::{Agent, AgentError};
use crate::workflow::event::RunEvent;
use crate::workflow::graph::Workflow;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("stage '{stage}' failed: {source}")]
    StageFailed {
        stage: String,
        #[source]
        source: AgentError,
    },
    #[error("stage '{stage}' timed out after {timeout_secs}s")]
    StageTimeout { stage: String, timeout_secs: u64 },
    #[error("run cancelled while stage '{stage}' was in flight")]
    Cancelled { stage: String },
}

impl RunError {
    pub fn stage(&self) -> &str {
        match self {
            RunError::StageFailed { stage, .. }
            | RunError::StageTimeout { stage, .. }
            | RunError::Cancelled { stage } => stage,
        }
    }

    /// The cause message without the stage prefix, for terminal events where
    /// the stage identifier travels in its own field.
    pub fn cause(&self) -> String {
        match self {
            RunError::StageFailed { source, .. } => source.to_string(),
            RunError::StageTimeout { timeout_secs, .. } => {
                format!("stage invocation timed out after {timeout_secs}s")
            }
            RunError::Cancelled { .. } => "run cancelled".to_string(),
        }
    }
}

/// Caller-supplied execution policy. Timeouts apply per stage invocation;
/// the engine itself imposes none.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub stage_timeout: Option<Duration>,
}

/// Requests cancellation of one run. Cloneable; cancelling is idempotent.
/// Propagation is best effort: the in-flight stage invocation is dropped and
/// no subsequent stage starts.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// The finite, single-shot event sequence of one run. Dropping the stream
/// stops the run before its next stage.
pub struct RunStream {
    events: mpsc::Receiver<RunEvent>,
    cancel: CancelHandle,
}

impl RunStream {
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

impl Stream for RunStream {
    type Item = RunEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}

/// Executes a built [`Workflow`]: feeds the caller input to the start stage
/// and every subsequent stage its upstream stage's completed output, in
/// strict traversal order. Each `run` call creates a fresh, private Run; the
/// shared workflow is read-only, so concurrent runs never observe each
/// other's state.
pub struct Runner {
    workflow: Arc<Workflow>,
    options: RunOptions,
}

impl Runner {
    pub fn new(workflow: Arc<Workflow>) -> Self {
        Self {
            workflow,
            options: RunOptions::default(),
        }
    }

    pub fn with_options(workflow: Arc<Workflow>, options: RunOptions) -> Self {
        Self { workflow, options }
    }

    pub fn workflow(&self) -> &Arc<Workflow> {
        &self.workflow
    }

    pub fn run(&self, input: impl Into<String>) -> RunStream {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        tokio::spawn(execute_run(
            Arc::clone(&self.workflow),
            self.options.clone(),
            input.into(),
            tx,
            cancel_rx,
        ));
        RunStream {
            events: rx,
            cancel: CancelHandle {
                tx: Arc::new(cancel_tx),
            },
        }
    }
}

async fn execute_run(
    workflow: Arc<Workflow>,
    options: RunOptions,
    input: String,
    tx: mpsc::Sender<RunEvent>,
    mut cancelled: watch::Receiver<bool>,
) {
    let mut outputs: HashMap<String, String> = HashMap::new();

    for stage_id in workflow.traversal_order() {
        if *cancelled.borrow_and_update() {
            let _ = tx
                .send(RunEvent::WorkflowFailed {
                    stage: stage_id.clone(),
                    error: "run cancelled".to_string(),
                })
                .await;
            return;
        }

        let stage_input = if stage_id == workflow.start() {
            input.clone()
        } else {
            join_upstream(&workflow, stage_id, &outputs)
        };

        if tx
            .send(RunEvent::StageStarted {
                stage: stage_id.clone(),
            })
            .await
            .is_err()
        {
            return;
        }

        let agent = workflow
            .agent(stage_id)
            .map(Arc::clone)
            .unwrap_or_else(|| unreachable!("traversal order only contains registered stages"));

        let stage_future = run_stage(stage_id, agent, stage_input, &tx);
        let result = match options.stage_timeout {
            Some(timeout) => {
                tokio::select! {
                    _ = cancelled.changed() => Err(RunError::Cancelled { stage: stage_id.clone() }),
                    outcome = tokio::time::timeout(timeout, stage_future) => match outcome {
                        Ok(result) => result,
                        Err(_) => Err(RunError::StageTimeout {
                            stage: stage_id.clone(),
                            timeout_secs: timeout.as_secs(),
                        }),
                    },
                }
            }
            None => {
                tokio::select! {
                    _ = cancelled.changed() => Err(RunError::Cancelled { stage: stage_id.clone() }),
                    result = stage_future => result,
                }
            }
        };

        match result {
            Ok(output) => {
                if tx
                    .send(RunEvent::StageCompleted {
                        stage: stage_id.clone(),
                        output: output.clone(),
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                outputs.insert(stage_id.clone(), output);
            }
            Err(err) => {
                tracing::warn!(stage = %err.stage(), error = %err, "workflow run failed");
                let _ = tx
                    .send(RunEvent::WorkflowFailed {
                        stage: err.stage().to_string(),
                        error: err.cause(),
                    })
                    .await;
                return;
            }
        }
    }

    let output = outputs
        .remove(workflow.terminal_stage())
        .unwrap_or_default();
    let _ = tx.send(RunEvent::WorkflowCompleted { output }).await;
}

async fn run_stage(
    stage_id: &str,
    agent: Arc<dyn Agent>,
    input: String,
    tx: &mpsc::Sender<RunEvent>,
) -> Result<String, RunError> {
    let mut chunks = agent.invoke(&input).await.map_err(|source| {
        RunError::StageFailed {
            stage: stage_id.to_string(),
            source,
        }
    })?;

    let mut aggregated = String::new();
    while let Some(chunk) = chunks.next().await {
        let delta = chunk.map_err(|source| RunError::StageFailed {
            stage: stage_id.to_string(),
            source,
        })?;
        if delta.is_empty() {
            continue;
        }
        aggregated.push_str(&delta);
        if tx
            .send(RunEvent::StageDelta {
                stage: stage_id.to_string(),
                delta,
            })
            .await
            .is_err()
        {
            // Consumer dropped the stream; abort without a terminal event
            // (nobody is listening).
            return Err(RunError::Cancelled {
                stage: stage_id.to_string(),
            });
        }
    }

    if aggregated.trim().is_empty() {
        return Err(RunError::StageFailed {
            stage: stage_id.to_string(),
            source: AgentError::Invocation("stage produced no textual output".to_string()),
        });
    }

    Ok(aggregated)
}

/// Input for a non-start stage: its upstream stages' completed outputs in
/// traversal order. The linear chain used by the advisory pipeline has
/// exactly one upstream per stage, making this a verbatim pass-through.
fn join_upstream(workflow: &Workflow, stage_id: &str, outputs: &HashMap<String, String>) -> String {
    let mut upstream: Vec<&str> = workflow
        .upstream_of(stage_id)
        .iter()
        .map(String::as_str)
        .collect();
    upstream.sort_by_key(|id| {
        workflow
            .traversal_order()
            .iter()
            .position(|ordered| ordered.as_str() == *id)
    });

    upstream
        .iter()
        .filter_map(|id| outputs.get(*id))
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n\n")
}
