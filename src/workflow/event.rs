use serde::Serialize;

/// One notification from a run. The sequence for a successful run is
/// `StageStarted/StageDelta*/StageCompleted` per stage in traversal order,
/// then exactly one `WorkflowCompleted`. A failing run ends with one
/// `WorkflowFailed` instead; nothing follows a terminal event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEvent {
    StageStarted { stage: String },
    StageDelta { stage: String, delta: String },
    StageCompleted { stage: String, output: String },
    WorkflowCompleted { output: String },
    WorkflowFailed { stage: String, error: String },
}

impl RunEvent {
    pub fn stage(&self) -> Option<&str> {
        match self {
            RunEvent::StageStarted { stage }
            | RunEvent::StageDelta { stage, .. }
            | RunEvent::StageCompleted { stage, .. }
            | RunEvent::WorkflowFailed { stage, .. } => Some(stage),
            RunEvent::WorkflowCompleted { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::WorkflowCompleted { .. } | RunEvent::WorkflowFailed { .. }
        )
    }
}

/// Lifecycle of a single run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RunStatus {
    #[default]
    Pending,
    Running(String),
    Completed,
    Failed,
}

impl RunStatus {
    pub fn observe(&mut self, event: &RunEvent) {
        match event {
            RunEvent::StageStarted { stage } => *self = RunStatus::Running(stage.clone()),
            RunEvent::WorkflowCompleted { .. } => *self = RunStatus::Completed,
            RunEvent::WorkflowFailed { .. } => *self = RunStatus::Failed,
            RunEvent::StageDelta { .. } | RunEvent::StageCompleted { .. } => {}
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}
