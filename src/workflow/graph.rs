use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use thiserror::Error;

use crate::agent::Agent;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("stage '{id}' is already registered")]
    DuplicateStage { id: String },
    #[error("stage '{id}' is not registered")]
    UnknownStage { id: String },
    #[error("invalid workflow topology: {reason}")]
    InvalidTopology { reason: String },
}

/// A directed dependency: the destination stage's input is the source
/// stage's completed output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

struct Stage {
    id: String,
    agent: Arc<dyn Agent>,
}

/// Accumulates stages and edges, validating identifiers eagerly and the
/// topology once at build time. Nothing partially built ever escapes:
/// `build` either returns a fully validated [`Workflow`] or an error.
#[derive(Default)]
pub struct WorkflowBuilder {
    stages: Vec<Stage>,
    edges: Vec<Edge>,
    start: Option<String>,
}

impl std::fmt::Debug for WorkflowBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowBuilder")
            .field(
                "stages",
                &self.stages.iter().map(|s| &s.id).collect::<Vec<_>>(),
            )
            .field("edges", &self.edges)
            .field("start", &self.start)
            .finish()
    }
}

impl WorkflowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stage(
        &mut self,
        id: impl Into<String>,
        agent: Arc<dyn Agent>,
    ) -> Result<&mut Self, GraphError> {
        let id = id.into();
        if self.stages.iter().any(|stage| stage.id == id) {
            return Err(GraphError::DuplicateStage { id });
        }
        self.stages.push(Stage { id, agent });
        Ok(self)
    }

    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<&mut Self, GraphError> {
        self.require_stage(from)?;
        self.require_stage(to)?;
        self.edges.push(Edge {
            from: from.to_string(),
            to: to.to_string(),
        });
        Ok(self)
    }

    pub fn set_start(&mut self, id: &str) -> Result<&mut Self, GraphError> {
        self.require_stage(id)?;
        self.start = Some(id.to_string());
        Ok(self)
    }

    fn require_stage(&self, id: &str) -> Result<(), GraphError> {
        if self.stages.iter().any(|stage| stage.id == id) {
            Ok(())
        } else {
            Err(GraphError::UnknownStage { id: id.to_string() })
        }
    }

    pub fn build(self) -> Result<Workflow, GraphError> {
        let start = self.start.ok_or_else(|| GraphError::InvalidTopology {
            reason: "no start stage designated".to_string(),
        })?;

        if self.edges.iter().any(|edge| edge.to == start) {
            return Err(GraphError::InvalidTopology {
                reason: format!("start stage '{start}' has an incoming edge"),
            });
        }

        let order = topological_order(&self.stages, &self.edges)?;

        // Every stage must be reachable from the start by following edges.
        let mut reachable = HashSet::new();
        reachable.insert(start.clone());
        let mut frontier = VecDeque::from([start.clone()]);
        while let Some(current) = frontier.pop_front() {
            for edge in self.edges.iter().filter(|edge| edge.from == current) {
                if reachable.insert(edge.to.clone()) {
                    frontier.push_back(edge.to.clone());
                }
            }
        }
        if let Some(orphan) = self
            .stages
            .iter()
            .find(|stage| !reachable.contains(&stage.id))
        {
            return Err(GraphError::InvalidTopology {
                reason: format!(
                    "stage '{}' is not reachable from start stage '{start}'",
                    orphan.id
                ),
            });
        }

        let mut upstream: HashMap<String, Vec<String>> = HashMap::new();
        for edge in &self.edges {
            upstream
                .entry(edge.to.clone())
                .or_default()
                .push(edge.from.clone());
        }

        Ok(Workflow {
            stages: self
                .stages
                .into_iter()
                .map(|stage| (stage.id, stage.agent))
                .collect(),
            edges: self.edges,
            start,
            order,
            upstream,
        })
    }
}

/// The immutable, validated topology: stages, edges, a designated start
/// stage, and the traversal order computed at build time. Holds no run
/// state, so one instance is safely shared across concurrent runs.
pub struct Workflow {
    stages: HashMap<String, Arc<dyn Agent>>,
    edges: Vec<Edge>,
    start: String,
    order: Vec<String>,
    upstream: HashMap<String, Vec<String>>,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field(
                "stages",
                &self.stages.keys().collect::<Vec<_>>(),
            )
            .field("edges", &self.edges)
            .field("start", &self.start)
            .field("order", &self.order)
            .field("upstream", &self.upstream)
            .finish()
    }
}

impl Workflow {
    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn traversal_order(&self) -> &[String] {
        &self.order
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn agent(&self, id: &str) -> Option<&Arc<dyn Agent>> {
        self.stages.get(id)
    }

    pub fn upstream_of(&self, id: &str) -> &[String] {
        self.upstream.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn terminal_stage(&self) -> &str {
        // Non-empty by construction: build() rejects graphs without a start.
        self.order.last().map(String::as_str).unwrap_or(&self.start)
    }
}

/// Kahn's algorithm over the registered stages. Ties break by registration
/// order so the traversal is deterministic. A leftover stage means a cycle.
fn topological_order(stages: &[Stage], edges: &[Edge]) -> Result<Vec<String>, GraphError> {
    let mut indegree: HashMap<&str, usize> =
        stages.iter().map(|stage| (stage.id.as_str(), 0)).collect();
    for edge in edges {
        if let Some(count) = indegree.get_mut(edge.to.as_str()) {
            *count += 1;
        }
    }

    let mut ready: VecDeque<&str> = stages
        .iter()
        .filter(|stage| indegree[stage.id.as_str()] == 0)
        .map(|stage| stage.id.as_str())
        .collect();
    let mut order = Vec::with_capacity(stages.len());

    while let Some(current) = ready.pop_front() {
        order.push(current.to_string());
        for edge in edges.iter().filter(|edge| edge.from == current) {
            if let Some(count) = indegree.get_mut(edge.to.as_str()) {
                *count -= 1;
                if *count == 0 {
                    ready.push_back(edge.to.as_str());
                }
            }
        }
    }

    if order.len() != stages.len() {
        return Err(GraphError::InvalidTopology {
            reason: "workflow edges form a cycle".to_string(),
        });
    }

    Ok(order)
}
