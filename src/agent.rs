use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use thiserror::Error;

use crate::model::{ChatMessage, ChatModel, ModelError};

/// Incremental output of one stage invocation. Aggregating every item in
/// order yields the stage's completed output.
pub type AgentStream = Pin<Box<dyn Stream<Item = Result<String, AgentError>> + Send>>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid agent configuration: {0}")]
    Configuration(String),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("{0}")]
    Invocation(String),
}

/// A stage capability: accept an input, produce output, optionally as an
/// incremental stream. The orchestrator treats implementations as opaque;
/// model-backed agents, deterministic transforms, and test doubles all plug
/// in the same way.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn invoke(&self, input: &str) -> Result<AgentStream, AgentError>;
}

/// Model-backed agent: a fixed instruction block plus a chat model. The
/// stage input arrives as the user turn.
pub struct LlmAgent {
    name: String,
    description: String,
    instructions: String,
    model: Arc<dyn ChatModel>,
}

pub struct LlmAgentBuilder {
    name: String,
    description: Option<String>,
    instructions: Option<String>,
    model: Option<Arc<dyn ChatModel>>,
}

impl LlmAgentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            instructions: None,
            model: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn build(self) -> Result<LlmAgent, AgentError> {
        if self.name.trim().is_empty() {
            return Err(AgentError::Configuration(
                "agent name cannot be empty".to_string(),
            ));
        }
        let instructions = self
            .instructions
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| {
                AgentError::Configuration(format!(
                    "agent '{}' requires a non-empty instruction block",
                    self.name
                ))
            })?;
        let model = self.model.ok_or_else(|| {
            AgentError::Configuration(format!("agent '{}' requires a model", self.name))
        })?;

        Ok(LlmAgent {
            name: self.name,
            description: self.description.unwrap_or_default(),
            instructions,
            model,
        })
    }
}

impl std::fmt::Debug for LlmAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmAgent")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("instructions", &self.instructions)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Agent for LlmAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn invoke(&self, input: &str) -> Result<AgentStream, AgentError> {
        let messages = vec![
            ChatMessage::system(self.instructions.clone()),
            ChatMessage::user(input),
        ];
        let chunks = self.model.generate(messages, true).await?;
        Ok(Box::pin(chunks.map(|chunk| chunk.map_err(AgentError::from))))
    }
}
