use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Incremental text produced by a model. A non-streaming backend yields a
/// single chunk containing the whole response.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<String, ModelError>> + Send>>;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid model client configuration: {0}")]
    Configuration(String),
    #[error("model endpoint request failed: {0}")]
    Request(String),
    #[error("model endpoint returned HTTP {status}: {message}")]
    Endpoint { status: u16, message: String },
    #[error("model produced no textual output")]
    EmptyResponse,
}

/// The externally supplied model capability. The orchestrator only needs
/// "given a message history, produce a response, optionally as a stream of
/// incremental text"; concrete clients plug in behind this trait.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        stream: bool,
    ) -> Result<ChatStream, ModelError>;
}
