use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use reqwest::{Client, header};
use serde::{Deserialize, Serialize};

use crate::model::{ChatMessage, ChatModel, ChatStream, ModelError};

const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Client for any OpenAI-compatible chat-completions endpoint (OpenAI,
/// Foundry Local, Ollama, vLLM, and similar gateways).
pub struct OpenAiChatModel {
    http: Client,
    endpoint: String,
    model: String,
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
}

impl OpenAiConfig {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

impl OpenAiChatModel {
    pub fn new(config: OpenAiConfig) -> Result<Self, ModelError> {
        let endpoint = config.endpoint.trim().trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(ModelError::Configuration(
                "chat endpoint cannot be empty".to_string(),
            ));
        }
        if config.model.trim().is_empty() {
            return Err(ModelError::Configuration(
                "model identifier cannot be empty".to_string(),
            ));
        }

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        if let Some(api_key) = config.api_key.as_deref().filter(|key| !key.is_empty()) {
            let value = header::HeaderValue::from_str(&format!("Bearer {api_key}"))
                .map_err(|err| ModelError::Configuration(format!("invalid api key: {err}")))?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let http = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|err| ModelError::Configuration(format!("http client build failed: {err}")))?;

        Ok(Self {
            http,
            endpoint,
            model: config.model,
        })
    }

    fn completions_url(&self) -> String {
        // Accept both a bare base url and a full /chat/completions url.
        if self.endpoint.ends_with("/chat/completions") {
            self.endpoint.clone()
        } else {
            format!("{}/chat/completions", self.endpoint)
        }
    }

    async fn send(
        &self,
        messages: Vec<ChatMessage>,
        stream: bool,
    ) -> Result<reqwest::Response, ModelError> {
        let body = CompletionRequest {
            model: self.model.clone(),
            messages: messages
                .into_iter()
                .map(|message| WireMessage {
                    role: message.role.as_str(),
                    content: message.content,
                })
                .collect(),
            stream,
        };

        let response = self
            .http
            .post(self.completions_url())
            .json(&body)
            .send()
            .await
            .map_err(|err| ModelError::Request(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|parsed| parsed.error.message)
                .unwrap_or(body);
            return Err(ModelError::Endpoint { status, message });
        }

        Ok(response)
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        stream: bool,
    ) -> Result<ChatStream, ModelError> {
        if !stream {
            let response = self.send(messages, false).await?;
            let parsed: CompletionResponse = response
                .json()
                .await
                .map_err(|err| ModelError::Request(format!("invalid response body: {err}")))?;
            let text = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content)
                .unwrap_or_default();
            if text.trim().is_empty() {
                return Err(ModelError::EmptyResponse);
            }
            return Ok(Box::pin(futures::stream::once(async move {
                Ok::<_, ModelError>(text)
            })));
        }

        let response = self.send(messages, true).await?;
        let sse = SseStream::new(response.bytes_stream());
        let deltas = sse.filter_map(|event| async move { parse_stream_event(&event) });
        Ok(Box::pin(deltas))
    }
}

fn parse_stream_event(event: &SseEvent) -> Option<Result<String, ModelError>> {
    let data = event.data.trim();
    if data == "[DONE]" {
        return None;
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            let choice = chunk.choices.into_iter().next()?;
            if choice.finish_reason.is_some() {
                return None;
            }
            match choice.delta.content {
                Some(text) if !text.is_empty() => Some(Ok(text)),
                _ => None,
            }
        }
        Err(err) => {
            tracing::warn!(data = %data, error = %err, "failed to parse stream chunk");
            None
        }
    }
}

/// A parsed server-sent event. Only the data payload matters for the
/// chat-completions protocol.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub data: String,
}

/// Incremental SSE parser. Feed raw chunks, get back complete events;
/// partial events stay buffered until their terminating blank line arrives.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(boundary) = self.buffer.find("\n\n") {
            let block = self.buffer[..boundary].to_string();
            self.buffer.drain(..boundary + 2);

            let data_lines = block
                .lines()
                .filter_map(|line| {
                    line.strip_prefix("data: ")
                        .or_else(|| line.strip_prefix("data:"))
                })
                .collect::<Vec<_>>();

            if !data_lines.is_empty() {
                events.push(SseEvent {
                    data: data_lines.join("\n"),
                });
            }
        }

        events
    }
}

/// Adapts a raw byte stream from the endpoint into a stream of SSE events.
pub struct SseStream<S> {
    inner: S,
    parser: SseParser,
    pending: Vec<SseEvent>,
}

impl<S> SseStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            parser: SseParser::new(),
            pending: Vec::new(),
        }
    }
}

impl<S> Stream for SseStream<S>
where
    S: Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Unpin,
{
    type Item = SseEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                return Poll::Ready(Some(this.pending.remove(0)));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let text = String::from_utf8_lossy(&bytes);
                    this.pending = this.parser.feed(&text);
                }
                Poll::Ready(Some(Err(_))) | Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
