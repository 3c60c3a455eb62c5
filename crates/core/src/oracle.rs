//! Oracle trait: the boundary to whatever produces natural-language
//! reasoning.
//!
//! An Oracle knows how to turn a message list into a completion, a stream of
//! text deltas, or embeddings. On top of the trait sit the three call shapes
//! the engine uses:
//!
//! - [`invoke_structured`]: completion parsed into a typed value
//! - [`invoke_streaming`]: lazy sequence of text fragments
//! - [`invoke_tool_capable`]: completion with a tool-calling loop

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::OracleError;
use crate::message::{Message, MessageToolCall};
use crate::tool::ToolRegistry;

/// A single request to the oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleRequest {
    /// The model to use (e.g., "gpt-4o-mini")
    pub model: String,

    pub messages: Vec<Message>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Tools the model may call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    #[serde(default)]
    pub stream: bool,

    /// Constrains the completion to a JSON schema when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

fn default_temperature() -> f32 {
    0.7
}

/// A named JSON schema the completion must conform to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFormat {
    pub name: String,
    pub schema: serde_json::Value,
}

impl ResponseFormat {
    pub fn new(name: impl Into<String>, schema: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }
}

/// A tool definition sent to the oracle so it knows what it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// A complete (non-streaming) response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleResponse {
    pub message: Message,
    pub usage: Option<Usage>,
    /// Which model actually responded (may differ from requested)
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A single chunk in a streaming response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Partial content delta
    #[serde(default)]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    #[serde(default)]
    pub done: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub model: String,
    pub inputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    /// One vector per input text.
    pub embeddings: Vec<Vec<f32>>,
    pub model: String,
}

/// Receiver side of a streamed oracle response.
pub type ChunkStream = mpsc::Receiver<Result<StreamChunk, OracleError>>;

/// Text fragments produced by [`invoke_streaming`].
pub type FragmentStream = mpsc::Receiver<Result<String, OracleError>>;

/// The core Oracle trait.
///
/// Strategies call `complete()` or `stream()` without knowing which backend
/// answers.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// A human-readable backend name (e.g., "openai", "scripted").
    fn name(&self) -> &str;

    async fn complete(&self, request: OracleRequest) -> Result<OracleResponse, OracleError>;

    /// Send a request and get a stream of response chunks.
    ///
    /// Default implementation calls `complete()` and wraps the result as a single chunk.
    async fn stream(&self, request: OracleRequest) -> Result<ChunkStream, OracleError> {
        let response = self.complete(request).await?;
        let (tx, rx) = mpsc::channel(1);
        let _ = tx
            .send(Ok(StreamChunk {
                content: Some(response.message.content),
                tool_calls: response.message.tool_calls,
                done: true,
                usage: response.usage,
            }))
            .await;
        Ok(rx)
    }

    /// Default implementation reports embeddings as unsupported.
    async fn embed(&self, _request: EmbeddingRequest) -> Result<EmbeddingResponse, OracleError> {
        Err(OracleError::NotConfigured(format!(
            "oracle '{}' does not support embeddings",
            self.name()
        )))
    }
}

/// Model parameters shared by every call a strategy makes.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl ModelSettings {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: default_temperature(),
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Same parameters, different model.
    pub fn for_model(&self, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..self.clone()
        }
    }

    pub fn request(&self, messages: Vec<Message>) -> OracleRequest {
        OracleRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: Vec::new(),
            stream: false,
            response_format: None,
        }
    }
}

/// Plain completion of a single user prompt.
pub async fn invoke_text(
    oracle: &dyn Oracle,
    settings: &ModelSettings,
    prompt: &str,
) -> Result<String, OracleError> {
    let response = oracle.complete(settings.request(vec![Message::user(prompt)])).await?;
    Ok(response.message.content)
}

/// Structured call: the completion is constrained to `format` and parsed as `T`.
pub async fn invoke_structured<T: DeserializeOwned>(
    oracle: &dyn Oracle,
    settings: &ModelSettings,
    prompt: &str,
    format: &ResponseFormat,
) -> Result<T, OracleError> {
    let mut request = settings.request(vec![Message::user(prompt)]);
    request.response_format = Some(format.clone());
    let response = oracle.complete(request).await?;
    let body = strip_code_fences(&response.message.content);
    serde_json::from_str(body).map_err(|e| {
        OracleError::MalformedOutput(format!("{} did not match schema '{}': {e}", body, format.name))
    })
}

/// Streaming call: returns text fragments as they arrive.
///
/// Empty deltas are dropped. A mid-stream error is forwarded as the final item.
pub async fn invoke_streaming(
    oracle: &dyn Oracle,
    settings: &ModelSettings,
    messages: Vec<Message>,
) -> Result<FragmentStream, OracleError> {
    let mut request = settings.request(messages);
    request.stream = true;
    let mut chunks = oracle.stream(request).await?;

    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        while let Some(item) = chunks.recv().await {
            let forward = match item {
                Ok(chunk) => match chunk.content {
                    Some(text) if !text.is_empty() => Ok(text),
                    _ => continue,
                },
                Err(e) => Err(e),
            };
            let stop = forward.is_err();
            if tx.send(forward).await.is_err() || stop {
                break;
            }
        }
    });
    Ok(rx)
}

/// Result of a tool-capable call.
#[derive(Debug, Clone)]
pub struct ToolCompletion {
    /// The final text answer.
    pub content: String,
    /// Messages produced by this call, starting with the prompt.
    pub transcript: Vec<Message>,
    pub tool_calls_made: usize,
}

/// Tool-capable call: completion, execute requested tools, feed results
/// back, until the oracle answers without tool calls.
///
/// After `max_rounds` tool rounds a final call is made with no tools offered
/// so the run always ends in text.
pub async fn invoke_tool_capable(
    oracle: &dyn Oracle,
    settings: &ModelSettings,
    prompt: &str,
    tools: &ToolRegistry,
    history: &[Message],
    max_rounds: usize,
) -> Result<ToolCompletion, OracleError> {
    let definitions = tools.definitions();
    let mut messages: Vec<Message> = history.to_vec();
    let run_start = messages.len();
    messages.push(Message::user(prompt));
    let mut tool_calls_made = 0;

    for round in 0..=max_rounds {
        let mut request = settings.request(messages.clone());
        if round < max_rounds {
            request.tools = definitions.clone();
        }
        debug!(round, model = %settings.model, "Tool-capable oracle round");

        let response = oracle.complete(request).await?;
        if response.message.tool_calls.is_empty() {
            let content = response.message.content.clone();
            messages.push(response.message);
            return Ok(ToolCompletion {
                content,
                transcript: messages.split_off(run_start),
                tool_calls_made,
            });
        }

        let tool_calls = response.message.tool_calls.clone();
        messages.push(response.message);

        for tc in &tool_calls {
            tool_calls_made += 1;
            messages.push(tools.answer(tc).await);
        }
    }

    Err(OracleError::StreamInterrupted(
        "tool rounds exhausted without a final answer".into(),
    ))
}

/// Strip a surrounding markdown code fence (```json ... ```), if any.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}
