//! OpenAI-compatible oracle.
//!
//! Works with OpenAI, OpenRouter, Ollama, vLLM and any endpoint exposing
//! `/chat/completions` and `/embeddings`.
//!
//! Supports:
//! - Chat completions (non-streaming and streaming SSE)
//! - Tool calling
//! - JSON-schema constrained output (`response_format`)
//! - Embeddings

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use threadloom_config::OracleConfig;
use threadloom_core::error::OracleError;
use threadloom_core::message::{Message, MessageToolCall, Role};
use threadloom_core::oracle::*;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// An oracle backed by an OpenAI-compatible HTTP API.
pub struct OpenAiCompatOracle {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatOracle {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OracleError::NotConfigured(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    /// Build from the `[oracle]` config section.
    ///
    /// Local endpoints (Ollama) accept any key, so a missing key is only an
    /// error for the hosted default.
    pub fn from_config(config: &OracleConfig) -> Result<Self, OracleError> {
        let api_key = match (&config.api_key, config.provider.as_str()) {
            (Some(key), _) => key.clone(),
            (None, "ollama") => "ollama".into(),
            (None, _) => {
                return Err(OracleError::NotConfigured(
                    "no API key; set oracle.api_key or THREADLOOM_API_KEY".into(),
                ));
            }
        };
        Self::new(
            &config.provider,
            &config.base_url,
            api_key,
            std::time::Duration::from_secs(config.request_timeout_secs),
        )
    }

    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: match m.role {
                    Role::User => "user".into(),
                    Role::Assistant => "assistant".into(),
                    Role::System => "system".into(),
                    Role::Tool => "tool".into(),
                },
                content: Some(m.content.clone()),
                tool_calls: (!m.tool_calls.is_empty()).then(|| {
                    m.tool_calls
                        .iter()
                        .map(|tc| ApiToolCall {
                            id: tc.id.clone(),
                            r#type: "function".into(),
                            function: ApiFunction {
                                name: tc.name.clone(),
                                arguments: tc.arguments.clone(),
                            },
                        })
                        .collect()
                }),
                tool_call_id: m.tool_call_id.clone(),
            })
            .collect()
    }

    /// Request body shared by the blocking and streaming calls.
    fn build_body(request: &OracleRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if !request.tools.is_empty() {
            let tools: Vec<_> = request
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = serde_json::json!(tools);
        }

        if let Some(format) = &request.response_format {
            body["response_format"] = serde_json::json!({
                "type": "json_schema",
                "json_schema": {
                    "name": format.name,
                    "schema": format.schema,
                    "strict": false,
                }
            });
        }

        body
    }

    async fn post(&self, path: &str, body: &serde_json::Value, sse: bool) -> Result<reqwest::Response, OracleError> {
        let url = format!("{}/{path}", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");
        if sse {
            builder = builder.header("Accept", "text/event-stream");
        }

        let response = builder.json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                OracleError::Timeout(e.to_string())
            } else {
                OracleError::Network(e.to_string())
            }
        })?;
        check_status(response).await
    }
}

/// Map non-success HTTP statuses to oracle errors.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, OracleError> {
    let status = response.status().as_u16();
    match status {
        200 => Ok(response),
        429 => Err(OracleError::RateLimited { retry_after_secs: 5 }),
        401 | 403 => Err(OracleError::AuthenticationFailed(
            "Invalid API key or insufficient permissions".into(),
        )),
        _ => {
            let body = response.text().await.unwrap_or_default();
            warn!(status, body = %body, "Oracle returned error");
            Err(OracleError::ApiError {
                status_code: status,
                message: body,
            })
        }
    }
}

#[async_trait]
impl Oracle for OpenAiCompatOracle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: OracleRequest) -> Result<OracleResponse, OracleError> {
        debug!(oracle = %self.name, model = %request.model, "Sending completion request");
        let body = Self::build_body(&request, false);
        let response = self.post("chat/completions", &body, false).await?;

        let api_response: ApiResponse = response.json().await.map_err(|e| OracleError::ApiError {
            status_code: 200,
            message: format!("Failed to parse response: {e}"),
        })?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| OracleError::ApiError {
                status_code: 200,
                message: "No choices in response".into(),
            })?;

        let tool_calls: Vec<MessageToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| MessageToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect();

        let message = Message::assistant(choice.message.content.unwrap_or_default()).with_tool_calls(tool_calls);

        Ok(OracleResponse {
            message,
            usage: api_response.usage.map(Usage::from),
            model: api_response.model,
        })
    }

    async fn stream(&self, request: OracleRequest) -> Result<ChunkStream, OracleError> {
        debug!(oracle = %self.name, model = %request.model, "Sending streaming request");
        let mut body = Self::build_body(&request, true);
        body["stream_options"] = serde_json::json!({ "include_usage": true });
        let response = self.post("chat/completions", &body, true).await?;

        let (tx, rx) = mpsc::channel(64);
        let oracle_name = self.name.clone();

        // Read the SSE byte stream and forward content deltas
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut lines = SseLines::default();

            while let Some(next) = bytes.next().await {
                let chunk = match next {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(OracleError::StreamInterrupted(e.to_string()))).await;
                        return;
                    }
                };

                for event in lines.feed(&String::from_utf8_lossy(&chunk)) {
                    let SseEvent::Data(data) = event else {
                        let _ = tx.send(Ok(StreamChunk { done: true, ..Default::default() })).await;
                        return;
                    };
                    let parsed = match serde_json::from_str::<StreamResponse>(&data) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            trace!(oracle = %oracle_name, data = %data, error = %e, "Ignoring unparseable SSE chunk");
                            continue;
                        }
                    };
                    if let Some(content) = parsed
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.delta.content)
                        .filter(|c| !c.is_empty())
                    {
                        let delta = StreamChunk {
                            content: Some(content),
                            ..Default::default()
                        };
                        if tx.send(Ok(delta)).await.is_err() {
                            return; // receiver dropped
                        }
                    }
                    if let Some(usage) = parsed.usage {
                        let _ = tx
                            .send(Ok(StreamChunk {
                                done: true,
                                usage: Some(usage.into()),
                                ..Default::default()
                            }))
                            .await;
                        return;
                    }
                }
            }

            // Stream ended without [DONE]
            let _ = tx.send(Ok(StreamChunk { done: true, ..Default::default() })).await;
        });

        Ok(rx)
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, OracleError> {
        debug!(
            oracle = %self.name,
            model = %request.model,
            count = request.inputs.len(),
            "Sending embedding request"
        );
        let body = serde_json::json!({
            "model": request.model,
            "input": request.inputs,
            "encoding_format": "float",
        });
        let response = self.post("embeddings", &body, false).await?;

        let api_resp: EmbeddingApiResponse = response.json().await.map_err(|e| OracleError::ApiError {
            status_code: 200,
            message: format!("Failed to parse embedding response: {e}"),
        })?;

        Ok(EmbeddingResponse {
            embeddings: api_resp.data.into_iter().map(|d| d.embedding).collect(),
            model: api_resp.model,
        })
    }
}

// --- SSE framing ---

#[derive(Debug, PartialEq)]
enum SseEvent {
    Data(String),
    Done,
}

/// Splits a byte stream into complete `data:` payloads.
#[derive(Default)]
struct SseLines {
    buffer: String,
}

impl SseLines {
    fn feed(&mut self, text: &str) -> Vec<SseEvent> {
        self.buffer.push_str(text);
        let mut events = Vec::new();
        while let Some(end) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=end).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            // Skip blanks and SSE comments
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                events.push(SseEvent::Done);
            } else if !data.is_empty() {
                events.push(SseEvent::Data(data.to_string()));
            }
        }
        events
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    total_tokens: u32,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingData>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}
