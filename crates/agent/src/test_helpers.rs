//! Shared test helpers for strategy, engine and orchestrator tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use threadloom_core::error::OracleError;
use threadloom_core::message::{Message, MessageToolCall};
use threadloom_core::oracle::{
    ChunkStream, EmbeddingRequest, EmbeddingResponse, Oracle, OracleRequest, OracleResponse,
    StreamChunk, Usage,
};
use threadloom_core::{
    AccountId, Assistant, AssistantId, ResponseChunk, Session, SessionContext, SessionId, StrategyKind,
    Turn, UserId,
};
use tokio::sync::{mpsc, oneshot};

use crate::strategy::{Strategy, StrategyStream, chunk_channel};

/// One scripted reply to a `complete` call.
#[derive(Debug, Clone)]
pub enum Scripted {
    Text(String),
    ToolCalls(Vec<MessageToolCall>),
    Fail(OracleError),
}

/// One scripted reply to a `stream` call: fragments, then an optional
/// mid-stream failure.
#[derive(Debug, Clone, Default)]
pub struct ScriptedStream {
    pub fragments: Vec<String>,
    pub then_fail: Option<OracleError>,
}

impl ScriptedStream {
    pub fn fragments(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            then_fail: None,
        }
    }

    pub fn failing_after(fragments: &[&str], error: OracleError) -> Self {
        Self {
            then_fail: Some(error),
            ..Self::fragments(fragments)
        }
    }
}

/// An oracle that replays scripted completions and streams in order and
/// records every request it sees.
///
/// Once a queue runs dry further calls fail with an API error, which the
/// engine treats like any other oracle failure.
#[derive(Default)]
pub struct ScriptedOracle {
    completions: Mutex<VecDeque<Scripted>>,
    streams: Mutex<VecDeque<ScriptedStream>>,
    embedding: Vec<f32>,
    requests: Mutex<Vec<OracleRequest>>,
    stream_requests: Mutex<Vec<OracleRequest>>,
    embed_calls: AtomicUsize,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, text: &str) -> Self {
        self.push(Scripted::Text(text.to_string()))
    }

    pub fn fail(self, error: OracleError) -> Self {
        self.push(Scripted::Fail(error))
    }

    pub fn tool_calls(self, calls: Vec<MessageToolCall>) -> Self {
        self.push(Scripted::ToolCalls(calls))
    }

    /// Queue a structured reply carrying a plan.
    pub fn plan(self, steps: &[&str]) -> Self {
        let body = serde_json::json!({ "steps": steps });
        self.push(Scripted::Text(body.to_string()))
    }

    pub fn stream(self, stream: ScriptedStream) -> Self {
        self.streams.lock().unwrap().push_back(stream);
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    fn push(self, item: Scripted) -> Self {
        self.completions.lock().unwrap().push_back(item);
        self
    }

    /// Every `complete` request, in call order.
    pub fn requests(&self) -> Vec<OracleRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// The last user message of every `complete` request.
    pub fn prompts(&self) -> Vec<String> {
        self.requests()
            .iter()
            .filter_map(|r| r.messages.last().map(|m| m.content.clone()))
            .collect()
    }

    pub fn stream_requests(&self) -> Vec<OracleRequest> {
        self.stream_requests.lock().unwrap().clone()
    }

    pub fn complete_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn embed_count(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: OracleRequest) -> Result<OracleResponse, OracleError> {
        self.requests.lock().unwrap().push(request);
        let next = self.completions.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Text(text)) => Ok(make_text_response(&text)),
            Some(Scripted::ToolCalls(calls)) => Ok(OracleResponse {
                message: Message::assistant("").with_tool_calls(calls),
                usage: None,
                model: "scripted-model".into(),
            }),
            Some(Scripted::Fail(e)) => Err(e),
            None => Err(OracleError::ApiError {
                status_code: 500,
                message: "no scripted completion left".into(),
            }),
        }
    }

    async fn stream(&self, request: OracleRequest) -> Result<ChunkStream, OracleError> {
        self.stream_requests.lock().unwrap().push(request);
        let Some(script) = self.streams.lock().unwrap().pop_front() else {
            return Err(OracleError::ApiError {
                status_code: 500,
                message: "no scripted stream left".into(),
            });
        };

        let (tx, rx) = mpsc::channel(script.fragments.len() + 2);
        for fragment in script.fragments {
            let _ = tx
                .send(Ok(StreamChunk {
                    content: Some(fragment),
                    ..StreamChunk::default()
                }))
                .await;
        }
        match script.then_fail {
            Some(e) => {
                let _ = tx.send(Err(e)).await;
            }
            None => {
                let _ = tx
                    .send(Ok(StreamChunk {
                        done: true,
                        ..StreamChunk::default()
                    }))
                    .await;
            }
        }
        Ok(rx)
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, OracleError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        if self.embedding.is_empty() {
            return Err(OracleError::NotConfigured("no scripted embedding".into()));
        }
        Ok(EmbeddingResponse {
            embeddings: request.inputs.iter().map(|_| self.embedding.clone()).collect(),
            model: request.model,
        })
    }
}

/// Create a simple text response (no tool calls).
pub fn make_text_response(text: &str) -> OracleResponse {
    OracleResponse {
        message: Message::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "scripted-model".into(),
    }
}

/// Helper to create a tool call.
pub fn make_tool_call(name: &str, args: serde_json::Value) -> MessageToolCall {
    MessageToolCall {
        id: format!("call_{name}"),
        name: name.to_string(),
        arguments: args.to_string(),
    }
}

pub fn session_fixture(kind: StrategyKind) -> (Session, Assistant) {
    let assistant = Assistant::new("fixture", kind);
    let session = Session::new(UserId::from("u1"), AccountId::from("acc1"), assistant.id.clone());
    (session, assistant)
}

pub fn context_fixture() -> SessionContext {
    SessionContext {
        session_id: SessionId::from("s1"),
        user_id: UserId::from("u1"),
        account_id: AccountId::from("acc1"),
        assistant_id: AssistantId::from("a1"),
    }
}

pub fn turn_fixture(content: &str) -> Turn {
    Turn::new(&context_fixture(), content)
}

/// Drain a strategy stream, turning a stream-level `Err` into an error chunk.
pub async fn collect_chunks(mut stream: StrategyStream) -> Vec<ResponseChunk> {
    let mut out = Vec::new();
    while let Some(item) = stream.chunks.recv().await {
        match item {
            Ok(chunk) => out.push(chunk),
            Err(e) => out.push(ResponseChunk::error(e.to_string())),
        }
    }
    out
}

/// Concatenated content of every text chunk.
pub fn text_of(chunks: &[ResponseChunk]) -> String {
    chunks
        .iter()
        .filter_map(|c| match c {
            ResponseChunk::Text { content } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

/// A strategy driven by the test: chunks are pushed through a sender and
/// the title resolves when the test sends it.
pub struct ManualStrategy {
    chunks: Mutex<Option<StrategyStream>>,
    title: Mutex<Option<oneshot::Receiver<String>>>,
    summarize_calls: AtomicUsize,
}

pub struct ManualHandles {
    pub chunks: mpsc::Sender<Result<ResponseChunk, threadloom_core::Error>>,
    /// Dropping this without sending leaves the title pending forever.
    pub title: oneshot::Sender<String>,
}

impl ManualStrategy {
    pub fn new() -> (Self, ManualHandles) {
        let (tx, stream) = chunk_channel();
        let (title_tx, title_rx) = oneshot::channel();
        let strategy = Self {
            chunks: Mutex::new(Some(stream)),
            title: Mutex::new(Some(title_rx)),
            summarize_calls: AtomicUsize::new(0),
        };
        (
            strategy,
            ManualHandles {
                chunks: tx,
                title: title_tx,
            },
        )
    }

    pub fn summarize_calls(&self) -> usize {
        self.summarize_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Strategy for ManualStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Direct
    }

    async fn respond(&self, _turn: &Turn, _ctx: &SessionContext) -> threadloom_core::Result<StrategyStream> {
        self.chunks
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| threadloom_core::Error::Internal("manual strategy already used".into()))
    }

    async fn summarize(&self, _turn: &Turn) -> threadloom_core::Result<String> {
        self.summarize_calls.fetch_add(1, Ordering::SeqCst);
        let rx = self.title.lock().unwrap().take();
        match rx {
            Some(rx) => match rx.await {
                Ok(title) => Ok(title),
                // Sender dropped: never resolve
                Err(_) => std::future::pending().await,
            },
            None => std::future::pending().await,
        }
    }
}
