//! The Strategy interface: one pluggable way of turning a turn into a
//! response stream.
//!
//! Every strategy spawns its work and hands back a [`StrategyStream`]
//! immediately. The stream is finite and not restartable. The orchestrator
//! drives all strategies the same way and never asks which one it has.

use async_trait::async_trait;
use std::sync::Arc;
use threadloom_core::oracle::{ModelSettings, Oracle, invoke_streaming, invoke_text};
use threadloom_core::{AgentRunLog, Message, ResponseChunk, Result, SessionContext, StrategyKind, Turn};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

pub type ChunkSender = mpsc::Sender<Result<ResponseChunk>>;
pub type ChunkReceiver = mpsc::Receiver<Result<ResponseChunk>>;

/// The output of [`Strategy::respond`].
pub struct StrategyStream {
    /// Chunks in production order. An `Err` item ends the response.
    pub chunks: ChunkReceiver,

    /// Resolves with the run transcript once the run finishes, for
    /// strategies that keep one.
    pub run_log: Option<oneshot::Receiver<AgentRunLog>>,
}

impl StrategyStream {
    pub fn new(chunks: ChunkReceiver) -> Self {
        Self { chunks, run_log: None }
    }

    pub fn with_run_log(mut self, run_log: oneshot::Receiver<AgentRunLog>) -> Self {
        self.run_log = Some(run_log);
        self
    }
}

/// A sender and the stream it feeds.
pub fn chunk_channel() -> (ChunkSender, StrategyStream) {
    let (tx, rx) = mpsc::channel(64);
    (tx, StrategyStream::new(rx))
}

#[async_trait]
pub trait Strategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Start producing the reply for `turn`.
    ///
    /// Errors returned here happen before any chunk is produced. Failures
    /// after that point travel inside the stream.
    async fn respond(&self, turn: &Turn, ctx: &SessionContext) -> Result<StrategyStream>;

    /// A short title for the session this turn opens.
    async fn summarize(&self, turn: &Turn) -> Result<String>;
}

/// Trim whitespace and surrounding quote characters from an oracle title.
pub fn clean_title(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim()
        .to_string()
}

pub(crate) fn title_prompt(query: &str) -> String {
    format!(
        "Provide a concise and informative title (less than 100 characters) for the following \
         conversation:\n\nUser Query: {query}\n\nTitle:"
    )
}

/// Ask the oracle for a session title.
pub(crate) async fn summarize_with_oracle(
    oracle: &dyn Oracle,
    settings: &ModelSettings,
    turn: &Turn,
) -> Result<String> {
    let raw = invoke_text(oracle, settings, &title_prompt(&turn.user_content)).await?;
    Ok(clean_title(&raw))
}

/// Stream an oracle completion into `tx` as text chunks.
///
/// An oracle failure, before or during the stream, becomes one error chunk
/// and ends the response. Returns the text that was streamed.
pub(crate) async fn stream_oracle_text(
    oracle: Arc<dyn Oracle>,
    settings: &ModelSettings,
    messages: Vec<Message>,
    tx: &ChunkSender,
) -> String {
    let mut streamed = String::new();
    let mut fragments = match invoke_streaming(oracle.as_ref(), settings, messages).await {
        Ok(fragments) => fragments,
        Err(e) => {
            warn!(error = %e, "Oracle stream failed to start");
            let _ = tx.send(Ok(ResponseChunk::error(e.to_string()))).await;
            return streamed;
        }
    };

    while let Some(item) = fragments.recv().await {
        match item {
            Ok(fragment) => {
                streamed.push_str(&fragment);
                if tx.send(Ok(ResponseChunk::text(fragment))).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Oracle stream interrupted");
                let _ = tx.send(Ok(ResponseChunk::error(e.to_string()))).await;
                break;
            }
        }
    }
    streamed
}

/// Stream a single oracle prompt as text chunks in a spawned task.
pub(crate) fn spawn_text_stream(oracle: Arc<dyn Oracle>, settings: ModelSettings, prompt: String) -> StrategyStream {
    let (tx, stream) = chunk_channel();
    tokio::spawn(async move {
        stream_oracle_text(oracle, &settings, vec![Message::user(prompt)], &tx).await;
    });
    stream
}

/// Format prior turns as `Role: content` lines.
pub(crate) fn format_history(turns: &[Turn]) -> String {
    turns
        .iter()
        .flat_map(|t| [format!("User: {}", t.user_content), format!("Assistant: {}", t.reply_text())])
        .collect::<Vec<_>>()
        .join("\n")
}
