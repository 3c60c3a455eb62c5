//! Tool-using agent with a two-phase confirmation flow.
//!
//! The agent reads freely but only proposes changes: a change is returned
//! as a `dialog` chunk whose actions the client submits. Pending proposals
//! live in the session's run log, which seeds the next turn, so nothing is
//! carried on the strategy itself.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use threadloom_core::oracle::{ModelSettings, Oracle, invoke_tool_capable, strip_code_fences};
use threadloom_core::{
    AgentRunLog, ConversationStore, DialogAction, Message, ResponseChunk, Result, SessionContext, SessionId,
    StrategyKind, ToolRegistry, Turn,
};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::strategy::{ChunkSender, Strategy, StrategyStream, chunk_channel, summarize_with_oracle};

#[derive(Clone)]
pub struct ToolAgentStrategy {
    oracle: Arc<dyn Oracle>,
    store: Arc<dyn ConversationStore>,
    tools: Arc<ToolRegistry>,
    settings: ModelSettings,
    system_prompt: String,
    max_rounds: usize,
}

impl ToolAgentStrategy {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        store: Arc<dyn ConversationStore>,
        tools: Arc<ToolRegistry>,
        settings: ModelSettings,
    ) -> Self {
        Self {
            oracle,
            store,
            tools,
            settings,
            system_prompt: String::new(),
            max_rounds: 5,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds;
        self
    }

    async fn prior_history(&self, session_id: &SessionId) -> Vec<Message> {
        match self.store.load_prior_run_log(session_id).await {
            Ok(Some(log)) => log.entries,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Could not load prior run log");
                Vec::new()
            }
        }
    }

    async fn run(
        self,
        query: String,
        session_id: SessionId,
        tx: ChunkSender,
        log_tx: oneshot::Sender<AgentRunLog>,
    ) {
        let history = self.prior_history(&session_id).await;
        let prompt = agent_prompt(&self.system_prompt, &query);

        match invoke_tool_capable(
            self.oracle.as_ref(),
            &self.settings,
            &prompt,
            &self.tools,
            &history,
            self.max_rounds,
        )
        .await
        {
            Ok(completion) => {
                let chunk = parse_agent_reply(&completion.content);
                info!(
                    session_id = %session_id,
                    kind = chunk.kind(),
                    tool_calls = completion.tool_calls_made,
                    "Agent run finished"
                );
                let _ = tx.send(Ok(chunk)).await;
                let _ = log_tx.send(AgentRunLog::new(session_id, completion.transcript));
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Agent run failed");
                let _ = tx.send(Ok(ResponseChunk::error(e.to_string()))).await;
            }
        }
    }
}

const REPLY_FORMAT: &str = r#"Reply with a single JSON object.

If the request involves creating, modifying or deleting something, do not make the change. Propose it
as a dialog the user can confirm, with a meaningful title and description:
{
  "type": "dialog",
  "content": "I have prepared a reservation for a single room from May 20th to May 21st. Would you like to proceed?",
  "response_metadata": {
    "title": "Reservation Confirmation",
    "description": "Single Room Booking",
    "actions": [
      {"action": "Submit", "url": "<action endpoint>", "method": "POST", "body": {"room_type": "single"}, "variant": "default"},
      {"action": "Cancel", "url": null, "variant": "outline"}
    ]
  }
}

Otherwise reply with text:
{"type": "text", "content": "Your reservation has been created."}

Do not call tools that create, modify or delete anything unless the user confirmed the change in the previous message."#;

fn agent_prompt(system: &str, query: &str) -> String {
    let mut prompt = String::new();
    if !system.is_empty() {
        prompt.push_str(system);
        prompt.push_str("\n\n");
    }
    prompt.push_str(REPLY_FORMAT);
    prompt.push_str(&format!("\n\nUser message:\n{query}"));
    prompt
}

#[derive(Debug, Default, Deserialize)]
struct DialogMetadata {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    actions: Vec<DialogAction>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AgentReply {
    Dialog {
        content: String,
        #[serde(default)]
        response_metadata: DialogMetadata,
    },
    Text {
        content: String,
    },
}

/// Turn the agent's final answer into a chunk. Anything that is not a
/// recognised JSON reply is passed through as text.
pub fn parse_agent_reply(raw: &str) -> ResponseChunk {
    match serde_json::from_str::<AgentReply>(strip_code_fences(raw)) {
        Ok(AgentReply::Dialog {
            content,
            response_metadata,
        }) => ResponseChunk::Dialog {
            content,
            title: response_metadata.title,
            description: response_metadata.description,
            actions: response_metadata.actions,
        },
        Ok(AgentReply::Text { content }) => ResponseChunk::text(content),
        Err(_) => ResponseChunk::text(raw.trim()),
    }
}

#[async_trait]
impl Strategy for ToolAgentStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ToolAgent
    }

    async fn respond(&self, turn: &Turn, ctx: &SessionContext) -> Result<StrategyStream> {
        let (tx, stream) = chunk_channel();
        let (log_tx, log_rx) = oneshot::channel();
        let agent = self.clone();
        let query = turn.user_content.clone();
        let session_id = ctx.session_id.clone();

        tokio::spawn(agent.run(query, session_id, tx, log_tx));
        Ok(stream.with_run_log(log_rx))
    }

    async fn summarize(&self, turn: &Turn) -> Result<String> {
        summarize_with_oracle(self.oracle.as_ref(), &self.settings, turn).await
    }
}
