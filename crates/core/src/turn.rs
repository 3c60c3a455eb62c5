//! The `Turn`: one user message and its eventual reply.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunk::Block;
use crate::ids::{AccountId, AssistantId, SessionId, TurnId, UserId};
use crate::session::SessionContext;

/// A user message plus the reply accumulated for it.
///
/// Only the orchestrator mutates a turn while its reply streams; once saved
/// it is never changed again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub account_id: AccountId,
    pub assistant_id: AssistantId,

    /// What the user asked.
    pub user_content: String,

    /// The concatenation of every text fragment streamed so far.
    #[serde(default)]
    pub ai_content: String,

    /// Ordered reply blocks. At most one text block, updated in place.
    #[serde(default)]
    pub blocks: Vec<Block>,

    pub created_at: DateTime<Utc>,
}

impl Turn {
    /// Start a fresh turn for a message sent into a session.
    pub fn new(ctx: &SessionContext, user_content: impl Into<String>) -> Self {
        Self {
            id: TurnId::new(),
            session_id: ctx.session_id.clone(),
            user_id: ctx.user_id.clone(),
            account_id: ctx.account_id.clone(),
            assistant_id: ctx.assistant_id.clone(),
            user_content: user_content.into(),
            ai_content: String::new(),
            blocks: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Append a text fragment and return the updated text block.
    ///
    /// The first fragment creates the text block at the current position;
    /// later fragments rewrite that same block.
    pub fn push_text(&mut self, fragment: &str) -> Block {
        self.ai_content.push_str(fragment);
        let block = Block::Text {
            text: self.ai_content.clone(),
        };
        match self
            .blocks
            .iter_mut()
            .find(|b| matches!(b, Block::Text { .. }))
        {
            Some(existing) => *existing = block.clone(),
            None => self.blocks.push(block.clone()),
        }
        block
    }

    pub fn push_block(&mut self, block: Block) {
        self.blocks.push(block);
    }

    /// Plain-text view of the reply, used when replaying history.
    pub fn reply_text(&self) -> String {
        if !self.ai_content.is_empty() {
            return self.ai_content.clone();
        }
        self.blocks
            .iter()
            .map(Block::as_plain_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
