//! Sessions, per-request session state, and agent run logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AccountId, AssistantId, SessionId, UserId};
use crate::message::Message;

/// A stored conversation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub account_id: AccountId,
    pub assistant_id: AssistantId,
    #[serde(default)]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user_id: UserId, account_id: AccountId, assistant_id: AssistantId) -> Self {
        Self {
            id: SessionId::new(),
            user_id,
            account_id,
            assistant_id,
            title: None,
            created_at: Utc::now(),
        }
    }

    /// The explicit per-request state handed to strategies.
    pub fn context(&self) -> SessionContext {
        SessionContext {
            session_id: self.id.clone(),
            user_id: self.user_id.clone(),
            account_id: self.account_id.clone(),
            assistant_id: self.assistant_id.clone(),
        }
    }

    pub fn is_owned_by(&self, user_id: &UserId) -> bool {
        &self.user_id == user_id
    }
}

/// Session state passed explicitly into every strategy call.
///
/// Strategies hold no per-session fields of their own; anything they need
/// to carry between turns goes through the store keyed by this context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub account_id: AccountId,
    pub assistant_id: AssistantId,
}

/// Transcript of one complete reasoning run.
///
/// Appended once per turn and only ever read back to seed the next turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRunLog {
    pub session_id: SessionId,
    pub entries: Vec<Message>,
    pub created_at: DateTime<Utc>,
}

impl AgentRunLog {
    pub fn new(session_id: SessionId, entries: Vec<Message>) -> Self {
        Self {
            session_id,
            entries,
            created_at: Utc::now(),
        }
    }

    /// Concatenate several logs (oldest first) into one history log.
    pub fn concat(session_id: SessionId, logs: impl IntoIterator<Item = AgentRunLog>) -> Option<Self> {
        let mut logs = logs.into_iter().peekable();
        logs.peek()?;
        let entries = logs.flat_map(|log| log.entries).collect();
        Some(Self::new(session_id, entries))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
