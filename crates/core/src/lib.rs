//! # Threadloom Core
//!
//! Domain types, collaborator traits, and error definitions for the
//! Threadloom response-orchestration engine. This crate performs no I/O: it
//! defines the model every other crate implements against.
//!
//! Each external collaborator is a trait here (oracle, conversation store,
//! retriever, table backend, tool). Implementations live in their own
//! crates, so strategies can be tested against scripted stand-ins.

pub mod assistant;
pub mod chunk;
pub mod error;
pub mod ids;
pub mod message;
pub mod oracle;
pub mod retrieval;
pub mod session;
pub mod store;
pub mod table;
pub mod tool;
pub mod turn;

// Re-export key types at crate root for ergonomics
pub use assistant::{Assistant, AssistantConfig, StrategyKind};
pub use chunk::{Block, DialogAction, OutboundRecord, ResponseChunk, Row};
pub use error::{Error, Result};
pub use ids::{AccountId, AssistantId, KnowledgeBaseId, SessionId, TurnId, UserId};
pub use message::{Message, MessageToolCall, Role};
pub use oracle::{ModelSettings, Oracle, OracleRequest, OracleResponse, ResponseFormat, StreamChunk};
pub use retrieval::{RetrievedChunk, Retriever};
pub use session::{AgentRunLog, Session, SessionContext};
pub use store::ConversationStore;
pub use table::{ColumnInfo, TableBackend};
pub use tool::{Tool, ToolOutput, ToolRegistry};
pub use turn::Turn;
