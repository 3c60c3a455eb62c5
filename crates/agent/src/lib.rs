//! Response strategies and the stream orchestrator.
//!
//! A turn flows through three pieces:
//!
//! 1. **Select**: the [`StrategyFactory`] maps the assistant's tag to one of
//!    five strategies (direct, retrieval, tabular, tool agent, research)
//! 2. **Respond**: the strategy spawns its work and hands back a stream of
//!    [`ResponseChunk`](threadloom_core::ResponseChunk)s
//! 3. **Orchestrate**: the [`StreamOrchestrator`] forwards and accumulates
//!    the chunks, races a title task, and saves the turn once at the end
//!
//! The research strategy runs a bounded plan, execute, replan loop before
//! streaming its synthesized answer; see [`research`].

pub mod direct;
pub mod factory;
pub mod orchestrator;
pub mod rag;
pub mod research;
pub mod strategy;
pub mod tabular;
pub mod tool_agent;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use direct::DirectStrategy;
pub use factory::{StrategyFactory, StrategyProvider};
pub use orchestrator::{StreamOrchestrator, TitleRegistry, TitleTask, fold_chunk};
pub use rag::RetrievalStrategy;
pub use research::{ResearchEngine, ResearchOutcome, ResearchStrategy};
pub use strategy::{Strategy, StrategyStream};
pub use tabular::TabularStrategy;
pub use tool_agent::ToolAgentStrategy;
