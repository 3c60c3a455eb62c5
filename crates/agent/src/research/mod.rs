//! Iterative research: the `deep_research` strategy.
//!
//! ```text
//! Planning -> Executing -> Replanning -> (Executing | Synthesizing) -> Done
//! ```

pub mod engine;
pub mod plan_state;

pub use engine::{ResearchEngine, ResearchOutcome};
pub use plan_state::{Plan, PlanState, ResearchPhase, decide};

use async_trait::async_trait;
use std::sync::Arc;
use threadloom_core::{AgentRunLog, Result, SessionContext, StrategyKind, Turn};
use tokio::sync::oneshot;
use tracing::info;

use crate::strategy::{Strategy, StrategyStream, chunk_channel};

/// Title used for research sessions; no oracle call needed.
pub fn research_title(objective: &str) -> String {
    let head: String = objective.chars().take(30).collect();
    format!("Deep Research: {head}...")
}

pub struct ResearchStrategy {
    engine: Arc<ResearchEngine>,
}

impl ResearchStrategy {
    pub fn new(engine: ResearchEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}

#[async_trait]
impl Strategy for ResearchStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Research
    }

    async fn respond(&self, turn: &Turn, ctx: &SessionContext) -> Result<StrategyStream> {
        let (tx, stream) = chunk_channel();
        let (log_tx, log_rx) = oneshot::channel();
        let engine = self.engine.clone();
        let objective = turn.user_content.clone();
        let session_id = ctx.session_id.clone();

        info!(session_id = %session_id, budget = engine.step_budget(), "Starting research");
        tokio::spawn(async move {
            let outcome = engine.run(&objective, &tx).await;
            let _ = log_tx.send(AgentRunLog::new(session_id, outcome.run_log));
        });

        Ok(stream.with_run_log(log_rx))
    }

    async fn summarize(&self, turn: &Turn) -> Result<String> {
        Ok(research_title(&turn.user_content))
    }
}
