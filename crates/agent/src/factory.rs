//! Strategy selection.
//!
//! The factory turns an assistant definition into a ready [`Strategy`].
//! Every configuration problem (unknown tag, missing knowledge base or
//! table, unconfigured provider) is reported here, before any streaming.

use std::sync::Arc;
use threadloom_config::AppConfig;
use threadloom_core::oracle::{ModelSettings, Oracle};
use threadloom_core::{
    Assistant, ConversationStore, Error, Result, Retriever, StrategyKind, TableBackend, ToolRegistry,
};
use tracing::debug;

use crate::direct::DirectStrategy;
use crate::rag::RetrievalStrategy;
use crate::research::{ResearchEngine, ResearchStrategy};
use crate::strategy::Strategy;
use crate::tabular::TabularStrategy;
use crate::tool_agent::ToolAgentStrategy;

/// Anything that can resolve an assistant to a strategy.
///
/// The orchestrator depends on this rather than on [`StrategyFactory`]
/// so callers can supply their own strategies.
pub trait StrategyProvider: Send + Sync {
    fn build(&self, assistant: &Assistant) -> Result<Arc<dyn Strategy>>;
}

pub struct StrategyFactory {
    oracle: Arc<dyn Oracle>,
    store: Arc<dyn ConversationStore>,
    config: Arc<AppConfig>,
    retriever: Option<Arc<dyn Retriever>>,
    table_backend: Option<Arc<dyn TableBackend>>,
    research_tools: Arc<ToolRegistry>,
    agent_tools: Arc<ToolRegistry>,
}

impl StrategyFactory {
    pub fn new(oracle: Arc<dyn Oracle>, store: Arc<dyn ConversationStore>, config: Arc<AppConfig>) -> Self {
        Self {
            oracle,
            store,
            config,
            retriever: None,
            table_backend: None,
            research_tools: Arc::new(ToolRegistry::new()),
            agent_tools: Arc::new(ToolRegistry::new()),
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_table_backend(mut self, backend: Arc<dyn TableBackend>) -> Self {
        self.table_backend = Some(backend);
        self
    }

    pub fn with_research_tools(mut self, tools: ToolRegistry) -> Self {
        self.research_tools = Arc::new(tools);
        self
    }

    pub fn with_agent_tools(mut self, tools: ToolRegistry) -> Self {
        self.agent_tools = Arc::new(tools);
        self
    }

    /// Model settings for an assistant: the global defaults with the
    /// assistant's own model, if it names one.
    fn settings_for(&self, assistant: &Assistant) -> Result<ModelSettings> {
        if let Some(provider) = &assistant.config.provider
            && provider != &self.config.oracle.provider
        {
            return Err(Error::config(format!(
                "assistant '{}' uses provider '{provider}', but only '{}' is configured",
                assistant.name, self.config.oracle.provider
            )));
        }
        let settings = self.config.oracle.model_settings();
        Ok(match &assistant.config.model {
            Some(model) => settings.for_model(model),
            None => settings,
        })
    }

    fn history_limit(&self, assistant: &Assistant) -> usize {
        assistant
            .num_history_messages
            .unwrap_or(self.config.history.default_messages)
    }
}

impl StrategyProvider for StrategyFactory {
    fn build(&self, assistant: &Assistant) -> Result<Arc<dyn Strategy>> {
        let kind = assistant.strategy_kind()?;
        let settings = self.settings_for(assistant)?;
        debug!(assistant = %assistant.name, kind = %kind, model = %settings.model, "Building strategy");

        let strategy: Arc<dyn Strategy> = match kind {
            StrategyKind::Direct => Arc::new(
                DirectStrategy::new(self.oracle.clone(), self.store.clone(), settings)
                    .with_system_prompt(assistant.prompt("system"))
                    .with_history_limit(self.history_limit(assistant)),
            ),
            StrategyKind::Retrieval => {
                let kb = assistant.config.knowledge_base_id.clone().ok_or_else(|| {
                    Error::config(format!("assistant '{}' has no knowledge_base_id", assistant.name))
                })?;
                let retriever = self
                    .retriever
                    .clone()
                    .ok_or_else(|| Error::config("no retriever is configured for rag assistants"))?;
                Arc::new(
                    RetrievalStrategy::new(self.oracle.clone(), self.store.clone(), retriever, kb, settings)
                        .with_embedding_model(&self.config.oracle.embedding_model)
                        .with_top_k(self.config.retrieval.top_k)
                        .with_system_prompt(assistant.prompt("system"))
                        .with_history_limit(self.history_limit(assistant)),
                )
            }
            StrategyKind::Tabular => {
                let table = assistant.config.table_name.clone().ok_or_else(|| {
                    Error::config(format!("assistant '{}' has no table_name", assistant.name))
                })?;
                let backend = self
                    .table_backend
                    .clone()
                    .ok_or_else(|| Error::config("no table backend is configured for sql assistants"))?;
                Arc::new(
                    TabularStrategy::new(self.oracle.clone(), backend, table, settings)
                        .with_prompts(assistant.prompt("data_description"), assistant.prompt("examples"))
                        .with_max_attempts(self.config.tabular.max_query_attempts),
                )
            }
            StrategyKind::ToolAgent => Arc::new(
                ToolAgentStrategy::new(
                    self.oracle.clone(),
                    self.store.clone(),
                    self.agent_tools.clone(),
                    settings,
                )
                .with_system_prompt(assistant.prompt("system")),
            ),
            StrategyKind::Research => Arc::new(ResearchStrategy::new(ResearchEngine::from_config(
                self.oracle.clone(),
                self.research_tools.clone(),
                settings,
                &self.config.research,
            ))),
        };
        Ok(strategy)
    }
}
