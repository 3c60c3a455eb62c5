//! `threadloom chat`: one turn through an ephemeral in-memory session.
//!
//! Records are printed to stdout exactly as the gateway would stream them.

use anyhow::{Context, bail};
use clap::Args;
use std::io::Write;
use std::sync::Arc;
use threadloom_agent::StreamOrchestrator;
use threadloom_config::AppConfig;
use threadloom_core::{AccountId, Assistant, ConversationStore, KnowledgeBaseId, Session, StrategyKind, Turn, UserId};
use threadloom_memory::InMemoryStore;

#[derive(Debug, Args)]
pub struct ChatArgs {
    /// Strategy tag: no_rag, rag, sql, agent or deep_research
    #[arg(short, long, default_value = "no_rag")]
    pub strategy: String,

    /// The message to send
    #[arg(short, long)]
    pub message: String,

    /// Override the configured model
    #[arg(long)]
    pub model: Option<String>,

    /// System prompt for the assistant
    #[arg(long)]
    pub system: Option<String>,

    /// Knowledge base for `rag`
    #[arg(long)]
    pub knowledge_base: Option<String>,

    /// Table for `sql` (requires `tabular.database_url`)
    #[arg(long)]
    pub table: Option<String>,
}

fn assistant_for(args: &ChatArgs) -> anyhow::Result<Assistant> {
    let kind: StrategyKind = args.strategy.parse()?;
    let mut assistant = Assistant::new("cli", kind);
    if let Some(model) = &args.model {
        assistant = assistant.with_model(model);
    }
    if let Some(system) = &args.system {
        assistant = assistant.with_prompt("system", system);
    }
    if let Some(kb) = &args.knowledge_base {
        assistant = assistant.with_knowledge_base(KnowledgeBaseId::from(kb.as_str()));
    }
    if let Some(table) = &args.table {
        assistant = assistant.with_table(table);
    }
    Ok(assistant)
}

pub async fn run(args: ChatArgs) -> anyhow::Result<()> {
    let config = AppConfig::load().context("Failed to load config")?;
    if !config.oracle.has_api_key() && config.oracle.provider != "ollama" {
        bail!(
            "No API key configured. Set THREADLOOM_API_KEY or OPENAI_API_KEY, or add one to {}",
            AppConfig::config_dir().join("config.toml").display()
        );
    }
    let config = Arc::new(config);
    let assistant = assistant_for(&args)?;

    let memory = InMemoryStore::new();
    let session = Session::new(UserId::from("cli"), AccountId::from("local"), assistant.id.clone());
    memory.insert_assistant(assistant).await;
    memory.insert_session(session.clone()).await;
    let store: Arc<dyn ConversationStore> = Arc::new(memory);

    let factory = threadloom_gateway::build_factory(config, store.clone()).await?;
    let orchestrator = StreamOrchestrator::new(Arc::new(factory), store);

    let ctx = session.context();
    tracing::debug!(session_id = %ctx.session_id, strategy = %args.strategy, "Running one turn");
    let mut records = orchestrator
        .process_turn(Turn::new(&ctx, &args.message), &ctx)
        .await?;

    let mut stdout = std::io::stdout();
    while let Some(record) = records.recv().await {
        stdout.write_all(record.to_ndjson_line()?.as_bytes())?;
        stdout.flush()?;
    }
    Ok(())
}
