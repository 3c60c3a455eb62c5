//! HTTP gateway for Threadloom.
//!
//! Streams each turn's outbound records as newline-delimited JSON and
//! exposes stored session history. Credentials are checked upstream; the
//! gateway only scopes sessions to the `x-user-id` it is given.
//!
//! Built on Axum.

pub mod api_v1;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, Method, header};
use axum::{Router, response::Json, routing::get};
use serde::Serialize;
use std::sync::Arc;
use threadloom_agent::{StrategyFactory, StrategyProvider, StreamOrchestrator};
use threadloom_config::{AppConfig, StoreConfig};
use threadloom_core::ConversationStore;
use threadloom_core::error::{OracleError, PersistenceError, TableError};
use threadloom_memory::{InMemoryStore, SqliteStore, SqliteTableBackend, VectorIndex};
use tower_http::cors::CorsLayer;
use tracing::info;

/// Shared application state.
pub struct GatewayState {
    pub orchestrator: StreamOrchestrator,
    pub store: Arc<dyn ConversationStore>,
}

impl GatewayState {
    pub fn new(strategies: Arc<dyn StrategyProvider>, store: Arc<dyn ConversationStore>) -> Self {
        Self {
            orchestrator: StreamOrchestrator::new(strategies, store.clone()),
            store,
        }
    }
}

pub type SharedState = Arc<GatewayState>;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Oracle setup failed: {0}")]
    Oracle(#[from] OracleError),

    #[error("Store setup failed: {0}")]
    Store(#[from] PersistenceError),

    #[error("Table backend setup failed: {0}")]
    Table(#[from] TableError),

    #[error("Unknown store backend '{0}' (expected 'memory' or 'sqlite')")]
    UnknownStore(String),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Open the conversation store named by `[store]`.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn ConversationStore>, StartupError> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryStore::new())),
        "sqlite" => {
            let path = config.resolved_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Ok(Arc::new(SqliteStore::new(&path.to_string_lossy()).await?))
        }
        other => Err(StartupError::UnknownStore(other.to_string())),
    }
}

/// Wire the oracle, tools, retriever and table backend into a factory.
pub async fn build_factory(
    config: Arc<AppConfig>,
    store: Arc<dyn ConversationStore>,
) -> Result<StrategyFactory, StartupError> {
    let oracle = threadloom_providers::build_oracle(&config.oracle)?;
    let retriever = VectorIndex::new(config.retrieval.fetch_k, config.retrieval.mmr_lambda);

    let mut factory = StrategyFactory::new(oracle, store, config.clone())
        .with_retriever(Arc::new(retriever))
        .with_research_tools(threadloom_tools::research_registry(&config.tools))
        .with_agent_tools(threadloom_tools::agent_registry(&config.tools));

    if let Some(url) = &config.tabular.database_url {
        factory = factory.with_table_backend(Arc::new(SqliteTableBackend::connect(url).await?));
    }
    Ok(factory)
}

/// Build the router: `/health` plus the `/v1` API.
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static("x-user-id")]);

    Router::new()
        .route("/health", get(health_handler))
        .nest("/v1", api_v1::v1_router(state))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Start the gateway HTTP server.
pub async fn start(config: AppConfig) -> Result<(), StartupError> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let config = Arc::new(config);

    let store = open_store(&config.store).await?;
    let factory = build_factory(config.clone(), store.clone()).await?;
    let state = Arc::new(GatewayState::new(Arc::new(factory), store));

    let app = build_router(state);
    info!(addr = %addr, store = %config.store.backend, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
