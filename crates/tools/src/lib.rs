//! Tools offered to tool-capable oracle calls.
//!
//! - `web_search`: grounds research steps in search results
//! - `action_api`: lets the tool agent read and change records

pub mod http_request;
pub mod web_search;

use threadloom_config::ToolsConfig;
use threadloom_core::tool::ToolRegistry;
use tracing::warn;

pub use http_request::ActionApiTool;
pub use web_search::WebSearchTool;

/// Tools for the research executor. Empty when no search key is configured,
/// in which case steps run on the oracle's own knowledge.
pub fn research_registry(config: &ToolsConfig) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    match &config.search_api_key {
        Some(key) => registry.register(Box::new(WebSearchTool::new(
            &config.search_base_url,
            key,
            config.search_max_results,
        ))),
        None => warn!("No search API key configured; research steps run without web search"),
    }
    registry
}

/// Tools for the tool agent.
pub fn agent_registry(config: &ToolsConfig) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    if let Some(base) = &config.action_base_url {
        registry.register(Box::new(ActionApiTool::new(base)));
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registries_follow_config() {
        let mut config = ToolsConfig::default();
        assert!(research_registry(&config).is_empty());
        assert!(agent_registry(&config).is_empty());

        config.search_api_key = Some("tvly".into());
        config.action_base_url = Some("http://localhost:8081".into());
        assert!(research_registry(&config).contains("web_search"));
        assert!(agent_registry(&config).contains("action_api"));
    }
}
