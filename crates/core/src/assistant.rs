//! Assistant definitions and strategy kinds.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::ids::{AssistantId, KnowledgeBaseId};

/// The closed set of response strategies an assistant can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Plain completion over recent history.
    Direct,
    /// Completion grounded in knowledge-base search results.
    Retrieval,
    /// Natural language to SQL over one backing table.
    Tabular,
    /// Tool-calling agent that asks for confirmation before acting.
    ToolAgent,
    /// Plan, execute, replan, synthesize.
    Research,
}

impl StrategyKind {
    /// The configuration tag stored on assistants.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Direct => "no_rag",
            Self::Retrieval => "rag",
            Self::Tabular => "sql",
            Self::ToolAgent => "agent",
            Self::Research => "deep_research",
        }
    }
}

impl FromStr for StrategyKind {
    type Err = Error;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "no_rag" | "direct" => Ok(Self::Direct),
            "rag" => Ok(Self::Retrieval),
            "sql" => Ok(Self::Tabular),
            "agent" => Ok(Self::ToolAgent),
            "deep_research" => Ok(Self::Research),
            other => Err(Error::config(format!("unknown assistant type '{other}'"))),
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Model and backing-resource configuration stored on an assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantConfig {
    /// Strategy tag, e.g. "rag" or "deep_research".
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub provider: Option<String>,

    /// Overrides the globally configured model when set.
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub knowledge_base_id: Option<KnowledgeBaseId>,

    #[serde(default)]
    pub table_name: Option<String>,
}

/// A configured assistant a session talks to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assistant {
    pub id: AssistantId,
    pub name: String,
    pub config: AssistantConfig,

    /// Named prompt fragments: "system", "data_description", "examples".
    #[serde(default)]
    pub system_prompts: HashMap<String, String>,

    /// How many prior turns to replay as history.
    #[serde(default)]
    pub num_history_messages: Option<usize>,
}

impl Assistant {
    pub fn new(name: impl Into<String>, kind: StrategyKind) -> Self {
        Self {
            id: AssistantId::new(),
            name: name.into(),
            config: AssistantConfig {
                kind: kind.tag().to_string(),
                provider: None,
                model: None,
                knowledge_base_id: None,
                table_name: None,
            },
            system_prompts: HashMap::new(),
            num_history_messages: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn with_knowledge_base(mut self, kb: KnowledgeBaseId) -> Self {
        self.config.knowledge_base_id = Some(kb);
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.config.table_name = Some(table.into());
        self
    }

    pub fn with_prompt(mut self, key: impl Into<String>, prompt: impl Into<String>) -> Self {
        self.system_prompts.insert(key.into(), prompt.into());
        self
    }

    pub fn with_history(mut self, turns: usize) -> Self {
        self.num_history_messages = Some(turns);
        self
    }

    /// Parse the stored tag into a strategy kind.
    pub fn strategy_kind(&self) -> Result<StrategyKind, Error> {
        self.config.kind.parse()
    }

    pub fn prompt(&self, key: &str) -> &str {
        self.system_prompts.get(key).map(String::as_str).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip_through_kind() {
        for kind in [
            StrategyKind::Direct,
            StrategyKind::Retrieval,
            StrategyKind::Tabular,
            StrategyKind::ToolAgent,
            StrategyKind::Research,
        ] {
            assert_eq!(kind.tag().parse::<StrategyKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_tag_is_config_error() {
        let err = "poetry".parse::<StrategyKind>().unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn assistant_config_reads_type_field() {
        let assistant: Assistant = serde_json::from_value(serde_json::json!({
            "id": "a1",
            "name": "Sales",
            "config": {"type": "sql", "table_name": "orders"}
        }))
        .unwrap();
        assert_eq!(assistant.strategy_kind().unwrap(), StrategyKind::Tabular);
        assert_eq!(assistant.config.table_name.as_deref(), Some("orders"));
        assert_eq!(assistant.prompt("system"), "");
    }
}
