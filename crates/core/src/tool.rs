//! Tools offered to tool-capable oracle calls.
//!
//! The research executor searches the web through a tool; the tool agent
//! calls an action API through one. Whatever a tool returns, the oracle only
//! ever sees a tool-result message: its output text, or `Error: ...` when
//! the call could not be served.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::error::ToolError;
use crate::message::{Message, MessageToolCall};
use crate::oracle::ToolDefinition;

/// What a tool hands back to the oracle.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// Text fed back to the oracle.
    pub content: String,

    /// The tool ran but the remote side refused (e.g. an HTTP 4xx). Reported
    /// to the oracle the same way as a [`ToolError`].
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn failure(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }

    /// Render as the content of a tool-result message.
    pub fn into_result_text(self) -> String {
        if self.is_error {
            format!("Error: {}", self.content)
        } else {
            self.content
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// Name the oracle calls the tool by, e.g. `web_search`.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema of the arguments object.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// The tools one strategy offers, keyed by name.
///
/// Kept ordered so the definitions sent to the oracle are stable between
/// requests.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool of the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn with(mut self, tool: Box<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.to_definition()).collect()
    }

    /// Run one call the oracle asked for.
    pub async fn run(&self, call: &MessageToolCall) -> Result<ToolOutput, ToolError> {
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
        let arguments = match call.arguments.trim() {
            "" => serde_json::Value::Object(Default::default()),
            raw => serde_json::from_str(raw).map_err(|e| ToolError::InvalidArguments(e.to_string()))?,
        };
        debug!(tool = %call.name, "Executing tool");
        tool.execute(arguments).await
    }

    /// Run one call and turn the outcome into the tool-result message fed
    /// back to the oracle. Failures never escape; the oracle sees them as
    /// `Error: ...` and can recover.
    pub async fn answer(&self, call: &MessageToolCall) -> Message {
        let text = match self.run(call).await {
            Ok(output) => output.into_result_text(),
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Tool execution failed");
                format!("Error: {e}")
            }
        };
        Message::tool_result(&call.id, text)
    }
}
