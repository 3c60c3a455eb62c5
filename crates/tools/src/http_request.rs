//! Action API tool: JSON requests against one configured base URL.
//!
//! The tool agent uses it to look up and change records. Requests are
//! limited to paths under the base URL so the oracle cannot reach
//! arbitrary hosts.

use async_trait::async_trait;
use serde::Serialize;
use threadloom_core::error::ToolError;
use threadloom_core::tool::{Tool, ToolOutput};
use tracing::debug;

pub struct ActionApiTool {
    client: reqwest::Client,
    base_url: String,
}

impl ActionApiTool {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Full URL for a relative path, or an error for anything else.
    fn resolve(&self, path: &str) -> Result<String, ToolError> {
        if path.contains("://") || path.contains("..") {
            return Err(ToolError::InvalidArguments(
                "path must be relative to the action API".into(),
            ));
        }
        Ok(format!("{}/{}", self.base_url, path.trim_start_matches('/')))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[derive(Debug, Serialize)]
struct ActionResponse {
    status_code: u16,
    body: serde_json::Value,
}

fn parse_method(raw: Option<&str>) -> Result<reqwest::Method, ToolError> {
    match raw.unwrap_or("GET").to_ascii_uppercase().as_str() {
        "GET" => Ok(reqwest::Method::GET),
        "POST" => Ok(reqwest::Method::POST),
        "PUT" => Ok(reqwest::Method::PUT),
        "PATCH" => Ok(reqwest::Method::PATCH),
        "DELETE" => Ok(reqwest::Method::DELETE),
        other => Err(ToolError::InvalidArguments(format!(
            "Invalid HTTP method: {other}. Must be GET, POST, PUT, PATCH, or DELETE."
        ))),
    }
}

#[async_trait]
impl Tool for ActionApiTool {
    fn name(&self) -> &str {
        "action_api"
    }

    fn description(&self) -> &str {
        "Call the action API. GET reads records; POST, PATCH, PUT and DELETE change them \
         and must only be used after the user confirmed the change."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the API root, e.g. 'reservations/11'"
                },
                "method": {
                    "type": "string",
                    "enum": ["GET", "POST", "PUT", "PATCH", "DELETE"],
                    "default": "GET"
                },
                "body": {
                    "type": "object",
                    "description": "JSON body for POST, PUT and PATCH"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let path = arguments["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'path' argument".into()))?;
        let method = parse_method(arguments["method"].as_str())?;
        let url = self.resolve(path)?;

        debug!(%method, %url, "Calling action API");
        let mut request = self.client.request(method, &url);
        if let Some(body) = arguments.get("body").filter(|b| !b.is_null()) {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| ToolError::ExecutionFailed {
            tool_name: "action_api".into(),
            reason: e.to_string(),
        })?;

        let status_code = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
        let result = ActionResponse { status_code, body };

        let rendered = serde_json::to_string(&result).unwrap_or_default();
        Ok(if status_code < 400 {
            ToolOutput::text(rendered)
        } else {
            ToolOutput::failure(rendered)
        })
    }
}
