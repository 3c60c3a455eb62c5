//! Response chunks, persisted blocks, and outbound stream records.
//!
//! Strategies produce [`ResponseChunk`]s. The orchestrator folds them into
//! [`Block`]s on the turn and forwards each one to the client as an
//! [`OutboundRecord`], one NDJSON line per record.

use serde::{Deserialize, Serialize};

use crate::ids::{AssistantId, TurnId};

/// A tabular result row: column name to JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// A button offered with a dialog chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogAction {
    /// Button label, e.g. "Submit" or "Cancel".
    pub action: String,

    /// Endpoint to call when chosen. `None` means dismiss only.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,

    /// Presentation hint (default, outline, destructive, ...).
    #[serde(default = "default_variant")]
    pub variant: String,
}

fn default_variant() -> String {
    "default".into()
}

/// One unit of streamed strategy output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseChunk {
    /// A text fragment. Fragments concatenate into the reply.
    Text { content: String },

    /// Progress notice; shown to the client, never persisted.
    Status { message: String },

    /// A failure the client should see.
    Error { message: String },

    /// A confirmation prompt with actions.
    Dialog {
        content: String,
        title: String,
        description: String,
        #[serde(default)]
        actions: Vec<DialogAction>,
    },

    Table {
        rows: Vec<Row>,
        title: String,
        description: String,
    },

    Barchart {
        rows: Vec<Row>,
        title: String,
        description: String,
        x_axis: String,
        y_axis: String,
        explanation: String,
    },
}

impl ResponseChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// The wire discriminant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Status { .. } => "status",
            Self::Error { .. } => "error",
            Self::Dialog { .. } => "dialog",
            Self::Table { .. } => "table",
            Self::Barchart { .. } => "barchart",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogConfig {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub actions: Vec<DialogAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartConfig {
    pub title: String,
    pub description: String,
    #[serde(rename = "xAxis")]
    pub x_axis: String,
    #[serde(rename = "yAxis")]
    pub y_axis: String,
    pub explanation: String,
}

/// The forwarded and persisted form of a chunk.
///
/// A text block always carries the full text accumulated so far, not the
/// fragment that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text { text: String },
    Status { message: String },
    Error { message: String },
    Dialog { content: String, config: DialogConfig },
    Table { data: Vec<Row>, config: TableConfig },
    Barchart { data: Vec<Row>, config: ChartConfig },
}

impl Block {
    /// Build the block for a non-text chunk. Text chunks return `None`
    /// since their block depends on accumulated state.
    pub fn from_structured(chunk: ResponseChunk) -> Option<Self> {
        match chunk {
            ResponseChunk::Text { .. } => None,
            ResponseChunk::Status { message } => Some(Self::Status { message }),
            ResponseChunk::Error { message } => Some(Self::Error { message }),
            ResponseChunk::Dialog {
                content,
                title,
                description,
                actions,
            } => Some(Self::Dialog {
                content,
                config: DialogConfig {
                    title,
                    description,
                    actions,
                },
            }),
            ResponseChunk::Table {
                rows,
                title,
                description,
            } => Some(Self::Table {
                data: rows,
                config: TableConfig { title, description },
            }),
            ResponseChunk::Barchart {
                rows,
                title,
                description,
                x_axis,
                y_axis,
                explanation,
            } => Some(Self::Barchart {
                data: rows,
                config: ChartConfig {
                    title,
                    description,
                    x_axis,
                    y_axis,
                    explanation,
                },
            }),
        }
    }

    /// Plain-text rendering used when a block is replayed as history.
    pub fn as_plain_text(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::Status { message } | Self::Error { message } => message.clone(),
            Self::Dialog { content, .. } => content.clone(),
            Self::Table { config, .. } => format!("{}: {}", config.title, config.description),
            Self::Barchart { config, .. } => config.explanation.clone(),
        }
    }
}

/// One line of the outbound NDJSON stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRecord {
    pub message_id: TurnId,
    pub assistant_id: AssistantId,
    #[serde(flatten)]
    pub block: Block,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl OutboundRecord {
    pub fn new(message_id: TurnId, assistant_id: AssistantId, block: Block) -> Self {
        Self {
            message_id,
            assistant_id,
            block,
            title: None,
        }
    }

    /// Encode as one JSON object followed by a newline.
    pub fn to_ndjson_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chunk_uses_type_tag() {
        let value = serde_json::to_value(ResponseChunk::status("querying")).unwrap();
        assert_eq!(value, json!({"type": "status", "message": "querying"}));
    }

    #[test]
    fn text_chunk_has_no_structured_block() {
        assert!(Block::from_structured(ResponseChunk::text("hi")).is_none());
    }

    #[test]
    fn barchart_block_uses_axis_wire_names() {
        let mut row = Row::new();
        row.insert("city".into(), json!("Oslo"));
        row.insert("sales".into(), json!(12));
        let block = Block::from_structured(ResponseChunk::Barchart {
            rows: vec![row],
            title: "Sales".into(),
            description: "By city".into(),
            x_axis: "city".into(),
            y_axis: "sales".into(),
            explanation: "grouped".into(),
        })
        .unwrap();

        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["type"], "barchart");
        assert_eq!(value["config"]["xAxis"], "city");
        assert_eq!(value["config"]["yAxis"], "sales");
        assert_eq!(value["data"][0]["sales"], 12);
    }

    #[test]
    fn ndjson_line_is_single_object() {
        let mut record = OutboundRecord::new(
            TurnId::from("t1"),
            AssistantId::from("a1"),
            Block::Text { text: "Hello".into() },
        );
        let line = record.to_ndjson_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert!(!line.contains("title"));

        record.title = Some("Greeting".into());
        let value: serde_json::Value = serde_json::from_str(record.to_ndjson_line().unwrap().trim()).unwrap();
        assert_eq!(value["message_id"], "t1");
        assert_eq!(value["type"], "text");
        assert_eq!(value["text"], "Hello");
        assert_eq!(value["title"], "Greeting");
    }

    #[test]
    fn dialog_action_defaults_variant() {
        let action: DialogAction = serde_json::from_value(json!({"action": "Cancel", "url": null})).unwrap();
        assert_eq!(action.variant, "default");
        assert!(action.url.is_none());
    }
}
