use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Visibility class of agent output. The serialized names are what settings
/// documents store in `hiddenCategories`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageCategory {
    #[serde(rename = "system")]
    System,
    #[serde(rename = "user")]
    ToolResponse,
    #[serde(rename = "assistant")]
    AssistantText,
    #[serde(rename = "result")]
    Result,
}

impl MessageCategory {
    pub const ALL: [MessageCategory; 4] = [
        MessageCategory::System,
        MessageCategory::ToolResponse,
        MessageCategory::AssistantText,
        MessageCategory::Result,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::ToolResponse => "user",
            Self::AssistantText => "assistant",
            Self::Result => "result",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|category| category.as_str() == raw)
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::System => "System",
            Self::ToolResponse => "Response",
            Self::AssistantText => "Assistant",
            Self::Result => "Result",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::System => "session start-up notices with the working directory",
            Self::ToolResponse => "results returned by the agent's tools",
            Self::AssistantText => "the agent's replies and tool invocations",
            Self::Result => "turn summary with duration and final answer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<Value>,
        #[serde(default)]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultMessage {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub duration_api_ms: u64,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub result: Option<String>,
}

/// One structured message from the agent's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentMessage {
    System {
        subtype: String,
        #[serde(default)]
        data: Value,
    },
    ToolResponse {
        content: Vec<ContentBlock>,
    },
    AssistantText {
        content: Vec<ContentBlock>,
        #[serde(default)]
        model: Option<String>,
    },
    Result(ResultMessage),
    Unknown {
        #[serde(rename = "type")]
        kind: String,
        raw: Value,
    },
}

impl AgentMessage {
    /// `None` for `Unknown`, which is never filtered.
    pub fn category(&self) -> Option<MessageCategory> {
        match self {
            Self::System { .. } => Some(MessageCategory::System),
            Self::ToolResponse { .. } => Some(MessageCategory::ToolResponse),
            Self::AssistantText { .. } => Some(MessageCategory::AssistantText),
            Self::Result(_) => Some(MessageCategory::Result),
            Self::Unknown { .. } => None,
        }
    }

    /// Engine session id carried by the stream's `init` handshake.
    pub fn handshake_session_id(&self) -> Option<&str> {
        match self {
            Self::System { subtype, data } if subtype == "init" => data
                .get("session_id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty()),
            _ => None,
        }
    }

    pub fn has_no_content(&self) -> bool {
        match self {
            Self::ToolResponse { content } | Self::AssistantText { content, .. } => {
                content.is_empty()
            }
            _ => false,
        }
    }

    pub fn is_result(&self) -> bool {
        matches!(self, Self::Result(_))
    }
}
