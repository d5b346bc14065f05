use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod message;

pub use message::{AgentMessage, ContentBlock, MessageCategory, ResultMessage};

/// Chat platform an event came from.
///
/// Parsing a tag never fails: anything unrecognised is carried as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Platform {
    Telegram,
    Slack,
    Other(String),
}

impl Platform {
    pub fn from_tag(tag: &str) -> Self {
        let normalized = tag.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "telegram" | "tg" => Self::Telegram,
            "slack" => Self::Slack,
            _ => Self::Other(normalized),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Telegram => "telegram",
            Self::Slack => "slack",
            Self::Other(tag) => tag,
        }
    }

    /// Platforms where every top-level message opens its own reply thread.
    pub fn opens_threads(&self) -> bool {
        matches!(self, Self::Slack)
    }
}

impl From<String> for Platform {
    fn from(value: String) -> Self {
        Self::from_tag(&value)
    }
}

impl From<Platform> for String {
    fn from(value: Platform) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub trace_id: Uuid,
    pub platform: String,
    pub user_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    pub text: String,
    pub at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn new(
        platform: impl Into<String>,
        user_id: impl Into<String>,
        channel_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            platform: platform.into(),
            user_id: user_id.into(),
            channel_id: channel_id.into(),
            thread_id: None,
            message_id: None,
            text: text.into(),
            at: Utc::now(),
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }
}

/// Inline button press delivered by a chat platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackEvent {
    pub trace_id: Uuid,
    pub platform: String,
    pub user_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Message carrying the pressed button
    #[serde(default)]
    pub message_id: Option<String>,
    pub data: String,
    pub at: DateTime<Utc>,
}

impl CallbackEvent {
    pub fn new(
        platform: impl Into<String>,
        user_id: impl Into<String>,
        channel_id: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            platform: platform.into(),
            user_id: user_id.into(),
            channel_id: channel_id.into(),
            thread_id: None,
            message_id: None,
            data: data.into(),
            at: Utc::now(),
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Re-shapes the callback as an inbound event so it resolves to the same keys.
    pub fn as_inbound(&self) -> InboundEvent {
        InboundEvent {
            trace_id: self.trace_id,
            platform: self.platform.clone(),
            user_id: self.user_id.clone(),
            channel_id: self.channel_id.clone(),
            thread_id: self.thread_id.clone(),
            message_id: self.message_id.clone(),
            text: String::new(),
            at: self.at,
        }
    }
}

/// Where a reply goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContext {
    pub platform: Platform,
    pub user_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
}

impl MessageContext {
    pub fn in_thread(&self, thread_id: Option<String>) -> Self {
        Self {
            thread_id,
            ..self.clone()
        }
    }
}

/// Identifies exactly one agent conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub platform: Platform,
    pub channel_id: String,
    #[serde(default)]
    pub thread: Option<String>,
}

impl ConversationKey {
    pub fn new(platform: Platform, channel_id: impl Into<String>, thread: Option<String>) -> Self {
        Self {
            platform,
            channel_id: channel_id.into(),
            thread,
        }
    }

    /// Stable prefix of every engine session id issued for this conversation.
    pub fn base_session_id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.thread {
            Some(thread) => write!(f, "{}:{}:{}", self.platform, self.channel_id, thread),
            None => write!(f, "{}:{}", self.platform, self.channel_id),
        }
    }
}

/// Canonical identity of a settings record.
///
/// Numeric identifiers and their string forms collapse to one key. Only
/// surrounding whitespace is dropped: `"007"` and `"7"` stay distinct ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct SettingsKey(String);

impl SettingsKey {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SettingsKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SettingsKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<i64> for SettingsKey {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl From<SettingsKey> for String {
    fn from(value: SettingsKey) -> Self {
        value.0
    }
}

impl fmt::Display for SettingsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub text: String,
    /// Thread the reply for this message should land in
    #[serde(default)]
    pub thread_anchor: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn new(text: impl Into<String>, thread_anchor: Option<String>) -> Self {
        Self {
            text: text.into(),
            thread_anchor,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineButton {
    pub label: String,
    pub callback_data: String,
}

impl InlineButton {
    pub fn new(label: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            callback_data: callback_data.into(),
        }
    }
}

pub type KeyboardRow = Vec<InlineButton>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_direct: bool,
}
