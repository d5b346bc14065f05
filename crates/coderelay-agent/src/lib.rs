pub mod claude;
pub mod decode;
pub mod stub;

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use coderelay_schema::AgentMessage;
use futures_core::Stream;

pub use claude::{ClaudeCliClient, ClaudeCliEngine};
pub use stub::{StubClient, StubEngine, StubQuery, StubReply};

pub type AgentMessageStream = Pin<Box<dyn Stream<Item = Result<AgentMessage, AgentError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to start agent: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("agent connection is closed")]
    Closed,
    #[error("agent transport failed: {0}")]
    Transport(String),
    #[error("undecodable agent message: {0}")]
    Decode(String),
    #[error("agent output stream was already taken")]
    StreamTaken,
    #[error("agent rejected request: {0}")]
    Rejected(String),
}

impl AgentError {
    /// Only a single bad message is recoverable; everything else ends the stream.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub working_directory: PathBuf,
    pub permission_mode: String,
    pub resume_session_id: Option<String>,
    pub system_prompt: Option<String>,
}

impl ConnectOptions {
    pub fn new(working_directory: impl Into<PathBuf>, permission_mode: impl Into<String>) -> Self {
        Self {
            working_directory: working_directory.into(),
            permission_mode: permission_mode.into(),
            resume_session_id: None,
            system_prompt: None,
        }
    }

    pub fn with_resume(mut self, session_id: Option<String>) -> Self {
        self.resume_session_id = session_id;
        self
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }
}

#[async_trait]
pub trait AgentEngine: Send + Sync {
    async fn connect(&self, options: ConnectOptions) -> Result<Arc<dyn AgentClient>, AgentError>;
}

/// One live conversation with the agent.
///
/// The working directory is mutable state shared by every call on this handle.
#[async_trait]
pub trait AgentClient: Send + Sync {
    fn working_directory(&self) -> PathBuf;

    fn set_working_directory(&self, directory: PathBuf);

    async fn query(&self, text: &str, session_id: &str) -> Result<(), AgentError>;

    /// Output of the whole connection. Can be taken once.
    async fn receive_messages(&self) -> Result<AgentMessageStream, AgentError>;

    async fn interrupt(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_decode_errors_are_recoverable() {
        assert!(AgentError::Decode("x".to_string()).is_recoverable());
        assert!(!AgentError::Closed.is_recoverable());
        assert!(!AgentError::Transport("eof".to_string()).is_recoverable());
    }
}
