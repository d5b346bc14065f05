use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Result};
use async_trait::async_trait;
use coderelay_schema::{ChannelInfo, KeyboardRow, MessageContext, Platform, UserInfo};

/// Outbound side of a chat platform.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    fn platform(&self) -> Platform;

    /// Whether replies should land in the thread the request came from.
    fn uses_threaded_replies(&self) -> bool;

    /// Returns the platform id of the sent message.
    async fn send_message(
        &self,
        context: &MessageContext,
        text: &str,
        thread_anchor: Option<&str>,
    ) -> Result<String>;

    async fn send_message_with_buttons(
        &self,
        context: &MessageContext,
        text: &str,
        keyboard: &[KeyboardRow],
        thread_anchor: Option<&str>,
    ) -> Result<String>;

    async fn edit_message(
        &self,
        context: &MessageContext,
        message_id: &str,
        text: &str,
        keyboard: Option<&[KeyboardRow]>,
    ) -> Result<()>;

    async fn get_user_info(&self, user_id: &str) -> Result<UserInfo>;

    async fn get_channel_info(&self, channel_id: &str) -> Result<ChannelInfo>;
}

/// Sends and swallows the failure. Outbound messages are never retried.
pub async fn deliver(
    chat: &dyn ChatGateway,
    context: &MessageContext,
    text: &str,
    thread_anchor: Option<&str>,
) -> Option<String> {
    match chat.send_message(context, text, thread_anchor).await {
        Ok(message_id) => Some(message_id),
        Err(e) => {
            tracing::warn!(
                platform = %context.platform,
                channel_id = %context.channel_id,
                "failed to send chat message: {e:#}"
            );
            None
        }
    }
}

/// Like [`deliver`], for messages carrying inline buttons.
pub async fn deliver_with_buttons(
    chat: &dyn ChatGateway,
    context: &MessageContext,
    text: &str,
    keyboard: &[KeyboardRow],
    thread_anchor: Option<&str>,
) -> Option<String> {
    match chat
        .send_message_with_buttons(context, text, keyboard, thread_anchor)
        .await
    {
        Ok(message_id) => Some(message_id),
        Err(e) => {
            tracing::warn!(
                platform = %context.platform,
                channel_id = %context.channel_id,
                "failed to send chat message with buttons: {e:#}"
            );
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: String,
    pub channel_id: String,
    pub text: String,
    pub thread_anchor: Option<String>,
    pub keyboard: Option<Vec<KeyboardRow>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditedMessage {
    pub message_id: String,
    pub text: String,
    pub keyboard: Option<Vec<KeyboardRow>>,
}

/// Records outbound traffic instead of talking to a platform.
pub struct StubChat {
    platform: Platform,
    threaded: bool,
    fail_sends: AtomicBool,
    next_id: AtomicU64,
    sent: Mutex<Vec<SentMessage>>,
    edits: Mutex<Vec<EditedMessage>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StubChat {
    pub fn new(platform: Platform) -> Self {
        let threaded = platform.opens_threads();
        Self {
            platform,
            threaded,
            fail_sends: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            sent: Mutex::new(Vec::new()),
            edits: Mutex::new(Vec::new()),
        }
    }

    pub fn with_threaded_replies(mut self, threaded: bool) -> Self {
        self.threaded = threaded;
        self
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        lock(&self.sent).clone()
    }

    pub fn texts(&self) -> Vec<String> {
        lock(&self.sent).iter().map(|sent| sent.text.clone()).collect()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        lock(&self.sent)
            .iter()
            .filter(|sent| sent.text.contains(needle))
            .count()
    }

    pub fn edits(&self) -> Vec<EditedMessage> {
        lock(&self.edits).clone()
    }

    fn record(
        &self,
        context: &MessageContext,
        text: &str,
        keyboard: Option<&[KeyboardRow]>,
        thread_anchor: Option<&str>,
    ) -> Result<String> {
        if self.fail_sends.load(Ordering::SeqCst) {
            bail!("stub chat rejected the message");
        }
        let message_id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        lock(&self.sent).push(SentMessage {
            message_id: message_id.clone(),
            channel_id: context.channel_id.clone(),
            text: text.to_string(),
            thread_anchor: thread_anchor.map(str::to_string),
            keyboard: keyboard.map(<[KeyboardRow]>::to_vec),
        });
        Ok(message_id)
    }
}

#[async_trait]
impl ChatGateway for StubChat {
    fn platform(&self) -> Platform {
        self.platform.clone()
    }

    fn uses_threaded_replies(&self) -> bool {
        self.threaded
    }

    async fn send_message(
        &self,
        context: &MessageContext,
        text: &str,
        thread_anchor: Option<&str>,
    ) -> Result<String> {
        self.record(context, text, None, thread_anchor)
    }

    async fn send_message_with_buttons(
        &self,
        context: &MessageContext,
        text: &str,
        keyboard: &[KeyboardRow],
        thread_anchor: Option<&str>,
    ) -> Result<String> {
        self.record(context, text, Some(keyboard), thread_anchor)
    }

    async fn edit_message(
        &self,
        _context: &MessageContext,
        message_id: &str,
        text: &str,
        keyboard: Option<&[KeyboardRow]>,
    ) -> Result<()> {
        lock(&self.edits).push(EditedMessage {
            message_id: message_id.to_string(),
            text: text.to_string(),
            keyboard: keyboard.map(<[KeyboardRow]>::to_vec),
        });
        Ok(())
    }

    async fn get_user_info(&self, user_id: &str) -> Result<UserInfo> {
        Ok(UserInfo {
            id: user_id.to_string(),
            ..Default::default()
        })
    }

    async fn get_channel_info(&self, channel_id: &str) -> Result<ChannelInfo> {
        Ok(ChannelInfo {
            id: channel_id.to_string(),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> MessageContext {
        MessageContext {
            platform: Platform::Telegram,
            user_id: "7".into(),
            channel_id: "7".into(),
            thread_id: None,
            message_id: None,
        }
    }

    #[tokio::test]
    async fn deliver_swallows_send_failures() {
        let chat = StubChat::new(Platform::Telegram);
        chat.set_fail_sends(true);
        assert_eq!(deliver(&chat, &context(), "hello", None).await, None);
        assert!(chat.sent().is_empty());

        chat.set_fail_sends(false);
        let id = deliver(&chat, &context(), "hello", Some("9")).await;
        assert_eq!(id.as_deref(), Some("1"));
        assert_eq!(chat.sent()[0].thread_anchor.as_deref(), Some("9"));
    }
}
