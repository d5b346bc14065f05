//! Maps an inbound chat event onto the conversation it belongs to and the
//! settings record that personalizes it.
//!
//! Resolution never fails:
//! - Slack scopes settings per channel and threads every conversation; a
//!   top-level message anchors its own thread.
//! - Telegram scopes settings per user in private chats (chat id equals user
//!   id) and per chat otherwise; forum topics become the thread.
//! - Any other platform scopes settings per user and keeps whatever thread id
//!   the event carries.

use coderelay_schema::{ConversationKey, InboundEvent, MessageContext, Platform, SettingsKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedContext {
    pub conversation_key: ConversationKey,
    pub settings_key: SettingsKey,
    /// Base reply target; the thread is chosen per message
    pub reply_to: MessageContext,
    pub thread_anchor: Option<String>,
}

pub fn resolve_context(event: &InboundEvent) -> ResolvedContext {
    let platform = Platform::from_tag(&event.platform);
    let thread_id = event.thread_id.clone().filter(|id| !id.is_empty());

    let thread_anchor = if platform.opens_threads() {
        thread_id.or_else(|| event.message_id.clone())
    } else {
        thread_id
    };

    let settings_key = match &platform {
        Platform::Slack => SettingsKey::new(&event.channel_id),
        Platform::Telegram => {
            let user = SettingsKey::new(&event.user_id);
            let channel = SettingsKey::new(&event.channel_id);
            if user == channel {
                user
            } else {
                channel
            }
        }
        Platform::Other(_) => SettingsKey::new(&event.user_id),
    };

    ResolvedContext {
        conversation_key: ConversationKey::new(
            platform.clone(),
            event.channel_id.clone(),
            thread_anchor.clone(),
        ),
        settings_key,
        reply_to: MessageContext {
            platform,
            user_id: event.user_id.clone(),
            channel_id: event.channel_id.clone(),
            thread_id: None,
            message_id: event.message_id.clone(),
        },
        thread_anchor,
    }
}
