use std::collections::HashMap as StdHashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use coderelay_core::{ChatGateway, TelegramFormatter};
use coderelay_gateway::Gateway;
use coderelay_schema::{
    CallbackEvent, ChannelInfo, InboundEvent, KeyboardRow, MessageContext, Platform, UserInfo,
};
use teloxide::prelude::*;
use teloxide::types::{
    Chat, ChatAction, InlineKeyboardButton, InlineKeyboardMarkup, MaybeInaccessibleMessage,
    Message, MessageId, ParseMode, ThreadId, User,
};
use tokio::sync::Mutex as TokioMutex;

pub fn to_inbound(
    chat_id: i64,
    user_id: i64,
    text: &str,
    message_id: i32,
    thread_id: Option<String>,
) -> InboundEvent {
    let mut event = InboundEvent::new("telegram", user_id.to_string(), chat_id.to_string(), text)
        .with_message_id(message_id.to_string());
    event.thread_id = thread_id;
    event
}

pub fn to_keyboard(rows: &[KeyboardRow]) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(rows.iter().map(|row| {
        row.iter()
            .map(|button| {
                InlineKeyboardButton::callback(button.label.clone(), button.callback_data.clone())
            })
            .collect::<Vec<_>>()
    }))
}

fn parse_chat_id(raw: &str) -> Result<ChatId> {
    raw.parse::<i64>()
        .map(ChatId)
        .with_context(|| format!("invalid telegram chat id: {raw}"))
}

fn parse_message_id(raw: &str) -> Result<MessageId> {
    raw.parse::<i32>()
        .map(MessageId)
        .with_context(|| format!("invalid telegram message id: {raw}"))
}

/// Forum topics are addressed through their root message id.
fn parse_thread(raw: &str) -> Option<ThreadId> {
    raw.parse::<i32>().ok().map(|id| ThreadId(MessageId(id)))
}

/// Outbound side of the Telegram bot.
///
/// User and chat details are remembered from inbound updates rather than
/// fetched.
pub struct TelegramChat {
    bot: Bot,
    users: TokioMutex<StdHashMap<String, UserInfo>>,
    chats: TokioMutex<StdHashMap<String, ChannelInfo>>,
}

impl TelegramChat {
    pub fn new(bot: Bot) -> Self {
        Self {
            bot,
            users: TokioMutex::new(StdHashMap::new()),
            chats: TokioMutex::new(StdHashMap::new()),
        }
    }

    pub fn from_token(token: &str) -> Self {
        Self::new(Bot::new(token))
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    async fn remember(&self, user: Option<&User>, chat: &Chat) {
        if let Some(user) = user {
            self.users.lock().await.insert(
                user.id.0.to_string(),
                UserInfo {
                    id: user.id.0.to_string(),
                    display_name: Some(user.full_name()),
                    username: user.username.clone(),
                },
            );
        }
        self.chats.lock().await.insert(
            chat.id.0.to_string(),
            ChannelInfo {
                id: chat.id.0.to_string(),
                name: chat.title().map(str::to_string),
                is_direct: chat.is_private(),
            },
        );
    }

    async fn send(
        &self,
        context: &MessageContext,
        text: &str,
        keyboard: Option<&[KeyboardRow]>,
        thread_anchor: Option<&str>,
    ) -> Result<String> {
        let chat_id = parse_chat_id(&context.channel_id)?;
        let thread = thread_anchor.and_then(parse_thread);

        let mut request = self
            .bot
            .send_message(chat_id, text)
            .parse_mode(ParseMode::MarkdownV2);
        if let Some(thread) = thread {
            request = request.message_thread_id(thread);
        }
        if let Some(rows) = keyboard {
            request = request.reply_markup(to_keyboard(rows));
        }

        let sent = match request.await {
            Ok(sent) => sent,
            Err(e) => {
                // markup the API refuses still goes out as plain text
                tracing::warn!(
                    chat_id = chat_id.0,
                    "markdown send failed, retrying as plain text: {e}"
                );
                let mut plain = self
                    .bot
                    .send_message(chat_id, TelegramFormatter::unescape(text));
                if let Some(thread) = thread {
                    plain = plain.message_thread_id(thread);
                }
                if let Some(rows) = keyboard {
                    plain = plain.reply_markup(to_keyboard(rows));
                }
                plain.await.context("telegram send_message failed")?
            }
        };
        Ok(sent.id.0.to_string())
    }
}

#[async_trait]
impl ChatGateway for TelegramChat {
    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    fn uses_threaded_replies(&self) -> bool {
        // anchors only exist for forum topics
        true
    }

    async fn send_message(
        &self,
        context: &MessageContext,
        text: &str,
        thread_anchor: Option<&str>,
    ) -> Result<String> {
        self.send(context, text, None, thread_anchor).await
    }

    async fn send_message_with_buttons(
        &self,
        context: &MessageContext,
        text: &str,
        keyboard: &[KeyboardRow],
        thread_anchor: Option<&str>,
    ) -> Result<String> {
        self.send(context, text, Some(keyboard), thread_anchor).await
    }

    async fn edit_message(
        &self,
        context: &MessageContext,
        message_id: &str,
        text: &str,
        keyboard: Option<&[KeyboardRow]>,
    ) -> Result<()> {
        let chat_id = parse_chat_id(&context.channel_id)?;
        let message_id = parse_message_id(message_id)?;
        let mut request = self
            .bot
            .edit_message_text(chat_id, message_id, text)
            .parse_mode(ParseMode::MarkdownV2);
        if let Some(rows) = keyboard {
            request = request.reply_markup(to_keyboard(rows));
        }
        request.await.context("telegram edit_message_text failed")?;
        Ok(())
    }

    async fn get_user_info(&self, user_id: &str) -> Result<UserInfo> {
        Ok(self
            .users
            .lock()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| UserInfo {
                id: user_id.to_string(),
                ..Default::default()
            }))
    }

    async fn get_channel_info(&self, channel_id: &str) -> Result<ChannelInfo> {
        Ok(self
            .chats
            .lock()
            .await
            .get(channel_id)
            .cloned()
            .unwrap_or_else(|| ChannelInfo {
                id: channel_id.to_string(),
                ..Default::default()
            }))
    }
}

pub struct TelegramBot {
    chat: Arc<TelegramChat>,
    gateway: Arc<Gateway>,
    allowed_users: Vec<i64>,
}

impl TelegramBot {
    pub fn new(chat: Arc<TelegramChat>, gateway: Arc<Gateway>, allowed_users: Vec<i64>) -> Self {
        Self {
            chat,
            gateway,
            allowed_users,
        }
    }

    pub async fn run_impl(self) -> anyhow::Result<()> {
        let bot = self.chat.bot();
        let allowed = Arc::new(self.allowed_users);

        let message_handler = {
            let chat = self.chat.clone();
            let gateway = self.gateway.clone();
            let allowed = allowed.clone();
            Update::filter_message().endpoint(move |bot: Bot, msg: Message| {
                let chat = chat.clone();
                let gateway = gateway.clone();
                let allowed = allowed.clone();

                async move {
                    let Some(text) = msg.text() else {
                        return Ok::<(), teloxide::RequestError>(());
                    };
                    let user_id = msg.from.as_ref().map(|user| user.id.0 as i64).unwrap_or(0);
                    if !is_allowed(&allowed, user_id) {
                        tracing::warn!(user_id, "ignoring message from unauthorized user");
                        return Ok(());
                    }

                    chat.remember(msg.from.as_ref(), &msg.chat).await;
                    let _ = bot.send_chat_action(msg.chat.id, ChatAction::Typing).await;

                    let inbound = to_inbound(
                        msg.chat.id.0,
                        user_id,
                        text,
                        msg.id.0,
                        msg.thread_id.map(|thread| thread.0.0.to_string()),
                    );
                    // awaited in place so one chat's messages are enqueued in order
                    if let Err(e) = gateway.handle_inbound(inbound).await {
                        tracing::error!("gateway error: {e:#}");
                    }
                    Ok(())
                }
            })
        };

        let callback_handler = {
            let gateway = self.gateway.clone();
            let allowed = allowed.clone();
            Update::filter_callback_query().endpoint(move |bot: Bot, query: CallbackQuery| {
                let gateway = gateway.clone();
                let allowed = allowed.clone();

                async move {
                    let _ = bot.answer_callback_query(query.id.clone()).await;

                    let user_id = query.from.id.0 as i64;
                    if !is_allowed(&allowed, user_id) {
                        tracing::warn!(user_id, "ignoring callback from unauthorized user");
                        return Ok::<(), teloxide::RequestError>(());
                    }
                    let (Some(data), Some(message)) = (query.data.as_ref(), query.message.as_ref())
                    else {
                        return Ok(());
                    };

                    let mut event = CallbackEvent::new(
                        "telegram",
                        user_id.to_string(),
                        message.chat().id.0.to_string(),
                        data.clone(),
                    )
                    .with_message_id(message.id().0.to_string());
                    if let MaybeInaccessibleMessage::Regular(regular) = message {
                        event.thread_id = regular.thread_id.map(|thread| thread.0.0.to_string());
                    }

                    if let Err(e) = gateway.handle_callback(event).await {
                        tracing::error!("gateway callback error: {e:#}");
                    }
                    Ok(())
                }
            })
        };

        let handler = dptree::entry()
            .branch(message_handler)
            .branch(callback_handler);

        tracing::info!("telegram bot started");
        Dispatcher::builder(bot, handler)
            .enable_ctrlc_handler()
            .build()
            .dispatch()
            .await;

        Ok(())
    }
}

fn is_allowed(allowed: &[i64], user_id: i64) -> bool {
    allowed.is_empty() || allowed.contains(&user_id)
}

#[async_trait]
impl crate::ChannelBot for TelegramBot {
    fn channel_type(&self) -> &str {
        "telegram"
    }

    async fn run(self: Box<Self>) -> anyhow::Result<()> {
        (*self).run_impl().await
    }
}
