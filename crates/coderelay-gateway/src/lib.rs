use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use coderelay_core::{
    absolutize, deliver, deliver_with_buttons, effective_working_directory, parse_callback,
    parse_command, resolve_context, settings_keyboard, start_keyboard, truncate_text,
    CallbackAction, ChatGateway, Formatter, ResolvedContext, SessionRegistry, SlashCommand,
    COMMAND_HELP,
};
use coderelay_schema::{CallbackEvent, InboundEvent, KeyboardRow, MessageCategory, QueuedMessage};
use coderelay_settings::SettingsStore;
use tokio::task::JoinHandle;

const WELCOME: &str =
    "Every message you send here goes to the coding agent and its output streams back into this chat.";
const QUEUE_PREVIEW: usize = 100;
const STATUS_PREVIEW: usize = 50;

/// Entry point for everything a chat platform delivers.
pub struct Gateway {
    registry: Arc<SessionRegistry>,
    settings: Arc<SettingsStore>,
    chat: Arc<dyn ChatGateway>,
    formatter: Arc<dyn Formatter>,
}

impl Gateway {
    pub fn new(
        registry: Arc<SessionRegistry>,
        settings: Arc<SettingsStore>,
        chat: Arc<dyn ChatGateway>,
        formatter: Arc<dyn Formatter>,
    ) -> Self {
        Self {
            registry,
            settings,
            chat,
            formatter,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn handle_inbound(&self, event: InboundEvent) -> Result<()> {
        let text = event.text.trim();
        if text.is_empty() {
            tracing::debug!(trace_id = %event.trace_id, "ignoring empty message");
            return Ok(());
        }

        let ctx = resolve_context(&event);
        tracing::info!(
            trace_id = %event.trace_id,
            conversation = %ctx.conversation_key,
            user_id = %event.user_id,
            "inbound message"
        );

        if let Some(command) = parse_command(text) {
            return self.handle_command(&ctx, command).await;
        }

        let was_executing = self.registry.is_executing(&ctx.conversation_key).await;
        let position = self
            .registry
            .enqueue(&ctx, QueuedMessage::new(text, ctx.thread_anchor.clone()))
            .await;

        let ack = if was_executing {
            format!("📥 {}", self.formatter.escape(&format!("Queued (position {position})")))
        } else {
            format!("📨 {}", self.formatter.escape("Message received, processing..."))
        };
        self.reply(&ctx, &ack).await;

        self.registry.try_start(&ctx.conversation_key).await;
        Ok(())
    }

    pub async fn handle_callback(&self, event: CallbackEvent) -> Result<()> {
        let ctx = resolve_context(&event.as_inbound());
        let Some(action) = parse_callback(&event.data) else {
            tracing::warn!(
                trace_id = %event.trace_id,
                data = %event.data,
                "unknown callback data"
            );
            return Ok(());
        };
        tracing::info!(
            trace_id = %event.trace_id,
            conversation = %ctx.conversation_key,
            action = ?action,
            "callback"
        );

        match action {
            CallbackAction::ToggleCategory(category) => {
                let hidden = self
                    .settings
                    .toggle_hidden_category(&ctx.settings_key, category)
                    .await;
                tracing::info!(
                    settings_key = %ctx.settings_key,
                    category = category.as_str(),
                    hidden,
                    "message visibility toggled"
                );

                let keyboard = self.settings_keyboard(&ctx).await;
                let text = self.settings_text();
                match event.message_id.as_deref() {
                    Some(message_id) => {
                        if let Err(e) = self
                            .chat
                            .edit_message(&ctx.reply_to, message_id, &text, Some(&keyboard))
                            .await
                        {
                            tracing::warn!("failed to update settings message: {e:#}");
                        }
                    }
                    None => self.reply_with_buttons(&ctx, &text, &keyboard).await,
                }
                Ok(())
            }
            CallbackAction::ShowCwd => self.handle_command(&ctx, SlashCommand::Cwd).await,
            CallbackAction::ChangeCwd => {
                self.handle_command(&ctx, SlashCommand::SetCwd { path: None })
                    .await
            }
            CallbackAction::Clear => self.handle_command(&ctx, SlashCommand::Clear).await,
            CallbackAction::ShowSettings => {
                self.handle_command(&ctx, SlashCommand::Settings).await
            }
            CallbackAction::ExplainCategories => {
                self.explain_categories(&ctx).await;
                Ok(())
            }
        }
    }

    async fn handle_command(&self, ctx: &ResolvedContext, command: SlashCommand) -> Result<()> {
        tracing::debug!(conversation = %ctx.conversation_key, command = ?command, "command");
        match command {
            SlashCommand::Start => self.start(ctx).await,
            SlashCommand::Clear => self.clear(ctx).await,
            SlashCommand::Cwd => self.show_cwd(ctx).await,
            SlashCommand::SetCwd { path } => self.set_cwd(ctx, path.as_deref()).await,
            SlashCommand::Settings => {
                let keyboard = self.settings_keyboard(ctx).await;
                self.reply_with_buttons(ctx, &self.settings_text(), &keyboard)
                    .await;
            }
            SlashCommand::Queue => self.show_queue(ctx).await,
            SlashCommand::Status => self.show_status(ctx).await,
            SlashCommand::Stop => self.stop(ctx).await,
        }
        Ok(())
    }

    async fn start(&self, ctx: &ResolvedContext) {
        let f = self.formatter.as_ref();
        let mut text = format!(
            "👋 {}\n\n{}\n\n{}",
            f.bold("Welcome to coderelay"),
            f.escape(WELCOME),
            f.bold("Commands")
        );
        for (command, help) in COMMAND_HELP {
            text.push_str(&format!(
                "\n{} {}",
                f.code_inline(command),
                f.escape(&format!("- {help}"))
            ));
        }
        self.reply_with_buttons(ctx, &text, &start_keyboard()).await;
    }

    async fn clear(&self, ctx: &ResolvedContext) {
        // the receiver is stopped first so a handshake in flight cannot
        // re-store a mapping after it was cleared
        let torn_down = self.registry.teardown(&ctx.conversation_key).await;
        let base_session_id = ctx.conversation_key.base_session_id();
        let cleared = self
            .settings
            .clear_session_mapping(&ctx.settings_key, &base_session_id, None)
            .await;
        tracing::info!(
            conversation = %ctx.conversation_key,
            cleared,
            torn_down,
            "session reset"
        );
        let text = format!("🔄 {}", self.formatter.escape("Session has been reset."));
        self.reply(ctx, &text).await;
    }

    async fn show_cwd(&self, ctx: &ResolvedContext) {
        let f = self.formatter.as_ref();
        let custom = self.settings.working_directory(&ctx.settings_key).await;
        let default = &self.registry.config().default_working_directory;
        let effective = effective_working_directory(custom.as_deref(), default);

        let mut text = format!(
            "📁 {}\n{}",
            f.bold("Working directory"),
            f.code_inline(&effective.to_string_lossy())
        );
        match custom.as_deref() {
            Some(custom) if Path::new(custom) != effective => text.push_str(&format!(
                "\n{}",
                f.format_warning(&format!(
                    "The custom directory {custom} no longer exists, using the default."
                ))
            )),
            Some(_) => text.push_str(&format!("\n{}", f.escape("Source: custom"))),
            None => text.push_str(&format!("\n{}", f.escape("Source: default"))),
        }
        if !effective.is_dir() {
            text.push_str(&format!(
                "\n{}",
                f.escape("The directory does not exist yet and is created when the agent starts.")
            ));
        }
        self.reply(ctx, &text).await;
    }

    async fn set_cwd(&self, ctx: &ResolvedContext, path: Option<&str>) {
        let f = self.formatter.as_ref();
        let Some(path) = path else {
            let text = f.format_info("Usage: /set_cwd <path>");
            self.reply(ctx, &text).await;
            return;
        };

        let target = absolutize(Path::new(path));
        if let Err(e) = tokio::fs::create_dir_all(&target).await {
            tracing::warn!(path = %target.display(), "failed to create working directory: {e}");
            let text = f.format_error(&format!(
                "Could not use {} as working directory: {e}",
                target.display()
            ));
            self.reply(ctx, &text).await;
            return;
        }
        if !target.is_dir() {
            let text = f.format_error(&format!("{} is not a directory.", target.display()));
            self.reply(ctx, &text).await;
            return;
        }

        let stored = target.to_string_lossy().to_string();
        self.settings
            .set_working_directory(&ctx.settings_key, Some(stored.clone()))
            .await;
        tracing::info!(
            settings_key = %ctx.settings_key,
            cwd = %stored,
            "working directory changed"
        );

        let text = f.format_success(&format!("Working directory changed to: {stored}"));
        self.reply(ctx, &text).await;
    }

    async fn show_queue(&self, ctx: &ResolvedContext) {
        let f = self.formatter.as_ref();
        let queued = match self.registry.snapshot(&ctx.conversation_key).await {
            Some(snapshot) => snapshot.queued,
            None => Vec::new(),
        };
        if queued.is_empty() {
            self.reply(ctx, &f.format_info("The queue is empty.")).await;
            return;
        }

        let mut text = format!(
            "📋 {}",
            f.bold(&format!("Queued messages ({})", queued.len()))
        );
        for (index, message) in queued.iter().enumerate() {
            text.push_str(&format!(
                "\n{}",
                f.escape(&format!(
                    "{}. {}",
                    index + 1,
                    preview(&message.text, QUEUE_PREVIEW)
                ))
            ));
        }
        self.reply(ctx, &text).await;
    }

    async fn show_status(&self, ctx: &ResolvedContext) {
        let f = self.formatter.as_ref();
        let Some(snapshot) = self.registry.snapshot(&ctx.conversation_key).await else {
            let text = f.format_info("No active session. Send a message to start one.");
            self.reply(ctx, &text).await;
            return;
        };

        let state = if snapshot.executing { "Processing" } else { "Idle" };
        let mut lines = vec![
            format!("State: {state}"),
            format!("Queued: {}", snapshot.queued.len()),
            format!(
                "Last activity: {}",
                snapshot.last_activity.format("%Y-%m-%d %H:%M:%S UTC")
            ),
        ];
        if let Some(dir) = &snapshot.working_directory {
            lines.push(format!("Working directory: {}", dir.display()));
        }
        if let Some(next) = snapshot.queued.first() {
            lines.push(format!("Next: {}", preview(&next.text, STATUS_PREVIEW)));
        }

        let mut text = format!("📊 {}", f.bold("Session status"));
        for line in lines {
            text.push('\n');
            text.push_str(&f.escape(&line));
        }
        self.reply(ctx, &text).await;
    }

    async fn stop(&self, ctx: &ResolvedContext) {
        let f = self.formatter.as_ref();
        let was_executing = self.registry.is_executing(&ctx.conversation_key).await;
        let discarded = self
            .registry
            .stop(&ctx.conversation_key)
            .await
            .unwrap_or_default();

        let text = if !was_executing && discarded == 0 {
            f.format_info("Nothing to stop.")
        } else {
            tracing::info!(conversation = %ctx.conversation_key, discarded, "stopped");
            f.format_success(&format!(
                "Stopped. {discarded} queued message(s) discarded."
            ))
        };
        self.reply(ctx, &text).await;
    }

    async fn explain_categories(&self, ctx: &ResolvedContext) {
        let f = self.formatter.as_ref();
        let mut text = format!("ℹ️ {}", f.bold("Message types"));
        for category in MessageCategory::ALL {
            text.push_str(&format!(
                "\n{} {}",
                f.bold(category.display_name()),
                f.escape(&format!("- {}", category.description()))
            ));
        }
        self.reply(ctx, &text).await;
    }

    fn settings_text(&self) -> String {
        let f = self.formatter.as_ref();
        format!(
            "⚙️ {}\n{}",
            f.bold("Message visibility"),
            f.escape("Choose which agent messages are shown in this chat.")
        )
    }

    async fn settings_keyboard(&self, ctx: &ResolvedContext) -> Vec<KeyboardRow> {
        let record = self.settings.get_or_create(&ctx.settings_key).await;
        settings_keyboard(|category| record.is_hidden(category))
    }

    fn anchor<'a>(&self, ctx: &'a ResolvedContext) -> Option<&'a str> {
        if self.chat.uses_threaded_replies() {
            ctx.thread_anchor.as_deref()
        } else {
            None
        }
    }

    async fn reply(&self, ctx: &ResolvedContext, text: &str) {
        deliver(self.chat.as_ref(), &ctx.reply_to, text, self.anchor(ctx)).await;
    }

    async fn reply_with_buttons(
        &self,
        ctx: &ResolvedContext,
        text: &str,
        keyboard: &[KeyboardRow],
    ) {
        deliver_with_buttons(
            self.chat.as_ref(),
            &ctx.reply_to,
            text,
            keyboard,
            self.anchor(ctx),
        )
        .await;
    }
}

/// One line, at most `max` characters.
fn preview(text: &str, max: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_text(&flat, max)
}

/// Periodically tears down sessions idle for longer than `threshold`.
pub fn spawn_inactivity_sweep(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    threshold: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let swept = registry.sweep_inactive(threshold).await;
            if !swept.is_empty() {
                tracing::info!(count = swept.len(), "swept inactive sessions");
            }
        }
    })
}
