//! Slash commands and inline-button callbacks understood by the bridge.
//!
//! Commands are handled before anything reaches the agent.

use coderelay_schema::{InlineButton, KeyboardRow, MessageCategory};

/// Parsed slash command from user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    /// /start - Welcome text and command list
    Start,
    /// /clear (or /reset) - Forget the agent conversation for this chat
    Clear,
    /// /cwd - Show the working directory
    Cwd,
    /// /set_cwd <path> - Change the working directory
    SetCwd { path: Option<String> },
    /// /settings - Message visibility toggles
    Settings,
    /// /queue - List messages waiting for the agent
    Queue,
    /// /status - Session state summary
    Status,
    /// /stop - Interrupt the running turn and drop the queue
    Stop,
}

pub const COMMAND_HELP: &[(&str, &str)] = &[
    ("/start", "Show this help"),
    ("/clear", "Reset the agent conversation"),
    ("/cwd", "Show the working directory"),
    ("/set_cwd <path>", "Change the working directory"),
    ("/settings", "Choose which messages are shown"),
    ("/queue", "List queued messages"),
    ("/status", "Show session status"),
    ("/stop", "Interrupt the agent and clear the queue"),
];

/// Parse a message to check if it starts with a known slash command.
///
/// Unknown commands return `None` and go to the agent like any other text.
pub fn parse_command(text: &str) -> Option<SlashCommand> {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    let (head, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (trimmed, ""),
    };
    // group chats address bots as /cmd@botname
    let name = head.split('@').next().unwrap_or(head).to_lowercase();

    match name.as_str() {
        "/start" | "/help" => Some(SlashCommand::Start),
        "/clear" | "/reset" => Some(SlashCommand::Clear),
        "/cwd" => Some(SlashCommand::Cwd),
        "/set_cwd" => Some(SlashCommand::SetCwd {
            path: (!rest.is_empty()).then(|| rest.to_string()),
        }),
        "/settings" => Some(SlashCommand::Settings),
        "/queue" => Some(SlashCommand::Queue),
        "/status" => Some(SlashCommand::Status),
        "/stop" => Some(SlashCommand::Stop),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    ToggleCategory(MessageCategory),
    ShowCwd,
    ChangeCwd,
    Clear,
    ShowSettings,
    ExplainCategories,
}

const TOGGLE_PREFIX: &str = "toggle_msg_";

pub fn parse_callback(data: &str) -> Option<CallbackAction> {
    if let Some(category) = data.strip_prefix(TOGGLE_PREFIX) {
        return MessageCategory::parse(category).map(CallbackAction::ToggleCategory);
    }
    match data {
        "cmd_cwd" => Some(CallbackAction::ShowCwd),
        "cmd_change_cwd" => Some(CallbackAction::ChangeCwd),
        "cmd_clear" => Some(CallbackAction::Clear),
        "cmd_settings" => Some(CallbackAction::ShowSettings),
        "info_msg_types" => Some(CallbackAction::ExplainCategories),
        _ => None,
    }
}

pub fn toggle_callback_data(category: MessageCategory) -> String {
    format!("{TOGGLE_PREFIX}{}", category.as_str())
}

/// One toggle row per category plus an explanation button.
pub fn settings_keyboard(is_hidden: impl Fn(MessageCategory) -> bool) -> Vec<KeyboardRow> {
    let mut rows: Vec<KeyboardRow> = MessageCategory::ALL
        .into_iter()
        .map(|category| {
            let mark = if is_hidden(category) { "❌" } else { "✅" };
            vec![InlineButton::new(
                format!("{mark} {}", category.display_name()),
                toggle_callback_data(category),
            )]
        })
        .collect();
    rows.push(vec![InlineButton::new("ℹ️ About message types", "info_msg_types")]);
    rows
}

pub fn start_keyboard() -> Vec<KeyboardRow> {
    vec![
        vec![
            InlineButton::new("📁 Working directory", "cmd_cwd"),
            InlineButton::new("📂 Change directory", "cmd_change_cwd"),
        ],
        vec![
            InlineButton::new("🔄 Reset session", "cmd_clear"),
            InlineButton::new("⚙️ Settings", "cmd_settings"),
        ],
    ]
}
