//! Platform markup for agent output.
//!
//! Rendering is shared; each platform only decides how text is escaped and
//! how emphasis and code look.

use std::path::Path;
use std::sync::Arc;

use coderelay_schema::{AgentMessage, ContentBlock, Platform, ResultMessage};
use serde_json::Value;

const TOOL_RESULT_PREVIEW: usize = 500;

pub trait Formatter: Send + Sync {
    /// Makes arbitrary text render literally.
    fn escape(&self, text: &str) -> String;

    fn bold(&self, text: &str) -> String;

    fn italic(&self, text: &str) -> String;

    fn code_inline(&self, text: &str) -> String;

    fn code_block(&self, text: &str, language: Option<&str>) -> String;

    /// Longest single message the platform accepts, in bytes.
    fn max_message_len(&self) -> usize {
        4000
    }

    fn format_error(&self, text: &str) -> String {
        format!("❌ {}: {}", self.bold("Error"), self.escape(text))
    }

    fn format_warning(&self, text: &str) -> String {
        format!("⚠️ {}: {}", self.bold("Warning"), self.escape(text))
    }

    fn format_success(&self, text: &str) -> String {
        format!("✅ {}", self.escape(text))
    }

    fn format_info(&self, text: &str) -> String {
        format!("ℹ️ {}", self.escape(text))
    }

    /// End-of-turn notice, sent once per result.
    fn format_ready(&self) -> String {
        format!("🟢 {}", self.italic("Ready for your next message"))
    }

    fn format_message(&self, message: &AgentMessage, working_directory: &Path) -> String {
        render_message(self, message, working_directory)
    }
}

pub fn formatter_for(platform: &Platform) -> Arc<dyn Formatter> {
    match platform {
        Platform::Slack => Arc::new(SlackFormatter),
        _ => Arc::new(TelegramFormatter),
    }
}

/// Telegram MarkdownV2.
pub struct TelegramFormatter;

const MARKDOWN_V2_SPECIAL: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!', '\\',
];

impl TelegramFormatter {
    /// Inverse of [`Formatter::escape`].
    pub fn unescape(text: &str) -> String {
        let mut output = String::with_capacity(text.len());
        let mut chars = text.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some(next) if MARKDOWN_V2_SPECIAL.contains(&next) => output.push(next),
                    Some(next) => {
                        output.push(c);
                        output.push(next);
                    }
                    None => output.push(c),
                }
            } else {
                output.push(c);
            }
        }
        output
    }

    fn escape_code(text: &str) -> String {
        let mut output = String::with_capacity(text.len());
        for c in text.chars() {
            if c == '`' || c == '\\' {
                output.push('\\');
            }
            output.push(c);
        }
        output
    }
}

impl Formatter for TelegramFormatter {
    fn escape(&self, text: &str) -> String {
        let mut output = String::with_capacity(text.len());
        for c in text.chars() {
            if MARKDOWN_V2_SPECIAL.contains(&c) {
                output.push('\\');
            }
            output.push(c);
        }
        output
    }

    fn bold(&self, text: &str) -> String {
        format!("*{}*", self.escape(text))
    }

    fn italic(&self, text: &str) -> String {
        format!("_{}_", self.escape(text))
    }

    fn code_inline(&self, text: &str) -> String {
        format!("`{}`", Self::escape_code(text))
    }

    fn code_block(&self, text: &str, language: Option<&str>) -> String {
        format!(
            "```{}\n{}\n```",
            language.unwrap_or_default(),
            Self::escape_code(text)
        )
    }
}

/// Slack mrkdwn.
pub struct SlackFormatter;

impl SlackFormatter {
    pub fn unescape(text: &str) -> String {
        text.replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&amp;", "&")
    }
}

impl Formatter for SlackFormatter {
    fn escape(&self, text: &str) -> String {
        text.replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;")
    }

    fn bold(&self, text: &str) -> String {
        format!("*{}*", self.escape(text))
    }

    fn italic(&self, text: &str) -> String {
        format!("_{}_", self.escape(text))
    }

    fn code_inline(&self, text: &str) -> String {
        format!("`{}`", self.escape(text))
    }

    fn code_block(&self, text: &str, _language: Option<&str>) -> String {
        format!("```\n{}\n```", self.escape(text))
    }

    fn max_message_len(&self) -> usize {
        3900
    }
}

pub fn render_message<F: Formatter + ?Sized>(
    f: &F,
    message: &AgentMessage,
    working_directory: &Path,
) -> String {
    match message {
        AgentMessage::System { subtype, data } => {
            let mut out = format!("🔧 {}", f.bold(&format!("System {subtype}")));
            if subtype == "init" {
                if let Some(cwd) = data.get("cwd").and_then(Value::as_str) {
                    out.push_str(&format!("\n📁 Working directory: {}", f.code_inline(cwd)));
                }
                out.push_str(&format!("\n✨ {}", f.escape("Ready to work!")));
            }
            out
        }
        AgentMessage::AssistantText { content, .. } => {
            render_blocks(f, "🤖", "Assistant", content, working_directory)
        }
        AgentMessage::ToolResponse { content } => {
            render_blocks(f, "👤", "Response", content, working_directory)
        }
        AgentMessage::Result(result) => render_result(f, result),
        AgentMessage::Unknown { kind, raw } => {
            let body = serde_json::to_string_pretty(raw).unwrap_or_else(|_| raw.to_string());
            format!(
                "❔ {}\n{}",
                f.bold(kind),
                f.code_block(&truncate_text(&body, TOOL_RESULT_PREVIEW), Some("json"))
            )
        }
    }
}

fn render_blocks<F: Formatter + ?Sized>(
    f: &F,
    emoji: &str,
    title: &str,
    blocks: &[ContentBlock],
    working_directory: &Path,
) -> String {
    let mut parts = vec![format!("{emoji} {}", f.bold(title))];
    for block in blocks {
        let rendered = match block {
            ContentBlock::Text { text } => f.escape(text),
            ContentBlock::ToolUse { name, input, .. } => {
                render_tool_use(f, name, input, working_directory)
            }
            ContentBlock::ToolResult {
                content, is_error, ..
            } => {
                let icon = if is_error.unwrap_or(false) { "❌" } else { "✅" };
                let body = content.as_ref().map(tool_result_text).unwrap_or_default();
                if body.trim().is_empty() {
                    format!("{icon} {}", f.bold("Tool Result"))
                } else {
                    format!(
                        "{icon} {}\n{}",
                        f.bold("Tool Result"),
                        f.code_block(&truncate_text(&body, TOOL_RESULT_PREVIEW), None)
                    )
                }
            }
        };
        if !rendered.is_empty() {
            parts.push(rendered);
        }
    }
    parts.join("\n\n")
}

fn render_result<F: Formatter + ?Sized>(f: &F, result: &ResultMessage) -> String {
    let mut out = format!(
        "📊 {}\n⏱️ {}",
        f.bold(&format!("Result ({})", result.subtype)),
        f.escape(&format!("Duration: {}", format_duration(result.duration_ms)))
    );
    if let Some(text) = result.result.as_deref().filter(|text| !text.is_empty()) {
        out.push_str("\n\n");
        out.push_str(&f.escape(text));
    }
    out
}

pub fn tool_emoji(name: &str) -> &'static str {
    match name {
        "Task" => "🤖",
        "Bash" => "💻",
        "Glob" => "🔍",
        "Grep" => "🔎",
        "LS" => "📂",
        "Read" => "📖",
        "Edit" => "✏️",
        "MultiEdit" => "📝",
        "Write" => "📄",
        "WebFetch" => "🌐",
        "WebSearch" => "🔍",
        "TodoWrite" => "✅",
        "ExitPlanMode" => "🚪",
        _ if name.starts_with("mcp__") => "🔌",
        _ => "🔧",
    }
}

fn render_tool_use<F: Formatter + ?Sized>(
    f: &F,
    name: &str,
    input: &Value,
    working_directory: &Path,
) -> String {
    let title = match name.strip_prefix("mcp__") {
        Some(rest) => format!("MCP Tool: {}", rest.replace("__", "/")),
        None => name.to_string(),
    };
    let mut lines = vec![format!("{} {}", tool_emoji(name), f.bold(&title))];

    let field = |key: &str| input.get(key).and_then(Value::as_str);

    if let Some(path) = field("file_path") {
        let shown = relative_display(path, working_directory);
        lines.push(format!("📁 File: {}", f.code_inline(&shown)));
    }
    if let Some(path) = field("path") {
        let shown = relative_display(path, working_directory);
        lines.push(format!("📂 Path: {}", f.code_inline(&shown)));
    }
    if let Some(command) = field("command") {
        if command.contains('\n') || command.chars().count() > 80 {
            lines.push(format!("💻 Command:\n{}", f.code_block(command, Some("bash"))));
        } else {
            lines.push(format!("💻 Command: {}", f.code_inline(command)));
        }
    }
    if let Some(description) = field("description") {
        lines.push(format!("📝 {}", f.escape(&format!("Description: {description}"))));
    }
    if let Some(pattern) = field("pattern") {
        lines.push(format!("🔍 Pattern: {}", f.code_inline(pattern)));
    }
    if let Some(query) = field("query") {
        lines.push(format!("🔎 {}", f.escape(&format!("Query: {}", truncate_text(query, 50)))));
    }
    if let Some(url) = field("url") {
        lines.push(format!("🌐 URL: {}", f.escape(url)));
    }
    if let Some(prompt) = field("prompt") {
        let prompt = format!("Prompt: {}", truncate_text(prompt, 100));
        lines.push(format!("💭 {}", f.escape(&prompt)));
    }
    if let Some(old) = field("old_string") {
        lines.push(format!("➖ Old: {}", f.code_inline(&truncate_text(old, 50))));
    }
    if let Some(new) = field("new_string") {
        lines.push(format!("➕ New: {}", f.code_inline(&truncate_text(new, 50))));
    }
    if let Some(edits) = input.get("edits").and_then(Value::as_array) {
        lines.push(format!("✏️ {}", f.escape(&format!("Edits: {}", edits.len()))));
    }
    if let Some(todos) = input.get("todos").and_then(Value::as_array) {
        for todo in todos {
            let content = todo.get("content").and_then(Value::as_str).unwrap_or_default();
            let mark = match todo.get("status").and_then(Value::as_str) {
                Some("completed") => "✅",
                Some("in_progress") => "🔄",
                _ => "☐",
            };
            lines.push(format!("{mark} {}", f.escape(content)));
        }
    }
    lines.join("\n")
}

fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn relative_display(path: &str, working_directory: &Path) -> String {
    match Path::new(path).strip_prefix(working_directory) {
        Ok(rest) if !rest.as_os_str().is_empty() => format!("./{}", rest.display()),
        _ => path.to_string(),
    }
}

pub fn format_duration(duration_ms: u64) -> String {
    let secs = duration_ms / 1000;
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", duration_ms as f64 / 1000.0)
    }
}

/// Cuts to `max` chars, marking the cut with `...`.
pub fn truncate_text(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

/// Splits at line breaks where possible, never inside a UTF-8 sequence.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    if text.len() <= limit {
        return vec![text.to_owned()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= limit {
            chunks.push(remaining.to_owned());
            break;
        }

        let safe_limit = floor_char_boundary(remaining, limit);
        let mut split_at = remaining[..safe_limit]
            .rfind('\n')
            .map(|pos| pos + 1)
            .unwrap_or(safe_limit);
        if split_at == 0 {
            // a single char wider than the limit
            split_at = remaining
                .char_indices()
                .nth(1)
                .map(|(idx, _)| idx)
                .unwrap_or(remaining.len());
        }

        chunks.push(remaining[..split_at].to_owned());
        remaining = &remaining[split_at..];
    }

    chunks
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut i = max;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn markdown_v2_escape_round_trips() {
        let f = TelegramFormatter;
        let raw = r"fn main() { let x = a_b * 2; } // см. [docs](x.y)! 1+1=2 #tag \ end";
        let escaped = f.escape(raw);
        assert!(escaped.contains(r"a\_b"));
        assert!(escaped.contains(r"\\ end"));
        assert_eq!(TelegramFormatter::unescape(&escaped), raw);
    }

    #[test]
    fn slack_escape_round_trips() {
        let f = SlackFormatter;
        let raw = "a < b && c > d &amp;";
        let escaped = f.escape(raw);
        assert_eq!(escaped, "a &lt; b &amp;&amp; c &gt; d &amp;amp;");
        assert_eq!(SlackFormatter::unescape(&escaped), raw);
    }

    #[test]
    fn telegram_code_escapes_only_backtick_and_backslash() {
        let f = TelegramFormatter;
        assert_eq!(f.code_inline("a_b`c"), "`a_b\\`c`");
    }

    #[test]
    fn error_notifications_are_marked() {
        let f = TelegramFormatter;
        assert_eq!(
            f.format_error("reset the session."),
            "❌ *Error*: reset the session\\."
        );
        assert!(f.format_ready() != f.format_success("Ready for your next message"));
    }

    #[test]
    fn init_message_shows_working_directory() {
        let f = SlackFormatter;
        let message = AgentMessage::System {
            subtype: "init".to_string(),
            data: json!({ "cwd": "/srv/app", "session_id": "s" }),
        };
        let out = f.format_message(&message, Path::new("/srv/app"));
        assert!(out.starts_with("🔧 *System init*"));
        assert!(out.contains("`/srv/app`"));
    }

    #[test]
    fn tool_use_lists_relevant_inputs() {
        let f = SlackFormatter;
        let message = AgentMessage::AssistantText {
            model: None,
            content: vec![
                ContentBlock::Text {
                    text: "Checking.".to_string(),
                },
                ContentBlock::ToolUse {
                    id: "t1".to_string(),
                    name: "Edit".to_string(),
                    input: json!({
                        "file_path": "/srv/app/src/lib.rs",
                        "old_string": "foo",
                        "new_string": "bar"
                    }),
                },
            ],
        };
        let out = f.format_message(&message, Path::new("/srv/app"));
        assert!(out.starts_with("🤖 *Assistant*\n\nChecking.\n\n✏️ *Edit*"));
        assert!(out.contains("📁 File: `./src/lib.rs`"));
        assert!(out.contains("➖ Old: `foo`"));
    }

    #[test]
    fn long_commands_render_as_blocks_and_mcp_tools_are_named() {
        let f = SlackFormatter;
        let long = "x".repeat(81);
        let out = render_tool_use(&f, "Bash", &json!({ "command": long }), Path::new("/"));
        assert!(out.contains("💻 Command:\n```\n"));

        let out = render_tool_use(&f, "mcp__github__search", &json!({}), Path::new("/"));
        assert!(out.starts_with("🔌 *MCP Tool: github/search*"));
    }

    #[test]
    fn result_shows_duration_and_answer() {
        let f = SlackFormatter;
        let message = AgentMessage::Result(ResultMessage {
            subtype: "success".to_string(),
            duration_ms: 125_000,
            result: Some("All tests pass".to_string()),
            ..Default::default()
        });
        assert_eq!(
            f.format_message(&message, Path::new("/")),
            "📊 *Result (success)*\n⏱️ Duration: 2m 5s\n\nAll tests pass"
        );
        assert_eq!(format_duration(4_200), "4.2s");
    }

    #[test]
    fn tool_results_are_truncated() {
        let f = SlackFormatter;
        let message = AgentMessage::ToolResponse {
            content: vec![ContentBlock::ToolResult {
                tool_use_id: "t1".to_string(),
                content: Some(json!("y".repeat(900))),
                is_error: Some(true),
            }],
        };
        let out = f.format_message(&message, Path::new("/"));
        assert!(out.contains("❌ *Tool Result*"));
        assert!(out.contains(&format!("{}...", "y".repeat(TOOL_RESULT_PREVIEW - 3))));
    }

    #[test]
    fn split_prefers_newlines_and_respects_char_boundaries() {
        let chunks = split_message("aaaa\nbbbb\ncccc", 10);
        assert_eq!(chunks, vec!["aaaa\nbbbb\n", "cccc"]);

        let text = "é".repeat(10);
        let chunks = split_message(&text, 5);
        assert!(chunks.iter().all(|chunk| chunk.len() <= 5));
        assert_eq!(chunks.concat(), text);
    }
}
