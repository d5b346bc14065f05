//! Decoding of the agent's stream-json output, one JSON object per line.

use coderelay_schema::{AgentMessage, ContentBlock, ResultMessage};
use serde_json::Value;

use crate::AgentError;

/// Decodes one output line.
///
/// `Ok(None)` means the line carried nothing for the chat: blank lines and
/// control-protocol frames.
pub fn decode_line(line: &str) -> Result<Option<AgentMessage>, AgentError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(line)
        .map_err(|e| AgentError::Decode(format!("invalid json: {e}")))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| AgentError::Decode("missing message type".to_string()))?
        .to_string();

    let message = match kind.as_str() {
        "system" => AgentMessage::System {
            subtype: value
                .get("subtype")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            data: value,
        },
        "assistant" => AgentMessage::AssistantText {
            model: value
                .pointer("/message/model")
                .and_then(Value::as_str)
                .map(str::to_string),
            content: content_blocks(value.pointer("/message/content")),
        },
        "user" => AgentMessage::ToolResponse {
            content: content_blocks(value.pointer("/message/content")),
        },
        "result" => AgentMessage::Result(result_message(value)),
        "control_request" | "control_response" | "keep_alive" => return Ok(None),
        _ => AgentMessage::Unknown {
            kind: kind.clone(),
            raw: value,
        },
    };
    Ok(Some(message))
}

/// A result line always decodes: it is the only thing that ends a turn.
fn result_message(value: Value) -> ResultMessage {
    match serde_json::from_value::<ResultMessage>(value.clone()) {
        Ok(mut result) => {
            if result.subtype.is_empty() {
                let subtype = if result.is_error { "error" } else { "success" };
                result.subtype = subtype.to_string();
            }
            result
        }
        Err(e) => {
            tracing::warn!("malformed result message, ending the turn anyway: {e}");
            let text = |field: &str| value.get(field).and_then(Value::as_str).map(str::to_string);
            ResultMessage {
                subtype: "error_undecodable".to_string(),
                is_error: true,
                session_id: text("session_id").unwrap_or_default(),
                result: text("result"),
                ..Default::default()
            }
        }
    }
}

fn content_blocks(content: Option<&Value>) -> Vec<ContentBlock> {
    match content {
        Some(Value::String(text)) if !text.is_empty() => {
            vec![ContentBlock::Text { text: text.clone() }]
        }
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|block| match serde_json::from_value::<ContentBlock>(block.clone()) {
                Ok(block) => Some(block),
                Err(_) => {
                    // thinking, images and other block kinds are not relayed
                    tracing::trace!("skipping content block: {block}");
                    None
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_init_handshake() {
        let line = r#"{"type":"system","subtype":"init","session_id":"4f1c","cwd":"/w","tools":["Bash"]}"#;
        let message = decode_line(line).unwrap().unwrap();
        assert_eq!(message.handshake_session_id(), Some("4f1c"));
    }

    #[test]
    fn decodes_assistant_blocks_and_skips_thinking() {
        let line = r#"{"type":"assistant","message":{"model":"m1","content":[
            {"type":"thinking","thinking":"hmm"},
            {"type":"text","text":"Looking now."},
            {"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"/w/a.rs"}}
        ]}}"#;
        let Some(AgentMessage::AssistantText { content, model }) = decode_line(line).unwrap() else {
            panic!("expected assistant text");
        };
        assert_eq!(model.as_deref(), Some("m1"));
        assert_eq!(content.len(), 2);
        assert!(matches!(&content[1], ContentBlock::ToolUse { name, .. } if name == "Read"));
    }

    #[test]
    fn decodes_tool_results_as_tool_response() {
        let line = r#"{"type":"user","message":{"role":"user","content":[
            {"type":"tool_result","tool_use_id":"t1","content":"fn main() {}","is_error":false}
        ]}}"#;
        let message = decode_line(line).unwrap().unwrap();
        assert!(matches!(
            message,
            AgentMessage::ToolResponse { ref content } if content.len() == 1
        ));
    }

    #[test]
    fn decodes_result() {
        let line = r#"{"type":"result","subtype":"success","duration_ms":65000,"duration_api_ms":1,"is_error":false,"num_turns":3,"session_id":"4f1c","total_cost_usd":0.02,"result":"Done"}"#;
        let Some(AgentMessage::Result(result)) = decode_line(line).unwrap() else {
            panic!("expected result");
        };
        assert_eq!(result.duration_ms, 65000);
        assert_eq!(result.result.as_deref(), Some("Done"));
    }

    #[test]
    fn result_without_subtype_still_ends_the_turn() {
        let line = r#"{"type":"result","is_error":false,"duration_ms":10,"result":"done"}"#;
        let Some(AgentMessage::Result(result)) = decode_line(line).unwrap() else {
            panic!("expected result");
        };
        assert_eq!(result.subtype, "success");
        assert_eq!(result.result.as_deref(), Some("done"));

        let line = r#"{"type":"result","subtype":"success","duration_ms":"soon","result":"late"}"#;
        let Some(AgentMessage::Result(result)) = decode_line(line).unwrap() else {
            panic!("expected result");
        };
        assert_eq!(result.subtype, "error_undecodable");
        assert!(result.is_error);
        assert_eq!(result.result.as_deref(), Some("late"));
    }

    #[test]
    fn control_frames_and_blank_lines_are_skipped() {
        assert!(decode_line("   ").unwrap().is_none());
        let frame = r#"{"type":"control_response","response":{"subtype":"success","request_id":"req_1"}}"#;
        assert!(decode_line(frame).unwrap().is_none());
    }

    #[test]
    fn unknown_types_pass_through_and_garbage_is_recoverable() {
        let message = decode_line(r#"{"type":"rate_limit","retry":3}"#).unwrap().unwrap();
        assert!(matches!(message, AgentMessage::Unknown { ref kind, .. } if kind == "rate_limit"));

        let err = decode_line("{oops").unwrap_err();
        assert!(err.is_recoverable());
        assert!(decode_line(r#"{"no_type":1}"#).unwrap_err().is_recoverable());
    }
}
