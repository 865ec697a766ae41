//! Serde types for the assistant's line-oriented stream output.
//!
//! Each stdout line is an independent JSON document. Anything that fails to
//! parse here is forwarded verbatim as a `raw` event rather than dropped, so
//! these types only need to cover the documented line kinds.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum AssistantLine {
    System(SystemLine),
    Assistant { message: MessagePayload },
    User { message: MessagePayload },
    Result(ResultLine),
}

/// `system` lines carry the assistant's native conversation id on first
/// emission. Other fields (subtype, model inventory) are irrelevant here.
#[derive(Debug, Deserialize)]
pub(crate) struct SystemLine {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessagePayload {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: serde_json::Value,
    },
    /// Block kinds this version does not understand are skipped, not fatal.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResultLine {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub usage: Option<UsageLine>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UsageLine {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Flatten a tool-result `content` value to display text. The assistant
/// emits either a bare string or an array of text blocks.
pub(crate) fn content_to_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_system_init_line() {
        let line = r#"{"type":"system","subtype":"init","session_id":"conv-123","model":"sonnet"}"#;
        match serde_json::from_str::<AssistantLine>(line).unwrap() {
            AssistantLine::System(system) => {
                assert_eq!(system.session_id.as_deref(), Some("conv-123"));
            }
            other => panic!("unexpected line: {other:?}"),
        }
    }

    #[test]
    fn parses_assistant_line_with_mixed_blocks() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"thinking","thinking":"hmm"},
            {"type":"text","text":"Hello"},
            {"type":"tool_use","id":"toolu_1","name":"Write","input":{"file_path":"a.rs"}},
            {"type":"server_tool_use","id":"x"}
        ]}}"#;

        match serde_json::from_str::<AssistantLine>(line).unwrap() {
            AssistantLine::Assistant { message } => {
                assert_eq!(message.content.len(), 4);
                assert!(matches!(message.content[0], ContentBlock::Thinking { .. }));
                assert!(matches!(message.content[1], ContentBlock::Text { .. }));
                assert!(matches!(message.content[2], ContentBlock::ToolUse { .. }));
                assert!(matches!(message.content[3], ContentBlock::Unknown));
            }
            other => panic!("unexpected line: {other:?}"),
        }
    }

    #[test]
    fn parses_user_tool_result_line() {
        let line = r#"{"type":"user","message":{"content":[
            {"type":"tool_result","tool_use_id":"toolu_1","content":"done"}
        ]}}"#;

        match serde_json::from_str::<AssistantLine>(line).unwrap() {
            AssistantLine::User { message } => match &message.content[0] {
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                } => {
                    assert_eq!(tool_use_id, "toolu_1");
                    assert_eq!(content_to_text(content), "done");
                }
                other => panic!("unexpected block: {other:?}"),
            },
            other => panic!("unexpected line: {other:?}"),
        }
    }

    #[test]
    fn parses_result_line() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,
            "result":"All done","total_cost_usd":0.034,"duration_ms":10421,
            "usage":{"input_tokens":1200,"output_tokens":300},"model":"claude-sonnet-4-5"}"#;

        match serde_json::from_str::<AssistantLine>(line).unwrap() {
            AssistantLine::Result(result) => {
                assert_eq!(result.subtype.as_deref(), Some("success"));
                assert!(!result.is_error);
                assert_eq!(result.result.as_deref(), Some("All done"));
                assert_eq!(result.usage.unwrap().input_tokens, 1200);
            }
            other => panic!("unexpected line: {other:?}"),
        }
    }

    #[test]
    fn content_to_text_handles_block_arrays() {
        let content = serde_json::json!([
            {"type": "text", "text": "line one"},
            {"type": "text", "text": "line two"}
        ]);
        assert_eq!(content_to_text(&content), "line one\nline two");
    }

    #[test]
    fn unknown_line_kind_fails_to_parse() {
        let line = r#"{"type":"telemetry","data":{}}"#;
        assert!(serde_json::from_str::<AssistantLine>(line).is_err());
    }
}
