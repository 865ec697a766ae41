//! Current-activity derivation.
//!
//! Answers "what is this session doing right now" purely from the buffered
//! event window, so no separate in-flight bookkeeping can drift out of sync
//! with the stream itself.

use std::collections::HashSet;

use wheelhouse_protocol::{Activity, EventEnvelope, StreamEvent};

/// Derive the in-flight activity from a session's buffered events, oldest
/// first. O(buffer size), no side effects.
///
/// A `tool_use` whose id has no matching `tool_result` is the current
/// activity. Failing that, trailing `assistant_text` with no `result` or
/// `user_message` after it means the assistant is composing a response.
pub fn derive_activity(buffered: &[EventEnvelope]) -> Option<Activity> {
    let completed: HashSet<&str> = buffered
        .iter()
        .filter_map(|envelope| match &envelope.event {
            StreamEvent::ToolResult { id, .. } => Some(id.as_str()),
            _ => None,
        })
        .collect();

    for envelope in buffered.iter().rev() {
        if let StreamEvent::ToolUse { id, name, input } = &envelope.event
            && !completed.contains(id.as_str())
        {
            return Some(Activity::Tool {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            });
        }
    }

    for envelope in buffered.iter().rev() {
        match &envelope.event {
            StreamEvent::Result(_) | StreamEvent::UserMessage { .. } => return None,
            StreamEvent::AssistantText { .. } => return Some(Activity::Composing),
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(seq: u64, event: StreamEvent) -> EventEnvelope {
        EventEnvelope::new(seq, event)
    }

    fn tool_use(seq: u64, id: &str, name: &str) -> EventEnvelope {
        envelope(
            seq,
            StreamEvent::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input: json!({"file_path": "src/lib.rs"}),
            },
        )
    }

    fn tool_result(seq: u64, id: &str) -> EventEnvelope {
        envelope(
            seq,
            StreamEvent::ToolResult {
                id: id.to_string(),
                content: "ok".to_string(),
                truncated: false,
                full_length: None,
            },
        )
    }

    #[test]
    fn pending_tool_is_reported() {
        let buffered = vec![
            tool_use(1, "a", "Write"),
            tool_use(2, "b", "Read"),
            tool_result(3, "a"),
        ];

        match derive_activity(&buffered) {
            Some(Activity::Tool { id, name, .. }) => {
                assert_eq!(id, "b");
                assert_eq!(name, "Read");
            }
            other => panic!("expected pending Read tool, got {other:?}"),
        }
    }

    #[test]
    fn all_tools_completed_means_no_activity() {
        let buffered = vec![
            tool_use(1, "a", "Write"),
            tool_use(2, "b", "Read"),
            tool_result(3, "a"),
            tool_result(4, "b"),
        ];

        assert_eq!(derive_activity(&buffered), None);
    }

    #[test]
    fn trailing_assistant_text_means_composing() {
        let buffered = vec![
            tool_use(1, "a", "Bash"),
            tool_result(2, "a"),
            envelope(
                3,
                StreamEvent::AssistantText {
                    content: "Working on it".to_string(),
                },
            ),
        ];

        assert_eq!(derive_activity(&buffered), Some(Activity::Composing));
    }

    #[test]
    fn text_before_result_boundary_is_not_composing() {
        let buffered = vec![
            envelope(
                1,
                StreamEvent::AssistantText {
                    content: "Done".to_string(),
                },
            ),
            envelope(
                2,
                StreamEvent::Result(wheelhouse_protocol::TurnResult {
                    content: "Done".to_string(),
                    is_error: false,
                    cost_usd: None,
                    duration_ms: None,
                    usage: None,
                    model: None,
                    mode: wheelhouse_protocol::SessionMode::Normal,
                }),
            ),
        ];

        assert_eq!(derive_activity(&buffered), None);
    }

    #[test]
    fn empty_buffer_has_no_activity() {
        assert_eq!(derive_activity(&[]), None);
    }
}
