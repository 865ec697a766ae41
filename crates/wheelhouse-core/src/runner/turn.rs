//! Translation from raw subprocess output lines to stream events.
//!
//! The translator is a pure state machine over one turn: it never touches
//! the event log, the registry, or the session store. The runner applies
//! the side effects its output implies (persisting the conversation id,
//! file-change records, mode flips) after each line.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use wheelhouse_protocol::{SessionMode, StreamEvent, TokenUsage, TurnResult};

use super::wire::{AssistantLine, ContentBlock, ResultLine, content_to_text};

/// Tool results longer than this are truncated before streaming; the full
/// text is still visible in the subprocess transcript.
const TOOL_RESULT_MAX_CHARS: usize = 5000;

/// Tools whose successful use means a file in the workspace changed.
const WRITE_CLASS_TOOLS: [&str; 4] = ["Write", "Edit", "MultiEdit", "NotebookEdit"];

const EXIT_PLAN_MODE_TOOL: &str = "ExitPlanMode";
const ASK_USER_QUESTION_TOOL: &str = "AskUserQuestion";

pub(crate) struct TurnTranslator {
    working_dir: PathBuf,
    requested_mode: SessionMode,
    accumulated_text: String,
    /// Tool-use ids whose results must not be streamed (plan/question
    /// bookkeeping calls, not real work).
    suppressed_ids: HashSet<String>,
    conversation_id: Option<String>,
    mode_flipped: bool,
    early_exit: bool,
    result: Option<TurnResult>,
}

impl TurnTranslator {
    pub(crate) fn new(working_dir: PathBuf, requested_mode: SessionMode) -> Self {
        Self {
            working_dir,
            requested_mode,
            accumulated_text: String::new(),
            suppressed_ids: HashSet::new(),
            conversation_id: None,
            mode_flipped: false,
            early_exit: false,
            result: None,
        }
    }

    /// True once the turn delegated plan approval back to the user, meaning
    /// the subprocess should be stopped without waiting for EOF.
    pub(crate) fn early_exit_requested(&self) -> bool {
        self.early_exit
    }

    pub(crate) fn final_result(&self) -> Option<&TurnResult> {
        self.result.as_ref()
    }

    /// Translate one stdout line into zero or more stream events.
    pub(crate) fn translate_line(&mut self, line: &str) -> Vec<StreamEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        let parsed: AssistantLine = match serde_json::from_str(trimmed) {
            Ok(parsed) => parsed,
            Err(_) => {
                return vec![StreamEvent::Raw {
                    line: trimmed.to_string(),
                }];
            }
        };

        match parsed {
            AssistantLine::System(system) => {
                let mut events = Vec::new();
                if let Some(conversation_id) = system.session_id
                    && self.conversation_id.is_none()
                {
                    self.conversation_id = Some(conversation_id.clone());
                    events.push(StreamEvent::SessionInfo { conversation_id });
                }
                events
            }
            AssistantLine::Assistant { message } => {
                let mut events = Vec::new();
                for block in message.content {
                    self.translate_assistant_block(block, &mut events);
                }
                events
            }
            AssistantLine::User { message } => {
                let mut events = Vec::new();
                for block in message.content {
                    if let ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                    } = block
                    {
                        if self.suppressed_ids.remove(&tool_use_id) {
                            continue;
                        }
                        events.push(tool_result_event(tool_use_id, &content_to_text(&content)));
                    }
                }
                events
            }
            AssistantLine::Result(result) => {
                let turn_result = self.finish(result);
                self.result = Some(turn_result.clone());
                vec![StreamEvent::Result(turn_result)]
            }
        }
    }

    fn translate_assistant_block(&mut self, block: ContentBlock, events: &mut Vec<StreamEvent>) {
        match block {
            ContentBlock::Text { text } => {
                self.accumulated_text.push_str(&text);
                events.push(StreamEvent::AssistantText {
                    content: self.accumulated_text.clone(),
                });
            }
            ContentBlock::Thinking { thinking } => {
                events.push(StreamEvent::Thinking { content: thinking });
            }
            ContentBlock::ToolUse { id, name, input } => match name.as_str() {
                EXIT_PLAN_MODE_TOOL => {
                    self.suppressed_ids.insert(id);
                    if self.requested_mode == SessionMode::Plan && !self.mode_flipped {
                        self.mode_flipped = true;
                        events.push(StreamEvent::ModeChange {
                            mode: SessionMode::Normal,
                        });
                    }
                }
                ASK_USER_QUESTION_TOOL => {
                    self.suppressed_ids.insert(id.clone());
                    self.early_exit = true;
                    events.push(StreamEvent::AskUserQuestion { id, input });
                }
                _ => {
                    let file_change = self.file_change_for(&name, &input);
                    events.push(StreamEvent::ToolUse { id, name, input });
                    if let Some(event) = file_change {
                        events.push(event);
                    }
                }
            },
            ContentBlock::ToolResult { .. } | ContentBlock::Unknown => {}
        }
    }

    fn file_change_for(&self, tool: &str, input: &serde_json::Value) -> Option<StreamEvent> {
        if !WRITE_CLASS_TOOLS.contains(&tool) {
            return None;
        }
        let raw = input
            .get("file_path")
            .or_else(|| input.get("notebook_path"))
            .and_then(|v| v.as_str())?;
        Some(StreamEvent::FileChange {
            path: normalize_path(&self.working_dir, raw),
            tool: tool.to_string(),
        })
    }

    fn finish(&mut self, line: ResultLine) -> TurnResult {
        let content = line
            .result
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.accumulated_text.clone());
        TurnResult {
            content,
            is_error: line.is_error || line.subtype.as_deref().is_some_and(|s| s != "success"),
            cost_usd: line.total_cost_usd,
            duration_ms: line.duration_ms,
            usage: line.usage.map(|u| TokenUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            }),
            model: line.model,
            // Always the mode the turn was requested with; a mid-turn
            // ExitPlanMode flip is reported through mode_change only.
            mode: self.requested_mode,
        }
    }
}

/// Report paths relative to the session's working directory when they fall
/// under it, absolute otherwise.
fn normalize_path(working_dir: &Path, raw: &str) -> String {
    let path = Path::new(raw);
    match path.strip_prefix(working_dir) {
        Ok(relative) => relative.display().to_string(),
        Err(_) => raw.to_string(),
    }
}

fn tool_result_event(id: String, text: &str) -> StreamEvent {
    let total_chars = text.chars().count();
    if total_chars <= TOOL_RESULT_MAX_CHARS {
        return StreamEvent::ToolResult {
            id,
            content: text.to_string(),
            truncated: false,
            full_length: None,
        };
    }
    StreamEvent::ToolResult {
        id,
        content: text.chars().take(TOOL_RESULT_MAX_CHARS).collect(),
        truncated: true,
        full_length: Some(total_chars as u64),
    }
}
