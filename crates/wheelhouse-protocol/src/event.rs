use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a session is allowed to do between prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Idle => write!(f, "idle"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Error => write!(f, "error"),
        }
    }
}

/// Turn execution mode. Plan mode restricts the assistant to read-only
/// tools until it finishes planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    #[default]
    Normal,
    Plan,
}

/// Token accounting reported by the assistant's terminal payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Terminal payload of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResult {
    pub content: String,
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// The mode the turn was requested with, not any mode mutated mid-turn.
    pub mode: SessionMode,
}

/// One event on a session's stream.
///
/// Serialized with an internal `type` tag so each broadcast frame is a
/// single flat JSON object; the envelope contributes `seq` and `ts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// The assistant reported its native conversation id; future turns can
    /// resume from it.
    SessionInfo { conversation_id: String },

    Status { status: SessionStatus },

    UserMessage { content: String },

    /// Latest accumulated assistant text for the current turn. Replaces, not
    /// appends, on each new text block.
    AssistantText { content: String },

    Thinking { content: String },

    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    ToolResult {
        id: String,
        content: String,
        truncated: bool,
        /// Full length of the untruncated output, set only when truncated.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        full_length: Option<u64>,
    },

    FileChange { path: String, tool: String },

    ModeChange { mode: SessionMode },

    PermissionRequest {
        permission_id: String,
        tool_name: String,
        input: serde_json::Value,
    },

    PermissionResponse {
        permission_id: String,
        behavior: crate::message::PermissionBehavior,
    },

    /// The assistant wants structured input from a human; the turn ends
    /// early and the session waits on the answer.
    AskUserQuestion {
        id: String,
        input: serde_json::Value,
    },

    Result(TurnResult),

    Error { message: String },

    Stderr { content: String },

    /// A subprocess output line that failed to parse as JSON, forwarded
    /// verbatim rather than dropped.
    Raw { line: String },

    /// Generic payload escape hatch for collaborators that piggyback on the
    /// broadcast primitive.
    Event { payload: serde_json::Value },
}

impl StreamEvent {
    /// Stable tag used for the durable store's `event_type` column.
    pub fn event_type(&self) -> &'static str {
        match self {
            StreamEvent::SessionInfo { .. } => "session_info",
            StreamEvent::Status { .. } => "status",
            StreamEvent::UserMessage { .. } => "user_message",
            StreamEvent::AssistantText { .. } => "assistant_text",
            StreamEvent::Thinking { .. } => "thinking",
            StreamEvent::ToolUse { .. } => "tool_use",
            StreamEvent::ToolResult { .. } => "tool_result",
            StreamEvent::FileChange { .. } => "file_change",
            StreamEvent::ModeChange { .. } => "mode_change",
            StreamEvent::PermissionRequest { .. } => "permission_request",
            StreamEvent::PermissionResponse { .. } => "permission_response",
            StreamEvent::AskUserQuestion { .. } => "ask_user_question",
            StreamEvent::Result(_) => "result",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Stderr { .. } => "stderr",
            StreamEvent::Raw { .. } => "raw",
            StreamEvent::Event { .. } => "event",
        }
    }

    /// Whether this event terminates a turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Result(_))
    }

    pub fn tool_use_id(&self) -> Option<&str> {
        match self {
            StreamEvent::ToolUse { id, .. }
            | StreamEvent::ToolResult { id, .. }
            | StreamEvent::AskUserQuestion { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// A stream event stamped with its per-session sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: StreamEvent,
}

impl EventEnvelope {
    pub fn new(seq: u64, event: StreamEvent) -> Self {
        Self {
            seq,
            ts: Utc::now(),
            event,
        }
    }
}
