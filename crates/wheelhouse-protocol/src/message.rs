use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::activity::Activity;
use crate::event::{EventEnvelope, SessionMode, SessionStatus};
use crate::types::SessionId;

/// A human's answer to a tool-permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionBehavior {
    Allow,
    Deny,
}

/// Messages a client may send over its session connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Prompt {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        allowed_tools: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<SessionMode>,
    },
    Stop,
    PermissionRespond {
        permission_id: String,
        behavior: PermissionBehavior,
    },
    Ping,
}

/// A persisted conversation message, replayed on first connect. Shape is
/// owned by the session store collaborator; only the fields the dashboard
/// renders are carried here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Point-in-time view of a session, sent on (re)connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub status: SessionStatus,
    pub mode: SessionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_activity: Option<Activity>,
}

/// Connect-time and keepalive frames. Stream events are broadcast as bare
/// [`EventEnvelope`]s; these frames cover everything else the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// First-ever connect: full history plus the live sequence high-water
    /// mark. Reconnects get a snapshot and no history.
    SessionState {
        session: SessionSnapshot,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        history: Option<Vec<StoredMessage>>,
        latest_seq: u64,
    },
    /// Gap fill for a reconnecting client: the current snapshot (no history
    /// replay) plus every buffered event past its last observed sequence
    /// number, in order.
    MissedEvents {
        session: SessionSnapshot,
        events: Vec<EventEnvelope>,
        latest_seq: u64,
    },
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_parses_with_optional_fields_absent() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"prompt","prompt":"fix the bug"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Prompt {
                prompt: "fix the bug".to_string(),
                allowed_tools: None,
                mode: None,
            }
        );
    }

    #[test]
    fn prompt_parses_plan_mode() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"prompt","prompt":"refactor","mode":"plan"}"#)
                .unwrap();
        match msg {
            ClientMessage::Prompt { mode, .. } => assert_eq!(mode, Some(SessionMode::Plan)),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn permission_respond_round_trips() {
        let msg = ClientMessage::PermissionRespond {
            permission_id: "perm-1".to_string(),
            behavior: PermissionBehavior::Deny,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn missed_events_frame_carries_snapshot_but_no_history() {
        let frame = ServerFrame::MissedEvents {
            session: SessionSnapshot {
                id: SessionId::new(),
                status: SessionStatus::Running,
                mode: SessionMode::Normal,
                conversation_id: None,
                current_activity: None,
            },
            events: Vec::new(),
            latest_seq: 5,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "missed_events");
        assert_eq!(json["latest_seq"], 5);
        assert_eq!(json["session"]["status"], "running");
        assert!(json.get("history").is_none());
    }
}
