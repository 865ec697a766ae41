//! Session model and the persistence collaborator seam.
//!
//! Sessions, their messages, and file-change records live in an external
//! relational store owned by the rest of the dashboard; this module defines
//! only the trait the streaming core needs, plus an in-memory impl used by
//! tests.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use wheelhouse_protocol::{SessionId, SessionMode, SessionStatus, StoredMessage};

/// How tool invocations are approved during a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionPolicy {
    /// The assistant runs tools without asking.
    #[default]
    Bypass,
    /// Sensitive tool calls are routed to a human through the permission
    /// relay side channel.
    Prompt,
}

/// System prompt handling for the assistant invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "text", rename_all = "snake_case")]
pub enum SystemPrompt {
    Replace(String),
    Append(String),
}

/// A write/edit-class tool touched a file during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub tool: String,
    pub changed_at: DateTime<Utc>,
}

/// One dashboard session as the streaming core sees it.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub working_dir: PathBuf,
    pub status: SessionStatus,
    pub mode: SessionMode,
    /// Identifier issued by the assistant itself, used to resume the
    /// conversation across subprocess invocations. Set once the subprocess
    /// first reports it.
    pub conversation_id: Option<String>,
    pub permission_policy: PermissionPolicy,
    pub model: Option<String>,
    pub system_prompt: Option<SystemPrompt>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub max_turns: Option<u32>,
    pub message_count: u64,
    pub total_cost_usd: f64,
}

impl Session {
    pub fn new(id: SessionId, working_dir: PathBuf) -> Self {
        Self {
            id,
            working_dir,
            status: SessionStatus::Idle,
            mode: SessionMode::Normal,
            conversation_id: None,
            permission_policy: PermissionPolicy::default(),
            model: None,
            system_prompt: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            max_turns: None,
            message_count: 0,
            total_cost_usd: 0.0,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Storage error: {message}")]
    Storage { message: String },
}

impl SessionStoreError {
    pub fn not_found(session_id: SessionId) -> Self {
        Self::SessionNotFound {
            session_id: session_id.to_string(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

/// The external session store, as consumed by the streaming core.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: SessionId) -> Result<Session, SessionStoreError>;

    async fn update_status(
        &self,
        session_id: SessionId,
        status: SessionStatus,
    ) -> Result<(), SessionStoreError>;

    async fn set_conversation_id(
        &self,
        session_id: SessionId,
        conversation_id: String,
    ) -> Result<(), SessionStoreError>;

    async fn set_mode(
        &self,
        session_id: SessionId,
        mode: SessionMode,
    ) -> Result<(), SessionStoreError>;

    async fn add_message(
        &self,
        session_id: SessionId,
        message: StoredMessage,
    ) -> Result<(), SessionStoreError>;

    async fn add_file_change(
        &self,
        session_id: SessionId,
        change: FileChange,
    ) -> Result<(), SessionStoreError>;

    async fn history(&self, session_id: SessionId) -> Result<Vec<StoredMessage>, SessionStoreError>;
}

#[derive(Default)]
struct SessionRecord {
    session: Option<Session>,
    messages: Vec<StoredMessage>,
    file_changes: Vec<FileChange>,
}

/// In-memory session store for tests.
#[derive(Default)]
pub struct InMemorySessionStore {
    records: std::sync::RwLock<HashMap<SessionId, SessionRecord>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Session) {
        let session_id = session.id;
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.entry(session_id).or_default().session = Some(session);
    }

    pub fn file_changes(&self, session_id: SessionId) -> Vec<FileChange> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records
            .get(&session_id)
            .map(|r| r.file_changes.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: SessionId) -> Result<Session, SessionStoreError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records
            .get(&session_id)
            .and_then(|r| r.session.clone())
            .ok_or_else(|| SessionStoreError::not_found(session_id))
    }

    async fn update_status(
        &self,
        session_id: SessionId,
        status: SessionStatus,
    ) -> Result<(), SessionStoreError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let session = records
            .get_mut(&session_id)
            .and_then(|r| r.session.as_mut())
            .ok_or_else(|| SessionStoreError::not_found(session_id))?;
        session.status = status;
        Ok(())
    }

    async fn set_conversation_id(
        &self,
        session_id: SessionId,
        conversation_id: String,
    ) -> Result<(), SessionStoreError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let session = records
            .get_mut(&session_id)
            .and_then(|r| r.session.as_mut())
            .ok_or_else(|| SessionStoreError::not_found(session_id))?;
        session.conversation_id = Some(conversation_id);
        Ok(())
    }

    async fn set_mode(
        &self,
        session_id: SessionId,
        mode: SessionMode,
    ) -> Result<(), SessionStoreError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let session = records
            .get_mut(&session_id)
            .and_then(|r| r.session.as_mut())
            .ok_or_else(|| SessionStoreError::not_found(session_id))?;
        session.mode = mode;
        Ok(())
    }

    async fn add_message(
        &self,
        session_id: SessionId,
        message: StoredMessage,
    ) -> Result<(), SessionStoreError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let record = records
            .get_mut(&session_id)
            .ok_or_else(|| SessionStoreError::not_found(session_id))?;
        record.messages.push(message);
        if let Some(session) = record.session.as_mut() {
            session.message_count += 1;
        }
        Ok(())
    }

    async fn add_file_change(
        &self,
        session_id: SessionId,
        change: FileChange,
    ) -> Result<(), SessionStoreError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let record = records
            .get_mut(&session_id)
            .ok_or_else(|| SessionStoreError::not_found(session_id))?;
        record.file_changes.push(change);
        Ok(())
    }

    async fn history(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<StoredMessage>, SessionStoreError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .get(&session_id)
            .map(|r| r.messages.clone())
            .unwrap_or_default())
    }
}
