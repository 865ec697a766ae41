//! Permission relay collaborator seam.
//!
//! When a session runs with a restrictive policy, the assistant asks a human
//! before sensitive tool calls. The relay delivers those requests (over the
//! same broadcast primitive the event stream uses) and awaits a bounded-time
//! decision; its own request/response protocol lives with the transport
//! layer, not here.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use wheelhouse_protocol::{PermissionBehavior, SessionId};

#[derive(Debug, Clone, PartialEq)]
pub struct PermissionRequest {
    pub permission_id: String,
    pub session_id: SessionId,
    pub tool_name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum PermissionRelayError {
    #[error("No decision within {0:?}")]
    Timeout(Duration),

    #[error("No client connected to decide")]
    NoDecider,

    #[error("Relay error: {message}")]
    Relay { message: String },
}

/// Delivers a tool-permission request to a human and awaits the decision.
#[async_trait]
pub trait PermissionRelay: Send + Sync {
    async fn request(
        &self,
        request: PermissionRequest,
        timeout: Duration,
    ) -> Result<PermissionBehavior, PermissionRelayError>;
}

/// Relay that always answers with a fixed decision. Used in tests and for
/// sessions whose policy bypasses human approval.
pub struct StaticPermissionRelay {
    decision: PermissionBehavior,
}

impl StaticPermissionRelay {
    pub fn allow_all() -> Self {
        Self {
            decision: PermissionBehavior::Allow,
        }
    }

    pub fn deny_all() -> Self {
        Self {
            decision: PermissionBehavior::Deny,
        }
    }
}

#[async_trait]
impl PermissionRelay for StaticPermissionRelay {
    async fn request(
        &self,
        _request: PermissionRequest,
        _timeout: Duration,
    ) -> Result<PermissionBehavior, PermissionRelayError> {
        Ok(self.decision)
    }
}
