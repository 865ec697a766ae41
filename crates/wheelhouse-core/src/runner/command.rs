//! Assistant subprocess invocation.
//!
//! Builds the argument vector for one turn from the session record plus the
//! per-turn options, and materializes the side-channel config file the
//! permission relay needs.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tempfile::NamedTempFile;
use tokio::process::Command;

use crate::session::{PermissionPolicy, Session, SystemPrompt};
use wheelhouse_protocol::SessionMode;

/// Static configuration for the assistant binary.
#[derive(Debug, Clone)]
pub struct AssistantConfig {
    pub binary: PathBuf,
    /// Tool name the subprocess calls back into for interactive approval.
    pub permission_prompt_tool: String,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("claude"),
            permission_prompt_tool: "mcp__wheelhouse__approve".to_string(),
        }
    }
}

/// Per-turn inputs supplied by the client.
#[derive(Debug, Clone)]
pub struct TurnOptions {
    pub prompt: String,
    pub mode: SessionMode,
    /// Overrides the session's allowed-tool list for this turn only.
    pub allowed_tools: Option<Vec<String>>,
    pub timeout: Option<std::time::Duration>,
}

impl TurnOptions {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            mode: SessionMode::Normal,
            allowed_tools: None,
            timeout: None,
        }
    }
}

/// Whether this turn routes tool approvals through the relay side channel.
/// Plan mode already restricts the subprocess to read-only tools, so the two
/// mechanisms are mutually exclusive.
pub(crate) fn needs_permission_channel(session: &Session, mode: SessionMode) -> bool {
    session.permission_policy == PermissionPolicy::Prompt && mode != SessionMode::Plan
}

/// Write the per-turn config file pointing the subprocess at our approval
/// tool. The file lives until the handle is dropped at teardown.
pub(crate) fn write_permission_config(
    config: &AssistantConfig,
) -> std::io::Result<NamedTempFile> {
    let file = tempfile::Builder::new()
        .prefix("wheelhouse-mcp-")
        .suffix(".json")
        .tempfile()?;
    let body = serde_json::json!({
        "mcpServers": {
            "wheelhouse": {
                "type": "http",
                "url": "http://127.0.0.1:0/approve",
                "tools": [config.permission_prompt_tool],
            }
        }
    });
    serde_json::to_writer(file.as_file(), &body)?;
    file.as_file().sync_all()?;
    Ok(file)
}

pub(crate) fn build_args(
    config: &AssistantConfig,
    session: &Session,
    options: &TurnOptions,
    permission_config: Option<&Path>,
) -> Vec<String> {
    let mut args = vec![
        "--print".to_string(),
        options.prompt.clone(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ];

    if options.mode == SessionMode::Plan {
        args.push("--permission-mode".to_string());
        args.push("plan".to_string());
    } else if let Some(path) = permission_config {
        args.push("--permission-prompt-tool".to_string());
        args.push(config.permission_prompt_tool.clone());
        args.push("--mcp-config".to_string());
        args.push(path.display().to_string());
    }

    let allowed = options
        .allowed_tools
        .as_ref()
        .unwrap_or(&session.allowed_tools);
    if !allowed.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(allowed.join(","));
    }
    if !session.disallowed_tools.is_empty() {
        args.push("--disallowedTools".to_string());
        args.push(session.disallowed_tools.join(","));
    }

    if let Some(model) = &session.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }

    match &session.system_prompt {
        Some(SystemPrompt::Replace(text)) => {
            args.push("--system-prompt".to_string());
            args.push(text.clone());
        }
        Some(SystemPrompt::Append(text)) => {
            args.push("--append-system-prompt".to_string());
            args.push(text.clone());
        }
        None => {}
    }

    if let Some(max_turns) = session.max_turns {
        args.push("--max-turns".to_string());
        args.push(max_turns.to_string());
    }

    if let Some(conversation_id) = &session.conversation_id {
        args.push("--resume".to_string());
        args.push(conversation_id.clone());
    }

    args
}

pub(crate) fn build_command(
    config: &AssistantConfig,
    session: &Session,
    options: &TurnOptions,
    permission_config: Option<&Path>,
) -> Command {
    let mut command = Command::new(&config.binary);
    command
        .args(build_args(config, session, options, permission_config))
        .current_dir(&session.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}
