//! Subprocess turn execution.
//!
//! One [`TurnRunner::run`] call is one turn: spawn the assistant CLI over
//! the session's working directory, translate its stdout line protocol into
//! stream events, fan them out, and tear the turn down no matter how it
//! ended. `run` never returns an error; every failure becomes an `error`
//! event on the stream plus a sticky error status on the session.

mod command;
mod turn;
mod wire;

pub use command::{AssistantConfig, TurnOptions};

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use wheelhouse_protocol::{SessionId, SessionStatus, StoredMessage, StreamEvent};

use crate::buffer::EventLog;
use crate::connections::ConnectionRegistry;
use crate::session::{FileChange, Session, SessionStore};
use command::{build_command, needs_permission_channel, write_permission_config};
use turn::TurnTranslator;

#[derive(Debug, Clone)]
pub struct TurnRunnerConfig {
    pub assistant: AssistantConfig,
    /// How long to wait after SIGTERM before resorting to SIGKILL.
    pub kill_grace: Duration,
}

impl Default for TurnRunnerConfig {
    fn default() -> Self {
        Self {
            assistant: AssistantConfig::default(),
            kill_grace: Duration::from_secs(2),
        }
    }
}

enum Outcome {
    Eof,
    EarlyExit,
    Cancelled,
    TimedOut,
    ReadError(std::io::Error),
}

pub struct TurnRunner {
    log: Arc<EventLog>,
    registry: Arc<ConnectionRegistry>,
    sessions: Arc<dyn SessionStore>,
    config: TurnRunnerConfig,
}

impl TurnRunner {
    pub fn new(
        log: Arc<EventLog>,
        registry: Arc<ConnectionRegistry>,
        sessions: Arc<dyn SessionStore>,
        config: TurnRunnerConfig,
    ) -> Self {
        Self {
            log,
            registry,
            sessions,
            config,
        }
    }

    /// Execute one turn to completion. Cancelling the token kills the
    /// subprocess; teardown always runs.
    pub async fn run(&self, session_id: SessionId, options: TurnOptions, cancel: CancellationToken) {
        let session = match self.sessions.get(session_id).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Cannot start turn");
                self.emit(
                    session_id,
                    StreamEvent::Error {
                        message: format!("Cannot start turn: {e}"),
                    },
                )
                .await;
                return;
            }
        };

        if let Err(e) = self
            .sessions
            .update_status(session_id, SessionStatus::Running)
            .await
        {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to mark session running");
        }
        self.emit(
            session_id,
            StreamEvent::Status {
                status: SessionStatus::Running,
            },
        )
        .await;
        self.emit(
            session_id,
            StreamEvent::UserMessage {
                content: options.prompt.clone(),
            },
        )
        .await;
        if let Err(e) = self
            .sessions
            .add_message(
                session_id,
                StoredMessage {
                    role: "user".to_string(),
                    content: options.prompt.clone(),
                    created_at: chrono::Utc::now(),
                },
            )
            .await
        {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to persist user message");
        }

        let mut translator = TurnTranslator::new(session.working_dir.clone(), options.mode);
        let mut error_status = false;

        self.execute(&session, &options, &mut translator, &mut error_status, cancel)
            .await;

        self.teardown(session_id, error_status).await;
    }

    async fn execute(
        &self,
        session: &Session,
        options: &TurnOptions,
        translator: &mut TurnTranslator,
        error_status: &mut bool,
        cancel: CancellationToken,
    ) {
        let session_id = session.id;

        // Lives until this function returns, which is after the subprocess
        // is gone.
        let permission_config = if needs_permission_channel(session, options.mode) {
            match write_permission_config(&self.config.assistant) {
                Ok(file) => Some(file),
                Err(e) => {
                    *error_status = true;
                    self.emit(
                        session_id,
                        StreamEvent::Error {
                            message: format!("Failed to prepare permission channel: {e}"),
                        },
                    )
                    .await;
                    return;
                }
            }
        } else {
            None
        };

        let mut child = match build_command(
            &self.config.assistant,
            session,
            options,
            permission_config.as_ref().map(|file| file.path()),
        )
        .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                *error_status = true;
                self.emit(
                    session_id,
                    StreamEvent::Error {
                        message: format!("Failed to spawn assistant: {e}"),
                    },
                )
                .await;
                return;
            }
        };
        tracing::info!(
            session_id = %session_id,
            pid = child.id(),
            mode = ?options.mode,
            "Assistant subprocess started"
        );

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = BufReader::new(stderr).read_to_string(&mut buf).await;
                buf
            })
        });

        let Some(stdout) = child.stdout.take() else {
            *error_status = true;
            self.emit(
                session_id,
                StreamEvent::Error {
                    message: "Assistant stdout unavailable".to_string(),
                },
            )
            .await;
            self.terminate(&mut child).await;
            return;
        };
        let mut lines = BufReader::new(stdout).lines();
        let deadline = options.timeout.map(|t| tokio::time::Instant::now() + t);

        let outcome = loop {
            tokio::select! {
                () = cancel.cancelled() => break Outcome::Cancelled,
                () = sleep_until(deadline) => break Outcome::TimedOut,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        self.process_line(session_id, translator, &line, error_status).await;
                        if translator.early_exit_requested() {
                            break Outcome::EarlyExit;
                        }
                    }
                    Ok(None) => break Outcome::Eof,
                    Err(e) => break Outcome::ReadError(e),
                },
            }
        };

        match outcome {
            Outcome::Eof => match child.wait().await {
                Ok(status) => {
                    if !status.success() && translator.final_result().is_none() {
                        *error_status = true;
                        self.emit(
                            session_id,
                            StreamEvent::Error {
                                message: format!("Assistant exited abnormally: {status}"),
                            },
                        )
                        .await;
                    }
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to reap assistant");
                }
            },
            Outcome::EarlyExit => {
                tracing::debug!(session_id = %session_id, "Turn handed back to the user");
                self.terminate(&mut child).await;
            }
            Outcome::Cancelled => {
                tracing::info!(session_id = %session_id, "Turn cancelled");
                self.terminate(&mut child).await;
            }
            Outcome::TimedOut => {
                *error_status = true;
                self.terminate(&mut child).await;
                self.emit(
                    session_id,
                    StreamEvent::Error {
                        message: "Turn timed out".to_string(),
                    },
                )
                .await;
            }
            Outcome::ReadError(e) => {
                *error_status = true;
                self.terminate(&mut child).await;
                self.emit(
                    session_id,
                    StreamEvent::Error {
                        message: format!("Failed reading assistant output: {e}"),
                    },
                )
                .await;
            }
        }

        if let Some(task) = stderr_task
            && let Ok(Ok(stderr_text)) = tokio::time::timeout(Duration::from_secs(1), task).await
            && !stderr_text.trim().is_empty()
        {
            self.emit(
                session_id,
                StreamEvent::Stderr {
                    content: stderr_text.trim_end().to_string(),
                },
            )
            .await;
        }

        if translator.final_result().is_some_and(|r| r.is_error) {
            *error_status = true;
        }
    }

    async fn process_line(
        &self,
        session_id: SessionId,
        translator: &mut TurnTranslator,
        line: &str,
        error_status: &mut bool,
    ) {
        for event in translator.translate_line(line) {
            self.apply_side_effects(session_id, &event).await;
            if let StreamEvent::Result(result) = &event
                && result.is_error
            {
                *error_status = true;
            }
            self.emit(session_id, event).await;
        }
    }

    /// Persist what an event implies about the session record before the
    /// event is visible to clients.
    async fn apply_side_effects(&self, session_id: SessionId, event: &StreamEvent) {
        let result = match event {
            StreamEvent::SessionInfo { conversation_id } => {
                self.sessions
                    .set_conversation_id(session_id, conversation_id.clone())
                    .await
            }
            StreamEvent::ModeChange { mode } => self.sessions.set_mode(session_id, *mode).await,
            StreamEvent::FileChange { path, tool } => {
                self.sessions
                    .add_file_change(
                        session_id,
                        FileChange {
                            path: path.clone(),
                            tool: tool.clone(),
                            changed_at: chrono::Utc::now(),
                        },
                    )
                    .await
            }
            StreamEvent::Result(result) => {
                self.sessions
                    .add_message(
                        session_id,
                        StoredMessage {
                            role: "assistant".to_string(),
                            content: result.content.clone(),
                            created_at: chrono::Utc::now(),
                        },
                    )
                    .await
            }
            _ => Ok(()),
        };

        if let Err(e) = result {
            tracing::warn!(
                session_id = %session_id,
                event_type = event.event_type(),
                error = %e,
                "Failed to persist event side effect"
            );
        }
    }

    /// Final status, flush, ring clear. Status stays `error` if anything in
    /// the turn set it.
    async fn teardown(&self, session_id: SessionId, error_status: bool) {
        let final_status = if error_status {
            SessionStatus::Error
        } else {
            SessionStatus::Idle
        };

        if let Err(e) = self.sessions.update_status(session_id, final_status).await {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to update final status");
        }
        self.emit(
            session_id,
            StreamEvent::Status {
                status: final_status,
            },
        )
        .await;

        self.log.flush_now().await;
        self.log.clear(session_id);
        tracing::debug!(session_id = %session_id, status = %final_status, "Turn finished");
    }

    /// SIGTERM first, SIGKILL after the grace period.
    async fn terminate(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if tokio::time::timeout(self.config.kill_grace, child.wait())
                .await
                .is_ok()
            {
                return;
            }
            tracing::warn!(pid, "Assistant ignored SIGTERM, killing");
        }
        let _ = child.start_kill();
        let _ = child.wait().await;
    }

    /// Append to the log (which stamps the sequence number) and fan out the
    /// serialized envelope to live connections.
    async fn emit(&self, session_id: SessionId, event: StreamEvent) {
        let envelope = self.log.append(session_id, event);
        match serde_json::to_string(&envelope) {
            Ok(json) => {
                self.registry.broadcast(session_id, &json).await;
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    seq = envelope.seq,
                    error = %e,
                    "Failed to serialize event for broadcast"
                );
            }
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
