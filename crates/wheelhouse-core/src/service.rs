//! The streaming service facade.
//!
//! One [`StreamService`] per process owns the sequencer, the event log, the
//! connection registry, and the set of in-flight turns. The transport layer
//! calls into it for connects, client messages, and shutdown; everything
//! else flows out through broadcast frames.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use wheelhouse_protocol::{
    Activity, ClientMessage, EventEnvelope, PermissionBehavior, ServerFrame, SessionId,
    SessionSnapshot, StreamEvent,
};

use crate::activity::derive_activity;
use crate::buffer::{EventLog, EventLogConfig};
use crate::connections::{ClientConnection, ConnectionRegistry, HEARTBEAT_INTERVAL};
use crate::error::{Error, Result};
use crate::permission::{PermissionRelay, PermissionRelayError, PermissionRequest};
use crate::runner::{TurnOptions, TurnRunner, TurnRunnerConfig};
use crate::sequencer::Sequencer;
use crate::session::SessionStore;
use crate::store::EventStore;

#[derive(Debug, Clone)]
pub struct StreamServiceConfig {
    pub event_log: EventLogConfig,
    pub runner: TurnRunnerConfig,
    /// Durable events older than this are swept.
    pub retention: Duration,
    pub retention_sweep_interval: Duration,
    pub heartbeat_interval: Duration,
    /// How long a tool-permission request waits for a human before denying.
    pub permission_timeout: Duration,
}

impl Default for StreamServiceConfig {
    fn default() -> Self {
        Self {
            event_log: EventLogConfig::default(),
            runner: TurnRunnerConfig::default(),
            retention: Duration::from_secs(24 * 60 * 60),
            retention_sweep_interval: Duration::from_secs(60 * 60),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            permission_timeout: Duration::from_secs(60),
        }
    }
}

struct ActiveTurn {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

pub struct StreamService {
    sequencer: Arc<Sequencer>,
    log: Arc<EventLog>,
    registry: Arc<ConnectionRegistry>,
    events: Arc<dyn EventStore>,
    sessions: Arc<dyn SessionStore>,
    runner: Arc<TurnRunner>,
    active_turns: Arc<Mutex<HashMap<SessionId, ActiveTurn>>>,
    pending_permissions: Mutex<HashMap<String, oneshot::Sender<PermissionBehavior>>>,
    permission_timeout: Duration,
    shutdown: CancellationToken,
}

impl StreamService {
    /// Build the service and spawn its background loops. Sequence counters
    /// are seeded from durable storage before any event can be issued.
    pub async fn new(
        events: Arc<dyn EventStore>,
        sessions: Arc<dyn SessionStore>,
        config: StreamServiceConfig,
    ) -> Result<Arc<Self>> {
        let sequencer = Arc::new(Sequencer::new());
        sequencer.restore(events.latest_sequences().await?);

        let log = Arc::new(EventLog::new(
            Arc::clone(&sequencer),
            Arc::clone(&events),
            config.event_log.clone(),
        ));
        let registry = Arc::new(ConnectionRegistry::new());
        let runner = Arc::new(TurnRunner::new(
            Arc::clone(&log),
            Arc::clone(&registry),
            Arc::clone(&sessions),
            config.runner.clone(),
        ));

        let shutdown = CancellationToken::new();
        registry.spawn_heartbeat(config.heartbeat_interval, shutdown.child_token());
        spawn_retention_sweep(
            Arc::clone(&log),
            config.retention,
            config.retention_sweep_interval,
            shutdown.child_token(),
        );

        Ok(Arc::new(Self {
            sequencer,
            log,
            registry,
            events,
            sessions,
            runner,
            active_turns: Arc::new(Mutex::new(HashMap::new())),
            pending_permissions: Mutex::new(HashMap::new()),
            permission_timeout: config.permission_timeout,
            shutdown,
        }))
    }

    /// Attach a client to a session and send its catch-up frame.
    ///
    /// The connection is registered before the frame is computed, so an
    /// event racing the connect may arrive both live and in the frame; the
    /// client deduplicates by sequence number.
    pub async fn connect(
        &self,
        session_id: SessionId,
        last_seq: Option<u64>,
        conn: Arc<dyn ClientConnection>,
    ) -> Result<()> {
        let conn_id = conn.id();
        self.registry.register(session_id, Arc::clone(&conn));

        let frame = match self.catch_up_frame(session_id, last_seq).await {
            Ok(frame) => frame,
            Err(e) => {
                self.registry.unregister(session_id, conn_id);
                return Err(e);
            }
        };
        let json = serde_json::to_string(&frame)?;
        if let Err(e) = conn.send(&json).await {
            self.registry.unregister(session_id, conn_id);
            return Err(e.into());
        }

        tracing::debug!(
            session_id = %session_id,
            connection_id = %conn_id,
            last_seq = ?last_seq,
            "Client connected"
        );
        Ok(())
    }

    async fn catch_up_frame(
        &self,
        session_id: SessionId,
        last_seq: Option<u64>,
    ) -> Result<ServerFrame> {
        let session = self.sessions.get(session_id).await?;
        let snapshot = SessionSnapshot {
            id: session.id,
            status: session.status,
            mode: session.mode,
            conversation_id: session.conversation_id,
            current_activity: self.current_activity(session_id),
        };

        // A reconnect gets the snapshot and the gap; only a first connect
        // replays the full history.
        if let Some(after_seq) = last_seq {
            let events = self.log.events_after(session_id, after_seq).await?;
            return Ok(ServerFrame::MissedEvents {
                session: snapshot,
                events,
                latest_seq: self.sequencer.latest(session_id),
            });
        }

        let history = self.sessions.history(session_id).await?;
        Ok(ServerFrame::SessionState {
            session: snapshot,
            history: Some(history),
            latest_seq: self.sequencer.latest(session_id),
        })
    }

    pub fn disconnect(&self, session_id: SessionId, conn_id: wheelhouse_protocol::ConnectionId) {
        self.registry.unregister(session_id, conn_id);
    }

    /// Dispatch one message from a connected client. Returns a frame only
    /// for request/response style messages.
    pub async fn handle_message(
        &self,
        session_id: SessionId,
        message: ClientMessage,
    ) -> Result<Option<ServerFrame>> {
        match message {
            ClientMessage::Prompt {
                prompt,
                allowed_tools,
                mode,
            } => {
                let mut options = TurnOptions::new(prompt);
                options.mode = mode.unwrap_or_default();
                options.allowed_tools = allowed_tools.map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|tool| !tool.is_empty())
                        .map(str::to_string)
                        .collect()
                });
                self.start_turn(session_id, options)?;
                Ok(None)
            }
            ClientMessage::Stop => {
                self.stop_turn(session_id)?;
                Ok(None)
            }
            ClientMessage::PermissionRespond {
                permission_id,
                behavior,
            } => {
                self.resolve_permission(&permission_id, behavior);
                Ok(None)
            }
            ClientMessage::Ping => Ok(Some(ServerFrame::Pong)),
        }
    }

    /// Begin a turn. At most one turn runs per session; a second prompt
    /// while one is active is rejected, not queued.
    pub fn start_turn(&self, session_id: SessionId, options: TurnOptions) -> Result<()> {
        let mut turns = self.active_turns.lock().unwrap_or_else(|e| e.into_inner());
        turns.retain(|_, turn| !turn.task.is_finished());
        if turns.contains_key(&session_id) {
            return Err(Error::TurnAlreadyActive(session_id));
        }

        let cancel = self.shutdown.child_token();
        let runner = Arc::clone(&self.runner);
        let active_turns = Arc::clone(&self.active_turns);
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                runner.run(session_id, options, cancel).await;
                active_turns
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&session_id);
            }
        });

        turns.insert(session_id, ActiveTurn { cancel, task });
        Ok(())
    }

    /// Cancel the session's running turn, if any.
    pub fn stop_turn(&self, session_id: SessionId) -> Result<()> {
        let turns = self.active_turns.lock().unwrap_or_else(|e| e.into_inner());
        match turns.get(&session_id) {
            Some(turn) if !turn.task.is_finished() => {
                turn.cancel.cancel();
                Ok(())
            }
            _ => Err(Error::InvalidOperation(format!(
                "no active turn for session {session_id}"
            ))),
        }
    }

    pub fn turn_active(&self, session_id: SessionId) -> bool {
        let turns = self.active_turns.lock().unwrap_or_else(|e| e.into_inner());
        turns
            .get(&session_id)
            .is_some_and(|turn| !turn.task.is_finished())
    }

    /// What the session is doing right now, derived from the buffered
    /// events of the current turn.
    pub fn current_activity(&self, session_id: SessionId) -> Option<Activity> {
        derive_activity(&self.log.buffered(session_id))
    }

    /// Live high-water mark for a session's stream.
    pub fn latest_seq(&self, session_id: SessionId) -> u64 {
        self.sequencer.latest(session_id)
    }

    pub async fn events_after(
        &self,
        session_id: SessionId,
        after_seq: u64,
    ) -> Result<Vec<EventEnvelope>> {
        Ok(self.log.events_after(session_id, after_seq).await?)
    }

    pub async fn current_turn_events(&self, session_id: SessionId) -> Result<Vec<EventEnvelope>> {
        Ok(self.log.current_turn_events(session_id).await?)
    }

    /// Append an event to the session's stream and fan it out.
    pub async fn publish(&self, session_id: SessionId, event: StreamEvent) -> EventEnvelope {
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
        envelope
    }

    /// Ask the session's connected humans to approve a tool call. Denies
    /// when nobody answers in time.
    pub async fn request_permission(
        &self,
        session_id: SessionId,
        tool_name: String,
        input: serde_json::Value,
        timeout: Duration,
    ) -> PermissionBehavior {
        let permission_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self
                .pending_permissions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            pending.insert(permission_id.clone(), tx);
        }

        self.publish(
            session_id,
            StreamEvent::PermissionRequest {
                permission_id: permission_id.clone(),
                tool_name: tool_name.clone(),
                input,
            },
        )
        .await;

        let behavior = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(behavior)) => behavior,
            _ => {
                tracing::warn!(
                    session_id = %session_id,
                    tool_name = %tool_name,
                    "No permission decision in time, denying"
                );
                PermissionBehavior::Deny
            }
        };

        {
            let mut pending = self
                .pending_permissions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            pending.remove(&permission_id);
        }
        self.publish(
            session_id,
            StreamEvent::PermissionResponse {
                permission_id,
                behavior,
            },
        )
        .await;
        behavior
    }

    fn resolve_permission(&self, permission_id: &str, behavior: PermissionBehavior) {
        let sender = {
            let mut pending = self
                .pending_permissions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            pending.remove(permission_id)
        };
        match sender {
            Some(tx) => {
                let _ = tx.send(behavior);
            }
            None => {
                tracing::debug!(permission_id, "Response for unknown or expired permission");
            }
        }
    }

    /// Remove a session's stream entirely: live turn, ring, durable events,
    /// and sequence counter. An in-flight turn is cancelled and its teardown
    /// awaited first, so its final flush cannot write the session back.
    pub async fn delete_session(&self, session_id: SessionId) -> Result<()> {
        let turn = {
            let mut turns = self.active_turns.lock().unwrap_or_else(|e| e.into_inner());
            turns.remove(&session_id)
        };
        if let Some(turn) = turn {
            await_turn_end(session_id, turn).await;
        }

        self.log.clear(session_id);
        self.events.delete_session(session_id).await?;
        self.sequencer.forget(session_id);
        Ok(())
    }

    /// Stop every turn, wait for their teardowns, stop the background loops,
    /// and force a final durable flush.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let turns: Vec<(SessionId, ActiveTurn)> = {
            let mut turns = self.active_turns.lock().unwrap_or_else(|e| e.into_inner());
            turns.drain().collect()
        };
        for (session_id, turn) in turns {
            await_turn_end(session_id, turn).await;
        }

        self.log.flush_now().await;
        tracing::info!("Stream service shut down");
    }
}

#[async_trait]
impl PermissionRelay for StreamService {
    async fn request(
        &self,
        request: PermissionRequest,
        timeout: Duration,
    ) -> std::result::Result<PermissionBehavior, PermissionRelayError> {
        if !self.registry.has_connections(request.session_id) {
            return Err(PermissionRelayError::NoDecider);
        }
        Ok(self
            .request_permission(
                request.session_id,
                request.tool_name,
                request.input,
                timeout.min(self.permission_timeout),
            )
            .await)
    }
}

/// Cancel a turn and wait for its teardown to finish, with a deadline.
async fn await_turn_end(session_id: SessionId, turn: ActiveTurn) {
    turn.cancel.cancel();
    match tokio::time::timeout(Duration::from_secs(10), turn.task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(session_id = %session_id, error = %e, "Turn task panicked");
        }
        Err(_) => {
            tracing::warn!(session_id = %session_id, "Turn did not stop before deadline");
        }
    }
}

fn spawn_retention_sweep(
    log: Arc<EventLog>,
    retention: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup does not race
        // the first writes.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match log.cleanup_older_than(retention).await {
                        Ok(0) => {}
                        Ok(removed) => {
                            tracing::info!(removed, "Retention sweep removed old events");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Retention sweep failed");
                        }
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::connections::ConnectionError;
    use crate::runner::AssistantConfig;
    use crate::session::{InMemorySessionStore, Session};
    use crate::store::InMemoryEventStore;
    use wheelhouse_protocol::{ConnectionId, SessionStatus};

    struct FakeConnection {
        id: ConnectionId,
        healthy: AtomicBool,
        sent: Mutex<Vec<String>>,
    }

    impl FakeConnection {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: ConnectionId::new(),
                healthy: AtomicBool::new(true),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn frames(&self) -> Vec<serde_json::Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|raw| serde_json::from_str(raw).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl ClientConnection for FakeConnection {
        fn id(&self) -> ConnectionId {
            self.id
        }

        fn is_ready(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        async fn send(&self, message: &str) -> std::result::Result<(), ConnectionError> {
            if !self.healthy.load(Ordering::SeqCst) {
                return Err(ConnectionError::Closed);
            }
            self.sent.lock().unwrap().push(message.to_string());
            Ok(())
        }

        async fn ping(&self) -> std::result::Result<(), ConnectionError> {
            Ok(())
        }
    }

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("assistant.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    struct Fixture {
        service: Arc<StreamService>,
        sessions: Arc<InMemorySessionStore>,
        session_id: SessionId,
        _workdir: tempfile::TempDir,
    }

    async fn fixture(script_body: &str) -> Fixture {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let workdir = tempfile::tempdir().unwrap();
        let binary = write_script(workdir.path(), script_body);

        let sessions = Arc::new(InMemorySessionStore::new());
        let session = Session::new(SessionId::new(), workdir.path().to_path_buf());
        let session_id = session.id;
        sessions.insert(session);

        let config = StreamServiceConfig {
            runner: TurnRunnerConfig {
                assistant: AssistantConfig {
                    binary,
                    ..AssistantConfig::default()
                },
                kill_grace: Duration::from_millis(200),
            },
            ..StreamServiceConfig::default()
        };
        let service = StreamService::new(
            Arc::new(InMemoryEventStore::new()),
            sessions.clone(),
            config,
        )
        .await
        .unwrap();

        Fixture {
            service,
            sessions,
            session_id,
            _workdir: workdir,
        }
    }

    async fn wait_for_idle(fixture: &Fixture) {
        for _ in 0..100 {
            if !fixture.service.turn_active(fixture.session_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("turn never finished");
    }

    #[tokio::test]
    async fn first_connect_gets_session_state_with_history() {
        let fixture = fixture("true").await;
        let conn = FakeConnection::new();

        fixture
            .service
            .connect(fixture.session_id, None, conn.clone())
            .await
            .unwrap();

        let frames = conn.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "session_state");
        assert_eq!(frames[0]["latest_seq"], 0);
        assert_eq!(frames[0]["session"]["status"], "idle");
        assert!(frames[0]["history"].is_array());
    }

    #[tokio::test]
    async fn reconnect_with_gap_gets_missed_events() {
        let fixture = fixture("true").await;
        for i in 1..=5 {
            fixture
                .service
                .publish(
                    fixture.session_id,
                    StreamEvent::AssistantText {
                        content: format!("event {i}"),
                    },
                )
                .await;
        }

        let conn = FakeConnection::new();
        fixture
            .service
            .connect(fixture.session_id, Some(2), conn.clone())
            .await
            .unwrap();

        let frames = conn.frames();
        assert_eq!(frames[0]["type"], "missed_events");
        assert_eq!(frames[0]["latest_seq"], 5);
        let seqs: Vec<u64> = frames[0]["events"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["seq"].as_u64().unwrap())
            .collect();
        assert_eq!(seqs, vec![3, 4, 5]);

        // The snapshot rides along; only the history replay is omitted.
        assert_eq!(frames[0]["session"]["status"], "idle");
        assert!(frames[0].get("history").is_none());
    }

    #[tokio::test]
    async fn caught_up_reconnect_gets_empty_gap() {
        let fixture = fixture("true").await;
        fixture
            .service
            .publish(
                fixture.session_id,
                StreamEvent::AssistantText {
                    content: "only".to_string(),
                },
            )
            .await;

        let conn = FakeConnection::new();
        fixture
            .service
            .connect(fixture.session_id, Some(1), conn.clone())
            .await
            .unwrap();

        let frames = conn.frames();
        assert_eq!(frames[0]["type"], "missed_events");
        assert!(frames[0]["events"].as_array().unwrap().is_empty());
        assert_eq!(frames[0]["latest_seq"], 1);
    }

    #[tokio::test]
    async fn connect_to_unknown_session_fails_and_registers_nothing() {
        let fixture = fixture("true").await;
        let unknown = SessionId::new();
        let conn = FakeConnection::new();

        let result = fixture.service.connect(unknown, None, conn.clone()).await;
        assert!(result.is_err());
        assert!(!fixture.service.registry.has_connections(unknown));
    }

    #[tokio::test]
    async fn connected_client_receives_published_events() {
        let fixture = fixture("true").await;
        let conn = FakeConnection::new();
        fixture
            .service
            .connect(fixture.session_id, None, conn.clone())
            .await
            .unwrap();

        fixture
            .service
            .publish(
                fixture.session_id,
                StreamEvent::AssistantText {
                    content: "live".to_string(),
                },
            )
            .await;

        let frames = conn.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1]["type"], "assistant_text");
        assert_eq!(frames[1]["seq"], 1);
    }

    #[tokio::test]
    async fn second_prompt_while_turn_active_is_rejected() {
        let fixture = fixture("sleep 30").await;

        fixture
            .service
            .start_turn(fixture.session_id, TurnOptions::new("first"))
            .unwrap();
        let second = fixture
            .service
            .start_turn(fixture.session_id, TurnOptions::new("second"));
        assert!(matches!(second, Err(Error::TurnAlreadyActive(_))));

        fixture.service.stop_turn(fixture.session_id).unwrap();
        wait_for_idle(&fixture).await;

        let session = fixture.sessions.get(fixture.session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn prompt_message_runs_a_full_turn() {
        let fixture = fixture(
            r#"printf '%s\n' '{"type":"result","subtype":"success","result":"done"}'"#,
        )
        .await;

        let frame = fixture
            .service
            .handle_message(
                fixture.session_id,
                ClientMessage::Prompt {
                    prompt: "go".to_string(),
                    allowed_tools: Some("Read, Bash".to_string()),
                    mode: None,
                },
            )
            .await
            .unwrap();
        assert!(frame.is_none());

        wait_for_idle(&fixture).await;
        let session = fixture.sessions.get(fixture.session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(session.message_count, 2);
    }

    #[tokio::test]
    async fn stop_without_active_turn_is_invalid() {
        let fixture = fixture("true").await;
        let result = fixture.service.stop_turn(fixture.session_id);
        assert!(matches!(result, Err(Error::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let fixture = fixture("true").await;
        let frame = fixture
            .service
            .handle_message(fixture.session_id, ClientMessage::Ping)
            .await
            .unwrap();
        assert_eq!(frame, Some(ServerFrame::Pong));
    }

    #[tokio::test]
    async fn permission_request_round_trips_through_client_response() {
        let fixture = fixture("true").await;
        let conn = FakeConnection::new();
        fixture
            .service
            .connect(fixture.session_id, None, conn.clone())
            .await
            .unwrap();

        let service = Arc::clone(&fixture.service);
        let session_id = fixture.session_id;
        let pending = tokio::spawn(async move {
            service
                .request_permission(
                    session_id,
                    "Bash".to_string(),
                    serde_json::json!({"command": "rm -rf build"}),
                    Duration::from_secs(5),
                )
                .await
        });

        let permission_id = loop {
            let frames = conn.frames();
            if let Some(frame) = frames.iter().find(|f| f["type"] == "permission_request") {
                break frame["permission_id"].as_str().unwrap().to_string();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        fixture
            .service
            .handle_message(
                fixture.session_id,
                ClientMessage::PermissionRespond {
                    permission_id,
                    behavior: PermissionBehavior::Allow,
                },
            )
            .await
            .unwrap();

        assert_eq!(pending.await.unwrap(), PermissionBehavior::Allow);
        let frames = conn.frames();
        assert!(frames.iter().any(|f| f["type"] == "permission_response"
            && f["behavior"] == "allow"));
    }

    #[tokio::test]
    async fn unanswered_permission_request_denies() {
        let fixture = fixture("true").await;

        let behavior = fixture
            .service
            .request_permission(
                fixture.session_id,
                "Write".to_string(),
                serde_json::json!({"file_path": "x"}),
                Duration::from_millis(50),
            )
            .await;

        assert_eq!(behavior, PermissionBehavior::Deny);
    }

    #[tokio::test]
    async fn relay_without_connections_reports_no_decider() {
        let fixture = fixture("true").await;

        let result = fixture
            .service
            .request(
                PermissionRequest {
                    permission_id: String::new(),
                    session_id: fixture.session_id,
                    tool_name: "Bash".to_string(),
                    input: serde_json::json!({}),
                },
                Duration::from_millis(50),
            )
            .await;

        assert!(matches!(result, Err(PermissionRelayError::NoDecider)));
    }

    #[tokio::test]
    async fn sequence_counters_survive_restart() {
        let events = Arc::new(InMemoryEventStore::new());
        let sessions = Arc::new(InMemorySessionStore::new());
        let session = Session::new(SessionId::new(), PathBuf::from("/tmp"));
        let session_id = session.id;
        sessions.insert(session);

        events
            .append_batch(&[(
                session_id,
                EventEnvelope::new(
                    7,
                    StreamEvent::AssistantText {
                        content: "old".to_string(),
                    },
                ),
            )])
            .await
            .unwrap();

        let service = StreamService::new(
            events,
            sessions,
            StreamServiceConfig::default(),
        )
        .await
        .unwrap();

        let envelope = service
            .publish(
                session_id,
                StreamEvent::AssistantText {
                    content: "new".to_string(),
                },
            )
            .await;
        assert_eq!(envelope.seq, 8);
    }

    #[tokio::test]
    async fn delete_session_wipes_stream_state() {
        let fixture = fixture("true").await;
        fixture
            .service
            .publish(
                fixture.session_id,
                StreamEvent::AssistantText {
                    content: "x".to_string(),
                },
            )
            .await;
        fixture.service.log.flush_now().await;

        fixture
            .service
            .delete_session(fixture.session_id)
            .await
            .unwrap();

        let events = fixture
            .service
            .log
            .events_after(fixture.session_id, 0)
            .await
            .unwrap();
        assert!(events.is_empty());

        // Sequence numbering restarts for a recreated session.
        let envelope = fixture
            .service
            .publish(
                fixture.session_id,
                StreamEvent::AssistantText {
                    content: "fresh".to_string(),
                },
            )
            .await;
        assert_eq!(envelope.seq, 1);
    }

    #[tokio::test]
    async fn delete_session_with_running_turn_stays_deleted() {
        let fixture = fixture("sleep 30").await;
        fixture
            .service
            .start_turn(fixture.session_id, TurnOptions::new("go"))
            .unwrap();

        fixture
            .service
            .delete_session(fixture.session_id)
            .await
            .unwrap();
        assert!(!fixture.service.turn_active(fixture.session_id));

        // The turn's teardown flush completed before the wipe; wait out a
        // flush interval to prove nothing trickles back in afterwards.
        tokio::time::sleep(Duration::from_millis(700)).await;
        let durable = fixture
            .service
            .events
            .events_after(fixture.session_id, 0)
            .await
            .unwrap();
        assert!(durable.is_empty());
        assert_eq!(fixture.service.latest_seq(fixture.session_id), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_turns_and_flushes() {
        let fixture = fixture("sleep 30").await;
        fixture
            .service
            .start_turn(fixture.session_id, TurnOptions::new("go"))
            .unwrap();

        let started = std::time::Instant::now();
        fixture.service.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(8));

        assert!(!fixture.service.turn_active(fixture.session_id));
        // Teardown flushed, so the durable log holds the turn's events.
        let events = fixture
            .service
            .events
            .events_after(fixture.session_id, 0)
            .await
            .unwrap();
        assert!(!events.is_empty());
    }
}
