//! Orchestrator facade.
//!
//! Ties the supervisor, hub, accumulator, projector, and broadcast sink into
//! the four public operations: `send`, `interrupt`, `push_events`, and
//! `push_finished`.
//!
//! Concurrency model: all mutable per-reply state (status, accumulator,
//! cancelled flag) lives behind one `tokio::sync::Mutex` per reply.
//! `push_events`, `push_finished`, `interrupt`, and the exit watcher for the
//! same reply are therefore mutually exclusive, which guarantees that a
//! `tool_result` can never race ahead of its own call's hidden-id insertion
//! and that the terminal event is published exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use studio_core::events::ReplyEvent;
use studio_core::ids;
use studio_core::status::ReplyStatus;
use studio_store::StudioStore;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::accumulator::TranscriptAccumulator;
use crate::broadcast_sink::BroadcastSink;
use crate::errors::{Result, RuntimeError};
use crate::hub::{CloseReason, FanoutHub, Subscription};
use crate::parser;
use crate::projector::PlanProjector;
use crate::settings::AgentSettings;
use crate::supervisor::{AgentSupervisor, ExitNotice, SpawnParams};
use crate::tool_filter::ToolDisplayFilter;

/// Notice shown to clients when the user interrupts a reply.
const CANCEL_MESSAGE: &str = "用户终止了请求";

/// Conversation titles take the first 50 characters of the opening message.
const TITLE_MAX_CHARS: usize = 50;

/// How long a terminal reply's channel and state stay around for late
/// subscribers before being pruned.
const REPLY_RETENTION: Duration = Duration::from_secs(60);

/// Input to [`ChatOrchestrator::send`].
#[derive(Clone, Debug)]
pub struct SendRequest {
    /// Authenticated caller.
    pub user_id: String,
    /// Existing conversation, or `None` to mint one.
    pub conversation_id: Option<String>,
    /// The user's message.
    pub message: String,
    /// Files already uploaded for this conversation.
    pub uploaded_files: Vec<String>,
}

/// Output of [`ChatOrchestrator::send`].
#[derive(Debug)]
pub struct SendOutcome {
    /// Conversation the reply belongs to (possibly freshly minted).
    pub conversation_id: String,
    /// The new reply id.
    pub reply_id: String,
    /// Subscription opened before the subprocess had any chance to call
    /// back, so `start` always precedes agent events on the stream.
    pub subscription: Subscription,
}

struct ReplyState {
    status: ReplyStatus,
    accumulator: TranscriptAccumulator,
    cancelled: bool,
}

struct ReplyEntry {
    conversation_id: String,
    user_id: String,
    state: tokio::sync::Mutex<ReplyState>,
}

type ReplyMap = Arc<Mutex<HashMap<String, Arc<ReplyEntry>>>>;

/// The orchestration facade. One instance per process.
pub struct ChatOrchestrator {
    store: StudioStore,
    settings: AgentSettings,
    filter: ToolDisplayFilter,
    studio_url: String,
    hub: Arc<FanoutHub>,
    supervisor: Arc<AgentSupervisor>,
    projector: PlanProjector,
    broadcast: Arc<dyn BroadcastSink>,
    replies: ReplyMap,
}

impl ChatOrchestrator {
    /// Construct the orchestrator and start its exit-watcher loop.
    ///
    /// `studio_url` is the base URL agents post their callbacks to.
    pub fn new(
        store: StudioStore,
        settings: AgentSettings,
        studio_url: String,
        broadcast: Arc<dyn BroadcastSink>,
    ) -> Arc<Self> {
        let filter = ToolDisplayFilter::from_settings(&settings);
        let (supervisor, exit_rx) = AgentSupervisor::new(settings.agent_program.clone());
        let projector = PlanProjector::new(store.clone());

        let orchestrator = Arc::new(Self {
            store,
            settings,
            filter,
            studio_url,
            hub: Arc::new(FanoutHub::new()),
            supervisor,
            projector,
            broadcast,
            replies: Arc::new(Mutex::new(HashMap::new())),
        });

        let weak = Arc::downgrade(&orchestrator);
        let _ = tokio::spawn(run_exit_loop(weak, exit_rx));

        orchestrator
    }

    /// The durable store handle (read paths for the HTTP layer).
    #[must_use]
    pub fn store(&self) -> &StudioStore {
        &self.store
    }

    /// Number of tracked replies (live or within the retention window).
    #[must_use]
    pub fn tracked_reply_count(&self) -> usize {
        self.replies.lock().len()
    }

    /// Number of live agent subprocesses.
    #[must_use]
    pub fn running_agent_count(&self) -> usize {
        self.supervisor.active_count()
    }

    /// Whether an agent is currently replying in the conversation.
    #[must_use]
    pub fn is_replying(&self, conversation_id: &str) -> bool {
        !self
            .supervisor
            .replies_for_conversation(conversation_id)
            .is_empty()
    }

    // ── send ────────────────────────────────────────────────────────────

    /// Start a reply: persist the user message, spawn the agent, and return
    /// a subscription bound before the subprocess can call back.
    pub async fn send(&self, req: SendRequest) -> Result<SendOutcome> {
        let title: String = req.message.chars().take(TITLE_MAX_CHARS).collect();

        let conversation_id = match &req.conversation_id {
            Some(id) => match self.store.get_conversation(id)? {
                Some(row) if row.user_id != req.user_id => {
                    return Err(RuntimeError::ForbiddenConversation(id.clone()));
                }
                Some(row) => row.id,
                // Client-supplied id for a conversation we have not seen yet
                None => {
                    self.store
                        .create_conversation_with_id(id, &req.user_id, &title)?
                        .id
                }
            },
            None => self.store.create_conversation(&req.user_id, &title)?.id,
        };

        let _ = self.store.create_message(
            &ids::new_message_id(),
            &conversation_id,
            "user",
            &req.message,
        )?;
        self.store.touch_conversation(&conversation_id)?;

        let reply_id = ids::new_reply_id();
        let entry = Arc::new(ReplyEntry {
            conversation_id: conversation_id.clone(),
            user_id: req.user_id.clone(),
            state: tokio::sync::Mutex::new(ReplyState {
                status: ReplyStatus::Starting,
                accumulator: TranscriptAccumulator::new(),
                cancelled: false,
            }),
        });
        let _ = self.replies.lock().insert(reply_id.clone(), entry.clone());

        self.hub.create(&reply_id, &conversation_id);
        let subscription = self
            .hub
            .subscribe(&reply_id)
            .ok_or_else(|| RuntimeError::UnknownReply(reply_id.clone()))?;

        self.store
            .create_agent_session(&reply_id, &conversation_id, &req.user_id)?;

        self.broadcast
            .push_replying_state(true, &conversation_id)
            .await;

        let params = SpawnParams {
            conversation_id: conversation_id.clone(),
            reply_id: reply_id.clone(),
            query: build_query_payload(
                &req.user_id,
                &conversation_id,
                &req.uploaded_files,
                &req.message,
            ),
            studio_url: self.studio_url.clone(),
            llm_provider: self.settings.llm_provider.clone(),
            model_name: self.settings.model_name.clone(),
            api_key: self.settings.api_key.clone(),
            workspace: self.settings.workspace.clone(),
            mode: self.settings.mode.as_str().to_string(),
        };

        match self.supervisor.spawn(&params) {
            Ok(pid) => {
                if let Err(e) = self.store.set_agent_session_pid(&reply_id, i64::from(pid)) {
                    warn!(reply_id, error = %e, "failed to record agent pid");
                }
                {
                    let mut state = entry.state.lock().await;
                    if transition(&reply_id, &mut state, ReplyStatus::Running) {
                        if let Err(e) = self
                            .store
                            .set_agent_session_status(&reply_id, ReplyStatus::Running)
                        {
                            warn!(reply_id, error = %e, "failed to persist running status");
                        }
                    }
                    self.snapshot_reply(&reply_id, &state);
                }
                info!(reply_id, conversation_id, "reply started");
                Ok(SendOutcome {
                    conversation_id,
                    reply_id,
                    subscription,
                })
            }
            Err(e) => {
                error!(reply_id, error = %e, "agent spawn failed");
                let _ = self.replies.lock().remove(&reply_id);
                self.hub.remove(&reply_id);
                if let Err(store_err) = self
                    .store
                    .set_agent_session_status(&reply_id, ReplyStatus::Failed)
                {
                    warn!(reply_id, error = %store_err, "failed to mark spawn failure");
                }
                self.broadcast
                    .push_replying_state(false, &conversation_id)
                    .await;
                Err(e)
            }
        }
    }

    // ── push_events ─────────────────────────────────────────────────────

    /// Feed one callback batch through Accumulator → Projector → Hub →
    /// Broadcast, in order, under the per-reply lock.
    pub async fn push_events(
        &self,
        reply_id: &str,
        events: Option<&[Value]>,
        msg: Option<&Value>,
    ) -> Result<()> {
        let entry = self
            .replies
            .lock()
            .get(reply_id)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownReply(reply_id.to_string()))?;

        let parsed = parser::events_from_request(events, msg);
        if parsed.is_empty() {
            return Ok(());
        }

        let mut state = entry.state.lock().await;
        if state.status.is_terminal() || state.cancelled {
            debug!(reply_id, "dropping events for terminal reply (orphan callback)");
            return Ok(());
        }

        for event in parsed {
            for out in state.accumulator.apply(event, &self.filter) {
                if let ReplyEvent::Coordinator { event_type, data } = &out {
                    self.projector.apply(&entry.conversation_id, event_type, data);
                }
                self.hub.publish(reply_id, &out);
                self.broadcast
                    .push_reply(&entry.conversation_id, reply_id, &out)
                    .await;
            }
        }

        self.snapshot_reply(reply_id, &state);
        Ok(())
    }

    // ── push_finished ───────────────────────────────────────────────────

    /// The agent's completion signal: flush the transcript, close the hub
    /// with reason `done`, and mark the durable record completed.
    pub async fn push_finished(&self, reply_id: &str) -> Result<()> {
        let entry = self
            .replies
            .lock()
            .get(reply_id)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownReply(reply_id.to_string()))?;

        let mut state = entry.state.lock().await;
        if state.status.is_terminal() {
            debug!(reply_id, "duplicate finished signal ignored");
            return Ok(());
        }

        self.flush_transcript(reply_id, &entry, &state);
        if transition(reply_id, &mut state, ReplyStatus::Completed) {
            if let Err(e) = self
                .store
                .set_agent_session_status(reply_id, ReplyStatus::Completed)
            {
                warn!(reply_id, error = %e, "failed to persist completed status");
            }
        }
        self.snapshot_reply(reply_id, &state);
        self.hub.close(reply_id, CloseReason::Done);
        // Reap a child that lingers after signalling completion
        let _ = self.supervisor.terminate(reply_id);
        drop(state);

        self.broadcast.push_finished(reply_id).await;
        self.broadcast
            .push_replying_state(false, &entry.conversation_id)
            .await;
        if let Err(e) = self.store.touch_conversation(&entry.conversation_id) {
            warn!(error = %e, "failed to touch conversation");
        }
        self.schedule_retention(reply_id);
        info!(reply_id, "reply completed");
        Ok(())
    }

    // ── interrupt ───────────────────────────────────────────────────────

    /// Cancel a reply on behalf of its owner.
    ///
    /// Returns whether a live reply was found. Cancelling someone else's
    /// reply is a hard error; cancelling twice is a no-op.
    pub async fn interrupt(&self, reply_id: &str, user_id: &str) -> Result<bool> {
        let Some(entry) = self.replies.lock().get(reply_id).cloned() else {
            return Ok(false);
        };
        if entry.user_id != user_id {
            return Err(RuntimeError::UnauthorizedInterrupt(reply_id.to_string()));
        }
        Ok(self.cancel_reply(reply_id, &entry).await)
    }

    /// Cancel every live reply in a conversation. Returns how many were
    /// cancelled.
    pub async fn cancel_conversation(&self, conversation_id: &str) -> usize {
        let targets: Vec<(String, Arc<ReplyEntry>)> = self
            .replies
            .lock()
            .iter()
            .filter(|(_, entry)| entry.conversation_id == conversation_id)
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();

        let mut cancelled = 0;
        for (reply_id, entry) in targets {
            if self.cancel_reply(&reply_id, &entry).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Shut down: cancel every live reply and hard-kill surviving children.
    pub async fn shutdown(&self) {
        let targets: Vec<(String, Arc<ReplyEntry>)> = self
            .replies
            .lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();

        info!(count = targets.len(), "orchestrator shutting down");
        for (reply_id, entry) in targets {
            let _ = self.cancel_reply(&reply_id, &entry).await;
        }
        self.supervisor.cleanup().await;
    }

    // ── internals ───────────────────────────────────────────────────────

    async fn cancel_reply(&self, reply_id: &str, entry: &Arc<ReplyEntry>) -> bool {
        let mut state = entry.state.lock().await;
        if state.status.is_terminal() {
            return false;
        }

        state.cancelled = true;
        let _ = self.supervisor.terminate(reply_id);
        self.flush_transcript(reply_id, entry, &state);
        if transition(reply_id, &mut state, ReplyStatus::Cancelled) {
            if let Err(e) = self
                .store
                .set_agent_session_status(reply_id, ReplyStatus::Cancelled)
            {
                warn!(reply_id, error = %e, "failed to persist cancelled status");
            }
        }
        self.snapshot_reply(reply_id, &state);

        let cancelled_event = ReplyEvent::Cancelled {
            message: CANCEL_MESSAGE.to_string(),
        };
        self.hub.publish(reply_id, &cancelled_event);
        self.hub.close(reply_id, CloseReason::Cancelled);
        drop(state);

        self.broadcast
            .push_reply(&entry.conversation_id, reply_id, &cancelled_event)
            .await;
        self.broadcast.push_cancelled(reply_id).await;
        self.broadcast
            .push_replying_state(false, &entry.conversation_id)
            .await;
        self.schedule_retention(reply_id);
        info!(reply_id, "reply cancelled");
        true
    }

    async fn handle_child_exit(&self, notice: ExitNotice) {
        let Some(entry) = self.replies.lock().get(&notice.reply_id).cloned() else {
            // Reply already pruned; nothing to synthesize
            return;
        };

        let mut state = entry.state.lock().await;
        if state.status.is_terminal() || state.cancelled {
            return;
        }

        warn!(
            reply_id = notice.reply_id,
            exit_code = ?notice.exit_code,
            "agent exited without a finished signal"
        );
        self.flush_transcript(&notice.reply_id, &entry, &state);
        if transition(&notice.reply_id, &mut state, ReplyStatus::Failed) {
            if let Err(e) = self
                .store
                .set_agent_session_status(&notice.reply_id, ReplyStatus::Failed)
            {
                warn!(reply_id = notice.reply_id, error = %e, "failed to persist failed status");
            }
        }
        self.snapshot_reply(&notice.reply_id, &state);

        let message = match notice.exit_code {
            Some(code) => format!("agent process exited unexpectedly (exit code {code})"),
            None => "agent process was terminated unexpectedly".to_string(),
        };
        let error_event = ReplyEvent::Error { message };
        self.hub.publish(&notice.reply_id, &error_event);
        self.hub.close(&notice.reply_id, CloseReason::Failed);
        drop(state);

        self.broadcast
            .push_reply(&entry.conversation_id, &notice.reply_id, &error_event)
            .await;
        self.broadcast.push_finished(&notice.reply_id).await;
        self.broadcast
            .push_replying_state(false, &entry.conversation_id)
            .await;
        self.schedule_retention(&notice.reply_id);
    }

    /// Persist the accumulated text as the assistant message. The message id
    /// is the reply id, so duplicate flushes are ignored by the store.
    fn flush_transcript(&self, reply_id: &str, entry: &ReplyEntry, state: &ReplyState) {
        let text = state.accumulator.accumulated_text();
        if text.is_empty() {
            return;
        }
        match self
            .store
            .create_message(reply_id, &entry.conversation_id, "assistant", text)
        {
            Ok(true) => {
                debug!(reply_id, chars = text.chars().count(), "assistant message persisted");
            }
            Ok(false) => debug!(reply_id, "assistant message already persisted"),
            Err(e) => {
                metrics::counter!("persistence_failures_total", "target" => "messages")
                    .increment(1);
                error!(
                    reply_id,
                    error = %e,
                    accumulated_text = text,
                    "failed to persist assistant message; content logged for recovery"
                );
            }
        }
    }

    /// Best-effort crash-forensics snapshot under `agent:reply:{id}`.
    fn snapshot_reply(&self, reply_id: &str, state: &ReplyState) {
        let snapshot = json!({
            "status": state.status,
            "cancelled": state.cancelled,
            "accumulated_chars": state.accumulator.accumulated_text().chars().count(),
            "testcase_extracted": state.accumulator.testcase_extracted(),
        });
        if let Err(e) = self.store.put_reply_state(reply_id, &snapshot) {
            metrics::counter!("persistence_failures_total", "target" => "kv_state").increment(1);
            warn!(reply_id, error = %e, "failed to snapshot reply state");
        }
    }

    fn schedule_retention(&self, reply_id: &str) {
        let hub = Arc::clone(&self.hub);
        let replies = Arc::clone(&self.replies);
        let reply_id = reply_id.to_string();
        let _ = tokio::spawn(async move {
            tokio::time::sleep(REPLY_RETENTION).await;
            hub.remove(&reply_id);
            let _ = replies.lock().remove(&reply_id);
        });
    }
}

/// Advance a reply's status through the state machine.
///
/// Refuses regressions and exits from terminal states; returns whether the
/// transition was applied. Callers skip the durable status write when it
/// was not.
fn transition(reply_id: &str, state: &mut ReplyState, next: ReplyStatus) -> bool {
    if !state.status.can_transition_to(next) {
        warn!(
            reply_id,
            from = %state.status,
            to = %next,
            "refusing illegal status transition"
        );
        return false;
    }
    state.status = next;
    true
}

async fn run_exit_loop(
    orchestrator: std::sync::Weak<ChatOrchestrator>,
    mut exit_rx: mpsc::UnboundedReceiver<ExitNotice>,
) {
    while let Some(notice) = exit_rx.recv().await {
        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };
        orchestrator.handle_child_exit(notice).await;
    }
}

/// Build the agent query payload: a `[SYSTEM CONTEXT]` block identifying the
/// user, conversation, and uploaded files, followed by the raw message.
fn build_query_payload(
    user_id: &str,
    conversation_id: &str,
    uploaded_files: &[String],
    message: &str,
) -> String {
    let files_info = if uploaded_files.is_empty() {
        "(none)".to_string()
    } else {
        uploaded_files.join(", ")
    };
    let context = format!(
        "[SYSTEM CONTEXT]\nuser_id: {user_id}\nconversation_id: {conversation_id}\nuploaded_files: {files_info}\n[/SYSTEM CONTEXT]"
    );
    json!([
        {"type": "text", "text": context},
        {"type": "text", "text": message},
    ])
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast_sink::test_support::RecordingSink;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use studio_store::{new_in_memory, run_migrations, ConnectionConfig};

    fn make_store() -> StudioStore {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        {
            let conn = pool.get().unwrap();
            run_migrations(&conn).unwrap();
        }
        StudioStore::new(pool)
    }

    fn write_stub_agent(dir: &Path, body: &str) -> String {
        let path = dir.join("agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_str().unwrap().to_string()
    }

    struct Fixture {
        orchestrator: Arc<ChatOrchestrator>,
        sink: Arc<RecordingSink>,
        _dir: tempfile::TempDir,
    }

    fn make_fixture(agent_body: &str, hidden: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = AgentSettings::default();
        settings.agent_program = write_stub_agent(dir.path(), agent_body);
        settings.hidden_tools = hidden.iter().map(|s| (*s).to_string()).collect();

        let sink = Arc::new(RecordingSink::default());
        let orchestrator = ChatOrchestrator::new(
            make_store(),
            settings,
            "http://127.0.0.1:8000".into(),
            sink.clone(),
        );
        Fixture {
            orchestrator,
            sink,
            _dir: dir,
        }
    }

    async fn send_simple(fixture: &Fixture, message: &str) -> SendOutcome {
        fixture
            .orchestrator
            .send(SendRequest {
                user_id: "u1".into(),
                conversation_id: None,
                message: message.into(),
                uploaded_files: vec![],
            })
            .await
            .unwrap()
    }

    fn text_events(chunks: &[&str]) -> Vec<Value> {
        chunks
            .iter()
            .map(|c| json!({"type": "text", "content": c}))
            .collect()
    }

    // -- S1: happy path --

    #[tokio::test]
    async fn happy_path_text_stream() {
        let fixture = make_fixture("sleep 30", &[]);
        let mut outcome = send_simple(&fixture, "hi").await;

        fixture
            .orchestrator
            .push_events(&outcome.reply_id, Some(&text_events(&["Hello"])), None)
            .await
            .unwrap();
        fixture
            .orchestrator
            .push_events(&outcome.reply_id, Some(&text_events(&[" world"])), None)
            .await
            .unwrap();
        fixture
            .orchestrator
            .push_finished(&outcome.reply_id)
            .await
            .unwrap();

        assert_eq!(
            outcome.subscription.recv().await,
            Some(ReplyEvent::Chunk {
                content: "Hello".into()
            })
        );
        assert_eq!(
            outcome.subscription.recv().await,
            Some(ReplyEvent::Chunk {
                content: " world".into()
            })
        );
        assert!(outcome.subscription.recv().await.unwrap().is_terminal());
        assert_eq!(outcome.subscription.recv().await, None);

        // Durable transcript: user message + assistant "Hello world"
        let messages = fixture
            .orchestrator
            .store()
            .list_messages(&outcome.conversation_id)
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].content, "Hello world");

        let session = fixture
            .orchestrator
            .store()
            .get_agent_session(&outcome.reply_id)
            .unwrap()
            .unwrap();
        assert_eq!(session.status, "completed");
    }

    // -- S2: hidden tools --

    #[tokio::test]
    async fn hidden_tool_pair_never_reaches_subscribers() {
        let fixture = make_fixture("sleep 30", &["internal_ping"]);
        let mut outcome = send_simple(&fixture, "go").await;

        let batch = vec![
            json!({"type": "tool_call", "id": "t1", "name": "internal_ping", "input": {}}),
            json!({"type": "tool_call", "id": "t2", "name": "fetch", "input": {}}),
            json!({"type": "tool_result", "id": "t1", "name": "internal_ping", "output": "ok", "success": true}),
            json!({"type": "tool_result", "id": "t2", "name": "fetch", "output": "body", "success": true}),
        ];
        fixture
            .orchestrator
            .push_events(&outcome.reply_id, Some(&batch), None)
            .await
            .unwrap();
        fixture
            .orchestrator
            .push_finished(&outcome.reply_id)
            .await
            .unwrap();

        let mut observed = Vec::new();
        while let Some(event) = outcome.subscription.recv().await {
            observed.push(event);
        }
        assert_eq!(observed.len(), 3); // tool_call t2, tool_result t2, done
        match &observed[0] {
            ReplyEvent::ToolCall { id, name, .. } => {
                assert_eq!(id, "t2");
                assert_eq!(name, "fetch");
            }
            other => panic!("unexpected: {other:?}"),
        }
        match &observed[1] {
            ReplyEvent::ToolResult { id, .. } => assert_eq!(id, "t2"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(observed[2].is_terminal());
    }

    // -- S3: interrupt --

    #[tokio::test]
    async fn interrupt_mid_stream() {
        let fixture = make_fixture("sleep 30", &[]);
        let mut outcome = send_simple(&fixture, "go").await;

        fixture
            .orchestrator
            .push_events(&outcome.reply_id, Some(&text_events(&["partial"])), None)
            .await
            .unwrap();

        let found = fixture
            .orchestrator
            .interrupt(&outcome.reply_id, "u1")
            .await
            .unwrap();
        assert!(found);

        assert_eq!(
            outcome.subscription.recv().await,
            Some(ReplyEvent::Chunk {
                content: "partial".into()
            })
        );
        assert_eq!(
            outcome.subscription.recv().await,
            Some(ReplyEvent::Cancelled {
                message: "用户终止了请求".into()
            })
        );
        assert!(outcome.subscription.recv().await.unwrap().is_terminal());
        assert_eq!(outcome.subscription.recv().await, None);

        // Partial transcript persisted
        let messages = fixture
            .orchestrator
            .store()
            .list_messages(&outcome.conversation_id)
            .unwrap();
        assert_eq!(messages[1].content, "partial");

        let session = fixture
            .orchestrator
            .store()
            .get_agent_session(&outcome.reply_id)
            .unwrap()
            .unwrap();
        assert_eq!(session.status, "cancelled");

        assert_eq!(fixture.sink.cancelled.lock().len(), 1);
    }

    #[tokio::test]
    async fn interrupt_is_idempotent() {
        let fixture = make_fixture("sleep 30", &[]);
        let outcome = send_simple(&fixture, "go").await;

        assert!(fixture
            .orchestrator
            .interrupt(&outcome.reply_id, "u1")
            .await
            .unwrap());
        assert!(!fixture
            .orchestrator
            .interrupt(&outcome.reply_id, "u1")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn interrupt_by_other_user_is_rejected() {
        let fixture = make_fixture("sleep 30", &[]);
        let outcome = send_simple(&fixture, "go").await;

        let err = fixture
            .orchestrator
            .interrupt(&outcome.reply_id, "intruder")
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::UnauthorizedInterrupt(_)));

        // The reply is unaffected
        assert!(fixture
            .orchestrator
            .interrupt(&outcome.reply_id, "u1")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn interrupt_unknown_reply_reports_not_found() {
        let fixture = make_fixture("sleep 30", &[]);
        assert!(!fixture
            .orchestrator
            .interrupt("ghost", "u1")
            .await
            .unwrap());
    }

    // -- S6: crash without finished --

    #[tokio::test]
    async fn crash_without_finished_synthesizes_failure() {
        let fixture = make_fixture("sleep 2; exit 1", &[]);
        let mut outcome = send_simple(&fixture, "go").await;

        fixture
            .orchestrator
            .push_events(&outcome.reply_id, Some(&text_events(&["partial"])), None)
            .await
            .unwrap();

        assert_eq!(
            outcome.subscription.recv().await,
            Some(ReplyEvent::Chunk {
                content: "partial".into()
            })
        );
        // The child exits with code 1; the exit watcher synthesizes error + done
        match tokio::time::timeout(Duration::from_secs(10), outcome.subscription.recv())
            .await
            .unwrap()
        {
            Some(ReplyEvent::Error { message }) => assert!(message.contains("exit code 1")),
            other => panic!("expected error event, got {other:?}"),
        }
        assert!(outcome.subscription.recv().await.unwrap().is_terminal());

        let session = fixture
            .orchestrator
            .store()
            .get_agent_session(&outcome.reply_id)
            .unwrap()
            .unwrap();
        assert_eq!(session.status, "failed");

        // Partial transcript preserved
        let messages = fixture
            .orchestrator
            .store()
            .list_messages(&outcome.conversation_id)
            .unwrap();
        assert_eq!(messages[1].content, "partial");
    }

    // -- callbacks and edge cases --

    #[tokio::test]
    async fn push_events_for_unknown_reply_errors() {
        let fixture = make_fixture("sleep 30", &[]);
        let err = fixture
            .orchestrator
            .push_events("ghost", Some(&text_events(&["x"])), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownReply(_)));
    }

    #[tokio::test]
    async fn events_after_finish_are_dropped() {
        let fixture = make_fixture("sleep 30", &[]);
        let mut outcome = send_simple(&fixture, "go").await;

        fixture
            .orchestrator
            .push_finished(&outcome.reply_id)
            .await
            .unwrap();
        // Orphan callback after terminal: accepted, dropped
        fixture
            .orchestrator
            .push_events(&outcome.reply_id, Some(&text_events(&["late"])), None)
            .await
            .unwrap();

        assert!(outcome.subscription.recv().await.unwrap().is_terminal());
        assert_eq!(outcome.subscription.recv().await, None);

        // No assistant message was created for the dropped delta
        let messages = fixture
            .orchestrator
            .store()
            .list_messages(&outcome.conversation_id)
            .unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_finished_is_ignored() {
        let fixture = make_fixture("sleep 30", &[]);
        let mut outcome = send_simple(&fixture, "go").await;

        fixture
            .orchestrator
            .push_events(&outcome.reply_id, Some(&text_events(&["text"])), None)
            .await
            .unwrap();
        fixture
            .orchestrator
            .push_finished(&outcome.reply_id)
            .await
            .unwrap();
        fixture
            .orchestrator
            .push_finished(&outcome.reply_id)
            .await
            .unwrap();

        let mut terminals = 0;
        while let Some(event) = outcome.subscription.recv().await {
            if event.is_terminal() {
                terminals += 1;
            }
        }
        assert_eq!(terminals, 1);

        let messages = fixture
            .orchestrator
            .store()
            .list_messages(&outcome.conversation_id)
            .unwrap();
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn legacy_msg_payload_accumulates() {
        let fixture = make_fixture("sleep 30", &[]);
        let mut outcome = send_simple(&fixture, "go").await;

        let msg = json!({"id": "m1", "content": [
            {"type": "text", "text": "legacy"},
            {"type": "thinking", "thinking": "pondering"},
        ]});
        fixture
            .orchestrator
            .push_events(&outcome.reply_id, None, Some(&msg))
            .await
            .unwrap();
        fixture
            .orchestrator
            .push_finished(&outcome.reply_id)
            .await
            .unwrap();

        assert_eq!(
            outcome.subscription.recv().await,
            Some(ReplyEvent::Chunk {
                content: "legacy".into()
            })
        );
        assert_eq!(
            outcome.subscription.recv().await,
            Some(ReplyEvent::Thinking {
                content: "pondering".into()
            })
        );

        let messages = fixture
            .orchestrator
            .store()
            .list_messages(&outcome.conversation_id)
            .unwrap();
        assert_eq!(messages[1].content, "legacy");
    }

    #[tokio::test]
    async fn spawn_failure_unwinds_reply() {
        let mut settings = AgentSettings::default();
        settings.agent_program = "/no/such/agent".into();
        let sink = Arc::new(RecordingSink::default());
        let orchestrator = ChatOrchestrator::new(
            make_store(),
            settings,
            "http://127.0.0.1:8000".into(),
            sink,
        );

        let err = orchestrator
            .send(SendRequest {
                user_id: "u1".into(),
                conversation_id: None,
                message: "hi".into(),
                uploaded_files: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::SpawnFailed(_)));
        assert_eq!(orchestrator.tracked_reply_count(), 0);
    }

    #[tokio::test]
    async fn send_reuses_existing_conversation() {
        let fixture = make_fixture("sleep 30", &[]);
        let first = send_simple(&fixture, "first").await;
        fixture
            .orchestrator
            .push_finished(&first.reply_id)
            .await
            .unwrap();

        let second = fixture
            .orchestrator
            .send(SendRequest {
                user_id: "u1".into(),
                conversation_id: Some(first.conversation_id.clone()),
                message: "second".into(),
                uploaded_files: vec![],
            })
            .await
            .unwrap();
        assert_eq!(second.conversation_id, first.conversation_id);

        let messages = fixture
            .orchestrator
            .store()
            .list_messages(&first.conversation_id)
            .unwrap();
        // first user msg + assistant? (no text) + second user msg
        assert!(messages.iter().filter(|m| m.role == "user").count() == 2);

        fixture
            .orchestrator
            .interrupt(&second.reply_id, "u1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn send_into_foreign_conversation_is_rejected() {
        let fixture = make_fixture("sleep 30", &[]);
        let outcome = send_simple(&fixture, "mine").await;

        let err = fixture
            .orchestrator
            .send(SendRequest {
                user_id: "intruder".into(),
                conversation_id: Some(outcome.conversation_id.clone()),
                message: "theirs".into(),
                uploaded_files: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ForbiddenConversation(_)));

        fixture
            .orchestrator
            .interrupt(&outcome.reply_id, "u1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn title_truncates_to_fifty_chars() {
        let fixture = make_fixture("sleep 30", &[]);
        let long = "x".repeat(120);
        let outcome = send_simple(&fixture, &long).await;

        let conversation = fixture
            .orchestrator
            .store()
            .get_conversation(&outcome.conversation_id)
            .unwrap()
            .unwrap();
        assert_eq!(conversation.title.chars().count(), 50);

        fixture
            .orchestrator
            .interrupt(&outcome.reply_id, "u1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_conversation_stops_all_replies() {
        let fixture = make_fixture("sleep 30", &[]);
        let first = send_simple(&fixture, "a").await;
        let second = fixture
            .orchestrator
            .send(SendRequest {
                user_id: "u1".into(),
                conversation_id: Some(first.conversation_id.clone()),
                message: "b".into(),
                uploaded_files: vec![],
            })
            .await
            .unwrap();

        let cancelled = fixture
            .orchestrator
            .cancel_conversation(&first.conversation_id)
            .await;
        assert_eq!(cancelled, 2);

        for reply_id in [&first.reply_id, &second.reply_id] {
            let session = fixture
                .orchestrator
                .store()
                .get_agent_session(reply_id)
                .unwrap()
                .unwrap();
            assert_eq!(session.status, "cancelled");
        }
    }

    #[tokio::test]
    async fn broadcast_sink_observes_every_event() {
        let fixture = make_fixture("sleep 30", &[]);
        let outcome = send_simple(&fixture, "go").await;

        fixture
            .orchestrator
            .push_events(
                &outcome.reply_id,
                Some(&text_events(&["a", "b"])),
                None,
            )
            .await
            .unwrap();
        fixture
            .orchestrator
            .push_finished(&outcome.reply_id)
            .await
            .unwrap();

        let pushes = fixture.sink.pushes.lock();
        assert_eq!(pushes.len(), 2);
        assert!(pushes.iter().all(|(c, r, t)| {
            c == &outcome.conversation_id && r == &outcome.reply_id && t == "chunk"
        }));
        drop(pushes);

        assert_eq!(fixture.sink.finished.lock().len(), 1);
        // replying_state: true on send, false on finish
        let states = fixture.sink.states.lock();
        assert_eq!(states.first().map(|(r, _)| *r), Some(true));
        assert_eq!(states.last().map(|(r, _)| *r), Some(false));
    }

    #[tokio::test]
    async fn testcase_extraction_happens_once_per_reply() {
        let fixture = make_fixture("sleep 30", &[]);
        let mut outcome = send_simple(&fixture, "go").await;

        let padding = "x".repeat(110);
        let blob = format!(
            "{padding} {{\"status\": \"success\", \"count\": 1, \"testcases\": [{{\"name\": \"t\"}}]}}"
        );
        fixture
            .orchestrator
            .push_events(
                &outcome.reply_id,
                Some(&text_events(&[&blob, &blob])),
                None,
            )
            .await
            .unwrap();
        fixture
            .orchestrator
            .push_finished(&outcome.reply_id)
            .await
            .unwrap();

        let mut testcase_events = 0;
        while let Some(event) = outcome.subscription.recv().await {
            if event.event_type() == "testcases" {
                testcase_events += 1;
            }
        }
        assert_eq!(testcase_events, 1);
    }

    #[tokio::test]
    async fn shutdown_cancels_everything() {
        let fixture = make_fixture("sleep 30", &[]);
        let first = send_simple(&fixture, "a").await;

        fixture.orchestrator.shutdown().await;

        let session = fixture
            .orchestrator
            .store()
            .get_agent_session(&first.reply_id)
            .unwrap()
            .unwrap();
        assert_eq!(session.status, "cancelled");
        assert_eq!(fixture.orchestrator.running_agent_count(), 0);
    }

    #[test]
    fn query_payload_shape() {
        let query = build_query_payload("u1", "c1", &["spec.docx".into()], "hello");
        let parsed: Value = serde_json::from_str(&query).unwrap();
        let blocks = parsed.as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        let context = blocks[0]["text"].as_str().unwrap();
        assert!(context.starts_with("[SYSTEM CONTEXT]"));
        assert!(context.contains("user_id: u1"));
        assert!(context.contains("conversation_id: c1"));
        assert!(context.contains("uploaded_files: spec.docx"));
        assert!(context.ends_with("[/SYSTEM CONTEXT]"));
        assert_eq!(blocks[1]["text"], "hello");
    }

    #[test]
    fn query_payload_without_files() {
        let query = build_query_payload("u1", "c1", &[], "hello");
        assert!(query.contains("uploaded_files: (none)"));
    }
}
