//! Agent subprocess supervision.
//!
//! Spawns one agent process per reply, tracks it in a process map plus a
//! conversation index, and terminates cooperatively: SIGTERM first, SIGKILL
//! after a grace period. The child's stdio is detached — its only channel
//! back to the orchestrator is the HTTP callback.
//!
//! Exits are reported through an [`ExitNotice`] channel; the orchestrator
//! consumes it and synthesizes the terminal `failed` event when a child dies
//! without a finished signal.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::RuntimeError;

/// Grace between SIGTERM and SIGKILL on a user interrupt.
const SOFT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Grace between SIGTERM and SIGKILL during process shutdown.
const SHUTDOWN_KILL_GRACE: Duration = Duration::from_secs(3);

/// Everything the agent child is invoked with.
#[derive(Clone, Debug)]
pub struct SpawnParams {
    /// Conversation the reply belongs to.
    pub conversation_id: String,
    /// The reply id.
    pub reply_id: String,
    /// Serialized query payload (JSON array of content blocks).
    pub query: String,
    /// Base URL the child posts its callbacks to.
    pub studio_url: String,
    /// LLM provider name.
    pub llm_provider: String,
    /// Model name.
    pub model_name: String,
    /// Provider API key.
    pub api_key: String,
    /// Agent workspace directory.
    pub workspace: String,
    /// `direct` or `coordinator`.
    pub mode: String,
}

/// Notification that a supervised child exited.
#[derive(Debug)]
pub struct ExitNotice {
    /// Reply the child was serving.
    pub reply_id: String,
    /// Conversation the reply belongs to.
    pub conversation_id: String,
    /// Exit code, if the child exited normally.
    pub exit_code: Option<i32>,
}

struct ProcessEntry {
    pid: u32,
    conversation_id: String,
    terminated: bool,
}

/// Supervises agent subprocesses.
pub struct AgentSupervisor {
    program: String,
    processes: Mutex<HashMap<String, ProcessEntry>>,
    by_conversation: Mutex<HashMap<String, HashSet<String>>>,
    exit_tx: mpsc::UnboundedSender<ExitNotice>,
}

impl AgentSupervisor {
    /// Create a supervisor for the given agent executable.
    ///
    /// Returns the supervisor and the exit-notice receiver; the caller owns
    /// the receive loop.
    #[must_use]
    pub fn new(program: String) -> (Arc<Self>, mpsc::UnboundedReceiver<ExitNotice>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                program,
                processes: Mutex::new(HashMap::new()),
                by_conversation: Mutex::new(HashMap::new()),
                exit_tx,
            }),
            exit_rx,
        )
    }

    /// Fork the agent child for a reply.
    ///
    /// On success the child is tracked in the process map and conversation
    /// index, and an exit watcher reports through the notice channel.
    pub fn spawn(self: &Arc<Self>, params: &SpawnParams) -> Result<u32, RuntimeError> {
        let mut cmd = tokio::process::Command::new(&self.program);
        let _ = cmd
            .arg("--query")
            .arg(&params.query)
            .arg("--llmProvider")
            .arg(&params.llm_provider)
            .arg("--modelName")
            .arg(&params.model_name)
            .arg("--apiKey")
            .arg(&params.api_key)
            .arg("--workspace")
            .arg(&params.workspace)
            .arg("--conversation_id")
            .arg(&params.conversation_id)
            .arg("--reply_id")
            .arg(&params.reply_id)
            .arg("--studio_url")
            .arg(&params.studio_url)
            .arg("--mode")
            .arg(&params.mode)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(RuntimeError::SpawnFailed)?;
        let pid = child.id().unwrap_or_default();

        {
            let mut procs = self.processes.lock();
            let _ = procs.insert(
                params.reply_id.clone(),
                ProcessEntry {
                    pid,
                    conversation_id: params.conversation_id.clone(),
                    terminated: false,
                },
            );
        }
        {
            let mut index = self.by_conversation.lock();
            let _ = index
                .entry(params.conversation_id.clone())
                .or_default()
                .insert(params.reply_id.clone());
        }

        metrics::counter!("agent_spawns_total").increment(1);
        info!(
            reply_id = params.reply_id,
            conversation_id = params.conversation_id,
            pid,
            "spawned agent process"
        );

        // Exit watcher: removes bookkeeping, then reports. The orchestrator
        // decides whether the exit needs a synthetic terminal event.
        let supervisor = Arc::clone(self);
        let reply_id = params.reply_id.clone();
        let conversation_id = params.conversation_id.clone();
        let _ = tokio::spawn(async move {
            let status = child.wait().await;
            let exit_code = status.as_ref().ok().and_then(std::process::ExitStatus::code);
            debug!(reply_id, ?exit_code, "agent process exited");
            metrics::counter!("agent_exits_total").increment(1);

            supervisor.forget(&reply_id, &conversation_id);
            let _ = supervisor.exit_tx.send(ExitNotice {
                reply_id,
                conversation_id,
                exit_code,
            });
        });

        Ok(pid)
    }

    /// Soft-stop a reply's child; hard kill after [`SOFT_KILL_GRACE`].
    ///
    /// Returns whether a live (not yet terminated) child was found.
    /// Idempotent: repeated calls are no-ops.
    pub fn terminate(self: &Arc<Self>, reply_id: &str) -> bool {
        let pid = {
            let mut procs = self.processes.lock();
            match procs.get_mut(reply_id) {
                Some(entry) if !entry.terminated => {
                    entry.terminated = true;
                    entry.pid
                }
                _ => return false,
            }
        };

        info!(reply_id, pid, "terminating agent process");
        send_signal(pid, libc::SIGTERM);

        let supervisor = Arc::clone(self);
        let reply_id = reply_id.to_string();
        let _ = tokio::spawn(async move {
            tokio::time::sleep(SOFT_KILL_GRACE).await;
            if let Some(pid) = supervisor.pid_of(&reply_id) {
                warn!(reply_id, pid, "agent ignored SIGTERM, sending SIGKILL");
                send_signal(pid, libc::SIGKILL);
            }
        });
        true
    }

    /// Terminate every live reply of a conversation. Returns the reply ids
    /// that had a live child.
    pub fn terminate_conversation(self: &Arc<Self>, conversation_id: &str) -> Vec<String> {
        let reply_ids = self.replies_for_conversation(conversation_id);
        reply_ids
            .into_iter()
            .filter(|reply_id| self.terminate(reply_id))
            .collect()
    }

    /// Whether a child exists for the reply, has not exited, and has not
    /// been asked to stop.
    #[must_use]
    pub fn is_running(&self, reply_id: &str) -> bool {
        self.processes
            .lock()
            .get(reply_id)
            .is_some_and(|entry| !entry.terminated)
    }

    /// Live reply ids for a conversation.
    #[must_use]
    pub fn replies_for_conversation(&self, conversation_id: &str) -> Vec<String> {
        self.by_conversation
            .lock()
            .get(conversation_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of tracked children.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.processes.lock().len()
    }

    /// Terminate every live child: SIGTERM, wait [`SHUTDOWN_KILL_GRACE`],
    /// SIGKILL the survivors. For process shutdown.
    pub async fn cleanup(&self) {
        let targets: Vec<(String, u32)> = {
            let mut procs = self.processes.lock();
            procs
                .iter_mut()
                .map(|(reply_id, entry)| {
                    entry.terminated = true;
                    (reply_id.clone(), entry.pid)
                })
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        info!(count = targets.len(), "shutting down agent processes");
        for (_, pid) in &targets {
            send_signal(*pid, libc::SIGTERM);
        }

        tokio::time::sleep(SHUTDOWN_KILL_GRACE).await;
        for (reply_id, pid) in &targets {
            if self.processes.lock().contains_key(reply_id) {
                send_signal(*pid, libc::SIGKILL);
            }
        }
    }

    fn pid_of(&self, reply_id: &str) -> Option<u32> {
        self.processes.lock().get(reply_id).map(|entry| entry.pid)
    }

    fn forget(&self, reply_id: &str, conversation_id: &str) {
        let _ = self.processes.lock().remove(reply_id);
        let mut index = self.by_conversation.lock();
        if let Some(set) = index.get_mut(conversation_id) {
            let _ = set.remove(reply_id);
            if set.is_empty() {
                let _ = index.remove(conversation_id);
            }
        }
    }
}

/// Deliver a signal to a process.
#[allow(clippy::cast_possible_wrap)]
fn send_signal(pid: u32, signal: i32) {
    // SAFETY: kill(2) with a valid pid and signal number has no memory-safety
    // concerns; a failure (the process already exited) is reported through
    // the return value, which we only log.
    let ret = unsafe { libc::kill(pid as i32, signal) };
    if ret != 0 {
        debug!(pid, signal, "kill(2) returned nonzero (process likely gone)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn write_stub_agent(dir: &Path, body: &str) -> String {
        let path = dir.join("agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_str().unwrap().to_string()
    }

    fn params(reply_id: &str, conversation_id: &str) -> SpawnParams {
        SpawnParams {
            conversation_id: conversation_id.into(),
            reply_id: reply_id.into(),
            query: "[]".into(),
            studio_url: "http://127.0.0.1:0".into(),
            llm_provider: "dashscope".into(),
            model_name: "qwen3-max-preview".into(),
            api_key: String::new(),
            workspace: ".".into(),
            mode: "direct".into(),
        }
    }

    async fn wait_exit(rx: &mut mpsc::UnboundedReceiver<ExitNotice>) -> ExitNotice {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for exit notice")
            .expect("exit channel closed")
    }

    #[tokio::test]
    async fn spawn_tracks_and_exit_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let program = write_stub_agent(dir.path(), "exit 0");
        let (sup, mut rx) = AgentSupervisor::new(program);

        let pid = sup.spawn(&params("r1", "c1")).unwrap();
        assert!(pid > 0);

        let notice = wait_exit(&mut rx).await;
        assert_eq!(notice.reply_id, "r1");
        assert_eq!(notice.conversation_id, "c1");
        assert_eq!(notice.exit_code, Some(0));

        // Bookkeeping cleared before the notice was sent
        assert!(!sup.is_running("r1"));
        assert_eq!(sup.active_count(), 0);
        assert!(sup.replies_for_conversation("c1").is_empty());
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let program = write_stub_agent(dir.path(), "exit 3");
        let (sup, mut rx) = AgentSupervisor::new(program);

        sup.spawn(&params("r1", "c1")).unwrap();
        let notice = wait_exit(&mut rx).await;
        assert_eq!(notice.exit_code, Some(3));
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let (sup, _rx) = AgentSupervisor::new("/no/such/program".into());
        let err = sup.spawn(&params("r1", "c1")).unwrap_err();
        assert!(matches!(err, RuntimeError::SpawnFailed(_)));
        assert_eq!(sup.active_count(), 0);
    }

    #[tokio::test]
    async fn is_running_while_child_lives() {
        let dir = tempfile::tempdir().unwrap();
        let program = write_stub_agent(dir.path(), "sleep 30");
        let (sup, mut rx) = AgentSupervisor::new(program);

        sup.spawn(&params("r1", "c1")).unwrap();
        assert!(sup.is_running("r1"));

        assert!(sup.terminate("r1"));
        // Terminated children no longer count as running even before exit
        assert!(!sup.is_running("r1"));

        let notice = wait_exit(&mut rx).await;
        assert_eq!(notice.reply_id, "r1");
        // Killed by signal → no exit code
        assert_eq!(notice.exit_code, None);
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let program = write_stub_agent(dir.path(), "sleep 30");
        let (sup, mut rx) = AgentSupervisor::new(program);

        sup.spawn(&params("r1", "c1")).unwrap();
        assert!(sup.terminate("r1"));
        assert!(!sup.terminate("r1"));
        let _ = wait_exit(&mut rx).await;
    }

    #[tokio::test]
    async fn terminate_unknown_reply_is_false() {
        let (sup, _rx) = AgentSupervisor::new("true".into());
        assert!(!sup.terminate("ghost"));
    }

    #[tokio::test]
    async fn conversation_index_tracks_multiple_replies() {
        let dir = tempfile::tempdir().unwrap();
        let program = write_stub_agent(dir.path(), "sleep 30");
        let (sup, mut rx) = AgentSupervisor::new(program);

        sup.spawn(&params("r1", "c1")).unwrap();
        sup.spawn(&params("r2", "c1")).unwrap();
        sup.spawn(&params("r3", "c2")).unwrap();

        let mut c1 = sup.replies_for_conversation("c1");
        c1.sort();
        assert_eq!(c1, vec!["r1", "r2"]);

        let stopped = sup.terminate_conversation("c1");
        assert_eq!(stopped.len(), 2);
        assert!(sup.is_running("r3"));

        let _ = wait_exit(&mut rx).await;
        let _ = wait_exit(&mut rx).await;
        assert!(sup.replies_for_conversation("c1").is_empty());

        sup.terminate("r3");
        let _ = wait_exit(&mut rx).await;
    }

    #[tokio::test]
    async fn sigterm_resistant_child_gets_hard_killed_on_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        // Trap and ignore SIGTERM so only SIGKILL works
        let program = write_stub_agent(dir.path(), "trap '' TERM\nsleep 60");
        let (sup, mut rx) = AgentSupervisor::new(program);

        sup.spawn(&params("r1", "c1")).unwrap();
        // Give the shell a moment to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        sup.cleanup().await;
        let notice = wait_exit(&mut rx).await;
        assert_eq!(notice.reply_id, "r1");
        assert_eq!(sup.active_count(), 0);
    }
}
