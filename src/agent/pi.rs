//! `pi` runner: drives a long-lived coding-agent subprocess and translates
//! its newline-delimited JSON event stream into [`AgentEvent`]s.
//!
//! The subprocess contract: commands are written to its stdin as one JSON
//! object per line (`{"type":"prompt","text":"..."}`, `{"type":"followUp",...}`,
//! `{"type":"steer",...}`, `{"type":"setModel",...}`,
//! `{"type":"setThinkingLevel",...}`, `{"type":"abort"}`), and it answers on
//! stdout with one JSON event object per line matching the shapes in
//! [`AgentEvent`]. This mirrors how a CLI-driven coding agent is spawned and
//! piped elsewhere in this codebase, generalized from a single request/reply
//! call into a standing session.

use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::{AgentEvent, AgentSession, AgentSessionFactory, ShareResult, ThreadRuntimeState};

pub struct PiSessionFactory {
    /// Path or bare command name of the pi binary, e.g. `pi` or
    /// `/usr/local/bin/pi`.
    pub command: String,
}

impl PiSessionFactory {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl AgentSessionFactory for PiSessionFactory {
    async fn create(
        &self,
        thread_key: &str,
        session_file_path: &str,
    ) -> anyhow::Result<Arc<dyn AgentSession>> {
        let mut cmd = Command::new(&self.command);
        cmd.arg("--session-file")
            .arg(session_file_path)
            .arg("--thread-key")
            .arg(thread_key)
            .arg("--event-format")
            .arg("jsonl")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                anyhow::anyhow!("pi runner not found at '{}': {e}", self.command)
            } else {
                anyhow::anyhow!("failed to spawn pi runner: {e}")
            }
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("pi runner did not expose stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("pi runner did not expose stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("pi runner did not expose stderr"))?;

        let session = Arc::new(PiSession {
            stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            runtime: Arc::new(Mutex::new(ThreadRuntimeState {
                session_id: Some(session_file_path.to_string()),
                ..Default::default()
            })),
            child: Arc::new(tokio::sync::Mutex::new(Some(child))),
            share_result: Arc::new(tokio::sync::Notify::new()),
            last_share_result: Arc::new(Mutex::new(None)),
        });

        session.clone().spawn_stdout_reader(stdout);
        session.clone().spawn_stderr_logger(stderr, thread_key.to_string());

        Ok(session)
    }
}

pub struct PiSession {
    stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<AgentEvent>>>>,
    runtime: Arc<Mutex<ThreadRuntimeState>>,
    child: Arc<tokio::sync::Mutex<Option<Child>>>,
    share_result: Arc<tokio::sync::Notify>,
    last_share_result: Arc<Mutex<Option<ShareResult>>>,
}

impl PiSession {
    async fn write_command(&self, value: serde_json::Value) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(&value)?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    fn broadcast(&self, event: AgentEvent) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn spawn_stdout_reader(self: Arc<Self>, stdout: tokio::process::ChildStdout) {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if self.try_handle_share_result(&line) {
                            continue;
                        }
                        match serde_json::from_str::<AgentEvent>(&line) {
                            Ok(event) => {
                                self.apply_runtime_update(&event);
                                self.broadcast(event);
                            }
                            Err(e) => {
                                warn!(err = %e, raw = %line, "failed to parse pi event line");
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("pi runner stdout closed");
                        self.broadcast(AgentEvent::AgentEnd);
                        break;
                    }
                    Err(e) => {
                        error!(err = %e, "error reading pi runner stdout");
                        break;
                    }
                }
            }
        });
    }

    fn spawn_stderr_logger(self: Arc<Self>, stderr: tokio::process::ChildStderr, thread_key: String) {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(%thread_key, pi_stderr = %line, "pi runner stderr");
            }
        });
    }

    fn try_handle_share_result(&self, line: &str) -> bool {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
            return false;
        };
        if value.get("type").and_then(|t| t.as_str()) != Some("share_result") {
            return false;
        }
        let gist_url = value.get("gist_url").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let share_url = value.get("share_url").and_then(|v| v.as_str()).unwrap_or("").to_string();
        *self.last_share_result.lock().unwrap() = Some(ShareResult { gist_url, share_url });
        self.share_result.notify_waiters();
        true
    }

    fn apply_runtime_update(&self, event: &AgentEvent) {
        if let AgentEvent::MessageEnd { provider, model, .. } = event {
            let mut runtime = self.runtime.lock().unwrap();
            if provider.is_some() {
                runtime.provider = provider.clone();
            }
            if model.is_some() {
                runtime.model = model.clone();
            }
        }
    }
}

#[async_trait]
impl AgentSession for PiSession {
    async fn prompt(&self, text: &str) -> anyhow::Result<()> {
        self.write_command(serde_json::json!({"type": "prompt", "text": text}))
            .await
    }

    async fn follow_up(&self, text: &str) -> anyhow::Result<()> {
        self.write_command(serde_json::json!({"type": "followUp", "text": text}))
            .await
    }

    async fn steer(&self, text: &str) -> anyhow::Result<()> {
        self.write_command(serde_json::json!({"type": "steer", "text": text}))
            .await
    }

    async fn set_model(&self, provider: &str, model_id: &str) -> anyhow::Result<()> {
        self.write_command(
            serde_json::json!({"type": "setModel", "provider": provider, "model_id": model_id}),
        )
        .await?;
        let mut runtime = self.runtime.lock().unwrap();
        runtime.provider = Some(provider.to_string());
        runtime.model = Some(model_id.to_string());
        Ok(())
    }

    async fn set_thinking_level(&self, level: &str) -> anyhow::Result<()> {
        self.write_command(serde_json::json!({"type": "setThinkingLevel", "level": level}))
            .await?;
        self.runtime.lock().unwrap().thinking_level = Some(level.to_string());
        Ok(())
    }

    async fn abort(&self) -> anyhow::Result<()> {
        self.write_command(serde_json::json!({"type": "abort"})).await
    }

    async fn share(&self) -> anyhow::Result<ShareResult> {
        *self.last_share_result.lock().unwrap() = None;
        let wait = self.share_result.notified();
        self.write_command(serde_json::json!({"type": "share"})).await?;

        tokio::time::timeout(std::time::Duration::from_secs(30), wait)
            .await
            .map_err(|_| anyhow::anyhow!("pi runner did not report a share result in time"))?;

        self.last_share_result
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("pi runner did not report a share result"))
    }

    fn runtime_state(&self) -> ThreadRuntimeState {
        self.runtime.lock().unwrap().clone()
    }

    fn session_id(&self) -> String {
        self.runtime
            .lock()
            .unwrap()
            .session_id
            .clone()
            .unwrap_or_default()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<AgentEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}

impl Drop for PiSession {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(mut child) = guard.take() {
                let _ = child.start_kill();
            }
        }
    }
}
