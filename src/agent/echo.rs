//! `echo` runner: an in-process, deterministic stand-in for the real
//! coding-agent session. Every `prompt`/`followUp`/`steer` call immediately
//! emits the canonical turn sequence (`user_message_start` ->
//! `assistant_message_end`) with the input text echoed back as the output,
//! uppercased, so correlation tests can assert on recognizable text.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{AgentEvent, AgentSession, AgentSessionFactory, ShareResult, ThreadRuntimeState};

pub struct EchoSessionFactory;

#[async_trait]
impl AgentSessionFactory for EchoSessionFactory {
    async fn create(
        &self,
        _thread_key: &str,
        session_file_path: &str,
    ) -> anyhow::Result<Arc<dyn AgentSession>> {
        Ok(Arc::new(EchoSession {
            subscribers: Mutex::new(Vec::new()),
            runtime: Mutex::new(ThreadRuntimeState {
                provider: Some("echo".to_string()),
                model: Some("echo-1".to_string()),
                thinking_level: Some("none".to_string()),
                session_id: Some(session_file_path.to_string()),
            }),
        }))
    }
}

pub struct EchoSession {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<AgentEvent>>>,
    runtime: Mutex<ThreadRuntimeState>,
}

impl EchoSession {
    fn broadcast(&self, event: AgentEvent) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn emit_turn(&self, text: &str) {
        let runtime = self.runtime.lock().unwrap().clone();
        self.broadcast(AgentEvent::TurnStart);
        self.broadcast(AgentEvent::MessageStart {
            role: "user".to_string(),
            content: text.to_string(),
        });
        self.broadcast(AgentEvent::AssistantTextDelta {
            delta: text.to_uppercase(),
        });
        self.broadcast(AgentEvent::MessageEnd {
            role: "assistant".to_string(),
            content: text.to_uppercase(),
            provider: runtime.provider,
            model: runtime.model,
            stop_reason: Some("end_turn".to_string()),
        });
        self.broadcast(AgentEvent::TurnEnd);
    }
}

#[async_trait]
impl AgentSession for EchoSession {
    async fn prompt(&self, text: &str) -> anyhow::Result<()> {
        self.broadcast(AgentEvent::AgentStart);
        self.emit_turn(text);
        Ok(())
    }

    async fn follow_up(&self, text: &str) -> anyhow::Result<()> {
        self.emit_turn(text);
        Ok(())
    }

    async fn steer(&self, text: &str) -> anyhow::Result<()> {
        self.emit_turn(text);
        Ok(())
    }

    async fn set_model(&self, provider: &str, model_id: &str) -> anyhow::Result<()> {
        let mut runtime = self.runtime.lock().unwrap();
        runtime.provider = Some(provider.to_string());
        runtime.model = Some(model_id.to_string());
        Ok(())
    }

    async fn set_thinking_level(&self, level: &str) -> anyhow::Result<()> {
        self.runtime.lock().unwrap().thinking_level = Some(level.to_string());
        Ok(())
    }

    async fn abort(&self) -> anyhow::Result<()> {
        self.broadcast(AgentEvent::AgentEnd);
        Ok(())
    }

    async fn share(&self) -> anyhow::Result<ShareResult> {
        Ok(ShareResult {
            gist_url: "https://gist.example/echo".to_string(),
            share_url: "https://share.example/echo".to_string(),
        })
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prompt_emits_matching_turn() {
        let factory = EchoSessionFactory;
        let session = factory.create("cli:default", "/tmp/session").await.unwrap();
        let mut rx = session.subscribe();
        session.prompt("hello").await.unwrap();

        let mut saw_start = false;
        let mut saw_end = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                AgentEvent::MessageStart { content, .. } if content == "hello" => saw_start = true,
                AgentEvent::MessageEnd { content, .. } if content == "HELLO" => saw_end = true,
                _ => {}
            }
        }
        assert!(saw_start);
        assert!(saw_end);
    }
}
