//! Thread Run Controller (spec §4.4): owns one agent session and serializes
//! runs onto it, correlating streamed assistant turns back to the run that
//! triggered them.
//!
//! State: two FIFO queues (`follow_up_queue`, `steer_queue`) plus a
//! `current_assistant_expectation` slot. `submit` appends the run to the
//! queue matching its delivery mode, kicks off the first prompt or a
//! follow-up/steer call, and returns once the matching assistant turn ends.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::agent::{AgentEvent, AgentSession, ShareResult, ThreadRuntimeState};
use crate::model::{DeliveryMode, Run, RunOutput};

struct QueuedRun {
    run: Run,
    responder: oneshot::Sender<Result<RunOutput, String>>,
}

struct State {
    follow_up_queue: VecDeque<QueuedRun>,
    steer_queue: VecDeque<QueuedRun>,
    current: Option<QueuedRun>,
    prompted: bool,
}

pub struct ThreadRunController {
    session: Arc<dyn AgentSession>,
    state: Mutex<State>,
}

impl ThreadRunController {
    pub fn new(session: Arc<dyn AgentSession>) -> Self {
        Self {
            session,
            state: Mutex::new(State {
                follow_up_queue: VecDeque::new(),
                steer_queue: VecDeque::new(),
                current: None,
                prompted: false,
            }),
        }
    }

    /// Spawns the event-consuming loop. Must be called once, immediately
    /// after construction, from `RunExecutor`; kept out of `new` so the
    /// Arc exists before the loop captures a clone of it.
    pub fn spawn_event_loop(self: &Arc<Self>) {
        let this = self.clone();
        let mut events = this.session.subscribe();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                this.handle_event(event);
            }
        });
    }

    pub async fn submit(&self, run: Run) -> anyhow::Result<RunOutput> {
        let (tx, rx) = oneshot::channel();
        let delivery_mode = run.delivery_mode;
        let input_text = run.input_text.clone();

        let is_first_prompt = {
            let mut state = self.state.lock().unwrap();
            let queued = QueuedRun { run, responder: tx };
            match delivery_mode {
                DeliveryMode::FollowUp => state.follow_up_queue.push_back(queued),
                DeliveryMode::Steer => state.steer_queue.push_back(queued),
            }
            let first = !state.prompted;
            state.prompted = true;
            first
        };

        if is_first_prompt {
            self.session.prompt(&input_text).await?;
        } else {
            match delivery_mode {
                DeliveryMode::FollowUp => self.session.follow_up(&input_text).await?,
                DeliveryMode::Steer => self.session.steer(&input_text).await?,
            }
        }

        match rx.await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(message)) => Err(anyhow::anyhow!(message)),
            Err(_) => Err(anyhow::anyhow!("run response channel dropped")),
        }
    }

    fn handle_event(&self, event: AgentEvent) {
        match event {
            AgentEvent::MessageStart { role, content } if role == "user" => {
                self.on_user_message_start(&content);
            }
            AgentEvent::MessageEnd {
                role,
                content,
                provider,
                model,
                ..
            } if role == "assistant" => {
                self.on_assistant_message_end(content, provider, model);
            }
            AgentEvent::AgentEnd => {
                self.on_agent_end();
            }
            _ => {}
        }
    }

    /// Pops the matching queued run from the head of whichever queue's
    /// front entry's input equals `text`, promoting it to the current
    /// expectation. Steer takes priority when both queues could match —
    /// steer exists precisely to interrupt the follow-up queue's order.
    fn on_user_message_start(&self, text: &str) {
        let mut state = self.state.lock().unwrap();
        let popped = if matches_front(&state.steer_queue, text) {
            state.steer_queue.pop_front()
        } else if matches_front(&state.follow_up_queue, text) {
            state.follow_up_queue.pop_front()
        } else {
            None
        };

        match popped {
            Some(queued) => {
                state.current = Some(queued);
            }
            None => {
                warn!(text, "user_message_start did not match any queued run");
            }
        }
    }

    fn on_assistant_message_end(&self, text: String, provider: Option<String>, model: Option<String>) {
        let current = {
            let mut state = self.state.lock().unwrap();
            state.current.take()
        };

        let Some(queued) = current else {
            debug!("assistant_message_end with no current expectation");
            return;
        };

        let delivery_mode = queued.run.delivery_mode;
        let output = RunOutput {
            kind: "message".to_string(),
            text,
            provider,
            model,
            delivery_mode: delivery_mode.as_str().to_string(),
        };
        let _ = queued.responder.send(Ok(output));
    }

    fn on_agent_end(&self) {
        let mut state = self.state.lock().unwrap();
        let mut undelivered = Vec::new();
        if let Some(current) = state.current.take() {
            undelivered.push(current);
        }
        undelivered.extend(state.follow_up_queue.drain(..));
        undelivered.extend(state.steer_queue.drain(..));
        drop(state);

        for queued in undelivered {
            let _ = queued
                .responder
                .send(Err("agent ended before message delivery".to_string()));
        }
    }

    pub fn has_pending_work(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.current.is_some() || !state.follow_up_queue.is_empty() || !state.steer_queue.is_empty()
    }

    pub async fn abort(&self) -> anyhow::Result<()> {
        self.session.abort().await
    }

    pub async fn share(&self) -> anyhow::Result<ShareResult> {
        self.session.share().await
    }

    pub fn runtime_state(&self) -> ThreadRuntimeState {
        self.session.runtime_state()
    }

    pub fn session_id(&self) -> String {
        self.session.session_id()
    }

    pub async fn set_model(&self, provider: &str, model_id: &str) -> anyhow::Result<()> {
        self.session.set_model(provider, model_id).await
    }

    pub async fn set_thinking_level(&self, level: &str) -> anyhow::Result<()> {
        self.session.set_thinking_level(level).await
    }
}

fn matches_front(queue: &VecDeque<QueuedRun>, text: &str) -> bool {
    queue.front().map(|q| q.run.input_text == text).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::echo::EchoSessionFactory;
    use crate::agent::AgentSessionFactory;
    use crate::model::ThreadKey;

    async fn make_controller() -> Arc<ThreadRunController> {
        let factory = EchoSessionFactory;
        let session = factory.create("cli:default", "/tmp/x").await.unwrap();
        let controller = Arc::new(ThreadRunController::new(session));
        controller.spawn_event_loop();
        controller
    }

    fn make_run(input_text: &str, delivery_mode: DeliveryMode) -> Run {
        Run::new_running(
            uuid::Uuid::new_v4().to_string(),
            "cli".to_string(),
            ThreadKey::cli_default(),
            None,
            delivery_mode,
            input_text.to_string(),
            vec![],
        )
    }

    #[tokio::test]
    async fn sequential_followups_resolve_in_order() {
        let controller = make_controller().await;
        let out1 = controller.submit(make_run("first", DeliveryMode::FollowUp)).await.unwrap();
        assert_eq!(out1.text, "FIRST");
        let out2 = controller.submit(make_run("second", DeliveryMode::FollowUp)).await.unwrap();
        assert_eq!(out2.text, "SECOND");
    }
}
