//! Scripted in-memory transport for lifecycle and gateway tests.

use super::{
    Chat, ClientInfo, Transport, TransportEvent, TransportEventSender, TransportFactory,
    TransportOptions,
};
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// What the next created instance does when `initialize` is called.
#[derive(Clone)]
pub enum InitScript {
    /// Emit these events, then resolve successfully.
    Succeed(Vec<TransportEvent>),
    Fail(String),
    /// Never resolve, not even after `destroy`.
    Hang,
    /// Fail as soon as the instance is destroyed.
    UntilDestroyed,
    /// Resolve successfully once notified.
    Wait(Arc<Notify>),
}

#[derive(Default)]
struct FakeState {
    scripts: VecDeque<InitScript>,
    created: usize,
    live: usize,
    max_live: usize,
    destroyed: usize,
    state_polls: usize,
    sends: Vec<(String, String)>,
    events: Option<TransportEventSender>,
    fail_create: bool,
    fail_destroy: bool,
    chats: Vec<Chat>,
    info: Option<ClientInfo>,
}

/// Shared handle for scripting and inspecting fake transports.
#[derive(Clone, Default)]
pub struct FakeControl {
    state: Arc<Mutex<FakeState>>,
}

impl FakeControl {
    pub fn push_script(&self, script: InitScript) {
        self.state.lock().scripts.push_back(script);
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.state.lock().fail_create = fail;
    }

    pub fn set_fail_destroy(&self, fail: bool) {
        self.state.lock().fail_destroy = fail;
    }

    pub fn set_chats(&self, chats: Vec<Chat>) {
        self.state.lock().chats = chats;
    }

    pub fn set_info(&self, info: ClientInfo) {
        self.state.lock().info = Some(info);
    }

    /// Emit an event from the most recently created instance.
    pub fn emit(&self, event: TransportEvent) {
        if let Some(tx) = self.state.lock().events.as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn created(&self) -> usize {
        self.state.lock().created
    }

    pub fn live(&self) -> usize {
        self.state.lock().live
    }

    pub fn max_live(&self) -> usize {
        self.state.lock().max_live
    }

    pub fn destroyed(&self) -> usize {
        self.state.lock().destroyed
    }

    pub fn state_polls(&self) -> usize {
        self.state.lock().state_polls
    }

    pub fn sends(&self) -> Vec<(String, String)> {
        self.state.lock().sends.clone()
    }

    pub fn factory(&self) -> FakeFactory {
        FakeFactory {
            control: self.clone(),
        }
    }
}

pub struct FakeFactory {
    control: FakeControl,
}

#[async_trait]
impl TransportFactory for FakeFactory {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create(
        &self,
        _options: &TransportOptions,
        events: TransportEventSender,
    ) -> Result<Arc<dyn Transport>> {
        let mut state = self.control.state.lock();
        if state.fail_create {
            bail!("fake transport refused to start");
        }
        state.created += 1;
        state.live += 1;
        state.max_live = state.max_live.max(state.live);
        state.events = Some(events.clone());
        let script = state
            .scripts
            .pop_front()
            .unwrap_or(InitScript::Succeed(Vec::new()));

        Ok(Arc::new(FakeTransport {
            control: self.control.clone(),
            events,
            script,
            destroyed: AtomicBool::new(false),
            closed: Notify::new(),
        }))
    }
}

pub struct FakeTransport {
    control: FakeControl,
    events: TransportEventSender,
    script: InitScript,
    destroyed: AtomicBool,
    closed: Notify,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn initialize(&self) -> Result<()> {
        match &self.script {
            InitScript::Succeed(events) => {
                for event in events {
                    let _ = self.events.send(event.clone());
                }
                Ok(())
            }
            InitScript::Fail(message) => bail!("{message}"),
            InitScript::Hang => std::future::pending::<Result<()>>().await,
            InitScript::UntilDestroyed => {
                self.closed.notified().await;
                bail!("transport destroyed")
            }
            InitScript::Wait(gate) => {
                gate.notified().await;
                Ok(())
            }
        }
    }

    async fn destroy(&self) -> Result<()> {
        let fail = {
            let mut state = self.control.state.lock();
            if !self.destroyed.swap(true, Ordering::SeqCst) {
                state.live = state.live.saturating_sub(1);
                state.destroyed += 1;
            }
            state.fail_destroy
        };
        self.closed.notify_one();
        if fail {
            bail!("fake destroy exploded");
        }
        Ok(())
    }

    async fn get_state(&self) -> Result<Option<String>> {
        self.control.state.lock().state_polls += 1;
        Ok(Some("CONNECTED".into()))
    }

    async fn send_message(&self, to: &str, body: &str) -> Result<()> {
        self.control
            .state
            .lock()
            .sends
            .push((to.to_string(), body.to_string()));
        Ok(())
    }

    async fn get_chats(&self) -> Result<Vec<Chat>> {
        Ok(self.control.state.lock().chats.clone())
    }

    async fn info(&self) -> Result<Option<ClientInfo>> {
        Ok(self.control.state.lock().info.clone())
    }
}
