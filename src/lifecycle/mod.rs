//! Session lifecycle supervisor.
//!
//! Owns the one [`SessionHandle`] for the process and drives it through
//! creation, authentication, readiness, teardown and scheduled restarts.
//!
//! ```text
//!  Idle ──start()──▶ Initializing ──qr──▶ AwaitingChallenge ──authenticated──▶ Authenticated ──ready──▶ Ready
//!                        │                        │                                 │                   │
//!                        └──── init failure / disconnected (any active state) ──────┴───────────────────┘
//!                                                 ▼
//!                                           Disconnecting ──teardown──▶ BackoffWait ──timer──▶ Initializing
//! ```
//!
//! All state lives behind a single mutex that is never held across an
//! `.await`. `start()` only proceeds from `Idle` or `BackoffWait`, and only
//! the caller that moves the state into `Disconnecting` runs the teardown.
//! An attempt stays in flight until its `start_attempt` returns, even after
//! a disconnect has torn its transport down; a start requested in that
//! window is deferred and runs once the old attempt settles. Transport
//! events are consumed in order by one task per session generation; events
//! from an older generation are dropped.
//!
//! Every failure is retried, forever. The attempt counter only grows.

pub mod backoff;

use crate::events::EventLog;
use crate::health;
use crate::session::{GroupSummary, SessionError, SessionHandle, SessionStatus};
use crate::transport::{
    ClientInfo, Transport, TransportEvent, TransportEventReceiver, TransportFactory,
    TransportOptions,
};
use anyhow::Context;
use backoff::{BackoffPolicy, BackoffScheduler};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Health registry component name.
pub const COMPONENT: &str = "session";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Initializing,
    AwaitingChallenge,
    Authenticated,
    Ready,
    Disconnecting,
    BackoffWait,
}

impl LifecycleState {
    pub fn accepts_start(self) -> bool {
        matches!(self, Self::Idle | Self::BackoffWait)
    }

    /// States in which a transport instance is (being) brought up.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Initializing | Self::AwaitingChallenge | Self::Authenticated | Self::Ready
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::AwaitingChallenge => "awaiting_challenge",
            Self::Authenticated => "authenticated",
            Self::Ready => "ready",
            Self::Disconnecting => "disconnecting",
            Self::BackoffWait => "backoff_wait",
        }
    }

    /// Next state for a transport event, or `None` if the event is ignored
    /// in this state.
    pub fn after_event(self, event: &TransportEvent) -> Option<Self> {
        match event {
            TransportEvent::Challenge(_) if self.is_active() => Some(Self::AwaitingChallenge),
            TransportEvent::Authenticated
                if matches!(self, Self::Initializing | Self::AwaitingChallenge) =>
            {
                Some(Self::Authenticated)
            }
            TransportEvent::Ready
                if matches!(
                    self,
                    Self::Initializing | Self::AwaitingChallenge | Self::Authenticated
                ) =>
            {
                Some(Self::Ready)
            }
            TransportEvent::Disconnected(_) if self.is_active() => Some(Self::Disconnecting),
            _ => None,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an initialization attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum InitFailure {
    /// The environment could not be prepared or the transport could not be
    /// created; no transport instance existed yet.
    #[error("session setup failed: {0:#}")]
    Setup(anyhow::Error),
    #[error("transport initialize failed: {0:#}")]
    Transport(anyhow::Error),
    #[error("transport initialize timed out after {0:?}")]
    Timeout(Duration),
}

impl InitFailure {
    pub fn is_setup(&self) -> bool {
        matches!(self, Self::Setup(_))
    }
}

#[derive(Debug)]
pub enum StartOutcome {
    /// `initialize` completed and the session is still current.
    Started,
    /// Another initialization or a live session already owns the slot.
    AlreadyActive(LifecycleState),
    /// A torn-down attempt has not returned yet; the start runs after it.
    Deferred,
    /// The attempt finished after it had been torn down or stopped.
    Superseded,
    /// The attempt failed; teardown ran and a restart is scheduled.
    Failed(InitFailure),
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub transport: TransportOptions,
    pub init_timeout: Duration,
    pub destroy_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub backoff: BackoffPolicy,
    pub event_log_capacity: usize,
}

#[cfg(test)]
impl LifecycleConfig {
    /// Service defaults with storage under `root`.
    pub(crate) fn for_tests(root: &std::path::Path) -> Self {
        Self {
            transport: TransportOptions {
                data_path: root.join("data"),
                cache_path: root.join("cache"),
                headless: true,
                protocol_timeout: Duration::from_secs(180),
                browser_args: vec![],
                takeover_on_conflict: true,
                takeover_timeout_ms: 0,
                restart_on_auth_fail: true,
                qr_max_retries: 8,
            },
            init_timeout: Duration::from_secs(180),
            destroy_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(20),
            backoff: BackoffPolicy::default(),
            event_log_capacity: 200,
        }
    }
}

/// Point-in-time view for `/debug`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleSnapshot {
    pub state: LifecycleState,
    pub is_authenticated: bool,
    pub is_ready: bool,
    pub init_attempt: u64,
    pub restart_pending: bool,
    /// Restarts scheduled by this manager.
    pub restart_count: u64,
}

struct Slot {
    state: LifecycleState,
    generation: u64,
    session: SessionHandle,
    cancel: Option<CancellationToken>,
    heartbeat: Option<JoinHandle<()>>,
    in_flight: bool,
    start_deferred: bool,
}

/// Marks an initialization sequence as in flight until dropped.
struct InFlight {
    manager: LifecycleManager,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.manager.finish_attempt();
    }
}

struct Inner {
    config: LifecycleConfig,
    factory: Arc<dyn TransportFactory>,
    slot: Mutex<Slot>,
    events: EventLog,
    attempts: AtomicU64,
    restarts: AtomicU64,
    stopped: AtomicBool,
    backoff: BackoffScheduler,
}

/// Cheap to clone; all clones drive the same session slot.
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

impl LifecycleManager {
    pub fn new(config: LifecycleConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let events = EventLog::new(config.event_log_capacity);
        let backoff = BackoffScheduler::new(config.backoff);
        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                slot: Mutex::new(Slot {
                    state: LifecycleState::Idle,
                    generation: 0,
                    session: SessionHandle::new(),
                    cancel: None,
                    heartbeat: None,
                    in_flight: false,
                    start_deferred: false,
                }),
                events,
                attempts: AtomicU64::new(0),
                restarts: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
                backoff,
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.slot.lock().state
    }

    /// Initialization attempts made over the whole process lifetime.
    pub fn attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.slot.lock().session.status()
    }

    pub fn events(&self) -> &EventLog {
        &self.inner.events
    }

    pub fn restart_pending(&self) -> bool {
        self.inner.backoff.is_pending()
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        let (state, status) = {
            let slot = self.inner.slot.lock();
            (slot.state, slot.session.status())
        };
        LifecycleSnapshot {
            state,
            is_authenticated: status.authenticated,
            is_ready: status.ready,
            init_attempt: self.attempts(),
            restart_pending: self.restart_pending(),
            restart_count: self.inner.restarts.load(Ordering::SeqCst),
        }
    }

    /// Bring up a transport instance unless one is already in flight.
    ///
    /// A no-op (no attempt counted) unless the manager is `Idle` or in
    /// `BackoffWait`. Starting from `BackoffWait` disarms the pending timer.
    /// While a torn-down attempt is still returning, the start is deferred
    /// and runs as soon as that attempt is done.
    pub async fn start(&self) -> StartOutcome {
        self.inner.stopped.store(false, Ordering::SeqCst);
        self.start_attempt().await
    }

    async fn start_attempt(&self) -> StartOutcome {
        let (generation, token) = {
            let mut slot = self.inner.slot.lock();
            if !slot.state.accepts_start() {
                tracing::debug!(
                    state = %slot.state,
                    "start() ignored; session already in progress"
                );
                return StartOutcome::AlreadyActive(slot.state);
            }
            if slot.in_flight {
                tracing::debug!("start() deferred until the previous attempt returns");
                slot.start_deferred = true;
                return StartOutcome::Deferred;
            }
            slot.state = LifecycleState::Initializing;
            slot.in_flight = true;
            slot.generation += 1;
            let token = CancellationToken::new();
            slot.cancel = Some(token.clone());
            (slot.generation, token)
        };
        let _in_flight = InFlight {
            manager: self.clone(),
        };
        self.inner.backoff.cancel();

        let attempt = self.inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        health::mark_component_starting(COMPONENT);
        tracing::info!(attempt, generation, "Initializing session transport");

        match self.initialize(generation, token.clone()).await {
            Ok(()) => self.on_initialized(generation, token),
            Err(failure) => {
                if self.claim_teardown(generation) {
                    self.inner.events.record("init_error");
                    tracing::error!(attempt, "Session initialization failed: {failure}");
                    self.teardown_and_schedule(&failure.to_string()).await;
                    StartOutcome::Failed(failure)
                } else {
                    tracing::debug!(
                        attempt,
                        "Ignoring failure of a superseded initialization: {failure}"
                    );
                    StartOutcome::Superseded
                }
            }
        }
    }

    /// Release the in-flight mark and run a start that arrived meanwhile.
    fn finish_attempt(&self) {
        let run_deferred = {
            let mut slot = self.inner.slot.lock();
            slot.in_flight = false;
            std::mem::take(&mut slot.start_deferred) && slot.state.accepts_start()
        };
        if !run_deferred {
            return;
        }
        // Runs from `Drop`, possibly while the runtime shuts down.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(self.clone().restart());
        }
    }

    async fn initialize(
        &self,
        generation: u64,
        token: CancellationToken,
    ) -> Result<(), InitFailure> {
        let options = &self.inner.config.transport;
        prepare_dirs(options).await.map_err(InitFailure::Setup)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let client = self
            .inner
            .factory
            .create(options, tx)
            .await
            .map_err(InitFailure::Setup)?;

        let (installed, stale) = {
            let mut slot = self.inner.slot.lock();
            if slot.generation == generation && slot.state.is_active() {
                (true, slot.session.install(Arc::clone(&client)))
            } else {
                (false, None)
            }
        };
        if let Some(stale) = stale {
            tracing::warn!("Replacing a transport that was never torn down");
            self.destroy_client(stale).await;
        }
        if !installed {
            // Stopped while the transport was being created.
            self.destroy_client(client).await;
            return Ok(());
        }

        self.spawn_event_pump(generation, rx, token);

        let timeout = self.inner.config.init_timeout;
        match tokio::time::timeout(timeout, client.initialize()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(InitFailure::Transport(e)),
            Err(_) => Err(InitFailure::Timeout(timeout)),
        }
    }

    fn on_initialized(&self, generation: u64, token: CancellationToken) -> StartOutcome {
        let mut slot = self.inner.slot.lock();
        if slot.generation != generation || !slot.state.is_active() {
            return StartOutcome::Superseded;
        }
        let Some(client) = slot.session.client() else {
            return StartOutcome::Superseded;
        };
        slot.heartbeat = Some(self.spawn_heartbeat(client, token));
        tracing::info!(generation, state = %slot.state, "Session transport initialized");
        StartOutcome::Started
    }

    fn spawn_event_pump(
        &self,
        generation: u64,
        mut rx: TransportEventReceiver,
        token: CancellationToken,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = token.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                manager.handle_event(generation, event).await;
            }
        });
    }

    fn spawn_heartbeat(
        &self,
        client: Arc<dyn Transport>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let every = self.inner.config.heartbeat_interval;
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let state = tokio::select! {
                    () = token.cancelled() => break,
                    state = client.get_state() => state.ok().flatten(),
                };
                if token.is_cancelled() {
                    break;
                }
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let ready = inner.slot.lock().session.is_ready();
                tracing::debug!(
                    state = state.as_deref().unwrap_or("unknown"),
                    ready,
                    "Heartbeat"
                );
            }
        })
    }

    async fn handle_event(&self, generation: u64, event: TransportEvent) {
        match &event {
            TransportEvent::LoadingScreen { percent, message } => {
                tracing::info!(percent, "Loading {message}");
                return;
            }
            TransportEvent::StateChanged(state) => {
                tracing::info!(state = %state, "Transport state changed");
                return;
            }
            TransportEvent::AuthFailure(message) => {
                self.inner.events.record("auth_failure");
                tracing::warn!("Transport authentication failure: {message}");
                return;
            }
            _ => {}
        }

        let disconnect_reason = {
            let mut slot = self.inner.slot.lock();
            if slot.generation != generation {
                tracing::debug!(?event, "Dropping event from a previous session");
                return;
            }
            let Some(next) = slot.state.after_event(&event) else {
                tracing::debug!(state = %slot.state, ?event, "Event ignored in current state");
                return;
            };

            let mut reason = None;
            match &event {
                TransportEvent::Challenge(payload) => {
                    slot.session.record_challenge(payload.clone());
                    self.inner.events.record("qr");
                    tracing::info!("New QR challenge issued");
                }
                TransportEvent::Authenticated => {
                    slot.session.mark_authenticated();
                    self.inner.events.record("authenticated");
                    tracing::info!("Session authenticated");
                }
                TransportEvent::Ready => {
                    slot.session.mark_ready();
                    self.inner.events.record("ready");
                    health::mark_component_ok(COMPONENT);
                    tracing::info!("Session ready");
                }
                TransportEvent::Disconnected(why) => {
                    self.inner.events.record(format!("disconnected:{why}"));
                    tracing::warn!(reason = %why, "Session disconnected");
                    reason = Some(why.clone());
                }
                _ => {}
            }

            tracing::debug!(from = %slot.state, to = %next, "Session state transition");
            slot.state = next;
            reason
        };

        if let Some(reason) = disconnect_reason {
            self.teardown_and_schedule(&format!("disconnected: {reason}"))
                .await;
        }
    }

    /// Move an active session of `generation` into `Disconnecting`.
    /// Only the caller that gets `true` runs the teardown.
    fn claim_teardown(&self, generation: u64) -> bool {
        let mut slot = self.inner.slot.lock();
        if slot.generation == generation && slot.state.is_active() {
            slot.state = LifecycleState::Disconnecting;
            true
        } else {
            false
        }
    }

    /// Cancel heartbeat and event pump, destroy the client (best effort),
    /// then clear the handle. Never fails.
    async fn teardown(&self) {
        let client = {
            let mut slot = self.inner.slot.lock();
            if let Some(token) = slot.cancel.take() {
                token.cancel();
            }
            if let Some(heartbeat) = slot.heartbeat.take() {
                heartbeat.abort();
            }
            slot.session.client()
        };

        if let Some(client) = client {
            self.destroy_client(client).await;
        }

        self.inner.slot.lock().session.clear();
    }

    async fn destroy_client(&self, client: Arc<dyn Transport>) {
        let timeout = self.inner.config.destroy_timeout;
        match tokio::time::timeout(timeout, client.destroy()).await {
            Ok(Ok(())) => tracing::debug!("Transport destroyed"),
            Ok(Err(e)) => {
                tracing::warn!(
                    attempt = self.attempts(),
                    error = %format!("{e:#}"),
                    "Transport destroy failed; continuing teardown"
                );
            }
            Err(_) => {
                tracing::warn!(
                    attempt = self.attempts(),
                    ?timeout,
                    "Transport destroy timed out; continuing teardown"
                );
            }
        }
    }

    async fn teardown_and_schedule(&self, reason: &str) {
        health::mark_component_error(COMPONENT, reason);
        self.teardown().await;

        if self.inner.stopped.load(Ordering::SeqCst) {
            self.inner.slot.lock().state = LifecycleState::Idle;
            tracing::info!("Manager stopped; not scheduling a restart");
            return;
        }

        self.inner.slot.lock().state = LifecycleState::BackoffWait;
        let attempts = self.attempts();
        let manager = self.clone();
        match self
            .inner
            .backoff
            .schedule(attempts, move || manager.restart())
        {
            Some(delay) => {
                self.inner.restarts.fetch_add(1, Ordering::SeqCst);
                health::bump_component_restart(COMPONENT);
                tracing::info!(
                    attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Session restart scheduled"
                );
            }
            None => tracing::debug!("Session restart already pending"),
        }
    }

    fn restart(self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            if self.inner.stopped.load(Ordering::SeqCst) {
                return;
            }
            tracing::info!("Restarting session after backoff");
            let _ = self.start_attempt().await;
        })
    }

    /// Cancel any pending restart and tear down the current session without
    /// scheduling another one. The manager ends up `Idle`.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.backoff.cancel();

        let claimed = {
            let mut slot = self.inner.slot.lock();
            match slot.state {
                state if state.is_active() => {
                    slot.state = LifecycleState::Disconnecting;
                    true
                }
                LifecycleState::BackoffWait => {
                    slot.state = LifecycleState::Idle;
                    false
                }
                _ => false,
            }
        };

        if claimed {
            self.teardown().await;
            self.inner.slot.lock().state = LifecycleState::Idle;
            tracing::info!("Session stopped");
        }
    }

    fn ready_client(&self) -> Result<Arc<dyn Transport>, SessionError> {
        self.inner.slot.lock().session.ready_client()
    }

    pub async fn send_message(&self, to: &str, body: &str) -> Result<(), SessionError> {
        let client = self.ready_client()?;
        client.send_message(to, body).await?;
        Ok(())
    }

    pub async fn list_groups(&self) -> Result<Vec<GroupSummary>, SessionError> {
        let client = self.ready_client()?;
        let chats = client.get_chats().await?;
        Ok(GroupSummary::from_chats(chats))
    }

    pub async fn who_am_i(&self) -> Result<Option<ClientInfo>, SessionError> {
        let client = self.ready_client()?;
        Ok(client.info().await?)
    }
}

async fn prepare_dirs(options: &TransportOptions) -> anyhow::Result<()> {
    for dir in [&options.data_path, &options.cache_path] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    Ok(())
}
