use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::MuxConfig;
use crate::error::{CoreError, Result};
use crate::mux::{EventBus, EventStream, IoMultiplexer};
use crate::policy::MarkerPolicies;
use crate::process::{CommandSpawner, SendError, Spawner};
use crate::session::{
    LaunchSpec, OutputLine, Session, SessionId, SessionRegistry, Trigger,
};

/// How a termination request played out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// Session was already terminated; nothing to do
    AlreadyTerminated,
    /// Process exited on its own after input was closed (or had no process)
    Exited,
    /// Killed immediately on request
    Killed,
    /// Ignored the grace period and was force-killed
    ForceKilled,
}

/// Result of [`Orchestrator::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Sessions that ended within the grace window
    pub exited: Vec<SessionId>,
    /// Sessions that had to be force-killed
    pub force_killed: Vec<SessionId>,
}

/// Top-level coordinator: the only way the display layer changes core state.
pub struct Orchestrator {
    config: MuxConfig,
    bus: EventBus,
    registry: Arc<SessionRegistry>,
    mux: IoMultiplexer,
    spawner: Arc<dyn Spawner>,
    markers: MarkerPolicies,
    active: Mutex<Option<SessionId>>,
    /// False once shutdown starts. Creates hold the read side while they
    /// spawn, so shutdown never misses a session that is mid-spawn.
    accepting: RwLock<bool>,
}

impl Orchestrator {
    /// Must be called inside a tokio runtime.
    pub fn new(config: MuxConfig) -> Result<Self> {
        let markers = config.marker_policies()?;
        Self::with_parts(config, markers, Arc::new(CommandSpawner))
    }

    pub fn with_parts(
        config: MuxConfig,
        markers: MarkerPolicies,
        spawner: Arc<dyn Spawner>,
    ) -> Result<Self> {
        config.validate()?;
        let bus = EventBus::new();
        let registry = Arc::new(SessionRegistry::new(config.buffer_capacity, bus.clone()));
        let mux = IoMultiplexer::new(config.pump_settings())?;

        Ok(Self {
            config,
            bus,
            registry,
            mux,
            spawner,
            markers,
            active: Mutex::new(None),
            accepting: RwLock::new(true),
        })
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn multiplexer(&self) -> &IoMultiplexer {
        &self.mux
    }

    /// Events from this point on.
    pub fn subscribe(&self) -> EventStream {
        self.bus.subscribe()
    }

    /// Every retained output line of a session.
    pub fn snapshot(&self, id: SessionId) -> Result<Vec<OutputLine>> {
        Ok(self.registry.handle(id)?.output().snapshot())
    }

    fn active_slot(&self) -> MutexGuard<'_, Option<SessionId>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register and spawn a new session.
    ///
    /// On spawn failure the session stays in the registry as `Errored` so the
    /// failure is visible, and the error is returned.
    pub fn create_session(&self, launch: LaunchSpec) -> Result<SessionId> {
        let accepting = self.accepting.read().unwrap_or_else(PoisonError::into_inner);
        if !*accepting {
            return Err(CoreError::ShuttingDown);
        }

        let session = self
            .registry
            .create_within(launch, self.config.max_sessions)?;
        let id = session.id();

        let _runtime = self.mux.enter();
        match self.spawner.spawn(session.launch()) {
            Ok(spawned) => {
                info!(session = %id, pid = spawned.pid, "process spawned");
                let marker = self.markers.for_kind(session.kind());
                let handle = self.mux.attach(Arc::clone(&session), spawned, marker);
                session.bind_process(handle);
                Ok(id)
            }
            Err(source) => {
                warn!(session = %id, error = %source, "spawn failed");
                session.apply(Trigger::SpawnFailed(source.to_string()));
                session.settle_spawn();
                Err(CoreError::Spawn {
                    id,
                    command: session.launch().command_line(),
                    source,
                })
            }
        }
    }

    /// Record which session the user is looking at. Does not touch the process.
    pub fn switch_active(&self, id: SessionId) -> Result<()> {
        self.registry.handle(id)?;
        *self.active_slot() = Some(id);
        debug!(session = %id, "switched active session");
        Ok(())
    }

    pub fn active(&self) -> Option<SessionId> {
        *self.active_slot()
    }

    /// Forward bytes to a session's stdin.
    pub async fn send_input(&self, id: SessionId, bytes: impl Into<Vec<u8>>) -> Result<()> {
        let session = self.registry.handle(id)?;
        if !session.state().accepts_input() {
            return Err(CoreError::NotRunning(id));
        }
        let process = session.process().ok_or(CoreError::NotRunning(id))?;

        process
            .send(bytes.into(), self.config.input_timeout())
            .await
            .map_err(|e| match e {
                SendError::Full => CoreError::Backpressure(id),
                SendError::Closed => CoreError::NotRunning(id),
            })?;
        session.apply(Trigger::InputSent);
        Ok(())
    }

    /// Send SIGINT to the session's process group, like Ctrl+C in a terminal.
    pub fn interrupt(&self, id: SessionId) -> Result<()> {
        let session = self.registry.handle(id)?;
        if !session.state().accepts_input() {
            return Err(CoreError::NotRunning(id));
        }
        match session.process() {
            Some(process) if process.signal(Signal::SIGINT) => Ok(()),
            _ => Err(CoreError::NotRunning(id)),
        }
    }

    /// End a session's process and wait until the session is `Terminated`.
    ///
    /// Graceful termination closes stdin and waits up to the grace period
    /// before killing. Terminating a terminated session is a no-op.
    pub async fn terminate(&self, id: SessionId, graceful: bool) -> Result<Termination> {
        let session = self.registry.handle(id)?;
        let grace = graceful.then(|| self.config.grace_period());
        Ok(terminate_session(&session, grace, self.config.drain_timeout()).await)
    }

    /// Terminate a session and start a fresh one with the same launch
    /// parameters. The old session stays in the registry with its history.
    pub async fn restart_session(&self, id: SessionId) -> Result<SessionId> {
        let launch = self.registry.handle(id)?.launch().clone();
        self.terminate(id, true).await?;
        let new_id = self.create_session(launch)?;

        let mut active = self.active_slot();
        if *active == Some(id) {
            *active = Some(new_id);
        }
        info!(old = %id, new = %new_id, "session restarted");
        Ok(new_id)
    }

    /// Dispose of a finished session.
    pub fn remove(&self, id: SessionId) -> Result<()> {
        self.registry.remove(id)?;
        let mut active = self.active_slot();
        if *active == Some(id) {
            *active = None;
        }
        Ok(())
    }

    /// Set or clear the display label.
    pub fn rename(&self, id: SessionId, label: &str) -> Result<()> {
        let session = self.registry.handle(id)?;
        let label = label.trim();
        session.set_label((!label.is_empty()).then(|| label.to_string()));
        Ok(())
    }

    pub fn toggle_pin(&self, id: SessionId) -> Result<bool> {
        self.registry.toggle_pin(id)
    }

    /// Terminate every session that is not yet terminated, concurrently.
    ///
    /// Each process gets its input closed and the shutdown timeout to exit;
    /// whatever is left after that is force-killed. Returns once every
    /// session is `Terminated`. New sessions are refused from here on.
    pub async fn shutdown(&self) -> ShutdownReport {
        // waits for creates already spawning
        *self.accepting.write().unwrap_or_else(PoisonError::into_inner) = false;

        let pending: Vec<Arc<Session>> = self
            .registry
            .all()
            .into_iter()
            .filter(|s| !s.state().is_terminal())
            .collect();
        info!(sessions = pending.len(), "shutting down");

        let grace = self.config.shutdown_timeout();
        let drain = self.config.drain_timeout();
        let mut tasks = JoinSet::new();
        for session in pending {
            tasks.spawn(async move {
                let outcome = terminate_session(&session, Some(grace), drain).await;
                (session.id(), outcome)
            });
        }

        let mut report = ShutdownReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Termination::ForceKilled)) => report.force_killed.push(id),
                Ok((id, _)) => report.exited.push(id),
                Err(e) => warn!(error = %e, "termination task failed"),
            }
        }
        report.exited.sort();
        report.force_killed.sort();

        if !self.mux.wait_idle(drain).await {
            debug!(tasks = self.mux.active_tasks(), "pumps still winding down");
        }
        info!(
            exited = report.exited.len(),
            force_killed = report.force_killed.len(),
            "shutdown complete"
        );
        report
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("sessions", &self.registry.len())
            .field("active", &self.active())
            .finish()
    }
}

/// Drive one session to `Terminated`.
///
/// `grace` of `None` kills immediately. After the process is gone the pump
/// gets `drain` to flush what is left in the pipes before it is stopped.
async fn terminate_session(session: &Session, grace: Option<Duration>, drain: Duration) -> Termination {
    if session.state().is_terminal() {
        return Termination::AlreadyTerminated;
    }
    session.request_termination();
    session.wait_spawn_settled().await;

    let Some(process) = session.process() else {
        // spawn failed, nothing to kill
        session.apply(Trigger::TerminationRequested);
        return Termination::Exited;
    };

    let mut outcome = Termination::Exited;
    if process.is_alive() {
        match grace {
            Some(grace) => {
                process.close_input();
                if process.wait_exit_timeout(grace).await.is_none() {
                    warn!(session = %session.id(), ?grace, "grace period elapsed, killing");
                    process.kill();
                    outcome = Termination::ForceKilled;
                }
            }
            None => {
                process.kill();
                outcome = Termination::Killed;
            }
        }
        process.wait_exit().await;
    }

    if tokio::time::timeout(drain, session.wait_terminated()).await.is_err() {
        process.stop_pump();
        session.wait_terminated().await;
    }
    outcome
}
