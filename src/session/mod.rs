mod output;
mod registry;
mod state;

pub use output::{LineAssembler, OutputBuffer, OutputLine, Stream};
pub use registry::SessionRegistry;
pub use state::{SessionState, SessionStateMachine, Transition, Trigger};

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::mux::{EventBus, EventKind};
use crate::process::ProcessHandle;

/// Opaque, monotonically increasing session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which AI tool a session wraps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Claude,
    Codex,
    Gemini,
    Other(String),
}

impl ToolKind {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "claude" => ToolKind::Claude,
            "codex" => ToolKind::Codex,
            "gemini" => ToolKind::Gemini,
            other => ToolKind::Other(other.to_string()),
        }
    }

    /// Guess the kind from the program being launched (`/usr/bin/claude` -> `Claude`).
    pub fn from_program(program: &str) -> Self {
        let name = Path::new(program)
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        ToolKind::from_name(&name)
    }

    pub fn name(&self) -> &str {
        match self {
            ToolKind::Claude => "claude",
            ToolKind::Codex => "codex",
            ToolKind::Gemini => "gemini",
            ToolKind::Other(name) => name,
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How to start a session's process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub kind: ToolKind,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(kind: ToolKind, program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
        }
    }

    /// Split a command line on whitespace. The kind is inferred from the
    /// program name when not given.
    pub fn parse(kind: Option<ToolKind>, command_line: &str, cwd: impl Into<PathBuf>) -> Result<Self> {
        let mut words = command_line.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| CoreError::InvalidConfig("empty command".to_string()))?;
        let kind = kind.unwrap_or_else(|| ToolKind::from_program(program));
        Ok(Self::new(kind, program, cwd).args(words))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Reject parameters that cannot possibly spawn.
    pub fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(CoreError::InvalidConfig("empty command".to_string()));
        }
        let has_nul = std::iter::once(&self.program)
            .chain(&self.args)
            .any(|s| s.contains('\0'));
        if has_nul {
            return Err(CoreError::InvalidConfig(format!(
                "command `{}` contains a NUL byte",
                self.command_line()
            )));
        }
        if !self.cwd.is_dir() {
            return Err(CoreError::InvalidConfig(format!(
                "working directory {} does not exist",
                self.cwd.display()
            )));
        }
        Ok(())
    }
}

/// Point-in-time copy of a session's metadata, for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub kind: ToolKind,
    pub label: Option<String>,
    pub command: String,
    pub cwd: PathBuf,
    pub pid: Option<u32>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub pinned: bool,
    pub lines: usize,
}

impl SessionSnapshot {
    pub fn display_name(&self) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None => format!("{}-{}", self.kind, self.id),
        }
    }
}

/// Mutable per-session fields, guarded by the session's own lock.
#[derive(Debug)]
struct SessionCore {
    machine: SessionStateMachine,
    last_activity: DateTime<Utc>,
    exit_code: Option<i32>,
    error: Option<String>,
    label: Option<String>,
    pinned_at: Option<u64>,
}

/// One managed tool process together with its output and state.
///
/// State only changes through [`Session::apply`], which runs the state
/// machine and publishes the resulting events while holding the session
/// lock, so a session's events reach the bus in the order they happened.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    launch: LaunchSpec,
    created_at: DateTime<Utc>,
    output: OutputBuffer,
    core: Mutex<SessionCore>,
    state_tx: watch::Sender<SessionState>,
    process: OnceLock<ProcessHandle>,
    /// Flips to true once spawning either bound a process or failed
    spawn_settled: watch::Sender<bool>,
    bus: EventBus,
}

impl Session {
    pub(crate) fn new(id: SessionId, launch: LaunchSpec, capacity: usize, bus: EventBus) -> Self {
        let now = Utc::now();
        let (state_tx, _) = watch::channel(SessionState::Starting);
        Self {
            id,
            launch,
            created_at: now,
            output: OutputBuffer::new(capacity),
            core: Mutex::new(SessionCore {
                machine: SessionStateMachine::new(),
                last_activity: now,
                exit_code: None,
                error: None,
                label: None,
                pinned_at: None,
            }),
            state_tx,
            process: OnceLock::new(),
            spawn_settled: watch::channel(false).0,
            bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn kind(&self) -> &ToolKind {
        &self.launch.kind
    }

    pub fn launch(&self) -> &LaunchSpec {
        &self.launch
    }

    pub fn output(&self) -> &OutputBuffer {
        &self.output
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn process(&self) -> Option<&ProcessHandle> {
        self.process.get()
    }

    pub(crate) fn bind_process(&self, handle: ProcessHandle) {
        if self.process.set(handle).is_err() {
            warn!(session = %self.id, "process already bound, ignoring second handle");
        }
        self.settle_spawn();
    }

    /// Mark the spawn attempt as over, with or without a process.
    pub(crate) fn settle_spawn(&self) {
        self.spawn_settled.send_replace(true);
    }

    /// Resolve once the spawn attempt has bound a process or failed.
    pub(crate) async fn wait_spawn_settled(&self) {
        let mut rx = self.spawn_settled.subscribe();
        let _ = rx.wait_for(|settled| *settled).await;
    }

    /// Follow state changes, e.g. to notice input moving the session to `Running`.
    pub(crate) fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Whether the registry may drop this session.
    pub fn is_disposable(&self) -> bool {
        match self.state() {
            SessionState::Terminated => true,
            SessionState::Errored => !self.process().is_some_and(ProcessHandle::is_alive),
            _ => false,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let core = self.lock();
        SessionSnapshot {
            id: self.id,
            kind: self.launch.kind.clone(),
            label: core.label.clone(),
            command: self.launch.command_line(),
            cwd: self.launch.cwd.clone(),
            pid: self.process().map(ProcessHandle::pid),
            state: core.machine.state(),
            created_at: self.created_at,
            last_activity: core.last_activity,
            exit_code: core.exit_code,
            error: core.error.clone(),
            pinned: core.pinned_at.is_some(),
            lines: self.output.len(),
        }
    }

    pub(crate) fn pinned_at(&self) -> Option<u64> {
        self.lock().pinned_at
    }

    /// Run a trigger through the state machine and publish what it caused.
    pub(crate) fn apply(&self, trigger: Trigger) -> Vec<Transition> {
        let mut core = self.lock();
        self.apply_locked(&mut core, trigger)
    }

    fn apply_locked(&self, core: &mut SessionCore, trigger: Trigger) -> Vec<Transition> {
        let steps = core.machine.apply(&trigger);
        if steps.is_empty() {
            return steps;
        }

        match &trigger {
            Trigger::SpawnFailed(detail) | Trigger::IoFailure(detail) => {
                core.error = Some(detail.clone());
            }
            Trigger::Exited { code } => {
                core.exit_code = Some(*code);
                if steps.iter().any(|t| t.to == SessionState::Errored) {
                    core.error = Some(format!("exited with code {code} before producing output"));
                }
            }
            _ => {}
        }

        for step in &steps {
            match step.to {
                SessionState::Errored => {
                    warn!(session = %self.id, from = %step.from, error = ?core.error, "session errored")
                }
                SessionState::Terminated => {
                    info!(session = %self.id, from = %step.from, exit_code = ?core.exit_code, "session terminated")
                }
                _ => debug!(session = %self.id, from = %step.from, to = %step.to, "state changed"),
            }
            self.state_tx.send_replace(step.to);
            self.bus.publish(
                self.id,
                EventKind::StateChanged {
                    from: step.from,
                    to: step.to,
                },
            );
        }
        steps
    }

    /// Append a batch of output and drive the state machine with it.
    pub(crate) fn record_output(&self, lines: Vec<OutputLine>, awaiting_input: bool) {
        let mut core = self.lock();
        core.last_activity = Utc::now();

        let appended = self.output.extend(lines);
        if appended > 0 {
            self.bus
                .publish(self.id, EventKind::OutputAppended { lines: appended });
        }
        self.apply_locked(&mut core, Trigger::Output { awaiting_input });
    }

    pub(crate) fn request_termination(&self) {
        self.lock().machine.request_termination();
    }

    pub(crate) fn set_label(&self, label: Option<String>) {
        self.lock().label = label;
        self.bus.publish(self.id, EventKind::MetadataChanged);
    }

    /// Pin with the given order key, or unpin with `None`.
    pub(crate) fn set_pinned(&self, pinned_at: Option<u64>) {
        self.lock().pinned_at = pinned_at;
        self.bus.publish(self.id, EventKind::MetadataChanged);
    }

    /// Resolve once the session reaches `Terminated`.
    pub async fn wait_terminated(&self) {
        let mut rx = self.state_tx.subscribe();
        // the sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|state| state.is_terminal()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (Session, crate::mux::EventStream) {
        let bus = EventBus::new();
        let stream = bus.subscribe();
        let launch = LaunchSpec::new(ToolKind::Claude, "claude", std::env::temp_dir());
        (Session::new(SessionId(1), launch, 10, bus), stream)
    }

    #[test]
    fn test_tool_kind_names() {
        assert_eq!(ToolKind::from_name("Claude"), ToolKind::Claude);
        assert_eq!(ToolKind::from_name("aider"), ToolKind::Other("aider".into()));
        assert_eq!(ToolKind::from_program("/opt/bin/codex"), ToolKind::Codex);
        assert_eq!(ToolKind::Other("aider".into()).to_string(), "aider");
    }

    #[test]
    fn test_parse_launch_spec() {
        let spec = LaunchSpec::parse(None, "  gemini --model pro ", "/tmp").unwrap();
        assert_eq!(spec.kind, ToolKind::Gemini);
        assert_eq!(spec.program, "gemini");
        assert_eq!(spec.args, vec!["--model", "pro"]);
        assert_eq!(spec.command_line(), "gemini --model pro");

        assert!(matches!(
            LaunchSpec::parse(None, "   ", "/tmp"),
            Err(CoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_missing_cwd() {
        let spec = LaunchSpec::new(ToolKind::Claude, "claude", "/definitely/not/here");
        assert!(matches!(spec.validate(), Err(CoreError::InvalidConfig(_))));

        let spec = LaunchSpec::new(ToolKind::Claude, "claude", std::env::temp_dir()).arg("a\0b");
        assert!(matches!(spec.validate(), Err(CoreError::InvalidConfig(_))));
    }

    #[test]
    fn test_output_publishes_append_then_state() {
        let (session, mut stream) = session();
        session.record_output(vec![OutputLine::new("hello", Stream::Stdout)], false);

        let kinds: Vec<_> = stream.drain().into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::OutputAppended { lines: 1 },
                EventKind::StateChanged {
                    from: SessionState::Starting,
                    to: SessionState::Running
                },
            ]
        );
        assert_eq!(session.state(), SessionState::Running);
    }

    #[test]
    fn test_spawn_failure_is_recorded() {
        let (session, _stream) = session();
        session.apply(Trigger::SpawnFailed("No such file or directory".into()));

        let snapshot = session.snapshot();
        assert_eq!(snapshot.state, SessionState::Errored);
        assert_eq!(snapshot.error.as_deref(), Some("No such file or directory"));
        assert!(session.is_disposable());
    }

    #[test]
    fn test_exit_records_code() {
        let (session, _stream) = session();
        session.record_output(vec![OutputLine::new("bye", Stream::Stdout)], false);
        session.apply(Trigger::Exited { code: 3 });

        let snapshot = session.snapshot();
        assert_eq!(snapshot.state, SessionState::Terminated);
        assert_eq!(snapshot.exit_code, Some(3));
        assert_eq!(snapshot.error, None);
    }

    #[test]
    fn test_display_name_prefers_label() {
        let (session, _stream) = session();
        assert_eq!(session.snapshot().display_name(), "claude-1");
        session.set_label(Some("refactor".into()));
        assert_eq!(session.snapshot().display_name(), "refactor");
    }

    #[tokio::test]
    async fn test_wait_terminated_resolves() {
        let (session, _stream) = session();
        session.apply(Trigger::TerminationRequested);
        tokio::time::timeout(std::time::Duration::from_secs(1), session.wait_terminated())
            .await
            .unwrap();
    }
}
