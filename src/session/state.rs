use serde::{Deserialize, Serialize};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SessionState {
    /// Process launched, no output seen yet
    #[default]
    Starting,
    /// Tool is producing output
    Running,
    /// No output for the configured quiet interval
    Idle,
    /// Output matched the tool's "needs input" marker
    AwaitingInput,
    /// Spawn failed or the session hit an unrecoverable I/O error
    Errored,
    /// Process is gone. Absorbing.
    Terminated,
}

impl SessionState {
    /// Counts against the orchestrator's concurrency limit.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SessionState::Starting
                | SessionState::Running
                | SessionState::Idle
                | SessionState::AwaitingInput
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Terminated
    }

    /// Whether user input may be forwarded to the process.
    pub fn accepts_input(self) -> bool {
        !matches!(self, SessionState::Errored | SessionState::Terminated)
    }

    pub fn label(self) -> &'static str {
        match self {
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Idle => "idle",
            SessionState::AwaitingInput => "awaiting input",
            SessionState::Errored => "errored",
            SessionState::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Lifecycle and I/O events that drive the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// A chunk of output arrived; `awaiting_input` is the marker policy verdict
    Output { awaiting_input: bool },
    /// The quiet interval elapsed without output
    QuietElapsed,
    /// User input was forwarded to the process
    InputSent,
    SpawnFailed(String),
    IoFailure(String),
    /// The process exited (clean or not)
    Exited { code: i32 },
    /// Termination requested for a session with no live process
    TerminationRequested,
}

/// A single state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Per-session transition rules.
///
/// This is the only place a session's state changes. `Starting` is never
/// re-entered and `Terminated` accepts no further triggers.
#[derive(Debug, Default)]
pub struct SessionStateMachine {
    state: SessionState,
    termination_requested: bool,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn termination_requested(&self) -> bool {
        self.termination_requested
    }

    /// Mark that the user (or shutdown) asked for this session to end.
    ///
    /// A process exit after this point goes straight to `Terminated` even if
    /// the tool never produced output.
    pub fn request_termination(&mut self) {
        self.termination_requested = true;
    }

    /// Apply a trigger and return the transitions it caused, in order.
    pub fn apply(&mut self, trigger: &Trigger) -> Vec<Transition> {
        use SessionState::*;

        let mut steps = Vec::new();
        if self.state == Terminated {
            return steps;
        }

        match trigger {
            Trigger::Output { awaiting_input } => {
                if self.state == Starting {
                    self.step(Running, &mut steps);
                }
                match self.state {
                    Running | Idle if *awaiting_input => self.step(AwaitingInput, &mut steps),
                    Idle | AwaitingInput if !*awaiting_input => self.step(Running, &mut steps),
                    _ => {}
                }
            }
            Trigger::QuietElapsed => {
                if self.state == Running {
                    self.step(Idle, &mut steps);
                }
            }
            Trigger::InputSent => {
                if matches!(self.state, Idle | AwaitingInput) {
                    self.step(Running, &mut steps);
                }
            }
            Trigger::SpawnFailed(_) | Trigger::IoFailure(_) => {
                if self.state != Errored {
                    self.step(Errored, &mut steps);
                }
            }
            Trigger::Exited { .. } => {
                if self.state == Starting && !self.termination_requested {
                    self.step(Errored, &mut steps);
                }
                self.step(Terminated, &mut steps);
            }
            Trigger::TerminationRequested => {
                self.termination_requested = true;
                self.step(Terminated, &mut steps);
            }
        }

        steps
    }

    fn step(&mut self, to: SessionState, steps: &mut Vec<Transition>) {
        steps.push(Transition {
            from: self.state,
            to,
        });
        self.state = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    fn states(steps: &[Transition]) -> Vec<SessionState> {
        steps.iter().map(|t| t.to).collect()
    }

    #[test]
    fn test_first_output_starts_running() {
        let mut machine = SessionStateMachine::new();
        let steps = machine.apply(&Trigger::Output { awaiting_input: false });
        assert_eq!(
            steps,
            vec![Transition {
                from: Starting,
                to: Running
            }]
        );
        assert!(machine.apply(&Trigger::Output { awaiting_input: false }).is_empty());
    }

    #[test]
    fn test_prompt_in_first_output() {
        let mut machine = SessionStateMachine::new();
        let steps = machine.apply(&Trigger::Output { awaiting_input: true });
        assert_eq!(states(&steps), vec![Running, AwaitingInput]);
    }

    #[test]
    fn test_quiet_interval_only_idles_running_sessions() {
        let mut machine = SessionStateMachine::new();
        assert!(machine.apply(&Trigger::QuietElapsed).is_empty());

        machine.apply(&Trigger::Output { awaiting_input: false });
        assert_eq!(states(&machine.apply(&Trigger::QuietElapsed)), vec![Idle]);
        assert!(machine.apply(&Trigger::QuietElapsed).is_empty());

        assert_eq!(
            states(&machine.apply(&Trigger::Output { awaiting_input: true })),
            vec![AwaitingInput]
        );
        assert!(machine.apply(&Trigger::QuietElapsed).is_empty());
    }

    #[test]
    fn test_input_resumes_running() {
        let mut machine = SessionStateMachine::new();
        machine.apply(&Trigger::Output { awaiting_input: true });
        assert_eq!(states(&machine.apply(&Trigger::InputSent)), vec![Running]);
        assert!(machine.apply(&Trigger::InputSent).is_empty());
    }

    #[test]
    fn test_spawn_failure_skips_running() {
        let mut machine = SessionStateMachine::new();
        let steps = machine.apply(&Trigger::SpawnFailed("not found".into()));
        assert_eq!(
            steps,
            vec![Transition {
                from: Starting,
                to: Errored
            }]
        );
        assert!(machine.apply(&Trigger::IoFailure("again".into())).is_empty());
    }

    #[test]
    fn test_silent_exit_is_an_error() {
        let mut machine = SessionStateMachine::new();
        let steps = machine.apply(&Trigger::Exited { code: 1 });
        assert_eq!(states(&steps), vec![Errored, Terminated]);
    }

    #[test]
    fn test_requested_exit_is_not_an_error() {
        let mut machine = SessionStateMachine::new();
        machine.request_termination();
        let steps = machine.apply(&Trigger::Exited { code: 137 });
        assert_eq!(states(&steps), vec![Terminated]);
    }

    #[test]
    fn test_terminated_is_absorbing() {
        let mut machine = SessionStateMachine::new();
        machine.apply(&Trigger::Output { awaiting_input: false });
        machine.apply(&Trigger::Exited { code: 0 });
        assert_eq!(machine.state(), Terminated);

        for trigger in [
            Trigger::Output { awaiting_input: true },
            Trigger::QuietElapsed,
            Trigger::InputSent,
            Trigger::IoFailure("late".into()),
            Trigger::Exited { code: 0 },
            Trigger::TerminationRequested,
        ] {
            assert!(machine.apply(&trigger).is_empty(), "{trigger:?} moved a terminated session");
        }
        assert_eq!(machine.state(), Terminated);
    }

    #[test]
    fn test_never_returns_to_starting() {
        let mut machine = SessionStateMachine::new();
        let triggers = [
            Trigger::Output { awaiting_input: false },
            Trigger::QuietElapsed,
            Trigger::Output { awaiting_input: true },
            Trigger::InputSent,
            Trigger::IoFailure("boom".into()),
            Trigger::Exited { code: 0 },
        ];
        for trigger in &triggers {
            for step in machine.apply(trigger) {
                assert_ne!(step.to, Starting);
            }
        }
    }

    #[test]
    fn test_errored_session_terminates_on_exit() {
        let mut machine = SessionStateMachine::new();
        machine.apply(&Trigger::Output { awaiting_input: false });
        machine.apply(&Trigger::IoFailure("read failed".into()));
        assert_eq!(states(&machine.apply(&Trigger::Exited { code: 0 })), vec![Terminated]);
    }

    #[test]
    fn test_state_classification() {
        assert!(Starting.is_live());
        assert!(AwaitingInput.is_live());
        assert!(!Errored.is_live());
        assert!(!Terminated.is_live());
        assert!(Idle.accepts_input());
        assert!(!Errored.accepts_input());
    }
}
