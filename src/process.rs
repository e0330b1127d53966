use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::LaunchSpec;

/// A freshly started process and its pipes.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub pid: u32,
    pub child: Child,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

/// Starts OS processes for sessions.
pub trait Spawner: Send + Sync {
    fn spawn(&self, launch: &LaunchSpec) -> std::io::Result<SpawnedProcess>;
}

/// Spawns the command directly (no shell) with all three pipes attached.
///
/// Each child leads its own process group so signals reach anything the
/// tool forks.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandSpawner;

impl Spawner for CommandSpawner {
    fn spawn(&self, launch: &LaunchSpec) -> std::io::Result<SpawnedProcess> {
        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .current_dir(&launch.cwd)
            .envs(launch.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        // tools get default SIGINT/SIGQUIT even if ours are ignored
        unsafe {
            command.pre_exec(|| {
                for sig in [Signal::SIGINT, Signal::SIGQUIT] {
                    signal::signal(sig, signal::SigHandler::SigDfl).map_err(std::io::Error::from)?;
                }
                Ok(())
            });
        }
        let mut child = command.spawn()?;

        // a pid of 0 would make killpg signal our own process group
        let pid = child.id().filter(|pid| *pid != 0).ok_or_else(|| {
            std::io::Error::other(format!("{} exited before its pid was read", launch.program))
        })?;
        Ok(SpawnedProcess {
            pid,
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
        })
    }
}

/// Why a message could not be queued for the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Queue stayed full for the whole timeout
    Full,
    /// Input side already closed
    Closed,
}

/// Session-side handle to a running process.
///
/// The `Child` itself is owned by a supervisor task; this handle talks to
/// it through channels, so signals are only ever sent to a pid that has not
/// been reaped yet.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    input_tx: mpsc::Sender<Vec<u8>>,
    close_input: CancellationToken,
    signal_tx: mpsc::UnboundedSender<Signal>,
    exit_rx: watch::Receiver<Option<i32>>,
    stop_pump: CancellationToken,
}

impl ProcessHandle {
    pub(crate) fn new(
        pid: u32,
        input_tx: mpsc::Sender<Vec<u8>>,
        close_input: CancellationToken,
        signal_tx: mpsc::UnboundedSender<Signal>,
        exit_rx: watch::Receiver<Option<i32>>,
        stop_pump: CancellationToken,
    ) -> Self {
        Self {
            pid,
            input_tx,
            close_input,
            signal_tx,
            exit_rx,
            stop_pump,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    /// Whether the input forwarder still holds the process's stdin.
    pub fn input_open(&self) -> bool {
        !self.input_tx.is_closed()
    }

    /// Queue bytes for the process's stdin, waiting at most `timeout` for room.
    pub async fn send(&self, bytes: Vec<u8>, timeout: Duration) -> Result<(), SendError> {
        if self.close_input.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.input_tx
            .send_timeout(bytes, timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => SendError::Full,
                mpsc::error::SendTimeoutError::Closed(_) => SendError::Closed,
            })
    }

    /// Close the process's stdin. Well-behaved tools exit on EOF.
    pub fn close_input(&self) {
        self.close_input.cancel();
    }

    /// Deliver a signal to the process group. Returns false once the
    /// process has been reaped.
    pub fn signal(&self, signal: Signal) -> bool {
        self.signal_tx.send(signal).is_ok()
    }

    pub fn kill(&self) -> bool {
        self.signal(Signal::SIGKILL)
    }

    /// Wait for the process to exit and return its exit code.
    pub async fn wait_exit(&self) -> i32 {
        wait_for_exit(self.exit_rx.clone()).await
    }

    /// Like [`wait_exit`](Self::wait_exit), giving up after `timeout`.
    pub async fn wait_exit_timeout(&self, timeout: Duration) -> Option<i32> {
        tokio::time::timeout(timeout, self.wait_exit()).await.ok()
    }

    /// Tell the output pump to stop reading and wrap up.
    pub(crate) fn stop_pump(&self) {
        self.stop_pump.cancel();
    }
}

pub(crate) async fn wait_for_exit(mut exit_rx: watch::Receiver<Option<i32>>) -> i32 {
    match exit_rx.wait_for(Option::is_some).await {
        Ok(code) => (*code).unwrap_or(-1),
        // supervisor vanished without reporting
        Err(_) => -1,
    }
}

/// Own the child until it exits, delivering signals on request.
pub(crate) async fn supervise(
    mut child: Child,
    pid: u32,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    exit_tx: watch::Sender<Option<i32>>,
) {
    let code = loop {
        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(status) => exit_code(status),
                    Err(e) => {
                        warn!(pid, error = %e, "failed to wait on child");
                        -1
                    }
                };
            }
            Some(sig) = signals.recv() => deliver(&mut child, pid, sig),
        }
    };

    debug!(pid, code, "process exited");
    exit_tx.send_replace(Some(code));
}

/// `killpg` for one child's group. Never signals pid 0 (our own group).
fn signal_group(pid: u32, sig: Signal) -> nix::Result<()> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => signal::killpg(Pid::from_raw(raw), sig),
        _ => Err(nix::errno::Errno::ESRCH),
    }
}

fn deliver(child: &mut Child, pid: u32, sig: Signal) {
    match signal_group(pid, sig) {
        Ok(()) => debug!(pid, signal = %sig, "signalled process group"),
        Err(errno) => {
            debug!(pid, signal = %sig, %errno, "killpg failed");
            if sig == Signal::SIGKILL {
                if let Err(e) = child.start_kill() {
                    warn!(pid, error = %e, "failed to kill child");
                }
            }
        }
    }
}

/// Exit code, or `128 + signal` when the process was killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ToolKind;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new(ToolKind::Other("sh".into()), "sh", std::env::temp_dir())
            .args(["-c", script])
    }

    #[tokio::test]
    async fn test_spawn_reports_pid_and_pipes() {
        let spawned = CommandSpawner.spawn(&sh("exit 0")).unwrap();
        assert!(spawned.pid > 0);
        assert!(spawned.stdin.is_some());
        assert!(spawned.stdout.is_some());
        assert!(spawned.stderr.is_some());
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let launch = LaunchSpec::new(ToolKind::Claude, "agent-mux-no-such-tool", std::env::temp_dir());
        let err = CommandSpawner.spawn(&launch).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_supervise_reports_exit_code() {
        let spawned = CommandSpawner.spawn(&sh("exit 7")).unwrap();
        let (_signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(supervise(spawned.child, spawned.pid, signal_rx, exit_tx));

        assert_eq!(wait_for_exit(exit_rx).await, 7);
    }

    #[tokio::test]
    async fn test_kill_reports_signal_exit() {
        let spawned = CommandSpawner.spawn(&sh("sleep 30")).unwrap();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(supervise(spawned.child, spawned.pid, signal_rx, exit_tx));

        signal_tx.send(Signal::SIGKILL).unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), wait_for_exit(exit_rx))
            .await
            .unwrap();
        assert_eq!(code, 128 + Signal::SIGKILL as i32);
    }

    #[test]
    fn test_pid_zero_is_never_signalled() {
        assert_eq!(signal_group(0, Signal::SIGCONT), Err(nix::errno::Errno::ESRCH));
    }

    #[tokio::test]
    async fn test_kill_falls_back_to_child_without_group() {
        let mut spawned = CommandSpawner.spawn(&sh("sleep 30")).unwrap();
        deliver(&mut spawned.child, 0, Signal::SIGKILL);

        let status = tokio::time::timeout(Duration::from_secs(5), spawned.child.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit_code(status), 128 + Signal::SIGKILL as i32);
    }
}
