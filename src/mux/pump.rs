use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::policy::InputMarkerPolicy;
use crate::process::{self, ProcessHandle, SpawnedProcess};
use crate::session::{LineAssembler, OutputLine, Session, SessionState, Stream, Trigger};

const READ_CHUNK: usize = 8 * 1024;

/// How many trailing lines of a chunk the marker policy gets to see.
const MARKER_WINDOW: usize = 20;

/// Timing knobs for the per-session pumps.
#[derive(Debug, Clone, Copy)]
pub struct PumpSettings {
    /// Quiet interval before a running session counts as idle
    pub idle_timeout: Duration,
    /// Capacity of each session's input queue
    pub input_queue: usize,
    /// How long a pump keeps draining pipes after its process exited
    pub drain_timeout: Duration,
}

/// Fans every session's I/O out onto independent tasks.
///
/// Each process gets three tasks: a supervisor that owns the child, an
/// output pump and an input forwarder. No task waits on another session's
/// I/O, so a stalled tool cannot hold up the rest.
#[derive(Debug)]
pub struct IoMultiplexer {
    runtime: Handle,
    tasks: TaskTracker,
    settings: PumpSettings,
}

impl IoMultiplexer {
    /// Fails with [`CoreError::Runtime`] outside a tokio runtime.
    pub fn new(settings: PumpSettings) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| CoreError::Runtime(e.to_string()))?;
        Ok(Self {
            runtime,
            tasks: TaskTracker::new(),
            settings,
        })
    }

    pub fn settings(&self) -> PumpSettings {
        self.settings
    }

    /// Number of pump tasks still running.
    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Enter the runtime; process spawning needs its reactor.
    pub(crate) fn enter(&self) -> tokio::runtime::EnterGuard<'_> {
        self.runtime.enter()
    }

    /// Start pumping a freshly spawned process on behalf of `session`.
    pub(crate) fn attach(
        &self,
        session: Arc<Session>,
        spawned: SpawnedProcess,
        marker: Arc<dyn InputMarkerPolicy>,
    ) -> ProcessHandle {
        let SpawnedProcess {
            pid,
            child,
            stdin,
            stdout,
            stderr,
        } = spawned;

        let (input_tx, input_rx) = mpsc::channel(self.settings.input_queue.max(1));
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let close_input = CancellationToken::new();
        let stop_pump = CancellationToken::new();

        debug!(session = %session.id(), pid, "attaching pumps");

        self.tasks
            .spawn_on(process::supervise(child, pid, signal_rx, exit_tx), &self.runtime);

        self.tasks.spawn_on(
            forward_input(
                Arc::clone(&session),
                stdin,
                input_rx,
                close_input.clone(),
                exit_rx.clone(),
            ),
            &self.runtime,
        );

        self.tasks.spawn_on(
            pump_output(
                session,
                StreamReader::new(stdout.map(boxed), Stream::Stdout),
                StreamReader::new(stderr.map(boxed), Stream::Stderr),
                exit_rx.clone(),
                stop_pump.clone(),
                marker,
                self.settings,
            ),
            &self.runtime,
        );

        ProcessHandle::new(pid, input_tx, close_input, signal_tx, exit_rx, stop_pump)
    }

    /// Wait for every pump to finish, up to `timeout`. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.tasks.close();
        let done = tokio::time::timeout(timeout, self.tasks.wait()).await.is_ok();
        self.tasks.reopen();
        done
    }
}

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

fn boxed<R: AsyncRead + Send + Unpin + 'static>(reader: R) -> BoxedRead {
    Box::new(reader)
}

/// What one read from a pipe produced.
enum Chunk {
    /// Complete lines plus whatever partial line is still pending
    Data {
        lines: Vec<String>,
        pending: Option<String>,
    },
    /// The pipe closed; carries the flushed trailing partial line, if any
    Eof(Option<String>),
}

struct StreamReader {
    reader: Option<BoxedRead>,
    stream: Stream,
    assembler: LineAssembler,
    buf: Box<[u8]>,
}

impl StreamReader {
    fn new(reader: Option<BoxedRead>, stream: Stream) -> Self {
        Self {
            reader,
            stream,
            assembler: LineAssembler::new(),
            buf: vec![0; READ_CHUNK].into_boxed_slice(),
        }
    }

    fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    /// Read once. Cancel safe: bytes are only consumed after `read` returns.
    async fn next(&mut self) -> std::io::Result<Chunk> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(Chunk::Eof(None));
        };
        let n = reader.read(&mut self.buf).await?;
        if n == 0 {
            self.reader = None;
            return Ok(Chunk::Eof(self.assembler.finish()));
        }
        let lines = self.assembler.push(&self.buf[..n]);
        Ok(Chunk::Data {
            lines,
            pending: self.assembler.pending(),
        })
    }

    /// Flush the trailing partial line, closing the reader.
    fn finish(&mut self) -> Option<String> {
        self.reader = None;
        self.assembler.finish()
    }
}

/// Why the output loop stopped.
enum PumpEnd {
    /// Both pipes closed
    Eof,
    /// Process exited and the drain window ran out with pipes still open
    Drained,
    /// Asked to stop
    Cancelled,
    Failed(std::io::Error),
}

/// Pump one session's stdout and stderr until both close.
///
/// Ends by waiting for the process exit and applying the final transition,
/// so every pump leaves its session `Terminated`.
async fn pump_output(
    session: Arc<Session>,
    mut out: StreamReader,
    mut err: StreamReader,
    mut exit_rx: watch::Receiver<Option<i32>>,
    cancel: CancellationToken,
    marker: Arc<dyn InputMarkerPolicy>,
    settings: PumpSettings,
) {
    let id = session.id();
    let idle = tokio::time::sleep(settings.idle_timeout);
    tokio::pin!(idle);
    let mut idle_armed = false;
    let mut drain_deadline: Option<Instant> = None;
    // input moves a session to Running without any output to re-arm on
    let mut state_rx = session.watch_state();
    let mut state_open = true;

    let end = loop {
        if !out.is_open() && !err.is_open() {
            break PumpEnd::Eof;
        }

        let (stream, result) = tokio::select! {
            biased;
            _ = cancel.cancelled() => break PumpEnd::Cancelled,
            result = out.next(), if out.is_open() => (Stream::Stdout, result),
            result = err.next(), if err.is_open() => (Stream::Stderr, result),
            _ = &mut idle, if idle_armed => {
                idle_armed = false;
                session.apply(Trigger::QuietElapsed);
                continue;
            }
            changed = state_rx.changed(), if state_open => {
                if changed.is_err() {
                    state_open = false;
                } else if *state_rx.borrow_and_update() == SessionState::Running {
                    idle.as_mut().reset(Instant::now() + settings.idle_timeout);
                    idle_armed = true;
                }
                continue;
            }
            _ = exit_rx.changed(), if drain_deadline.is_none() => {
                drain_deadline = Some(Instant::now() + settings.drain_timeout);
                continue;
            }
            _ = tokio::time::sleep_until(drain_deadline.unwrap_or_else(Instant::now)), if drain_deadline.is_some() => {
                break PumpEnd::Drained;
            }
        };

        match result {
            Ok(Chunk::Data { lines, pending }) => {
                deliver(&session, stream, lines, pending, marker.as_ref());
                idle.as_mut().reset(Instant::now() + settings.idle_timeout);
                idle_armed = true;
            }
            Ok(Chunk::Eof(Some(last))) => {
                deliver(&session, stream, vec![last], None, marker.as_ref());
            }
            Ok(Chunk::Eof(None)) => {}
            Err(e) => break PumpEnd::Failed(e),
        }
    };

    for reader in [&mut out, &mut err] {
        if let Some(last) = reader.finish() {
            deliver(&session, reader.stream, vec![last], None, marker.as_ref());
        }
    }

    match end {
        PumpEnd::Eof => debug!(session = %id, "output closed"),
        PumpEnd::Drained => debug!(session = %id, "stopped draining after exit"),
        PumpEnd::Cancelled => debug!(session = %id, "pump cancelled"),
        PumpEnd::Failed(e) => {
            warn!(session = %id, error = %e, "output read failed");
            session.apply(Trigger::IoFailure(format!("read failed: {e}")));
        }
    }

    let code = process::wait_for_exit(exit_rx).await;
    session.apply(Trigger::Exited { code });
}

fn deliver(
    session: &Session,
    stream: Stream,
    lines: Vec<String>,
    pending: Option<String>,
    marker: &dyn InputMarkerPolicy,
) {
    let recent = lines
        .iter()
        .skip(lines.len().saturating_sub(MARKER_WINDOW))
        .map(String::as_str)
        .chain(pending.as_deref())
        .collect::<Vec<_>>()
        .join("\n");
    let awaiting_input = !recent.is_empty() && marker.matches(&recent);

    let lines = lines
        .into_iter()
        .map(|text| OutputLine::new(text, stream))
        .collect();
    session.record_output(lines, awaiting_input);
}

/// Forward queued input to the process until input is closed or it exits.
async fn forward_input(
    session: Arc<Session>,
    stdin: Option<ChildStdin>,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
    close: CancellationToken,
    mut exit_rx: watch::Receiver<Option<i32>>,
) {
    let Some(mut stdin) = stdin else {
        return;
    };

    loop {
        let bytes = tokio::select! {
            biased;
            _ = close.cancelled() => break,
            _ = exit_rx.changed() => break,
            msg = input_rx.recv() => match msg {
                Some(bytes) => bytes,
                None => break,
            },
        };

        // a full pipe must not keep input open past close or exit
        let written = tokio::select! {
            biased;
            _ = close.cancelled() => break,
            _ = exit_rx.changed() => break,
            written = async {
                stdin.write_all(&bytes).await?;
                stdin.flush().await
            } => written,
        };

        if let Err(e) = written {
            warn!(session = %session.id(), error = %e, "input write failed");
            session.apply(Trigger::IoFailure(format!("write failed: {e}")));
            break;
        }
    }

    debug!(session = %session.id(), "input closed");
    // dropping stdin closes the pipe
}
