use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_mux::{LaunchSpec, MuxConfig, Orchestrator, SessionId};
use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyEventKind};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod actions;
mod app;

use actions::Action;
use app::{clipboard_text, App};

/// Log to a file; stdout belongs to the TUI.
fn init_logging() -> Result<PathBuf> {
    let dir = dirs::cache_dir()
        .context("could not determine cache directory")?
        .join("agent-mux");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;

    let path = dir.join("agent-mux.log");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(path)
}

/// Surface a failed core operation in the status bar.
///
/// Fatal errors end the session loop so the orchestrator can shut down.
fn report<T>(tx: &UnboundedSender<Action>, result: agent_mux::Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) if e.is_fatal() => {
            error!(error = %e, "fatal orchestrator error");
            let _ = tx.send(Action::Quit);
            None
        }
        Err(e) => {
            warn!(error = %e, "operation failed");
            let _ = tx.send(Action::Error(e.to_string()));
            None
        }
    }
}

/// Carry out an action the app queued.
///
/// Anything that waits on a process runs on its own task so the UI keeps
/// drawing.
fn dispatch(
    orchestrator: &Arc<Orchestrator>,
    action: Action,
    tx: &UnboundedSender<Action>,
    input_tx: &UnboundedSender<(SessionId, Vec<u8>)>,
    cwd: &Path,
) {
    match action {
        Action::SwitchSession(id) => {
            report(tx, orchestrator.switch_active(id));
        }
        Action::CreateSession(command) => {
            let created = LaunchSpec::parse(None, &command, cwd)
                .and_then(|launch| orchestrator.create_session(launch));
            if let Some(id) = report(tx, created) {
                let _ = tx.send(Action::Notice(format!("Launched '{command}' as session {id}")));
            }
        }
        Action::SendInput(id, bytes) => {
            let _ = input_tx.send((id, bytes));
        }
        Action::Interrupt(id) => {
            report(tx, orchestrator.interrupt(id));
        }
        Action::RenameSession(id, label) => {
            report(tx, orchestrator.rename(id, &label));
        }
        Action::TogglePin(id) => {
            report(tx, orchestrator.toggle_pin(id));
        }
        Action::CopyOutput(id) => {
            let Some(lines) = report(tx, orchestrator.snapshot(id)) else {
                return;
            };
            let copied = arboard::Clipboard::new()
                .and_then(|mut clipboard| clipboard.set_text(clipboard_text(&lines)));
            let _ = match copied {
                Ok(()) => tx.send(Action::Notice(format!(
                    "Copied {} lines from session {id}",
                    lines.len()
                ))),
                Err(e) => tx.send(Action::Error(format!("Clipboard error: {e}"))),
            };
        }
        Action::DeleteSession(id) => {
            let orchestrator = Arc::clone(orchestrator);
            let tx = tx.clone();
            tokio::spawn(async move {
                let removed = match orchestrator.terminate(id, true).await {
                    Ok(_) => orchestrator.remove(id),
                    Err(e) => Err(e),
                };
                if report(&tx, removed).is_some() {
                    let _ = tx.send(Action::Notice(format!("Session {id} deleted")));
                }
            });
        }
        Action::RestartSession(id) => {
            let orchestrator = Arc::clone(orchestrator);
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Some(new_id) = report(&tx, orchestrator.restart_session(id).await) {
                    let _ = tx.send(Action::Notice(format!(
                        "Session {id} restarted as {new_id}"
                    )));
                }
            });
        }
        _ => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_path = init_logging()?;
    let config = MuxConfig::load().context("failed to load config")?;
    let orchestrator = Arc::new(Orchestrator::new(config).context("failed to start orchestrator")?);
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    info!(log = %log_path.display(), "agent-mux starting");

    // Create event channel
    let (tx, mut rx) = mpsc::unbounded_channel::<Action>();

    // Initialize terminal
    let mut terminal = ratatui::init();

    // Spawn input handler
    let key_tx = tx.clone();
    tokio::task::spawn_blocking(move || loop {
        if event::poll(Duration::from_millis(100)).unwrap_or(false) {
            if let Ok(Event::Key(key)) = event::read() {
                if key.kind == KeyEventKind::Press && key_tx.send(Action::KeyPress(key)).is_err() {
                    break;
                }
            }
        } else if key_tx.is_closed() {
            break;
        }
    });

    // Forward core events
    let mut events = orchestrator.subscribe();
    let core_tx = tx.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if core_tx.send(Action::Core(event)).is_err() {
                break;
            }
        }
    });

    // Typed lines go out one at a time so they reach each session in order
    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<(SessionId, Vec<u8>)>();
    let input_orchestrator = Arc::clone(&orchestrator);
    let input_err_tx = tx.clone();
    tokio::spawn(async move {
        while let Some((id, bytes)) = input_rx.recv().await {
            report(&input_err_tx, input_orchestrator.send_input(id, bytes).await);
        }
    });

    let mut app = App::new();

    // Main event loop
    let result = loop {
        if app.dirty {
            app.refresh(&orchestrator);
        }
        if let Err(e) = terminal.draw(|f| app.render(f)) {
            break Err(e).context("failed to draw");
        }

        for pending_action in app.take_pending_actions() {
            dispatch(&orchestrator, pending_action, &tx, &input_tx, &cwd);
        }

        let Some(action) = rx.recv().await else {
            break Ok(());
        };
        match app.handle_action(action) {
            Ok(true) => break Ok(()),
            Ok(false) => {}
            Err(e) => break Err(e),
        }

        // catch up on whatever else arrived before redrawing
        let mut quit = false;
        while let Ok(action) = rx.try_recv() {
            match app.handle_action(action) {
                Ok(true) => {
                    quit = true;
                    break;
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "action failed"),
            }
        }
        if quit {
            break Ok(());
        }
    };

    // Restore terminal
    ratatui::restore();

    let summary = orchestrator.shutdown().await;
    if !summary.force_killed.is_empty() {
        eprintln!(
            "agent-mux: force-killed {} session(s) that ignored shutdown",
            summary.force_killed.len()
        );
    }
    result
}
