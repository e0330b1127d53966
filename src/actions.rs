use agent_mux::{EventRecord, SessionId};
use crossterm::event::KeyEvent;

/// Actions that can be dispatched through the application
#[derive(Debug, Clone)]
pub enum Action {
    /// A key was pressed
    KeyPress(KeyEvent),
    /// Something changed in the core
    Core(EventRecord),
    /// An error occurred
    Error(String),
    /// An informational message for the status bar
    Notice(String),
    /// Request to quit the application
    Quit,
    /// Make a session the active one
    SwitchSession(SessionId),
    /// Launch a new session from a command line
    CreateSession(String),
    /// Terminate and remove a session
    DeleteSession(SessionId),
    /// Terminate a session and launch a fresh one in its place
    RestartSession(SessionId),
    /// Forward bytes to a session's stdin
    SendInput(SessionId, Vec<u8>),
    /// Ctrl+C to the session's process group
    Interrupt(SessionId),
    /// Set or clear a session's label
    RenameSession(SessionId, String),
    /// Pin or unpin a session at the top of the list
    TogglePin(SessionId),
    /// Copy a session's retained output to the clipboard
    CopyOutput(SessionId),
}
