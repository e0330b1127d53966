//! Session orchestration core for agent-mux.
//!
//! Launches AI coding tools as subprocesses, pumps their output into
//! per-session buffers, tracks each session's lifecycle state and publishes
//! changes on an event bus for the display layer.

pub mod config;
pub mod error;
pub mod mux;
pub mod orchestrator;
pub mod policy;
pub mod process;
pub mod session;

pub use config::MuxConfig;
pub use error::{CoreError, Result};
pub use mux::{EventBus, EventKind, EventRecord, EventStream, IoMultiplexer};
pub use orchestrator::{Orchestrator, ShutdownReport, Termination};
pub use policy::{InputMarkerPolicy, MarkerPolicies, NeverMatches, RegexMarker};
pub use process::{CommandSpawner, ProcessHandle, SpawnedProcess, Spawner};
pub use session::{
    LaunchSpec, OutputBuffer, OutputLine, SessionId, SessionRegistry, SessionSnapshot,
    SessionState, Stream, ToolKind,
};
