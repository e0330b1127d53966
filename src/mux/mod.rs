mod events;
mod pump;

pub use events::{EventBus, EventKind, EventRecord, EventStream};
pub use pump::{IoMultiplexer, PumpSettings};
