use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::session::{SessionId, SessionState};

/// What happened to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// `lines` complete lines were appended to the session's buffer
    OutputAppended { lines: usize },
    /// Label or pin changed
    MetadataChanged,
    Removed,
}

/// An immutable session-change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Position in the bus; strictly increasing across all sessions
    pub seq: u64,
    pub session_id: SessionId,
    pub kind: EventKind,
    pub at: DateTime<Utc>,
}

/// Ordered, multi-subscriber stream of session changes.
///
/// Each subscriber gets its own unbounded queue, so a slow display never
/// blocks a pump and never loses events. Records are numbered and fanned out
/// under one lock, so every subscriber sees the same order.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

#[derive(Debug, Default)]
struct BusInner {
    next_seq: u64,
    subscribers: Vec<mpsc::UnboundedSender<EventRecord>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish(&self, session_id: SessionId, kind: EventKind) -> EventRecord {
        let mut inner = self.lock();
        inner.next_seq += 1;
        let record = EventRecord {
            seq: inner.next_seq,
            session_id,
            kind,
            at: Utc::now(),
        };
        inner
            .subscribers
            .retain(|tx| tx.send(record.clone()).is_ok());
        record
    }

    /// Start receiving events published from now on.
    ///
    /// The queue is unbounded so publishers never wait and nothing is
    /// dropped. A stream that is kept but never read grows for as long as
    /// sessions keep changing; drop it to unsubscribe.
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        EventStream { rx }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.len()
    }
}

/// One subscriber's view of the bus.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<EventRecord>,
}

impl EventStream {
    /// Wait for the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<EventRecord> {
        self.rx.recv().await
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<EventRecord> {
        self.rx.try_recv().ok()
    }

    /// Take everything queued right now.
    pub fn drain(&mut self) -> Vec<EventRecord> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
