use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use super::{LaunchSpec, Session, SessionId, SessionSnapshot};
use crate::error::{CoreError, Result};
use crate::mux::{EventBus, EventKind};

/// Authoritative collection of sessions.
///
/// The map lock only covers structural changes (create/remove/list). Once a
/// caller holds an `Arc<Session>`, reading its state or buffer never touches
/// the map again.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<BTreeMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
    next_pin: AtomicU64,
    buffer_capacity: usize,
    bus: EventBus,
}

impl SessionRegistry {
    pub fn new(buffer_capacity: usize, bus: EventBus) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            next_pin: AtomicU64::new(1),
            buffer_capacity,
            bus,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<SessionId, Arc<Session>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<SessionId, Arc<Session>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new session in `Starting`. Nothing is spawned for it.
    pub fn create(&self, launch: LaunchSpec) -> Result<SessionId> {
        let session = self.insert(launch, None)?;
        session.settle_spawn();
        Ok(session.id())
    }

    /// Register a new session unless `limit` live sessions already exist.
    ///
    /// The count and the insert happen under one write lock so concurrent
    /// creates cannot overshoot the limit.
    pub(crate) fn create_within(&self, launch: LaunchSpec, limit: usize) -> Result<Arc<Session>> {
        self.insert(launch, Some(limit))
    }

    fn insert(&self, launch: LaunchSpec, limit: Option<usize>) -> Result<Arc<Session>> {
        launch.validate()?;

        let session = {
            let mut sessions = self.write();
            if let Some(limit) = limit {
                let live = sessions.values().filter(|s| s.state().is_live()).count();
                if live >= limit {
                    return Err(CoreError::CapacityExceeded { limit });
                }
            }
            let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
            let session = Arc::new(Session::new(id, launch, self.buffer_capacity, self.bus.clone()));
            sessions.insert(id, Arc::clone(&session));
            session
        };

        info!(session = %session.id(), kind = %session.kind(), command = %session.launch().command_line(), "session created");
        self.bus.publish(session.id(), EventKind::Created);
        Ok(session)
    }

    pub fn get(&self, id: SessionId) -> Result<SessionSnapshot> {
        self.handle(id).map(|session| session.snapshot())
    }

    pub fn handle(&self, id: SessionId) -> Result<Arc<Session>> {
        self.read().get(&id).cloned().ok_or(CoreError::NotFound(id))
    }

    /// Every session, in creation order.
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.read().values().cloned().collect()
    }

    /// Summaries of every session, in creation order.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        self.all().iter().map(|s| s.snapshot()).collect()
    }

    /// Summaries with pinned sessions first (most recently pinned on top),
    /// then the rest in creation order.
    pub fn display_order(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<_> = self
            .all()
            .into_iter()
            .map(|s| (s.pinned_at(), s.snapshot()))
            .collect();
        // stable sort keeps creation order among unpinned sessions
        sessions.sort_by_key(|(pinned_at, _)| match pinned_at {
            Some(order) => (0, u64::MAX - order),
            None => (1, 0),
        });
        sessions.into_iter().map(|(_, snapshot)| snapshot).collect()
    }

    /// Drop a session that has finished.
    pub fn remove(&self, id: SessionId) -> Result<()> {
        {
            let mut sessions = self.write();
            let session = sessions.get(&id).ok_or(CoreError::NotFound(id))?;
            if !session.is_disposable() {
                return Err(CoreError::StillRunning(id));
            }
            sessions.remove(&id);
        }

        debug!(session = %id, "session removed");
        self.bus.publish(id, EventKind::Removed);
        Ok(())
    }

    /// Toggle a session's pin and return whether it is now pinned.
    pub fn toggle_pin(&self, id: SessionId) -> Result<bool> {
        let session = self.handle(id)?;
        let pinned = session.pinned_at().is_none();
        let order = pinned.then(|| self.next_pin.fetch_add(1, Ordering::Relaxed));
        session.set_pinned(order);
        Ok(pinned)
    }

    pub fn live_count(&self) -> usize {
        self.read().values().filter(|s| s.state().is_live()).count()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
