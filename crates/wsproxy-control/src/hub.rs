//! Registry of active sessions
//!
//! The hub hands out correlation names for logging, keeps every registered
//! session keyed by its random id, and closes all of them at shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::session::Session;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("hub already stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HubState {
    Running,
    Stopped,
}

struct HubInner {
    state: HubState,
    sessions: HashMap<u64, Arc<Session>>,
}

pub struct Hub {
    /// Last correlation name handed out
    counter: AtomicU64,
    inner: Mutex<HubInner>,
}

impl Hub {
    pub fn new() -> Self {
        debug!("Creating new hub");
        Self {
            counter: AtomicU64::new(0),
            inner: Mutex::new(HubInner {
                state: HubState::Running,
                sessions: HashMap::new(),
            }),
        }
    }

    /// Next correlation name, strictly increasing from 1.
    ///
    /// Only meant for log correlation; sessions are keyed by their id.
    pub fn next_correlation_name(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Register a session under its id. Last write wins on an id collision.
    pub async fn add(&self, session: Arc<Session>) -> Result<(), HubError> {
        let mut inner = self.inner.lock().await;

        if inner.state == HubState::Stopped {
            return Err(HubError::Stopped);
        }

        let id = session.id();
        let name = session.name();
        if let Some(replaced) = inner.sessions.insert(id, session) {
            warn!(
                "hub: session id {} of connection {} replaced by connection {}",
                id,
                replaced.name(),
                name
            );
        }

        Ok(())
    }

    /// Drop a session from the registry; unknown ids are ignored
    pub async fn remove(&self, id: u64) -> Option<Arc<Session>> {
        self.inner.lock().await.sessions.remove(&id)
    }

    /// Drop `session` only if it still owns its id slot.
    ///
    /// A session replaced on an id collision must not evict its replacement.
    pub async fn release(&self, session: &Arc<Session>) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.sessions.get(&session.id()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                inner.sessions.remove(&session.id());
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, id: u64) -> Option<Arc<Session>> {
        self.inner.lock().await.sessions.get(&id).cloned()
    }

    /// Refuse further registrations. Returns `true` only for the call that
    /// performed the transition.
    pub async fn stop(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state == HubState::Stopped {
            return false;
        }
        inner.state = HubState::Stopped;
        info!("hub stopped");
        true
    }

    pub async fn is_stopped(&self) -> bool {
        self.inner.lock().await.state == HubState::Stopped
    }

    /// Close every registered session and empty the registry.
    ///
    /// The registry lock is held for the whole sweep, so no session can be
    /// added halfway through and escape it. Returns how many sessions were
    /// registered.
    pub async fn close_all(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let count = inner.sessions.len();

        info!("hub: closing {} connections", count);
        for session in inner.sessions.values() {
            session.close().await;
        }
        inner.sessions.clear();

        count
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
