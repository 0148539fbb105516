//! Session identity, metadata, and the process-wide session table.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::RwLock;

use uuid::Uuid;

/// Opaque identifier for one live connection. Generated on accept/dial
/// completion and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side initiated the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Lifecycle state of a session, per `spec.md` §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Ready,
    Closing,
    Closed,
}

/// Metadata about one session, owned exclusively by `SessionRegistry`.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub host: String,
    pub port: u16,
    pub name: Option<String>,
    pub state: SessionState,
    pub direction: Direction,
}

impl Session {
    pub fn new(
        id: SessionId,
        host: impl Into<String>,
        port: u16,
        name: Option<String>,
        direction: Direction,
    ) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            name,
            state: SessionState::Connecting,
            direction,
        }
    }
}

/// Callback invoked when a session is removed from the registry.
pub type DisconnectCallback = Arc<dyn Fn(SessionId) + Send + Sync>;

/// Process-wide mapping from `SessionId` to `Session`.
///
/// All mutations are serialized behind a single `RwLock`; readers observe
/// a consistent snapshot. Removing a session is the trigger point the
/// orchestrator uses to cascade cleanup into `FactCache` and `Poller`.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<SessionId, Session>>>,
    on_remove: Arc<RwLock<Vec<DisconnectCallback>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            on_remove: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a callback fired (synchronously, in registration order)
    /// whenever a session is removed.
    pub fn on_remove(&self, cb: DisconnectCallback) {
        self.on_remove.write().unwrap().push(cb);
    }

    pub fn insert(&self, session: Session) {
        self.inner.write().unwrap().insert(session.id, session);
    }

    pub fn set_state(&self, id: SessionId, state: SessionState) {
        if let Some(s) = self.inner.write().unwrap().get_mut(&id) {
            s.state = state;
        }
    }

    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.inner.read().unwrap().get(&id).cloned()
    }

    /// `true` when the session exists and is in the `Ready` state.
    pub fn is_ready(&self, id: SessionId) -> bool {
        matches!(
            self.inner.read().unwrap().get(&id),
            Some(s) if s.state == SessionState::Ready
        )
    }

    pub fn remove(&self, id: SessionId) -> Option<Session> {
        let removed = self.inner.write().unwrap().remove(&id);
        if removed.is_some() {
            for cb in self.on_remove.read().unwrap().iter() {
                cb(id);
            }
        }
        removed
    }

    pub fn enumerate(&self) -> Vec<Session> {
        self.inner.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
