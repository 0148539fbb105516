//! The public façade: owns every other component, exposes the unified
//! event stream, and routes consumer calls to the right `Connection`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::connection::Connection;
use crate::dialer::{self, DialerHandle};
use crate::error::HmonError;
use crate::event::{command_name, get_facts_payload, Event, FactsResponse};
use crate::fact::{FactCache, FactKind};
use crate::listener::{self, ListenerHandle};
use crate::poller::PollerTable;
use crate::session::{Direction, Session, SessionId, SessionRegistry, SessionState};

/// Opaque handle to one configured outbound remote, returned by
/// `add_server` and accepted by `remove_server`. A server may be
/// redialed many times over its lifetime (once per retry or reconnect),
/// each producing a distinct `SessionId`; `ServerRef` tracks the
/// configured remote itself, not any one connection to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerRef(Uuid);

impl ServerRef {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

struct DialerEntry {
    handle: DialerHandle,
}

type OwnedConnection = Arc<Connection<OwnedWriteHalf>>;

/// Owns the `SessionRegistry`, `FactCache`, `PollerTable`, every configured
/// `Dialer`, and at most one `Listener`. Constructed once per process (or
/// once per test); `dispose` tears everything down idempotently.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: SessionRegistry,
    cache: FactCache,
    pollers: Arc<PollerTable<OwnedWriteHalf>>,
    connections: Arc<RwLock<HashMap<SessionId, OwnedConnection>>>,
    dialers: Mutex<HashMap<ServerRef, DialerEntry>>,
    listener: tokio::sync::Mutex<Option<ListenerHandle>>,
    internal_tx: mpsc::UnboundedSender<Event>,
    public_tx: mpsc::UnboundedSender<Event>,
    public_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    forward_task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Result<Arc<Self>, HmonError> {
        config.validate()?;

        let (internal_tx, mut internal_rx) = mpsc::unbounded_channel::<Event>();
        let (public_tx, public_rx) = mpsc::unbounded_channel::<Event>();

        let registry = SessionRegistry::new();
        let cache = FactCache::new(config.fact_cache_ttl);
        let pollers = Arc::new(PollerTable::new());
        let connections: Arc<RwLock<HashMap<SessionId, OwnedConnection>>> =
            Arc::new(RwLock::new(HashMap::new()));

        // Cascading cleanup per `spec.md` §4.3: removing a session purges
        // its cache entries and stops its poller.
        let cleanup_cache = cache.clone();
        let cleanup_connections = connections.clone();
        let cleanup_pollers = pollers.clone();
        registry.on_remove(Arc::new(move |session| {
            cleanup_cache.purge_session(session);
            cleanup_connections.write().unwrap().remove(&session);
            let pollers = cleanup_pollers.clone();
            tokio::spawn(async move { pollers.stop(session).await });
        }));

        let forward_registry = registry.clone();
        let forward_public = public_tx.clone();
        let forward_task = tokio::spawn(async move {
            while let Some(event) = internal_rx.recv().await {
                if let Event::SessionDisconnected { session, .. } = &event {
                    forward_registry.remove(*session);
                }
                if forward_public.send(event).is_err() {
                    break;
                }
            }
        });

        Ok(Arc::new(Self {
            config,
            registry,
            cache,
            pollers,
            connections,
            dialers: Mutex::new(HashMap::new()),
            listener: tokio::sync::Mutex::new(None),
            internal_tx,
            public_tx,
            public_rx: Mutex::new(Some(public_rx)),
            forward_task: Mutex::new(Some(forward_task)),
            disposed: AtomicBool::new(false),
        }))
    }

    /// Take ownership of the unified event stream. May be called exactly
    /// once per `Orchestrator`; subsequent calls panic, matching the
    /// single-logical-consumer model in `spec.md` §4.8.
    pub fn take_events(&self) -> mpsc::UnboundedReceiver<Event> {
        self.public_rx
            .lock()
            .unwrap()
            .take()
            .expect("event stream already taken")
    }

    /// Configure an outbound remote. The Dialer starts connecting
    /// immediately and keeps retrying with backoff until the server is
    /// removed or the Orchestrator is disposed.
    pub fn add_server(
        &self,
        host: impl Into<String>,
        port: u16,
        name: Option<String>,
    ) -> ServerRef {
        let host = host.into();
        let server_ref = ServerRef::new();

        let registry = self.registry.clone();
        let connections = self.connections.clone();
        let connected_name = name.clone();
        let on_connected: dialer::OnConnected = Arc::new(move |session, conn| {
            let mut entry = Session::new(
                session,
                conn_remote_host(&conn),
                conn_remote_port(&conn),
                connected_name.clone(),
                Direction::Outbound,
            );
            entry.state = SessionState::Ready;
            registry.insert(entry);
            connections.write().unwrap().insert(session, conn);
        });

        let handle = dialer::spawn(
            host,
            port,
            name,
            self.config.backoff(),
            self.config.max_frame_size,
            self.config.default_command_timeout,
            self.internal_tx.clone(),
            on_connected,
        );

        self.dialers
            .lock()
            .unwrap()
            .insert(server_ref, DialerEntry { handle });
        server_ref
    }

    /// Stop redialing `server_ref` and close its live session, if any.
    pub async fn remove_server(&self, server_ref: ServerRef) {
        let entry = self.dialers.lock().unwrap().remove(&server_ref);
        if let Some(entry) = entry {
            entry.handle.stop().await;
        }
    }

    /// Bind an inbound listener. Returns the actually-bound address (useful
    /// when `port == 0`). Replaces any previously running listener.
    pub async fn start_listener(&self, ip: IpAddr, port: u16) -> Result<std::net::SocketAddr, HmonError> {
        let registry = self.registry.clone();
        let connections = self.connections.clone();
        let on_accepted: listener::OnAccepted = Arc::new(move |session, conn| {
            let mut entry = Session::new(
                session,
                conn_remote_host(&conn),
                conn_remote_port(&conn),
                None,
                Direction::Inbound,
            );
            entry.state = SessionState::Ready;
            registry.insert(entry);
            connections.write().unwrap().insert(session, conn);
        });

        let handle = listener::bind(
            ip,
            port,
            self.config.max_frame_size,
            self.config.default_command_timeout,
            self.internal_tx.clone(),
            on_accepted,
        )
        .await?;
        let addr = handle.local_addr();

        let mut slot = self.listener.lock().await;
        if let Some(old) = slot.take() {
            old.stop().await;
        }
        *slot = Some(handle);
        Ok(addr)
    }

    fn require_ready(&self, session: SessionId) -> Result<OwnedConnection, HmonError> {
        if !self.registry.is_ready(session) {
            return Err(HmonError::SessionNotFound(session));
        }
        self.connections
            .read()
            .unwrap()
            .get(&session)
            .cloned()
            .ok_or(HmonError::SessionNotFound(session))
    }

    async fn request(
        &self,
        session: SessionId,
        command: &str,
        payload: serde_json::Value,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<Event, HmonError> {
        let conn = self.require_ready(session)?;
        match conn
            .send_command(command, payload, true, timeout, cancel)
            .await?
        {
            Some(event) => Ok(event),
            None => Err(HmonError::Protocol(
                "expected a typed response but received none".to_owned(),
            )),
        }
    }

    pub async fn get_facts(
        &self,
        session: SessionId,
        kinds: Vec<FactKind>,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<FactsResponse, HmonError> {
        let conn = self.require_ready(session)?;
        let payload = get_facts_payload(&kinds);
        match conn
            .send_command(command_name::GET_FACTS, payload, true, timeout, cancel)
            .await?
        {
            Some(Event::Facts { response, .. }) => {
                for fact in &response.facts {
                    self.cache.put(session, fact.clone());
                }
                Ok(response)
            }
            _ => Err(HmonError::Protocol(
                "expected a Facts response to GetFacts".to_owned(),
            )),
        }
    }

    /// Read through the `FactCache`. Returns `None` on a cache miss or a
    /// TTL-expired entry; callers that need a fresh value should call
    /// `get_facts` instead.
    pub fn cached_fact(&self, session: SessionId, kind: FactKind) -> Option<crate::fact::Fact> {
        self.cache.get(session, kind)
    }

    pub async fn get_last_known_state(
        &self,
        session: SessionId,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<Event, HmonError> {
        self.request(session, command_name::GET_LAST_KNOWN_STATE, serde_json::json!({}), timeout, cancel)
            .await
    }

    pub async fn subscribe(
        &self,
        session: SessionId,
        payload: serde_json::Value,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<Event, HmonError> {
        self.request(session, command_name::SUBSCRIBE, payload, timeout, cancel).await
    }

    pub async fn bump_facts(
        &self,
        session: SessionId,
        payload: serde_json::Value,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<Event, HmonError> {
        self.request(session, command_name::BUMP_FACTS, payload, timeout, cancel).await
    }

    pub async fn connect_ride(
        &self,
        session: SessionId,
        payload: serde_json::Value,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<Event, HmonError> {
        self.request(session, command_name::CONNECT_RIDE, payload, timeout, cancel).await
    }

    pub async fn disconnect_ride(
        &self,
        session: SessionId,
        payload: serde_json::Value,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<Event, HmonError> {
        self.request(session, command_name::DISCONNECT_RIDE, payload, timeout, cancel).await
    }

    /// Start (or replace) periodic `GetFacts` polling for `session`.
    pub async fn poll_facts(
        &self,
        session: SessionId,
        kinds: Vec<FactKind>,
        interval: Duration,
    ) -> Result<(), HmonError> {
        let conn = self.require_ready(session)?;
        self.pollers
            .start(conn, self.cache.clone(), self.public_tx.clone(), session, kinds, interval)
            .await;
        Ok(())
    }

    pub async fn stop_facts_polling(&self, session: SessionId) {
        self.pollers.stop(session).await;
    }

    /// Idempotent: closes the listener, cancels all dialers, disposes all
    /// connections, and stops forwarding events.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self.listener.lock().await.take() {
            handle.stop().await;
        }

        let dialers: Vec<_> = self.dialers.lock().unwrap().drain().collect();
        for (_, entry) in dialers {
            entry.handle.stop().await;
        }

        let sessions: Vec<_> = self.connections.read().unwrap().keys().copied().collect();
        for session in sessions {
            self.pollers.stop(session).await;
            let conn = self.connections.write().unwrap().remove(&session);
            if let Some(conn) = conn {
                conn.dispose().await;
            }
        }

        if let Some(task) = self.forward_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

fn conn_remote_host(conn: &OwnedConnection) -> String {
    conn.host().to_owned()
}

fn conn_remote_port(conn: &OwnedConnection) -> u16 {
    conn.port()
}
