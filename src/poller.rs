//! Per-session scheduled `Facts` polling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::event::{command_name, get_facts_payload, Event};
use crate::fact::{FactCache, FactKind};
use crate::session::SessionId;

struct PollerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Tracks the single active poller per session, per `spec.md` §4.4's
/// last-call-wins tie-break: starting a new poller for a session that
/// already has one stops the old one first.
pub struct PollerTable<W> {
    inner: Mutex<HashMap<SessionId, PollerHandle>>,
    _marker: std::marker::PhantomData<fn() -> W>,
}

impl<W> Default for PollerTable<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<W> PollerTable<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            _marker: std::marker::PhantomData,
        }
    }

    /// Start polling `kinds` on `session` at `interval`, replacing any
    /// poller already running for that session.
    pub async fn start(
        &self,
        connection: Arc<Connection<W>>,
        cache: FactCache,
        event_tx: mpsc::UnboundedSender<Event>,
        session: SessionId,
        kinds: Vec<FactKind>,
        interval: Duration,
    ) {
        self.stop(session).await;

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            Self::run(connection, cache, event_tx, session, kinds, interval, loop_cancel).await;
        });
        self.inner
            .lock()
            .unwrap()
            .insert(session, PollerHandle { cancel, join });
    }

    /// Stop the poller for `session`, if any, and await its shutdown.
    pub async fn stop(&self, session: SessionId) {
        let handle = self.inner.lock().unwrap().remove(&session);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            let _ = handle.join.await;
        }
    }

    pub fn is_running(&self, session: SessionId) -> bool {
        self.inner.lock().unwrap().contains_key(&session)
    }

    async fn run(
        connection: Arc<Connection<W>>,
        cache: FactCache,
        event_tx: mpsc::UnboundedSender<Event>,
        session: SessionId,
        kinds: Vec<FactKind>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately; consume it up front

        // Tracks the in-flight poll request so a new tick can cancel and
        // replace it rather than let requests queue up unbounded.
        let mut outstanding: Option<(CancellationToken, JoinHandle<()>)> = None;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some((prev_cancel, prev_join)) = outstanding.take() {
                        prev_cancel.cancel();
                        let _ = prev_join.await;
                    }
                    let request_cancel = CancellationToken::new();
                    let join = tokio::spawn(Self::issue_poll(
                        connection.clone(),
                        cache.clone(),
                        event_tx.clone(),
                        session,
                        kinds.clone(),
                        request_cancel.clone(),
                    ));
                    outstanding = Some((request_cancel, join));
                }
            }
        }

        if let Some((prev_cancel, prev_join)) = outstanding.take() {
            prev_cancel.cancel();
            let _ = prev_join.await;
        }
    }

    async fn issue_poll(
        connection: Arc<Connection<W>>,
        cache: FactCache,
        event_tx: mpsc::UnboundedSender<Event>,
        session: SessionId,
        kinds: Vec<FactKind>,
        cancel: CancellationToken,
    ) {
        let payload = get_facts_payload(&kinds);
        let result = connection
            .send_command(command_name::GET_FACTS, payload, true, None, cancel)
            .await;
        // A cancelled/timed-out/disconnected poll is silently skipped; the
        // next tick will simply try again.
        let Ok(Some(Event::Facts { response, .. })) = result else {
            return;
        };
        for fact in &response.facts {
            cache.put(session, fact.clone());
        }
        let _ = event_tx.send(Event::Facts { session, response });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{encode_envelope, FactsResponse};
    use crate::fact::Fact;
    use crate::frame::{self, Role};
    use tokio::io::duplex;

    async fn connected_pair() -> (
        Arc<Connection<tokio::io::WriteHalf<tokio::io::DuplexStream>>>,
        tokio::io::DuplexStream,
        mpsc::UnboundedReceiver<Event>,
        SessionId,
    ) {
        let (mut client, mut server) = duplex(1 << 16);
        let (tx, rx) = mpsc::unbounded_channel();

        let client_task = tokio::spawn(async move {
            frame::handshake(&mut client, Role::Dialer, 1 << 20).await.unwrap();
            client
        });
        let server_task = tokio::spawn(async move {
            frame::handshake(&mut server, Role::Acceptor, 1 << 20).await.unwrap();
            server
        });
        let (client, server) = tokio::join!(client_task, server_task);
        let (client, server) = (client.unwrap(), server.unwrap());
        let (client_read, client_write) = tokio::io::split(client);

        let session = SessionId::new();
        let conn = Connection::new(
            session,
            "127.0.0.1".to_owned(),
            4502,
            None,
            client_write,
            1 << 20,
            Duration::from_secs(5),
            tx,
        );
        conn.start(client_read).await;

        (conn, server, rx, session)
    }

    /// A stub peer that answers every `GetFacts` with a fresh `Workspace`
    /// fact, echoing the request's UID, until told to stop.
    async fn serve_facts(mut server: tokio::io::DuplexStream, mut stop: mpsc::UnboundedReceiver<()>) {
        loop {
            tokio::select! {
                _ = stop.recv() => return,
                frame = frame::read_frame(&mut server, 1 << 20) => {
                    let Ok(payload) = frame else { return };
                    let (_, value): (String, serde_json::Value) =
                        serde_json::from_slice(&payload).unwrap();
                    let uid = value["UID"].as_str().unwrap().to_owned();
                    let response = FactsResponse {
                        uid: Some(uid),
                        interval: None,
                        facts: vec![Fact::Workspace(serde_json::json!("ws"))],
                    };
                    let payload = serde_json::to_value(&response).unwrap();
                    let bytes = encode_envelope(command_name::FACTS, payload, None).unwrap();
                    if frame::write_frame(&mut server, &bytes).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn start_populates_cache_and_publishes_facts_events() {
        let (conn, server, mut rx, session) = connected_pair().await;
        let _connected = rx.recv().await.unwrap();

        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let server_task = tokio::spawn(serve_facts(server, stop_rx));

        let cache = FactCache::new(Duration::from_secs(60));
        let table: PollerTable<tokio::io::WriteHalf<tokio::io::DuplexStream>> = PollerTable::new();
        let (poll_tx, mut poll_rx) = mpsc::unbounded_channel();
        table
            .start(
                conn.clone(),
                cache.clone(),
                poll_tx,
                session,
                vec![FactKind::Workspace],
                Duration::from_millis(20),
            )
            .await;

        // Drain at least two Facts events to confirm repeated polling.
        for _ in 0..2 {
            match poll_rx.recv().await.unwrap() {
                Event::Facts { .. } => {}
                other => panic!("expected Facts, got {other:?}"),
            }
        }
        assert_eq!(
            cache.get(session, FactKind::Workspace),
            Some(Fact::Workspace(serde_json::json!("ws")))
        );
        assert!(rx.try_recv().is_err(), "poller must publish to its own channel, not the connection's");

        table.stop(session).await;
        assert!(!table.is_running(session));

        let _ = stop_tx.send(());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn starting_a_second_poller_for_the_same_session_replaces_the_first() {
        let (conn, server, mut rx, session) = connected_pair().await;
        let _connected = rx.recv().await.unwrap();

        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let server_task = tokio::spawn(serve_facts(server, stop_rx));

        let cache = FactCache::new(Duration::from_secs(60));
        let table: PollerTable<tokio::io::WriteHalf<tokio::io::DuplexStream>> = PollerTable::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        table
            .start(conn.clone(), cache.clone(), tx_a, session, vec![FactKind::Host], Duration::from_millis(500))
            .await;
        assert!(table.is_running(session));

        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        table
            .start(
                conn.clone(),
                cache.clone(),
                tx_b,
                session,
                vec![FactKind::Workspace],
                Duration::from_millis(20),
            )
            .await;

        match rx_b.recv().await.unwrap() {
            Event::Facts { .. } => {}
            other => panic!("expected Facts from the replacement poller, got {other:?}"),
        }

        table.stop(session).await;
        let _ = stop_tx.send(());
        server_task.await.unwrap();
    }
}
