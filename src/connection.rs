//! One framed HMON session: handshake, read loop, and outbound command
//! correlation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::HmonError;
use crate::event::{decode_command, encode_envelope, CommandPayload, Event};
use crate::frame;
use crate::session::SessionId;

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Event, HmonError>>>>>;

/// One live, handshaken connection to an interpreter.
///
/// Owns the write half directly (serialized behind an async mutex) and
/// hands the read half to a spawned read-loop task. The read loop is the
/// sole writer of `SessionDisconnected`; `dispose` only requests
/// cancellation and waits for that task to finish emitting it.
pub struct Connection<W> {
    session: SessionId,
    host: String,
    port: u16,
    name: Option<String>,
    write_half: AsyncMutex<W>,
    pending: PendingMap,
    cancel: CancellationToken,
    read_loop: AsyncMutex<Option<JoinHandle<()>>>,
    unknown_count: AtomicU64,
    seen_unknown_names: Mutex<HashSet<String>>,
    max_frame_size: u32,
    default_timeout: Duration,
    event_tx: mpsc::UnboundedSender<Event>,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl<W> Connection<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an already-handshaken write half into a not-yet-started
    /// `Connection`. No event is published and no read loop runs until
    /// `start` is called.
    ///
    /// Split this way so a caller (`Dialer`/`Listener`) can register the
    /// session in the orchestrator's registry/connection map *before*
    /// `SessionConnected` becomes observable: if registration instead
    /// happened only after the event was published, a consumer reacting to
    /// `SessionConnected` on another thread could race a request against the
    /// registry insert and see a spurious `SessionNotFound`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: SessionId,
        host: String,
        port: u16,
        name: Option<String>,
        write_half: W,
        max_frame_size: u32,
        default_timeout: Duration,
        event_tx: mpsc::UnboundedSender<Event>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            host,
            port,
            name,
            write_half: AsyncMutex::new(write_half),
            pending: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
            read_loop: AsyncMutex::new(None),
            unknown_count: AtomicU64::new(0),
            seen_unknown_names: Mutex::new(HashSet::new()),
            max_frame_size,
            default_timeout,
            event_tx,
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        })
    }

    /// Publish `SessionConnected` and spawn the read loop over `read_half`.
    /// Callers must have finished registering the session as queryable
    /// (registry + connection map) before calling this, per the ordering
    /// note on `new`.
    ///
    /// The handshake happens on the whole stream before it is split (see
    /// `Dialer`/`Listener`), since `frame::handshake` needs to both read
    /// and write and the split halves each implement only one direction.
    pub async fn start<R>(self: &Arc<Self>, read_half: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let _ = self.event_tx.send(Event::SessionConnected {
            session: self.session,
            host: self.host.clone(),
            port: self.port,
            name: self.name.clone(),
        });

        let host = self.host.clone();
        let port = self.port;
        let name = self.name.clone();
        let loop_conn = self.clone();
        let handle = tokio::spawn(async move {
            Self::read_loop(loop_conn, read_half, host, port, name).await;
        });
        *self.read_loop.lock().await = Some(handle);
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn unknown_command_count(&self) -> u64 {
        self.unknown_count.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolve once the read loop has exited and `SessionDisconnected` has
    /// been published. Used by `Dialer` to know when to restart its
    /// backoff loop. Safe to call both before and after the connection has
    /// already closed.
    ///
    /// `enable()` registers this waiter with `Notify` before the flag is
    /// checked, so a `notify_waiters()` landing in the gap between the
    /// check and the `.await` below is still observed instead of missed.
    pub async fn closed(&self) {
        let notified = self.closed_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Send one command. When `want_response` is `true`, a fresh UID is
    /// generated, a `PendingRequest` is installed before the frame is
    /// written, and the call awaits completion subject to `timeout` (or
    /// the connection's default) and `cancel`. When `false`, the frame is
    /// written with no UID and the call returns immediately.
    pub async fn send_command(
        &self,
        command: &str,
        payload: serde_json::Value,
        want_response: bool,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<Option<Event>, HmonError> {
        if self.is_closed() {
            return Err(HmonError::ConnectionLost(
                "connection already closed".to_owned(),
            ));
        }
        if !want_response {
            let bytes = encode_envelope(command, payload, None)
                .map_err(|e| HmonError::Protocol(e.to_string()))?;
            self.write_frame(&bytes).await?;
            return Ok(None);
        }

        let uid = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(uid.clone(), tx);

        let bytes = encode_envelope(command, payload, Some(&uid))
            .map_err(|e| HmonError::Protocol(e.to_string()))?;
        if let Err(err) = self.write_frame(&bytes).await {
            self.pending.lock().unwrap().remove(&uid);
            return Err(err);
        }

        let effective_timeout = timeout
            .map(|t| t.min(self.default_timeout))
            .unwrap_or(self.default_timeout);

        tokio::select! {
            _ = cancel.cancelled() => {
                self.pending.lock().unwrap().remove(&uid);
                Err(HmonError::Cancelled)
            }
            _ = tokio::time::sleep(effective_timeout) => {
                self.pending.lock().unwrap().remove(&uid);
                Err(HmonError::CommandTimeout {
                    command: command.to_owned(),
                    duration: effective_timeout,
                })
            }
            result = rx => {
                match result {
                    Ok(inner) => inner.map(Some),
                    Err(_) => Err(HmonError::ConnectionLost(
                        "connection closed while request was outstanding".to_owned(),
                    )),
                }
            }
        }
    }

    /// Cancel the read loop, drain pending requests with `Cancelled`, and
    /// wait for `SessionDisconnected` to have been emitted. Idempotent: a
    /// second call is a no-op.
    pub async fn dispose(&self) {
        self.cancel.cancel();
        let handle = self.read_loop.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn write_frame(&self, payload: &[u8]) -> Result<(), HmonError> {
        let mut guard = self.write_half.lock().await;
        frame::write_frame(&mut *guard, payload).await
    }

    async fn read_loop<R>(
        conn: Arc<Self>,
        mut read_half: R,
        host: String,
        port: u16,
        name: Option<String>,
    ) where
        R: AsyncRead + Unpin,
    {
        let reason = loop {
            tokio::select! {
                biased;
                () = conn.cancel.cancelled() => break DisconnectReason::Disposed,
                frame_result = frame::read_frame(&mut read_half, conn.max_frame_size) => {
                    match frame_result {
                        Ok(payload) => match Self::handle_frame(&conn, &payload) {
                            Ok(()) => continue,
                            Err(e) => break DisconnectReason::Error(e.to_string()),
                        },
                        Err(e) => break DisconnectReason::Error(e.to_string()),
                    }
                }
            }
        };
        conn.finish(reason, host, port, name);
    }

    fn handle_frame(conn: &Arc<Self>, payload: &[u8]) -> Result<(), HmonError> {
        let (name_value, value) = parse_envelope(payload)?;
        let Some(name) = name_value.as_str() else {
            // Only "not a two-element array" is session-fatal (spec §7); a
            // non-string command name is just another flavor of unrecognized
            // command and gets dropped-and-counted like `decode_command`'s
            // `None` arm.
            conn.note_unknown_command(&format!("<non-string command: {name_value}>"));
            return Ok(());
        };
        match decode_command(name, value) {
            Ok(Some(cmd)) => {
                conn.dispatch(cmd);
                Ok(())
            }
            Ok(None) => {
                conn.note_unknown_command(name);
                Ok(())
            }
            Err(e) => Err(HmonError::Protocol(format!(
                "failed to decode '{name}' payload: {e}"
            ))),
        }
    }

    fn dispatch(&self, cmd: CommandPayload) {
        if let Some(uid) = cmd.uid() {
            let sender = self.pending.lock().unwrap().remove(uid);
            if let Some(sender) = sender {
                let event = cmd.into_event(self.session);
                // A duplicate UID delivery or a waiter that already timed
                // out locally both land here only via the first delivery;
                // a send failure just means the waiter already gave up.
                let _ = sender.send(Ok(event));
                return;
            }
        }
        let event = cmd.into_event(self.session);
        let _ = self.event_tx.send(event);
    }

    fn note_unknown_command(&self, name: &str) {
        self.unknown_count.fetch_add(1, Ordering::Relaxed);
        let mut seen = self.seen_unknown_names.lock().unwrap();
        if seen.insert(name.to_owned()) {
            tracing::warn!(session = %self.session, command = name, "unknown command received");
        } else {
            tracing::debug!(session = %self.session, command = name, "unknown command received");
        }
    }

    fn finish(&self, reason: DisconnectReason, host: String, port: u16, name: Option<String>) {
        let pending: Vec<_> = self.pending.lock().unwrap().drain().collect();
        for (_, sender) in pending {
            let _ = sender.send(Err(reason.pending_error()));
        }
        let reason = reason.describe();
        tracing::info!(session = %self.session, %host, port, %reason, "session disconnected");
        let _ = self.event_tx.send(Event::SessionDisconnected {
            session: self.session,
            host,
            port,
            name,
            reason,
        });
        self.closed.store(true, Ordering::Release);
        self.closed_notify.notify_waiters();
    }
}

/// Why the read loop stopped. Distinguishes an orderly `dispose()` (pending
/// requests fail with `Cancelled`, per spec §4.2) from every other teardown
/// path (transport/protocol failure, pending requests fail with
/// `ConnectionLost`).
enum DisconnectReason {
    Disposed,
    Error(String),
}

impl DisconnectReason {
    fn pending_error(&self) -> HmonError {
        match self {
            DisconnectReason::Disposed => HmonError::Cancelled,
            DisconnectReason::Error(msg) => HmonError::ConnectionLost(msg.clone()),
        }
    }

    fn describe(self) -> String {
        match self {
            DisconnectReason::Disposed => "disposed".to_owned(),
            DisconnectReason::Error(msg) => msg,
        }
    }
}

/// Split a frame payload into its envelope's two elements. Only "not valid
/// JSON" and "not a two-element array" are session-fatal here; whether the
/// first element is a recognized (or even string-typed) command name is the
/// caller's concern.
fn parse_envelope(payload: &[u8]) -> Result<(serde_json::Value, serde_json::Value), HmonError> {
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(|e| HmonError::Protocol(format!("invalid JSON: {e}")))?;
    let arr = value
        .as_array()
        .ok_or_else(|| HmonError::Protocol("command envelope was not a JSON array".to_owned()))?;
    if arr.len() != 2 {
        return Err(HmonError::Protocol(format!(
            "command envelope had {} elements, expected 2",
            arr.len()
        )));
    }
    Ok((arr[0].clone(), arr[1].clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::command_name;
    use tokio::io::duplex;

    async fn connected_pair() -> (
        Arc<Connection<tokio::io::WriteHalf<tokio::io::DuplexStream>>>,
        tokio::io::DuplexStream,
        mpsc::UnboundedReceiver<Event>,
    ) {
        let (mut client, mut server) = duplex(1 << 16);
        let (tx, rx) = mpsc::unbounded_channel();

        let client_task = tokio::spawn(async move {
            frame::handshake(&mut client, frame::Role::Dialer, 1 << 20)
                .await
                .unwrap();
            client
        });
        let server_task = tokio::spawn(async move {
            frame::handshake(&mut server, frame::Role::Acceptor, 1 << 20)
                .await
                .unwrap();
            server
        });
        let (client, server) = tokio::join!(client_task, server_task);
        let (client, server) = (client.unwrap(), server.unwrap());
        let (client_read, client_write) = tokio::io::split(client);

        let conn = Connection::new(
            SessionId::new(),
            "127.0.0.1".to_owned(),
            4502,
            None,
            client_write,
            1 << 20,
            Duration::from_millis(200),
            tx,
        );
        conn.start(client_read).await;

        (conn, server, rx)
    }

    #[tokio::test]
    async fn initialize_publishes_session_connected_then_starts_loop() {
        let (conn, _server, mut rx) = connected_pair().await;
        match rx.recv().await.unwrap() {
            Event::SessionConnected { session, port, .. } => {
                assert_eq!(session, conn.session_id());
                assert_eq!(port, 4502);
            }
            other => panic!("expected SessionConnected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_command_with_uid_correlates_response_and_suppresses_event() {
        let (conn, mut server, mut rx) = connected_pair().await;
        let _connected = rx.recv().await.unwrap();

        let responder = tokio::spawn(async move {
            let payload = frame::read_frame(&mut server, 1 << 20).await.unwrap();
            let (name, value): (String, serde_json::Value) =
                serde_json::from_slice(&payload).unwrap();
            assert_eq!(name, "GetFacts");
            let uid = value["UID"].as_str().unwrap().to_owned();
            let response = serde_json::json!({
                "UID": uid,
                "Facts": [{"ID": 3, "Name": "Workspace", "Value": "ws"}],
            });
            let bytes = encode_envelope(command_name::FACTS, response, None).unwrap();
            frame::write_frame(&mut server, &bytes).await.unwrap();
            server
        });

        let result = conn
            .send_command(
                command_name::GET_FACTS,
                crate::event::get_facts_payload(&[crate::fact::FactKind::Workspace]),
                true,
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        match result {
            Some(Event::Facts { response, .. }) => assert_eq!(response.facts.len(), 1),
            other => panic!("expected Facts response, got {other:?}"),
        }
        assert!(rx.try_recv().is_err(), "correlated response must not also appear as an event");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn send_command_times_out_and_late_response_becomes_an_event() {
        let (conn, mut server, mut rx) = connected_pair().await;
        let _connected = rx.recv().await.unwrap();

        let server_task = tokio::spawn(async move {
            let payload = frame::read_frame(&mut server, 1 << 20).await.unwrap();
            let (_, value): (String, serde_json::Value) = serde_json::from_slice(&payload).unwrap();
            let uid = value["UID"].as_str().unwrap().to_owned();
            // Respond only after the caller's timeout has certainly elapsed.
            tokio::time::sleep(Duration::from_millis(100)).await;
            let response = serde_json::json!({"UID": uid, "Facts": []});
            let bytes = encode_envelope(command_name::FACTS, response, None).unwrap();
            frame::write_frame(&mut server, &bytes).await.unwrap();
            server
        });

        let err = conn
            .send_command(
                command_name::GET_FACTS,
                crate::event::get_facts_payload(&[crate::fact::FactKind::Host]),
                true,
                Some(Duration::from_millis(10)),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HmonError::CommandTimeout { .. }));

        match rx.recv().await.unwrap() {
            Event::Facts { .. } => {}
            other => panic!("expected the late response as an event, got {other:?}"),
        }
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn send_command_without_uid_is_fire_and_forget() {
        let (conn, mut server, mut rx) = connected_pair().await;
        let _connected = rx.recv().await.unwrap();

        let result = conn
            .send_command(
                command_name::DISCONNECT_RIDE,
                serde_json::json!({}),
                false,
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(result.is_none());

        let payload = frame::read_frame(&mut server, 1 << 20).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert!(parsed[1].get("UID").is_none());
        let _ = rx.try_recv();
    }

    #[tokio::test]
    async fn dispose_drains_pending_with_cancelled_and_emits_disconnected_once() {
        let (conn, _server, mut rx) = connected_pair().await;
        let _connected = rx.recv().await.unwrap();

        let conn2 = conn.clone();
        let pending = tokio::spawn(async move {
            conn2
                .send_command(
                    command_name::GET_FACTS,
                    serde_json::json!({}),
                    true,
                    Some(Duration::from_secs(5)),
                    CancellationToken::new(),
                )
                .await
        });

        // Give the pending request time to register before disposing.
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.dispose().await;
        conn.dispose().await; // idempotent

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, HmonError::Cancelled));

        match rx.recv().await.unwrap() {
            Event::SessionDisconnected { .. } => {}
            other => panic!("expected SessionDisconnected, got {other:?}"),
        }
        assert!(rx.try_recv().is_err(), "no further events after SessionDisconnected");
    }

    #[tokio::test]
    async fn a_non_string_command_name_is_dropped_but_counted() {
        let (conn, mut server, mut rx) = connected_pair().await;
        let _connected = rx.recv().await.unwrap();

        let bytes = serde_json::to_vec(&serde_json::json!([3, {"UID": "x"}])).unwrap();
        frame::write_frame(&mut server, &bytes).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(conn.unknown_command_count(), 1);
        assert!(rx.try_recv().is_err(), "a non-string command name must not kill the session");
    }

    #[tokio::test]
    async fn closed_resolves_immediately_once_already_disposed() {
        let (conn, _server, mut rx) = connected_pair().await;
        let _connected = rx.recv().await.unwrap();

        conn.dispose().await;
        assert!(conn.is_closed());
        // Must not hang: the flag is already set.
        tokio::time::timeout(Duration::from_millis(50), conn.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn closed_resolves_once_dispose_runs_concurrently() {
        let (conn, _server, mut rx) = connected_pair().await;
        let _connected = rx.recv().await.unwrap();

        let waiter = conn.clone();
        let waiting = tokio::spawn(async move { waiter.closed().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        conn.dispose().await;
        tokio::time::timeout(Duration::from_millis(50), waiting)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_command_is_dropped_but_counted() {
        let (conn, mut server, mut rx) = connected_pair().await;
        let _connected = rx.recv().await.unwrap();

        let bytes = encode_envelope("TotallyMadeUp", serde_json::json!({}), None).unwrap();
        frame::write_frame(&mut server, &bytes).await.unwrap();

        // Give the read loop a moment to process the frame.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(conn.unknown_command_count(), 1);
        assert!(rx.try_recv().is_err());
    }
}
