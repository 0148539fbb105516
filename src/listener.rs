//! Inbound server socket: accepts connections from interpreters configured
//! to dial the orchestrator. Unlike `Dialer`, a disconnected inbound
//! session is never retried — it simply leaves the registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::error::HmonError;
use crate::event::Event;
use crate::frame::Role;
use crate::session::SessionId;

/// Invoked once per accepted, handshaken connection.
pub type OnAccepted = Arc<dyn Fn(SessionId, Arc<Connection<OwnedWriteHalf>>) + Send + Sync>;

pub struct ListenerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

/// Bind `ip:port` and accept connections until stopped. Each accepted
/// socket gets its own handshake and `Connection`; a handshake failure
/// drops that one connection silently (per `spec.md` §7) without
/// affecting the accept loop.
pub async fn bind(
    ip: std::net::IpAddr,
    port: u16,
    max_frame_size: u32,
    default_timeout: Duration,
    event_tx: mpsc::UnboundedSender<Event>,
    on_accepted: OnAccepted,
) -> Result<ListenerHandle, HmonError> {
    let listener = TcpListener::bind((ip, port)).await.map_err(HmonError::Io)?;
    let local_addr = listener.local_addr().map_err(HmonError::Io)?;

    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();
    let join = tokio::spawn(async move {
        accept_loop(
            listener,
            max_frame_size,
            default_timeout,
            event_tx,
            on_accepted,
            loop_cancel,
        )
        .await;
    });

    Ok(ListenerHandle {
        cancel,
        join,
        local_addr,
    })
}

async fn accept_loop(
    listener: TcpListener,
    max_frame_size: u32,
    default_timeout: Duration,
    event_tx: mpsc::UnboundedSender<Event>,
    on_accepted: OnAccepted,
    cancel: CancellationToken,
) {
    loop {
        let (mut socket, peer) = tokio::select! {
            () = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        let event_tx = event_tx.clone();
        let on_accepted = on_accepted.clone();
        let child_cancel = cancel.child_token();
        tokio::spawn(async move {
            tokio::select! {
                () = child_cancel.cancelled() => {}
                result = crate::frame::handshake(&mut socket, Role::Acceptor, max_frame_size) => {
                    match result {
                        Ok(()) => {
                            let (read_half, write_half) = socket.into_split();
                            let conn = Connection::new(
                                SessionId::new(),
                                peer.ip().to_string(),
                                peer.port(),
                                None,
                                write_half,
                                max_frame_size,
                                default_timeout,
                                event_tx,
                            );
                            // Register before `start` makes `SessionConnected`
                            // observable, so the session is always queryable
                            // by the time a consumer sees the event.
                            on_accepted(conn.session_id(), conn.clone());
                            conn.start(read_half).await;
                        }
                        Err(e) => {
                            tracing::warn!(%peer, error = %e, "inbound handshake failed, dropping connection");
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn accepts_one_connection_and_invokes_callback_on_successful_handshake() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let accepted2 = accepted.clone();
        let handle = bind(
            "127.0.0.1".parse().unwrap(),
            0,
            1 << 20,
            Duration::from_secs(5),
            tx,
            Arc::new(move |session, conn| accepted2.lock().unwrap().push((session, conn))),
        )
        .await
        .unwrap();

        let addr = handle.local_addr();
        let mut client = TcpStream::connect(addr).await.unwrap();
        crate::frame::handshake(&mut client, Role::Dialer, 1 << 20)
            .await
            .unwrap();

        match tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            Event::SessionConnected { .. } => {}
            other => panic!("expected SessionConnected, got {other:?}"),
        }
        // Give the spawned accept task a moment to run the callback.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(accepted.lock().unwrap().len(), 1);

        handle.stop().await;
    }

    #[tokio::test]
    async fn a_failed_handshake_is_dropped_without_stopping_the_accept_loop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = bind(
            "127.0.0.1".parse().unwrap(),
            0,
            1 << 20,
            Duration::from_secs(5),
            tx,
            Arc::new(|_, _| {}),
        )
        .await
        .unwrap();
        let addr = handle.local_addr();

        // First client sends garbage and disconnects.
        let mut bad = TcpStream::connect(addr).await.unwrap();
        bad.write_all(&[0, 0, 0, 1]).await.unwrap();
        drop(bad);

        // Second client completes a real handshake; the loop must still be
        // alive to accept it.
        let mut good = TcpStream::connect(addr).await.unwrap();
        crate::frame::handshake(&mut good, Role::Dialer, 1 << 20)
            .await
            .unwrap();

        match tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            Event::SessionConnected { .. } => {}
            other => panic!("expected SessionConnected, got {other:?}"),
        }

        handle.stop().await;
    }
}
