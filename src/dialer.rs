//! Outbound connection maker with exponential backoff and full jitter.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::event::Event;
use crate::frame::Role;
use crate::session::SessionId;

/// Backoff schedule for Dialer retries, per `spec.md` §4.6/§6.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry attempt `attempt` (0-indexed: the delay before
    /// the *first* retry, i.e. after the first failure, is `attempt == 0`).
    /// Full jitter: uniformly sampled in `[0, base · 2^attempt]`, capped at
    /// `max_delay`.
    fn delay_for(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let exp = self.initial_delay.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let jittered = capped * (1.0 - self.jitter) + rng.gen_range(0.0..=capped * self.jitter * 2.0);
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()).max(0.0))
    }
}

/// A handle to the background retry loop for one configured remote.
/// Dropping this handle does not stop the loop; call `stop` explicitly
/// (the orchestrator does this from `removeServerAsync`).
pub struct DialerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl DialerHandle {
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

/// Callback invoked once per successful `Ready` transition, with the new
/// session's id and its freshly constructed `Connection`. The orchestrator
/// uses this to register the session and start its read-loop-dependent
/// bookkeeping (poller table entries are created separately, on demand).
pub type OnConnected = Arc<dyn Fn(SessionId, Arc<Connection<OwnedWriteHalf>>) + Send + Sync>;

/// Dial `host:port` in a loop, retrying with backoff on any failure before
/// `Ready` and restarting the backoff schedule from scratch every time a
/// previously-established session disconnects. Backoff state is per
/// server, not per session: each successful attempt produces a fresh
/// `SessionId` and resets the attempt counter.
pub fn spawn(
    host: String,
    port: u16,
    name: Option<String>,
    backoff: BackoffConfig,
    max_frame_size: u32,
    default_timeout: Duration,
    event_tx: mpsc::UnboundedSender<Event>,
    on_connected: OnConnected,
) -> DialerHandle {
    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();
    let join = tokio::spawn(async move {
        run(
            host,
            port,
            name,
            backoff,
            max_frame_size,
            default_timeout,
            event_tx,
            on_connected,
            loop_cancel,
        )
        .await;
    });
    DialerHandle { cancel, join }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    host: String,
    port: u16,
    name: Option<String>,
    backoff: BackoffConfig,
    max_frame_size: u32,
    default_timeout: Duration,
    event_tx: mpsc::UnboundedSender<Event>,
    on_connected: OnConnected,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    let mut rng = rand::thread_rng();

    loop {
        if cancel.is_cancelled() {
            return;
        }

        match dial_once(
            &host,
            port,
            name.clone(),
            max_frame_size,
            default_timeout,
            event_tx.clone(),
            cancel.clone(),
        )
        .await
        {
            Ok((conn, read_half)) => {
                attempt = 0;
                let session = conn.session_id();
                // Register the session with the orchestrator before
                // `start` publishes `SessionConnected`, so a consumer
                // reacting to that event can never observe a session the
                // registry doesn't know about yet.
                on_connected(session, conn.clone());
                conn.start(read_half).await;
                tokio::select! {
                    () = cancel.cancelled() => {
                        conn.dispose().await;
                        return;
                    }
                    () = conn.closed() => {}
                }
                // Disconnected; loop around and start dialing again from
                // the base delay.
            }
            Err(reason) => {
                tracing::warn!(host = %host, port, attempt, %reason, "dial attempt failed");
                let delay = backoff.delay_for(attempt, &mut rng);
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Connect and handshake, returning a constructed-but-not-started
/// `Connection` plus its read half. The caller must register the session
/// (orchestrator registry/connections map) before calling `start` on the
/// returned connection, so `SessionConnected` never becomes observable
/// before the session is queryable.
async fn dial_once(
    host: &str,
    port: u16,
    name: Option<String>,
    max_frame_size: u32,
    default_timeout: Duration,
    event_tx: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
) -> Result<(Arc<Connection<OwnedWriteHalf>>, OwnedReadHalf), String> {
    let connect = TcpStream::connect((host, port));
    let mut stream = tokio::select! {
        () = cancel.cancelled() => return Err("cancelled".to_owned()),
        result = connect => result.map_err(|e| e.to_string())?,
    };

    crate::frame::handshake(&mut stream, Role::Dialer, max_frame_size)
        .await
        .map_err(|e| e.to_string())?;

    let (read_half, write_half) = stream.into_split();
    let conn = Connection::new(
        SessionId::new(),
        host.to_owned(),
        port,
        name,
        write_half,
        max_frame_size,
        default_timeout,
        event_tx,
    );
    Ok((conn, read_half))
}
