//! HTTP/1.1 accept loop and per-connection request handling.
//!
//! The engine reports every connection transition to its
//! [`ConnStateObserver`] from the connection's own task, so transitions for
//! one connection are always delivered in order:
//!
//! ```text
//! New ─▶ Active ─▶ Idle ─▶ Active ─▶ Idle ─▶ … ─▶ Closed
//!  │        └──────────────────────────────────▶ Closed
//!  └───────────────────────────────────────────▶ Closed
//! ```

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use super::tracker::{ConnInfo, ConnState, ConnStateObserver, ConnectionId};
use crate::http::{Request, RequestError, Response, StatusCode};
use crate::net::{Connection, Listener, ListenerError, ServerIo};

/// Default cap on a buffered request, head plus body (8 MiB).
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

const INITIAL_BUF_SIZE: usize = 4096;

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Keep-alive switch shared between the engine and the server.
///
/// Disabling keep-alives also tells connections that are waiting for a
/// request to close.
#[derive(Debug)]
pub(crate) struct KeepAlives {
    enabled: AtomicBool,
    closing: watch::Sender<bool>,
}

impl KeepAlives {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            closing: watch::Sender::new(false),
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        self.closing.send_replace(true);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }
}

/// Resolves once keep-alives have been disabled.
async fn shutting_down(closing: &mut watch::Receiver<bool>) {
    // The sender lives in the engine, which outlives every connection task.
    let _ = closing.wait_for(|closing| *closing).await;
}

/// Reports `Closed` for a connection when dropped, so the transition is
/// delivered on every exit from the connection task, a panic included.
struct CloseOnDrop {
    observer: Arc<dyn ConnStateObserver>,
    info: ConnInfo,
    finished: bool,
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if !self.finished {
            error!(conn = %self.info.id, peer = %self.info.peer_addr, "connection task ended abnormally");
        }
        self.observer.on_transition(&self.info, ConnState::Closed);
    }
}

pub(crate) struct Engine<H> {
    handler: H,
    observer: Arc<dyn ConnStateObserver>,
    keep_alives: Arc<KeepAlives>,
    max_request_size: usize,
}

impl<H, F> Engine<H>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    pub(crate) fn new(
        handler: H,
        observer: Arc<dyn ConnStateObserver>,
        keep_alives: Arc<KeepAlives>,
        max_request_size: usize,
    ) -> Self {
        Self {
            handler,
            observer,
            keep_alives,
            max_request_size,
        }
    }

    /// Accepts connections until the listener fails or is closed.
    ///
    /// There is no clean exit: the return value is whatever stopped the loop,
    /// [`ListenerError::IntentionallyClosed`] after a shutdown.
    pub(crate) async fn serve(self: Arc<Self>, listener: Arc<Listener>) -> ListenerError {
        let mut backoff: Option<Duration> = None;

        loop {
            let conn = match listener.accept().await {
                Ok(conn) => {
                    backoff = None;
                    conn
                }
                Err(ListenerError::Io(e)) if is_transient(&e) => {
                    let delay = backoff.map_or(MIN_ACCEPT_BACKOFF, |d| (d * 2).min(MAX_ACCEPT_BACKOFF));
                    backoff = Some(delay);
                    warn!(error = %e, retry_in = ?delay, "accept failed, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => return e,
            };

            let info = ConnInfo {
                id: ConnectionId::next(),
                peer_addr: conn.peer_addr(),
            };
            debug!(conn = %info.id, peer = %info.peer_addr, "connection accepted");
            self.observer.on_transition(&info, ConnState::New);
            let mut closed = CloseOnDrop {
                observer: Arc::clone(&self.observer),
                info,
                finished: false,
            };

            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                let _ = &closed;
                engine.serve_connection(conn, &closed.info).await;
                closed.finished = true;
            });
        }
    }

    async fn serve_connection(&self, conn: Connection, info: &ConnInfo) {
        let mut closing = self.keep_alives.subscribe();
        let established = tokio::select! {
            established = conn.establish() => established,
            _ = shutting_down(&mut closing) => {
                debug!(conn = %info.id, "closing connection for shutdown during handshake");
                return;
            }
        };

        match established {
            Ok(io) => {
                if let ServerIo::TlsIo(_) = io {
                    debug!(
                        conn = %info.id,
                        sni = io.server_name().unwrap_or("-"),
                        alpn = ?io.alpn_protocol().map(String::from_utf8_lossy),
                        "TLS established"
                    );
                }
                if let Err(e) = self.drive(io, info, closing).await {
                    warn!(conn = %info.id, peer = %info.peer_addr, error = %e, "connection closed with error");
                }
            }
            Err(e) => {
                debug!(conn = %info.id, peer = %info.peer_addr, error = %e, "TLS handshake failed");
            }
        }
    }

    /// Runs requests on one connection until it should close.
    ///
    /// HTTP/1.1 connections persist by default; each iteration serves one
    /// request. Returning (with or without error) closes the connection.
    async fn drive(
        &self,
        mut io: ServerIo,
        info: &ConnInfo,
        mut closing: watch::Receiver<bool>,
    ) -> io::Result<()> {
        let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
        let mut state = ConnState::New;

        loop {
            // Between requests a shutdown may close us; mid-request it may not.
            if buf.is_empty() {
                let read = tokio::select! {
                    biased;
                    _ = shutting_down(&mut closing) => {
                        debug!(conn = %info.id, %state, "closing connection for shutdown");
                        return Ok(());
                    }
                    read = io.read_buf(&mut buf) => read?,
                };
                if read == 0 {
                    debug!(conn = %info.id, "connection closed by peer");
                    return Ok(());
                }
            }

            if state != ConnState::Active {
                state = ConnState::Active;
                self.observer.on_transition(info, state);
            }

            let mut request = match Request::parse_limited(&buf, self.max_request_size) {
                Ok((request, consumed)) => {
                    buf.advance(consumed);
                    request
                }
                Err(RequestError::Incomplete) => {
                    if buf.len() > self.max_request_size {
                        return self.too_large(&mut io, info).await;
                    }
                    if io.read_buf(&mut buf).await? == 0 {
                        debug!(conn = %info.id, "peer closed mid-request");
                        return Ok(());
                    }
                    continue;
                }
                Err(RequestError::TooLarge { .. }) => {
                    return self.too_large(&mut io, info).await;
                }
                Err(e) => {
                    warn!(conn = %info.id, peer = %info.peer_addr, error = %e, "bad request, sending 400");
                    let response =
                        Response::new(StatusCode::BadRequest).body(format!("Bad Request: {e}"));
                    return write_final(&mut io, response).await;
                }
            };

            request.set_peer_addr(info.peer_addr);
            let wants_keep_alive = request.wants_keep_alive();
            debug!(
                conn = %info.id,
                method = %request.method(),
                path = %request.path(),
                "dispatching request"
            );

            // On its own task: a panic becomes a 500 instead of ending the connection task.
            let response = match tokio::spawn((self.handler)(request)).await {
                Ok(response) => response,
                Err(e) => {
                    error!(conn = %info.id, peer = %info.peer_addr, error = %e, "handler failed, sending 500");
                    Response::new(StatusCode::InternalServerError)
                        .body("Internal Server Error")
                        .close()
                }
            };
            if response.status().is_server_error() {
                warn!(conn = %info.id, status = response.status().as_u16(), "handler returned server error");
            }
            // Checked after the handler so a shutdown during the request closes the connection.
            let keep_alive =
                wants_keep_alive && response.allows_keep_alive() && self.keep_alives.enabled();

            io.write_all(&response.into_bytes(keep_alive)).await?;
            io.flush().await?;

            if !keep_alive {
                let _ = io.shutdown().await;
                return Ok(());
            }

            state = ConnState::Idle;
            self.observer.on_transition(info, state);
        }
    }

    async fn too_large(&self, io: &mut ServerIo, info: &ConnInfo) -> io::Result<()> {
        warn!(
            conn = %info.id,
            peer = %info.peer_addr,
            limit = self.max_request_size,
            "request too large, sending 413"
        );
        let response = Response::new(StatusCode::PayloadTooLarge).body("Request entity too large");
        write_final(io, response).await
    }
}

async fn write_final(io: &mut ServerIo, response: Response) -> io::Result<()> {
    io.write_all(&response.into_bytes(false)).await?;
    io.flush().await?;
    let _ = io.shutdown().await;
    Ok(())
}

/// Accept errors that say nothing about the listener itself.
fn is_transient(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => true,
        _ => out_of_descriptors(e),
    }
}

/// Descriptor table errnos, identical on Linux and the BSDs.
#[cfg(unix)]
const ENFILE: i32 = 23;
#[cfg(unix)]
const EMFILE: i32 = 24;

/// Process or system descriptor table full; clears once connections close.
#[cfg(unix)]
fn out_of_descriptors(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(ENFILE | EMFILE))
}

#[cfg(not(unix))]
fn out_of_descriptors(_: &io::Error) -> bool {
    false
}
