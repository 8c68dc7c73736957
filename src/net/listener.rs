//! A TCP/TLS listener with one-shot, distinguishable close.
//!
//! [`Listener::close`] flips the `accepting` flag *before* releasing the
//! socket, so any [`Listener::accept`] that fails at or after the close
//! reports [`ListenerError::IntentionallyClosed`] instead of a raw I/O error.

use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tracing::{debug, info};

use super::io::ServerIo;

/// Errors returned by [`Listener::accept`].
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The listener was closed on purpose. This is the shutdown signal, not a fault.
    #[error("listener was intentionally closed")]
    IntentionallyClosed {
        #[source]
        source: io::Error,
    },

    /// The underlying accept failed while the listener was still open.
    #[error("accept failed: {0}")]
    Io(#[from] io::Error),
}

impl ListenerError {
    /// Returns `true` for [`ListenerError::IntentionallyClosed`].
    pub fn is_intentionally_closed(&self) -> bool {
        matches!(self, Self::IntentionallyClosed { .. })
    }
}

/// A bound listener that serves plaintext or TLS depending on how it was created.
pub struct Listener {
    inner: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    accepting: AtomicBool,
    /// Wakes pending accepts on close or when `fault` is set.
    interrupt: Notify,
    /// Error handed to the next accept instead of waiting on the socket.
    fault: Mutex<Option<io::Error>>,
}

impl Listener {
    /// Binds `addr`. When `tls` is `Some`, accepted connections are wrapped in TLS.
    ///
    /// # Errors
    ///
    /// Returns the bind error unchanged (address in use, permission denied,
    /// unresolvable address).
    pub async fn bind(addr: &str, tls: Option<Arc<ServerConfig>>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let scheme = if tls.is_some() { "https" } else { "http" };
        info!(address = %local_addr, scheme, "listener bound");

        Ok(Self {
            inner: Mutex::new(Some(listener)),
            local_addr,
            tls: tls.map(TlsAcceptor::from),
            accepting: AtomicBool::new(true),
            interrupt: Notify::new(),
            fault: Mutex::new(None),
        })
    }

    /// Returns the address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns `true` if accepted connections are TLS-wrapped.
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Returns `true` until [`close`](Self::close) is first called.
    pub fn listening(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Waits for the next connection.
    ///
    /// # Errors
    ///
    /// - [`ListenerError::IntentionallyClosed`] if the listener has been closed,
    ///   including when the close races with an in-flight accept.
    /// - [`ListenerError::Io`] for any other accept failure.
    pub async fn accept(&self) -> Result<Connection, ListenerError> {
        let interrupted = self.interrupt.notified();
        tokio::pin!(interrupted);
        interrupted.as_mut().enable();

        let accepted = match self.take_fault() {
            Some(e) => Err(e),
            None => tokio::select! {
                res = poll_fn(|cx| self.poll_accept(cx)) => res,
                _ = interrupted => Err(self.take_fault().unwrap_or_else(closed_error)),
            },
        };

        match accepted {
            Ok((stream, peer_addr)) => Ok(Connection {
                stream,
                peer_addr,
                tls: self.tls.clone(),
            }),
            Err(source) if !self.listening() => {
                Err(ListenerError::IntentionallyClosed { source })
            }
            Err(e) => Err(ListenerError::Io(e)),
        }
    }

    fn take_fault(&self) -> Option<io::Error> {
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Makes the next (or the pending) accept fail with `error`.
    #[cfg(test)]
    pub(crate) fn fail_next_accept(&self, error: io::Error) {
        *self.fault.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
        self.interrupt.notify_waiters();
    }

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, SocketAddr)>> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(listener) => listener.poll_accept(cx),
            None => Poll::Ready(Err(closed_error())),
        }
    }

    /// Stops accepting and releases the socket.
    ///
    /// Idempotent: only the first call has an effect, and it is the only one
    /// that returns `true`. New connection attempts are refused as soon as
    /// this returns.
    pub fn close(&self) -> bool {
        if self
            .accepting
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let socket = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(socket);
        self.interrupt.notify_waiters();
        debug!(address = %self.local_addr, "listener closed");
        true
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("tls", &self.is_tls())
            .field("listening", &self.listening())
            .finish()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "listener closed")
}

/// An accepted TCP connection whose TLS handshake, if any, has not run yet.
///
/// The handshake is deferred to [`Connection::establish`] so it runs on the
/// connection's own task rather than blocking the accept loop.
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
}

impl Connection {
    /// Returns the remote peer's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Completes the TLS handshake if required and returns the byte stream.
    ///
    /// # Errors
    ///
    /// Returns the handshake error for TLS connections.
    pub async fn establish(self) -> io::Result<ServerIo> {
        match self.tls {
            None => Ok(ServerIo::new_io(self.stream)),
            Some(acceptor) => {
                let stream = acceptor.accept(self.stream).await?;
                Ok(ServerIo::new_tls_io(stream))
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}
