//! The graceful-shutdown server.
//!
//! A [`Server`] goes through `listen` → `serve` → `shutdown`. Shutting down
//! closes the listener at once, then the accept loop waits until every
//! connection of that session is idle or closed and every registered routine
//! has finished before publishing [`ShutdownOutcome::Graceful`].
//!
//! Connections are counted per session; routines are counted per server.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::http::{Request, Response};
use crate::net::{Listener, ListenerError};
use crate::tls::{TlsError, TlsSettings};

pub mod engine;
mod pending;
pub mod tracker;

use engine::{DEFAULT_MAX_REQUEST_SIZE, Engine, KeepAlives};
use pending::PendingWork;
pub use pending::{RoutineGuard, Routines};
use tracker::Tracker;
pub use tracker::{ConnInfo, ConnState, ConnStateObserver, ConnectionId};

/// Errors returned synchronously by [`Server`] operations.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("the server is already listening")]
    AlreadyListening,

    #[error("the server is not listening")]
    NotListening,

    #[error("the server is already serving")]
    AlreadyServing,

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("the accept loop stopped before it started")]
    ServeAborted,
}

/// How a serve session ended. Exactly one is published per [`Server::serve`].
#[derive(Debug)]
pub enum ShutdownOutcome {
    /// The listener was closed on purpose and all outstanding work drained.
    Graceful,
    /// The accept loop failed. Outstanding work was not waited for.
    Errored(ListenerError),
}

impl ShutdownOutcome {
    pub fn is_graceful(&self) -> bool {
        matches!(self, Self::Graceful)
    }
}

impl fmt::Display for ShutdownOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graceful => f.write_str("graceful shutdown"),
            Self::Errored(e) => write!(f, "server failed: {e}"),
        }
    }
}

/// Where the current session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unconfigured,
    Listening,
    Serving,
    ShuttingDown,
    Terminated,
}

/// An HTTP/HTTPS server with graceful shutdown.
///
/// `Server` is a cheap handle; clones control the same server.
///
/// # Examples
///
/// ```rust,no_run
/// use graceful_web::{Response, Server, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::new();
///     server.listen("127.0.0.1:8080").await?;
///
///     let (tx, mut rx) = tokio::sync::mpsc::channel(1);
///     server
///         .serve(|_req| async { Response::new(StatusCode::Ok).body("Success") }, tx)
///         .await?;
///
///     tokio::signal::ctrl_c().await?;
///     server.shutdown();
///     println!("{}", rx.recv().await.unwrap());
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    settings: Mutex<Settings>,
    session: Mutex<Session>,
    routines: Arc<PendingWork>,
}

struct Settings {
    keep_alives: bool,
    max_request_size: usize,
    tls: TlsSettings,
    observer: Option<Arc<dyn ConnStateObserver>>,
}

struct Session {
    generation: u64,
    lifecycle: Lifecycle,
    listener: Option<Arc<Listener>>,
    keep_alives: Option<Arc<KeepAlives>>,
    tracker: Option<Arc<Tracker>>,
}

impl Session {
    fn live_listener(&self) -> Option<&Arc<Listener>> {
        self.listener.as_ref().filter(|listener| listener.listening())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Server {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                settings: Mutex::new(Settings {
                    keep_alives: true,
                    max_request_size: DEFAULT_MAX_REQUEST_SIZE,
                    tls: TlsSettings::new(),
                    observer: None,
                }),
                session: Mutex::new(Session {
                    generation: 0,
                    lifecycle: Lifecycle::Unconfigured,
                    listener: None,
                    keep_alives: None,
                    tracker: None,
                }),
                routines: Arc::new(PendingWork::new()),
            }),
        }
    }

    /// Builds a server from `config`, loading its TLS files if any.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Tls`] if the certificate or key cannot be loaded.
    pub fn with_config(config: &ServerConfig) -> Result<Self, ServerError> {
        let server = Self::new();
        server.set_keep_alives_enabled(config.keep_alives);
        server.set_max_request_size(config.max_request_size);
        if let Some(tls) = &config.tls {
            server.add_tls_certificate_from_file(&tls.cert_path, &tls.key_path)?;
        }
        Ok(server)
    }

    /// Reads a JSON config file and builds a server from it.
    ///
    /// # Errors
    ///
    /// [`ServerError::Config`] for unreadable or invalid files, otherwise as
    /// [`with_config`](Self::with_config).
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        Self::with_config(&ServerConfig::from_json_file(path)?)
    }

    /// Enables or disables keep-alives for sessions started after this call.
    pub fn set_keep_alives_enabled(&self, enabled: bool) {
        lock(&self.inner.settings).keep_alives = enabled;
    }

    pub fn set_max_request_size(&self, bytes: usize) {
        lock(&self.inner.settings).max_request_size = bytes;
    }

    /// Installs an observer that sees every connection transition after the
    /// server has accounted for it. Takes effect on the next `serve`.
    pub fn set_conn_state_observer(&self, observer: impl ConnStateObserver) {
        lock(&self.inner.settings).observer = Some(Arc::new(observer));
    }

    /// Adds a PEM certificate chain and key. Once any certificate is added,
    /// `listen` serves HTTPS.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Tls`] if the PEM data is malformed.
    pub fn add_tls_certificate(&self, cert_pem: &[u8], key_pem: &[u8]) -> Result<(), ServerError> {
        lock(&self.inner.settings)
            .tls
            .add_certificate(cert_pem, key_pem)?;
        Ok(())
    }

    /// Like [`add_tls_certificate`](Self::add_tls_certificate), reading both from disk.
    pub fn add_tls_certificate_from_file(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<(), ServerError> {
        lock(&self.inner.settings)
            .tls
            .add_certificate_from_file(cert_path, key_path)?;
        Ok(())
    }

    /// Binds `addr` and returns the bound address.
    ///
    /// # Errors
    ///
    /// - [`ServerError::AlreadyListening`] while a previous listener is open.
    /// - [`ServerError::Tls`] if the TLS configuration cannot be built.
    /// - [`ServerError::Bind`] if the address cannot be bound.
    pub async fn listen(&self, addr: impl AsRef<str>) -> Result<SocketAddr, ServerError> {
        let addr = addr.as_ref();
        if self.listening() {
            return Err(ServerError::AlreadyListening);
        }

        let tls = lock(&self.inner.settings).tls.server_config()?;
        let listener = Listener::bind(addr, tls)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_owned(),
                source,
            })?;

        let mut session = lock(&self.inner.session);
        // Another caller may have won the race while we were binding.
        if session.live_listener().is_some() {
            return Err(ServerError::AlreadyListening);
        }
        let local_addr = listener.local_addr();
        session.generation += 1;
        session.lifecycle = Lifecycle::Listening;
        session.listener = Some(Arc::new(listener));
        session.keep_alives = None;
        session.tracker = None;
        Ok(local_addr)
    }

    /// Starts the accept loop and returns once it is running.
    ///
    /// `handler` is called for every request. When the loop ends, one
    /// [`ShutdownOutcome`] is sent on `outcomes`: `Graceful` after a
    /// [`shutdown`](Self::shutdown) once all work has drained, or `Errored`
    /// immediately if the listener failed.
    ///
    /// The drain covers this session's connections and every routine
    /// registered on the server. Connections left open by an earlier session
    /// that ended `Errored` are not waited for.
    ///
    /// # Errors
    ///
    /// - [`ServerError::NotListening`] if `listen` has not succeeded.
    /// - [`ServerError::AlreadyServing`] if this listener is already served.
    pub async fn serve<H, F>(
        &self,
        handler: H,
        outcomes: mpsc::Sender<ShutdownOutcome>,
    ) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let (listener, engine, connections, generation) = {
            let mut session = lock(&self.inner.session);
            let listener = Arc::clone(session.live_listener().ok_or(ServerError::NotListening)?);
            if session.lifecycle == Lifecycle::Serving {
                return Err(ServerError::AlreadyServing);
            }

            let settings = lock(&self.inner.settings);
            let keep_alives = Arc::new(KeepAlives::new(settings.keep_alives));
            let tracker = Arc::new(Tracker::new(
                Arc::new(PendingWork::new()),
                settings.observer.clone(),
            ));
            let engine = Arc::new(Engine::new(
                handler,
                Arc::clone(&tracker) as Arc<dyn ConnStateObserver>,
                Arc::clone(&keep_alives),
                settings.max_request_size,
            ));

            session.lifecycle = Lifecycle::Serving;
            session.keep_alives = Some(keep_alives);
            let connections = Arc::clone(tracker.pending());
            session.tracker = Some(tracker);
            (listener, engine, connections, session.generation)
        };

        let (started_tx, started_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let _ = started_tx.send(());
            info!(address = %listener.local_addr(), tls = listener.is_tls(), "serving");

            let cause = engine.serve(Arc::clone(&listener)).await;
            let outcome = if cause.is_intentionally_closed() {
                info!(
                    connections = connections.get(),
                    routines = inner.routines.get(),
                    "listener closed, draining"
                );
                drain(&connections, &inner.routines).await;
                info!("all connections and routines drained");
                ShutdownOutcome::Graceful
            } else {
                error!(error = %cause, "accept loop failed");
                listener.close();
                ShutdownOutcome::Errored(cause)
            };

            inner.terminate(generation);
            if outcomes.send(outcome).await.is_err() {
                warn!("shutdown outcome dropped, receiver is gone");
            }
        });

        started_rx.await.map_err(|_| ServerError::ServeAborted)
    }

    /// Stops accepting connections. A no-op unless currently listening.
    ///
    /// Keep-alives are switched off first so in-flight responses close their
    /// connections and idle connections are closed, then the listener closes.
    pub fn shutdown(&self) {
        let mut session = lock(&self.inner.session);
        let Some(listener) = session.live_listener().cloned() else {
            return;
        };
        info!(address = %listener.local_addr(), "shutdown requested");

        if let Some(keep_alives) = &session.keep_alives {
            keep_alives.disable();
        }
        listener.close();
        session.lifecycle = match session.lifecycle {
            Lifecycle::Serving => Lifecycle::ShuttingDown,
            _ => Lifecycle::Terminated,
        };
    }

    /// Returns `true` while a listener is open.
    pub fn listening(&self) -> bool {
        lock(&self.inner.session).live_listener().is_some()
    }

    /// Address of the open listener, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.session)
            .live_listener()
            .map(|listener| listener.local_addr())
    }

    pub fn state(&self) -> Lifecycle {
        lock(&self.inner.session).lifecycle
    }

    /// Handle for registering background work from request handlers.
    pub fn routines(&self) -> Routines {
        Routines::new(Arc::clone(&self.inner.routines))
    }

    /// Registers one unit of background work; see [`Routines::start`].
    pub fn routine_started(&self) {
        self.inner.routines.apply(1);
    }

    /// Finishes one unit of background work; see [`Routines::finish`].
    ///
    /// # Panics
    ///
    /// Panics when called without a matching [`routine_started`](Self::routine_started).
    pub fn routine_finished(&self) {
        self.inner.routines.apply(-1);
    }

    /// Outstanding obligations a graceful shutdown of the current session
    /// would wait for.
    pub fn pending_work(&self) -> i64 {
        let connections = lock(&self.inner.session)
            .tracker
            .as_ref()
            .map_or(0, |tracker| tracker.pending().get());
        connections + self.inner.routines.get()
    }

    /// Connections of the current session that are open, and how many of them are idle.
    pub fn connections(&self) -> (usize, usize) {
        match &lock(&self.inner.session).tracker {
            Some(tracker) => (tracker.tracked_connections(), tracker.idle_connections()),
            None => (0, 0),
        }
    }
}

/// Resolves once both counters are zero at the same time.
async fn drain(connections: &PendingWork, routines: &PendingWork) {
    loop {
        connections.drained().await;
        routines.drained().await;
        if connections.get() == 0 && routines.get() == 0 {
            return;
        }
    }
}

impl Inner {
    fn terminate(&self, generation: u64) {
        let mut session = lock(&self.session);
        if session.generation == generation {
            session.lifecycle = Lifecycle::Terminated;
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = lock(&self.inner.session);
        f.debug_struct("Server")
            .field("lifecycle", &session.lifecycle)
            .field("listener", &session.listener)
            .field("routines", &self.inner.routines.get())
            .finish()
    }
}
