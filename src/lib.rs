//! # graceful-web
//!
//! An async HTTP/1.1 and HTTPS server that can stop without dropping work.
//!
//! [`Server::shutdown`] closes the listener immediately. The accept loop
//! then waits until every connection is idle or closed and every routine
//! registered through [`Routines`] has finished, and only then reports
//! [`ShutdownOutcome::Graceful`] on the channel given to [`Server::serve`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use graceful_web::{Request, Response, Server, StatusCode};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::new();
//!     let addr = server.listen("127.0.0.1:8080").await?;
//!     println!("Listening on http://{addr}");
//!
//!     let (tx, mut rx) = mpsc::channel(1);
//!     server
//!         .serve(|_req: Request| async {
//!             Response::new(StatusCode::Ok).body("Hello, World!")
//!         }, tx)
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown();
//!     if let Some(outcome) = rx.recv().await {
//!         println!("{outcome}");
//!     }
//!     Ok(())
//! }
//! ```

// ── Modules ───────────────────────────────────────────────────────────────────
pub mod config;
pub mod http;
pub mod net;
pub mod server;
pub mod tls;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::{ConfigError, ServerConfig, TlsFiles};
pub use http::{Headers, Method, Request, RequestError, Response, StatusCode};
pub use net::{Listener, ListenerError};
pub use server::{
    ConnInfo, ConnState, ConnStateObserver, ConnectionId, Lifecycle, RoutineGuard, Routines,
    Server, ServerError, ShutdownOutcome,
};
pub use tls::{TlsError, TlsSettings};
