//! Network plumbing: the shutdown-aware listener and connection streams.

pub mod io;
pub mod listener;

pub use io::ServerIo;
pub use listener::{Connection, Listener, ListenerError};
