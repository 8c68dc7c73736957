//! Connection lifecycle tracking.
//!
//! The protocol engine reports every connection transition through a
//! [`ConnStateObserver`]. [`Tracker`] is the observer the server installs: it
//! turns transitions into pending-work deltas and then forwards the unchanged
//! transition to the user's observer, if one is configured.
//!
//! ## Accounting
//!
//! Each tracked connection sits in a [`Phase`] that owes a fixed number of
//! obligations. The delta applied for a transition is the difference between
//! what the new phase and the old phase owe, so the pending counter always
//! equals the sum over live connections and returns to zero once every
//! connection is idle or gone.
//!
//! | Previous phase | New state          | Delta | Next phase |
//! |----------------|--------------------|-------|------------|
//! | untracked      | `New`              | +1    | `Fresh`    |
//! | `Fresh`        | `Active`           | +1    | `Busy`     |
//! | `Idle`         | `Active`           | +1    | `Resumed`  |
//! | `Busy`         | `Idle`             | −2    | `Idle`     |
//! | `Resumed`      | `Idle`             | −1    | `Idle`     |
//! | `Idle`         | `Hijacked`/`Closed`| 0     | untracked  |
//! | `Busy`         | `Hijacked`/`Closed`| −2    | untracked  |
//! | `Fresh`        | `Hijacked`/`Closed`| −1    | untracked  |
//! | `Resumed`      | `Hijacked`/`Closed`| −1    | untracked  |

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use super::pending::PendingWork;

/// Lifecycle state of a single connection as seen by the protocol engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// The connection was just accepted and has not sent a request yet.
    New,
    /// Request bytes have arrived and a response is in progress.
    Active,
    /// The previous response is complete and the connection is waiting for
    /// the next request.
    Idle,
    /// The connection was taken over by a handler and is no longer managed.
    Hijacked,
    /// The connection is closed. Terminal.
    Closed,
}

impl ConnState {
    /// All states, in lifecycle order.
    pub const ALL: [ConnState; 5] = [
        ConnState::New,
        ConnState::Active,
        ConnState::Idle,
        ConnState::Hijacked,
        ConnState::Closed,
    ];

    /// Returns `true` for `Hijacked` and `Closed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Hijacked | Self::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Hijacked => "hijacked",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-unique identity of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric id.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Read-only description of a connection handed to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnInfo {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
}

/// Receives every connection state transition, in order per connection.
///
/// Implemented for any `Fn(&ConnInfo, ConnState) + Send + Sync + 'static`.
pub trait ConnStateObserver: Send + Sync + 'static {
    fn on_transition(&self, conn: &ConnInfo, state: ConnState);
}

impl<F> ConnStateObserver for F
where
    F: Fn(&ConnInfo, ConnState) + Send + Sync + 'static,
{
    fn on_transition(&self, conn: &ConnInfo, state: ConnState) {
        (self)(conn, state)
    }
}

/// Where a tracked connection is in its lifecycle, for accounting purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Accepted, no request seen yet. Owes its eventual close.
    Fresh,
    /// Serving its first request. Owes the request and the eventual close.
    Busy,
    /// Between requests. The close obligation was prepaid on first idle.
    Idle,
    /// Serving a request after having been idle. Owes only the request.
    Resumed,
}

impl Phase {
    pub(crate) const ALL: [Phase; 4] = [Phase::Fresh, Phase::Busy, Phase::Idle, Phase::Resumed];

    fn owed(phase: Option<Phase>) -> i64 {
        match phase {
            None | Some(Phase::Idle) => 0,
            Some(Phase::Fresh) | Some(Phase::Resumed) => 1,
            Some(Phase::Busy) => 2,
        }
    }
}

/// Pure accounting rule: `(previous phase, new state) -> (delta, next phase)`.
///
/// `None` means the connection is not tracked. Repeated `New`/`Active`
/// reports for a connection that is already past them are absorbed with a
/// zero delta.
pub(crate) fn transition(prev: Option<Phase>, state: ConnState) -> (i64, Option<Phase>) {
    let next = match (prev, state) {
        (None, ConnState::New) => Some(Phase::Fresh),
        (Some(phase), ConnState::New) => Some(phase),
        (None | Some(Phase::Fresh), ConnState::Active) => Some(Phase::Busy),
        (Some(Phase::Idle), ConnState::Active) => Some(Phase::Resumed),
        (Some(phase @ (Phase::Busy | Phase::Resumed)), ConnState::Active) => Some(phase),
        (_, ConnState::Idle) => Some(Phase::Idle),
        (_, ConnState::Hijacked | ConnState::Closed) => None,
    };
    (Phase::owed(next) - Phase::owed(prev), next)
}

/// The server's own connection observer.
pub(crate) struct Tracker {
    phases: Mutex<HashMap<ConnectionId, Phase>>,
    pending: Arc<PendingWork>,
    downstream: Option<Arc<dyn ConnStateObserver>>,
}

impl Tracker {
    pub(crate) fn new(
        pending: Arc<PendingWork>,
        downstream: Option<Arc<dyn ConnStateObserver>>,
    ) -> Self {
        Self {
            phases: Mutex::new(HashMap::new()),
            pending,
            downstream,
        }
    }

    /// The counter this tracker charges connection obligations to.
    pub(crate) fn pending(&self) -> &Arc<PendingWork> {
        &self.pending
    }

    /// Number of connections currently between requests.
    pub(crate) fn idle_connections(&self) -> usize {
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|phase| **phase == Phase::Idle)
            .count()
    }

    /// Number of connections the tracker currently knows about.
    pub(crate) fn tracked_connections(&self) -> usize {
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl ConnStateObserver for Tracker {
    fn on_transition(&self, conn: &ConnInfo, state: ConnState) {
        let delta = {
            let mut phases = self.phases.lock().unwrap_or_else(PoisonError::into_inner);
            let prev = phases.get(&conn.id).copied();
            let (delta, next) = transition(prev, state);
            match next {
                Some(phase) => phases.insert(conn.id, phase),
                None => phases.remove(&conn.id),
            };
            delta
        };
        self.pending.apply(delta);
        debug!(conn = %conn.id, peer = %conn.peer_addr, %state, delta, "connection state");

        if let Some(downstream) = &self.downstream {
            downstream.on_transition(conn, state);
        }
    }
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("tracked", &self.tracked_connections())
            .field("pending", &self.pending.get())
            .finish()
    }
}
