//! Outstanding-work accounting for graceful shutdown.
//!
//! [`PendingWork`] is a signed atomic counter paired with a [`Notify`] so the
//! accept loop can wait for it to reach zero without polling. It is mutated by
//! the connection tracker and by handler code through [`Routines`].

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::Notify;
use tracing::trace;

/// Counter of obligations that must be repaid before the server is drained.
#[derive(Debug, Default)]
pub(crate) struct PendingWork {
    count: AtomicI64,
    zero: Notify,
}

impl PendingWork {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Applies `delta` and wakes drain waiters when the counter lands on zero.
    ///
    /// # Panics
    ///
    /// Panics if the counter would go negative. That only happens when
    /// [`Routines::finish`] is called more often than [`Routines::start`].
    pub(crate) fn apply(&self, delta: i64) {
        if delta == 0 {
            return;
        }
        let now = self.count.fetch_add(delta, Ordering::AcqRel) + delta;
        trace!(delta, pending = now, "pending work updated");
        assert!(now >= 0, "pending work counter went negative ({now})");
        if now == 0 {
            self.zero.notify_waiters();
        }
    }

    /// Returns the current number of outstanding obligations.
    pub(crate) fn get(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    /// Resolves once the counter is zero.
    pub(crate) async fn drained(&self) {
        loop {
            let notified = self.zero.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent drop to zero is not missed.
            notified.as_mut().enable();
            if self.get() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Handle for registering background work that outlives an HTTP response.
///
/// Obtain one with [`Server::routines`](crate::Server::routines) and move it
/// into the handler closure. Every [`start`](Self::start) must be paired with
/// exactly one [`finish`](Self::finish); a graceful shutdown waits for all
/// started routines to finish.
///
/// # Examples
///
/// ```rust,no_run
/// use graceful_web::{Response, Server, StatusCode};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let server = Server::new();
/// let routines = server.routines();
/// server.listen("127.0.0.1:0").await?;
/// let (tx, _rx) = tokio::sync::mpsc::channel(1);
/// server
///     .serve(
///         move |_req| {
///             let guard = routines.guard();
///             async move {
///                 tokio::spawn(async move {
///                     // ... background work ...
///                     drop(guard);
///                 });
///                 Response::new(StatusCode::Accepted)
///             }
///         },
///         tx,
///     )
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Routines {
    pending: Arc<PendingWork>,
}

impl Routines {
    pub(crate) fn new(pending: Arc<PendingWork>) -> Self {
        Self { pending }
    }

    /// Registers one unit of background work.
    pub fn start(&self) {
        self.pending.apply(1);
    }

    /// Marks one previously started unit of background work as finished.
    ///
    /// # Panics
    ///
    /// Panics when called without a matching [`start`](Self::start).
    pub fn finish(&self) {
        self.pending.apply(-1);
    }

    /// Starts a routine and returns a guard that finishes it when dropped.
    #[must_use = "the routine finishes as soon as the guard is dropped"]
    pub fn guard(&self) -> RoutineGuard {
        self.start();
        RoutineGuard {
            routines: self.clone(),
        }
    }
}

/// Finishes its routine on drop. Created by [`Routines::guard`].
#[derive(Debug)]
pub struct RoutineGuard {
    routines: Routines,
}

impl Drop for RoutineGuard {
    fn drop(&mut self) {
        self.routines.finish();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn starts_at_zero() {
        assert_eq!(PendingWork::new().get(), 0);
    }

    #[test]
    fn start_and_finish_pair_up() {
        let routines = Routines::new(Arc::new(PendingWork::new()));
        routines.start();
        routines.start();
        assert_eq!(routines.pending.get(), 2);
        routines.finish();
        routines.finish();
        assert_eq!(routines.pending.get(), 0);
    }

    #[test]
    #[should_panic(expected = "went negative")]
    fn unpaired_finish_panics() {
        let routines = Routines::new(Arc::new(PendingWork::new()));
        routines.finish();
    }

    #[test]
    fn guard_finishes_on_drop() {
        let routines = Routines::new(Arc::new(PendingWork::new()));
        let guard = routines.guard();
        assert_eq!(routines.pending.get(), 1);
        drop(guard);
        assert_eq!(routines.pending.get(), 0);
    }

    #[tokio::test]
    async fn drained_returns_immediately_at_zero() {
        let pending = PendingWork::new();
        tokio::time::timeout(Duration::from_millis(100), pending.drained())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn drained_waits_for_last_finish() {
        let pending = Arc::new(PendingWork::new());
        pending.apply(2);

        let waiter = {
            let pending = Arc::clone(&pending);
            tokio::spawn(async move { pending.drained().await })
        };

        pending.apply(-1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pending.apply(-1);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
