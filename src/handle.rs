//! Single-use checkout handles over shared physical connections

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::trace;

use crate::connection::{Connection, ResourceError};
use crate::errors::{PoolError, PoolResult};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_PHYSICAL_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle phase of a [`Handle`].
///
/// The only transitions are `Available -> InUse -> Used`. `Used` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Not checked out yet
    Available,

    /// Checked out by a caller; resource operations are allowed
    InUse,

    /// Checked in; the handle is permanently inert
    Used,
}

#[derive(Debug)]
struct Lifecycle {
    phase: Phase,
    last_used: Instant,
}

/// Physical connection shared by a handle and the siblings minted by [`Handle::rewrap`].
struct Physical<C> {
    id: u64,
    conn: Mutex<C>,
}

struct Inner<C> {
    id: u64,
    origin: Option<u64>,
    lifecycle: Mutex<Lifecycle>,
    physical: Arc<Physical<C>>,
}

/// A single-use checkout of a pooled connection.
///
/// A handle goes through `Available -> InUse -> Used` exactly once. While it
/// is in use, [`with_connection`](Handle::with_connection) gives access to the
/// physical connection and resets the idle clock. Once checked in the handle
/// answers nothing; [`rewrap`](Handle::rewrap) mints a fresh sibling bound to
/// the same physical connection.
///
/// Cloning a `Handle` clones the reference, not the checkout: both clones
/// observe the same lifecycle.
///
/// # Examples
///
/// ```
/// use esox_connpool::{Handle, MemoryServer, Connector};
///
/// let server = MemoryServer::new();
/// let handle = Handle::new(server.connector("mem://db").connect().unwrap());
///
/// assert!(handle.check_out().unwrap());
/// handle.probe().unwrap();
/// handle.check_in().unwrap();
///
/// // Checked-in handles are inert.
/// assert!(handle.probe().unwrap_err().is_invalid_state());
///
/// // A sibling over the same connection can be checked out again.
/// let sibling = handle.rewrap().unwrap();
/// assert_eq!(sibling.physical_id(), handle.physical_id());
/// assert!(sibling.check_out().unwrap());
/// ```
pub struct Handle<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for Handle<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> fmt::Debug for Handle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.inner.id)
            .field("physical_id", &self.inner.physical.id)
            .field("phase", &self.phase())
            .finish()
    }
}

impl<C> Handle<C> {
    /// Wrap a physical connection in a standalone handle.
    ///
    /// A standalone handle belongs to no pool, so releasing it to one fails
    /// with [`PoolError::InvalidState`].
    pub fn new(conn: C) -> Self {
        Self::wrap(conn, None)
    }

    pub(crate) fn minted(conn: C, pool_id: u64) -> Self {
        Self::wrap(conn, Some(pool_id))
    }

    fn wrap(conn: C, origin: Option<u64>) -> Self {
        let physical = Arc::new(Physical {
            id: NEXT_PHYSICAL_ID.fetch_add(1, Ordering::Relaxed),
            conn: Mutex::new(conn),
        });
        Self::sibling(physical, origin)
    }

    fn sibling(physical: Arc<Physical<C>>, origin: Option<u64>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
                origin,
                lifecycle: Mutex::new(Lifecycle {
                    phase: Phase::Available,
                    last_used: Instant::now(),
                }),
                physical,
            }),
        }
    }

    /// Mark the handle as in use and start its idle clock.
    ///
    /// Returns `false` if the handle is already in use, so a second caller
    /// racing for the same handle loses without an error.
    pub fn check_out(&self) -> PoolResult<bool> {
        let mut lifecycle = self.inner.lifecycle.lock();
        match lifecycle.phase {
            Phase::InUse => Ok(false),
            Phase::Used => Err(PoolError::invalid_state(
                "connection has already been checked in and cannot be re-used",
            )),
            Phase::Available => {
                lifecycle.phase = Phase::InUse;
                lifecycle.last_used = Instant::now();
                trace!(handle = self.inner.id, "checked out");
                Ok(true)
            }
        }
    }

    /// Mark the handle as used. Fails unless it is currently checked out.
    pub fn check_in(&self) -> PoolResult<()> {
        let mut lifecycle = self.inner.lifecycle.lock();
        match lifecycle.phase {
            Phase::InUse => {
                lifecycle.phase = Phase::Used;
                trace!(handle = self.inner.id, "checked in");
                Ok(())
            }
            Phase::Used => Err(PoolError::invalid_state("connection already checked in")),
            Phase::Available => Err(PoolError::invalid_state("connection not checked out")),
        }
    }

    /// Check in without validating the current phase.
    pub(crate) fn force_check_in(&self) {
        self.inner.lifecycle.lock().phase = Phase::Used;
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> Phase {
        self.inner.lifecycle.lock().phase
    }

    /// Whether the handle has not been checked out yet
    pub fn available(&self) -> bool {
        self.phase() == Phase::Available
    }

    /// Whether the handle is checked out and not yet checked in
    pub fn in_use(&self) -> bool {
        self.phase() == Phase::InUse
    }

    /// When the handle was checked out or last used, whichever is later.
    pub fn last_used_at(&self) -> PoolResult<Instant> {
        let lifecycle = self.inner.lifecycle.lock();
        if lifecycle.phase != Phase::InUse {
            return Err(PoolError::invalid_state("connection not in use"));
        }
        Ok(lifecycle.last_used)
    }

    /// Gate for every resource operation: the handle must be in use.
    /// Refreshes the idle clock on success.
    pub fn touch(&self) -> PoolResult<()> {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.phase != Phase::InUse {
            return Err(PoolError::invalid_state("connection not in use"));
        }
        lifecycle.last_used = Instant::now();
        Ok(())
    }

    /// Run an operation against the physical connection.
    ///
    /// Fails with [`PoolError::InvalidState`] unless the handle is checked
    /// out; driver errors surface as [`PoolError::Resource`].
    pub fn with_connection<R, F>(&self, op: F) -> PoolResult<R>
    where
        F: FnOnce(&mut C) -> Result<R, ResourceError>,
    {
        // The phase is checked while the connection is held, so a check-in
        // that lands while this call waits for the connection is honoured.
        let mut conn = self.inner.physical.conn.lock();
        self.touch()?;
        op(&mut *conn).map_err(PoolError::from)
    }

    /// Does nothing. The pool owns the physical connection and closes it
    /// when it is evicted; hand the handle back with
    /// [`ConnectionPool::release`](crate::ConnectionPool::release) instead.
    pub fn close(&self) {}

    /// Mint a new `Available` handle bound to the same physical connection.
    /// Only a checked-in handle can be rewrapped.
    pub fn rewrap(&self) -> PoolResult<Handle<C>> {
        if self.phase() != Phase::Used {
            return Err(PoolError::invalid_state("connection not checked in"));
        }
        Ok(Self::sibling(Arc::clone(&self.inner.physical), self.inner.origin))
    }

    /// Unique id of this handle object
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Id of the physical connection, shared with every rewrapped sibling
    pub fn physical_id(&self) -> u64 {
        self.inner.physical.id
    }

    pub(crate) fn origin(&self) -> Option<u64> {
        self.inner.origin
    }

    /// Whether `other` refers to the same handle object (not merely the same
    /// physical connection).
    pub fn same_handle(&self, other: &Handle<C>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<C: Connection> Handle<C> {
    /// Liveness probe through the gate.
    pub fn probe(&self) -> PoolResult<()> {
        self.with_connection(|conn| conn.probe())
    }

    /// Close the physical connection regardless of the handle's phase.
    pub(crate) fn force_close(&self) -> Result<(), ResourceError> {
        self.inner.physical.conn.lock().close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connector;
    use crate::memory::{MemoryConnection, MemoryServer};
    use std::thread;
    use std::time::Duration;

    fn handle(server: &MemoryServer) -> Handle<MemoryConnection> {
        Handle::new(server.connector("mem://handle").connect().unwrap())
    }

    #[test]
    fn test_check_out() {
        let server = MemoryServer::new();
        let conn = handle(&server);
        assert!(conn.available());
        assert!(conn.check_out().unwrap());
        assert!(!conn.available());
        assert!(conn.in_use());
    }

    #[test]
    fn test_repeated_check_out_returns_false() {
        let server = MemoryServer::new();
        let conn = handle(&server);
        assert!(conn.check_out().unwrap());
        assert!(!conn.check_out().unwrap());
        assert!(conn.in_use());
    }

    #[test]
    fn test_check_in() {
        let server = MemoryServer::new();
        let conn = handle(&server);
        conn.check_out().unwrap();
        conn.check_in().unwrap();
        assert!(!conn.available());
        assert!(!conn.in_use());
        assert_eq!(conn.phase(), Phase::Used);
    }

    #[test]
    fn test_repeated_check_in_fails() {
        let server = MemoryServer::new();
        let conn = handle(&server);
        conn.check_out().unwrap();
        conn.check_in().unwrap();
        assert!(conn.check_in().unwrap_err().is_invalid_state());
    }

    #[test]
    fn test_check_out_after_check_in_fails() {
        let server = MemoryServer::new();
        let conn = handle(&server);
        conn.check_out().unwrap();
        conn.check_in().unwrap();
        assert!(conn.check_out().unwrap_err().is_invalid_state());
    }

    #[test]
    fn test_check_in_before_check_out_fails() {
        let server = MemoryServer::new();
        let conn = handle(&server);
        assert!(conn.check_in().unwrap_err().is_invalid_state());
        assert!(conn.available());
    }

    #[test]
    fn test_rewrap_shares_physical_connection() {
        let server = MemoryServer::new();
        let conn = handle(&server);
        conn.check_out().unwrap();
        conn.check_in().unwrap();

        let sibling = conn.rewrap().unwrap();
        assert!(!sibling.same_handle(&conn));
        assert_ne!(sibling.id(), conn.id());
        assert_eq!(sibling.physical_id(), conn.physical_id());
        assert!(sibling.available());
        assert!(sibling.check_out().unwrap());
        sibling.probe().unwrap();
    }

    #[test]
    fn test_rewrap_requires_check_in() {
        let server = MemoryServer::new();
        let conn = handle(&server);
        assert!(conn.rewrap().unwrap_err().is_invalid_state());
        conn.check_out().unwrap();
        assert!(conn.rewrap().unwrap_err().is_invalid_state());
    }

    #[test]
    fn test_operations_gated_by_phase() {
        let server = MemoryServer::new();
        let conn = handle(&server);
        assert!(conn.probe().unwrap_err().is_invalid_state());
        conn.check_out().unwrap();
        assert_eq!(conn.with_connection(|c| c.execute("select 1")).unwrap(), 1);
        conn.check_in().unwrap();
        assert!(
            conn.with_connection(|c| c.execute("select 1"))
                .unwrap_err()
                .is_invalid_state()
        );
    }

    #[test]
    fn test_close_is_a_no_op() {
        let server = MemoryServer::new();
        let conn = handle(&server);
        conn.check_out().unwrap();
        conn.close();
        conn.probe().unwrap();
        assert_eq!(server.open_count(), 1);
    }

    #[test]
    fn test_force_close_ignores_phase() {
        let server = MemoryServer::new();
        let conn = handle(&server);
        conn.force_close().unwrap();
        assert_eq!(server.open_count(), 0);
        assert!(conn.available());
    }

    #[test]
    fn test_last_used_tracking() {
        let server = MemoryServer::new();
        let conn = handle(&server);
        assert!(conn.last_used_at().unwrap_err().is_invalid_state());

        conn.check_out().unwrap();
        let previous = conn.last_used_at().unwrap();
        thread::sleep(Duration::from_millis(50));
        // Not using the connection leaves the clock alone.
        assert_eq!(conn.last_used_at().unwrap(), previous);

        conn.probe().unwrap();
        let latest = conn.last_used_at().unwrap();
        assert!(latest >= previous + Duration::from_millis(50));

        conn.check_in().unwrap();
        assert!(conn.last_used_at().unwrap_err().is_invalid_state());
    }

    #[test]
    fn test_racing_check_out_has_one_winner() {
        let server = MemoryServer::new();
        let conn = handle(&server);

        let winners: usize = (0..8)
            .map(|_| {
                let conn = conn.clone();
                thread::spawn(move || conn.check_out().unwrap())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| t.join().unwrap() as usize)
            .sum();

        assert_eq!(winners, 1);
    }

    #[test]
    fn test_waiting_operation_fails_after_check_in() {
        let server = MemoryServer::new();
        let conn = handle(&server);
        conn.check_out().unwrap();
        let (entered_tx, entered_rx) = crossbeam::channel::bounded(1);

        let slow = {
            let conn = conn.clone();
            thread::spawn(move || {
                conn.with_connection(|c| {
                    entered_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(200));
                    c.execute("select 1")
                })
            })
        };
        entered_rx.recv().unwrap();

        let queued = {
            let conn = conn.clone();
            thread::spawn(move || conn.with_connection(|c| c.execute("select 2")))
        };
        // Let the second call block on the connection, then retire the handle.
        thread::sleep(Duration::from_millis(50));
        conn.check_in().unwrap();

        assert!(slow.join().unwrap().is_ok());
        assert!(queued.join().unwrap().unwrap_err().is_invalid_state());
    }
}
