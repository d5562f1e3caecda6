//! Connection pool: checkout, release, sizing policy and idle reclamation

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::PoolConfiguration;
use crate::connection::Connector;
use crate::errors::{PoolError, PoolResult};
use crate::handle::Handle;
use crate::status::PoolStatus;
use crate::sweeper::{Sweeper, sweep_interval};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Handle type handed out by a pool over connector `K`.
pub type PooledConnection<K> = Handle<<K as Connector>::Connection>;

/// Collection and sizing policy, guarded by the pool lock.
struct PoolState<C> {
    handles: Vec<Handle<C>>,
    min_size: usize,
    max_size: usize,
    growth_increment: usize,
    torn_down: bool,
}

impl<C> PoolState<C> {
    fn count_available(&self) -> usize {
        self.handles.iter().filter(|h| h.available()).count()
    }

    fn count_in_use(&self) -> usize {
        self.handles.iter().filter(|h| h.in_use()).count()
    }

    fn position(&self, handle: &Handle<C>) -> Option<usize> {
        self.handles.iter().position(|h| h.same_handle(handle))
    }
}

/// State shared between the pool and its sweep thread.
struct Shared<K: Connector> {
    id: u64,
    connector: K,
    idle_timeout: Duration,
    state: Mutex<PoolState<K::Connection>>,
}

impl<K: Connector> Shared<K> {
    fn open(&self) -> PoolResult<PooledConnection<K>> {
        let conn = self.connector.connect()?;
        Ok(Handle::minted(conn, self.id))
    }

    /// Evict every checked-out handle idle longer than the timeout.
    fn prune_idle(&self) -> usize {
        let mut state = self.state.lock();
        let now = Instant::now();
        let timeout = self.idle_timeout;

        let mut expired = Vec::new();
        state.handles.retain(|handle| {
            let idle = handle
                .last_used_at()
                .map(|last_used| now.saturating_duration_since(last_used));
            match idle {
                Ok(idle) if idle > timeout => {
                    expired.push(handle.clone());
                    false
                }
                _ => true,
            }
        });

        for handle in &expired {
            handle.force_check_in();
        }
        if !expired.is_empty() {
            debug!(
                pool = self.id,
                evicted = expired.len(),
                size = state.handles.len(),
                "evicted idle connections"
            );
        }
        // Closing waits for any operation still running on the connection.
        drop(state);

        for handle in &expired {
            // A timed-out connection may well fail to close.
            if let Err(err) = handle.force_close() {
                warn!(handle = handle.id(), error = %err, "failed to close timed-out connection");
            }
        }
        expired.len()
    }
}

/// A bounded pool of single-use connection handles.
///
/// The pool opens `min_size` connections up front and grows by
/// `growth_increment` (never beyond `max_size`) when every connection is
/// checked out. [`acquire`](ConnectionPool::acquire) never waits: when the
/// pool is exhausted it returns `Ok(None)`.
///
/// Every handle is good for a single checkout. Releasing it retires the
/// handle and either closes its connection, when at least one growth
/// increment is already idle and the pool is above its minimum, or
/// re-admits a fresh handle over the same connection.
///
/// With a non-zero idle timeout a sweep thread reclaims handles that stay
/// checked out without activity for longer than the timeout.
///
/// # Examples
///
/// ```
/// use esox_connpool::{ConnectionPool, MemoryServer, PoolConfiguration};
///
/// let server = MemoryServer::new();
/// let pool = ConnectionPool::new(
///     server.connector("mem://inventory"),
///     PoolConfiguration::new().with_min_size(1).with_max_size(1),
/// )
/// .unwrap();
///
/// let conn = pool.acquire().unwrap().expect("pool has capacity");
/// conn.with_connection(|c| c.execute("select 1")).unwrap();
///
/// // Exhausted: no error, just nothing to hand out.
/// assert!(pool.acquire().unwrap().is_none());
///
/// pool.release(&conn).unwrap();
/// assert!(pool.acquire().unwrap().is_some());
/// ```
pub struct ConnectionPool<K: Connector> {
    shared: Arc<Shared<K>>,
    sweeper: Mutex<Option<Sweeper>>,
    config: PoolConfiguration,
}

impl<K: Connector> ConnectionPool<K> {
    /// Create a pool and open `min_size` connections.
    ///
    /// The configuration is validated before any connection is opened. If
    /// opening one of the initial connections fails, those already opened
    /// are closed and the error is returned.
    pub fn new(connector: K, config: PoolConfiguration) -> PoolResult<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            connector,
            idle_timeout: config.idle_timeout,
            state: Mutex::new(PoolState {
                handles: Vec::with_capacity(config.min_size),
                min_size: config.min_size,
                max_size: config.max_size,
                growth_increment: config.growth_increment,
                torn_down: false,
            }),
        });

        let mut initial = Vec::with_capacity(config.min_size);
        for _ in 0..config.min_size {
            match shared.open() {
                Ok(handle) => initial.push(handle),
                Err(err) => {
                    for handle in &initial {
                        if let Err(close_err) = handle.force_close() {
                            warn!(error = %close_err, "failed to close connection after aborted startup");
                        }
                    }
                    return Err(err);
                }
            }
        }
        shared.state.lock().handles = initial;

        debug!(
            pool = shared.id,
            min_size = config.min_size,
            max_size = config.max_size,
            growth_increment = config.growth_increment,
            idle_timeout = ?config.idle_timeout,
            "connection pool created"
        );

        let pool = Self {
            shared,
            sweeper: Mutex::new(None),
            config,
        };
        if pool.config.sweeps_idle() {
            let target = Arc::clone(&pool.shared);
            // On failure the pool is dropped here, which tears it down.
            let sweeper = Sweeper::start(sweep_interval(pool.config.idle_timeout), move || {
                target.prune_idle()
            })?;
            *pool.sweeper.lock() = Some(sweeper);
        }
        Ok(pool)
    }

    /// Create a pool with the default configuration.
    pub fn with_defaults(connector: K) -> PoolResult<Self> {
        Self::new(connector, PoolConfiguration::default())
    }

    /// Check out a connection, growing the pool if every connection is busy.
    ///
    /// Returns `Ok(None)` when the pool is at `max_size` and nothing is free
    /// (or the pool has been torn down). A claimed connection is probed first;
    /// a stale one is replaced in its slot by a freshly opened connection.
    /// Errors from opening connections are returned to the caller.
    pub fn acquire(&self) -> PoolResult<Option<PooledConnection<K>>> {
        let mut state = self.shared.state.lock();

        let claimed = state
            .handles
            .iter()
            .position(|handle| handle.check_out().unwrap_or(false));

        if let Some(index) = claimed {
            let handle = state.handles[index].clone();
            if handle.probe().is_ok() {
                return Ok(Some(handle));
            }
            return self.replace_stale(&mut *state, index).map(Some);
        }

        let room = state.max_size.saturating_sub(state.handles.len());
        let wanted = state.growth_increment.min(room);
        let mut first = None;
        for _ in 0..wanted {
            let handle = self.shared.open()?;
            if first.is_none() {
                first = Some(handle.clone());
            }
            state.handles.push(handle);
        }

        match first {
            Some(handle) => {
                debug!(pool = self.shared.id, added = wanted, size = state.handles.len(), "pool grew");
                handle.check_out()?;
                Ok(Some(handle))
            }
            None => {
                trace!(pool = self.shared.id, size = state.handles.len(), "pool exhausted");
                Ok(None)
            }
        }
    }

    /// Swap the stale handle at `index` for a new connection, checked out.
    fn replace_stale(
        &self,
        state: &mut PoolState<K::Connection>,
        index: usize,
    ) -> PoolResult<PooledConnection<K>> {
        let stale = state.handles[index].clone();
        warn!(pool = self.shared.id, handle = stale.id(), "stale connection, replacing");
        stale.force_check_in();

        let replacement = match self.shared.open() {
            Ok(handle) => handle,
            Err(err) => {
                // Keep the slot so the pool stays at size; the next acquire probes again.
                state.handles[index] = stale.rewrap()?;
                return Err(err);
            }
        };

        if let Err(err) = stale.force_close() {
            warn!(handle = stale.id(), error = %err, "failed to close stale connection");
        }
        replacement.check_out()?;
        state.handles[index] = replacement.clone();
        Ok(replacement)
    }

    /// Hand a connection back to the pool.
    ///
    /// The handle is checked in and retired. Its connection is closed when at
    /// least `growth_increment` handles are already available and the pool
    /// would still hold `min_size` handles; otherwise a fresh handle over the
    /// same connection is re-admitted.
    ///
    /// Fails with [`PoolError::InvalidArgument`] for a handle minted by a
    /// different pool, and with [`PoolError::InvalidState`] for a handle the
    /// pool no longer tracks (evicted by the idle sweep, or the pool was torn
    /// down) or one already checked in.
    pub fn release(&self, handle: &PooledConnection<K>) -> PoolResult<()> {
        let mut state = self.shared.state.lock();

        if let Some(origin) = handle.origin()
            && origin != self.shared.id
        {
            return Err(PoolError::invalid_argument(
                "attempted to release a connection that didn't come from this pool",
            ));
        }

        let index = state.position(handle).ok_or_else(|| {
            PoolError::invalid_state(
                "connection not in pool; it may have been removed already, possibly due to timeout",
            )
        })?;
        handle.check_in()?;
        state.handles.remove(index);

        if state.count_available() >= state.growth_increment && state.handles.len() >= state.min_size {
            debug!(pool = self.shared.id, size = state.handles.len(), "closing surplus connection");
            drop(state);
            if let Err(err) = handle.force_close() {
                warn!(handle = handle.id(), error = %err, "failed to close surplus connection");
            }
        } else {
            state.handles.push(handle.rewrap()?);
            trace!(pool = self.shared.id, physical = handle.physical_id(), "connection re-admitted");
        }
        Ok(())
    }

    /// Stop the sweep thread, close every connection and stop the pool
    /// from ever growing again. Idempotent.
    ///
    /// Handles still checked out are retired; releasing them afterwards fails
    /// with [`PoolError::InvalidState`].
    pub fn teardown(&self) {
        if let Some(mut sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }

        let mut state = self.shared.state.lock();
        let handles = std::mem::take(&mut state.handles);
        state.max_size = 0;
        let first_teardown = !state.torn_down;
        state.torn_down = true;
        drop(state);

        for handle in &handles {
            handle.force_check_in();
            if let Err(err) = handle.force_close() {
                warn!(handle = handle.id(), error = %err, "failed to close connection during teardown");
            }
        }
        if first_teardown {
            debug!(pool = self.shared.id, closed = handles.len(), "connection pool torn down");
        }
    }

    /// Number of handles not yet checked out
    pub fn count_available(&self) -> usize {
        self.shared.state.lock().count_available()
    }

    /// Number of handles checked out
    pub fn count_in_use(&self) -> usize {
        self.shared.state.lock().count_in_use()
    }

    /// Number of handles tracked by the pool
    pub fn size(&self) -> usize {
        self.shared.state.lock().handles.len()
    }

    /// Consistent snapshot of all counts
    pub fn status(&self) -> PoolStatus {
        let state = self.shared.state.lock();
        PoolStatus {
            available: state.count_available(),
            in_use: state.count_in_use(),
            size: state.handles.len(),
            min_size: state.min_size,
            max_size: state.max_size,
            torn_down: state.torn_down,
        }
    }

    /// The configuration the pool was created with
    pub fn config(&self) -> &PoolConfiguration {
        &self.config
    }

    /// The connector used to open new connections
    pub fn connector(&self) -> &K {
        &self.shared.connector
    }

    /// Whether the idle sweep thread is running
    pub fn is_sweeping(&self) -> bool {
        self.sweeper.lock().is_some()
    }

    /// Acquire asynchronously, retrying until a connection frees up or
    /// `acquire_timeout` elapses.
    pub async fn acquire_async(&self) -> PoolResult<PooledConnection<K>> {
        let timeout = self.config.acquire_timeout;

        tokio::time::timeout(timeout, async {
            loop {
                match self.acquire()? {
                    Some(handle) => return Ok(handle),
                    None => {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        })
        .await
        .map_err(|_| PoolError::Timeout(timeout))?
    }
}

impl<K: Connector> Drop for ConnectionPool<K> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryConnector, MemoryServer};

    fn pool(server: &MemoryServer, config: PoolConfiguration) -> ConnectionPool<MemoryConnector> {
        ConnectionPool::new(server.connector("mem://pool"), config).unwrap()
    }

    fn sized(min: usize, max: usize, incr: usize) -> PoolConfiguration {
        PoolConfiguration::new()
            .with_min_size(min)
            .with_max_size(max)
            .with_growth_increment(incr)
    }

    #[test]
    fn test_pool_starts_at_min_size() {
        let server = MemoryServer::new();
        let pool = pool(&server, sized(3, 6, 2));
        assert_eq!(pool.status().counts(), (3, 0, 3));
        assert_eq!(server.open_count(), 3);
        assert!(!pool.is_sweeping());
    }

    #[test]
    fn test_invalid_config_opens_nothing() {
        let server = MemoryServer::new();
        let result = ConnectionPool::new(server.connector("mem://pool"), sized(0, 1, 1));
        assert!(result.err().unwrap().is_invalid_argument());
        let result = ConnectionPool::new(server.connector("mem://pool"), sized(2, 1, 1));
        assert!(result.err().unwrap().is_invalid_argument());
        assert_eq!(server.opened_total(), 0);
    }

    #[test]
    fn test_failed_startup_closes_opened_connections() {
        struct FlakyConnector {
            inner: MemoryConnector,
            budget: AtomicU64,
        }

        impl Connector for FlakyConnector {
            type Connection = <MemoryConnector as Connector>::Connection;

            fn connect(&self) -> Result<Self::Connection, crate::ResourceError> {
                if self.budget.fetch_sub(1, Ordering::SeqCst) == 0 {
                    return Err("out of connections".into());
                }
                self.inner.connect()
            }
        }

        let server = MemoryServer::new();
        let connector = FlakyConnector {
            inner: server.connector("mem://pool"),
            budget: AtomicU64::new(2),
        };
        let result = ConnectionPool::new(connector, sized(4, 4, 1));
        assert!(matches!(result, Err(PoolError::Resource(_))));
        assert_eq!(server.opened_total(), 2);
        assert_eq!(server.open_count(), 0);
    }

    #[test]
    fn test_acquire_probes_and_replaces_stale_connection() {
        let server = MemoryServer::new();
        let pool = pool(&server, sized(1, 2, 1));
        server.invalidate_all();

        let conn = pool.acquire().unwrap().unwrap();
        conn.probe().unwrap();
        assert_eq!(pool.status().counts(), (0, 1, 1));
        // The stale session was closed, the replacement is the only one open.
        assert_eq!(server.opened_total(), 2);
        assert_eq!(server.open_count(), 1);
    }

    #[test]
    fn test_stale_replacement_failure_keeps_slot() {
        let server = MemoryServer::new();
        let pool = pool(&server, sized(1, 1, 1));
        server.invalidate_all();
        server.set_refuse_connections(true);

        assert!(matches!(pool.acquire(), Err(PoolError::Resource(_))));
        assert_eq!(pool.status().counts(), (1, 0, 1));

        server.set_refuse_connections(false);
        let conn = pool.acquire().unwrap().unwrap();
        conn.probe().unwrap();
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_growth_failure_propagates() {
        let server = MemoryServer::new();
        let pool = pool(&server, sized(1, 4, 2));
        let _first = pool.acquire().unwrap().unwrap();

        server.set_refuse_connections(true);
        assert!(matches!(pool.acquire(), Err(PoolError::Resource(_))));
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_zero_increment_never_grows() {
        let server = MemoryServer::new();
        let pool = pool(&server, sized(1, 5, 0));
        let _conn = pool.acquire().unwrap().unwrap();
        assert!(pool.acquire().unwrap().is_none());
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_release_readmits_sibling_over_same_connection() {
        let server = MemoryServer::new();
        let pool = pool(&server, sized(1, 1, 1));

        let conn = pool.acquire().unwrap().unwrap();
        pool.release(&conn).unwrap();
        assert!(conn.probe().unwrap_err().is_invalid_state());

        let again = pool.acquire().unwrap().unwrap();
        assert!(!again.same_handle(&conn));
        assert_eq!(again.physical_id(), conn.physical_id());
        assert_eq!(server.opened_total(), 1);
    }

    #[test]
    fn test_double_release_fails() {
        let server = MemoryServer::new();
        let pool = pool(&server, sized(2, 2, 1));
        let conn = pool.acquire().unwrap().unwrap();
        pool.release(&conn).unwrap();
        assert!(pool.release(&conn).unwrap_err().is_invalid_state());
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn test_release_of_unclaimed_handle_fails() {
        let server = MemoryServer::new();
        let pool = pool(&server, sized(1, 1, 1));
        let conn = pool.acquire().unwrap().unwrap();
        pool.release(&conn).unwrap();

        // The re-admitted sibling is tracked but was never checked out.
        let sibling = {
            let state = pool.shared.state.lock();
            state.handles[0].clone()
        };
        assert!(pool.release(&sibling).unwrap_err().is_invalid_state());
        assert_eq!(pool.status().counts(), (1, 0, 1));
    }

    #[test]
    fn test_no_sweeper_without_timeout() {
        let server = MemoryServer::new();
        let pool = pool(&server, sized(1, 1, 1));
        let conn = pool.acquire().unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(!pool.is_sweeping());
        assert!(conn.in_use());
    }

    #[test]
    fn test_prune_leaves_recently_used_connections() {
        let server = MemoryServer::new();
        let pool = pool(&server, sized(2, 2, 1).with_idle_timeout(Duration::from_secs(3600)));
        let conn = pool.acquire().unwrap().unwrap();

        assert_eq!(pool.shared.prune_idle(), 0);
        assert_eq!(pool.size(), 2);
        assert!(conn.in_use());
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let server = MemoryServer::new();
        let pool = pool(&server, sized(2, 4, 1));
        pool.teardown();
        pool.teardown();
        let status = pool.status();
        assert!(status.torn_down);
        assert_eq!(status.max_size, 0);
        assert_eq!(status.counts(), (0, 0, 0));
        assert_eq!(server.open_count(), 0);
    }

    #[test]
    fn test_drop_closes_connections() {
        let server = MemoryServer::new();
        {
            let _pool = pool(&server, sized(3, 4, 1).with_idle_timeout(Duration::from_secs(10)));
            assert_eq!(server.open_count(), 3);
        }
        assert_eq!(server.open_count(), 0);
    }

    #[tokio::test]
    async fn test_acquire_async() {
        let server = MemoryServer::new();
        let pool = pool(&server, sized(1, 1, 1));
        let conn = pool.acquire_async().await.unwrap();
        conn.probe().unwrap();
    }

    #[tokio::test]
    async fn test_acquire_async_times_out_when_exhausted() {
        let server = MemoryServer::new();
        let pool = pool(&server, sized(1, 1, 1).with_acquire_timeout(Duration::from_millis(50)));
        let _held = pool.acquire().unwrap().unwrap();
        let err = pool.acquire_async().await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_acquire_async_waits_for_release() {
        let server = MemoryServer::new();
        let pool = Arc::new(pool(&server, sized(1, 1, 1)));
        let held = pool.acquire().unwrap().unwrap();

        let releaser = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                pool.release(&held).unwrap();
            })
        };

        let conn = pool.acquire_async().await.unwrap();
        conn.probe().unwrap();
        releaser.await.unwrap();
    }
}
