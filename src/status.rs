//! Point-in-time view of a pool's size and occupancy

use std::fmt;

/// Snapshot of a pool taken under a single lock acquisition, so the
/// counts are mutually consistent.
///
/// # Examples
///
/// ```
/// use esox_connpool::{ConnectionPool, MemoryServer, PoolConfiguration};
///
/// let server = MemoryServer::new();
/// let pool = ConnectionPool::new(
///     server.connector("mem://db"),
///     PoolConfiguration::new().with_min_size(3).with_max_size(5),
/// )
/// .unwrap();
///
/// let _conn = pool.acquire().unwrap().unwrap();
/// let status = pool.status();
/// assert_eq!(status.available, 2);
/// assert_eq!(status.in_use, 1);
/// assert_eq!(status.size, 3);
/// assert!(!status.torn_down);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Handles not yet checked out
    pub available: usize,

    /// Handles checked out and not yet released
    pub in_use: usize,

    /// Handles tracked by the pool
    pub size: usize,

    /// Configured floor
    pub min_size: usize,

    /// Current cap (forced to zero by teardown)
    pub max_size: usize,

    /// Whether the pool has been torn down
    pub torn_down: bool,
}

impl PoolStatus {
    /// The `(available, in_use, size)` triple
    pub fn counts(&self) -> (usize, usize, usize) {
        (self.available, self.in_use, self.size)
    }

    /// Whether another `acquire` could be served without growing the pool
    pub fn has_idle(&self) -> bool {
        self.available > 0
    }

    /// Whether the pool can still grow
    pub fn can_grow(&self) -> bool {
        self.size < self.max_size
    }
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "size={} available={} in_use={} (min={}, max={})",
            self.size, self.available, self.in_use, self.min_size, self.max_size
        )?;
        if self.torn_down {
            write!(f, " torn down")?;
        }
        Ok(())
    }
}
