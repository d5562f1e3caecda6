//! # Esox ConnPool
//!
//! Thread-safe connection pool for Rust built around single-use checkout
//! handles.
//!
//! ## Features
//!
//! - Min/max sizing with growth in configurable increments
//! - Surplus connections closed on release, never below the minimum
//! - Liveness probe on checkout, stale connections replaced transparently
//! - Single-use handles: a released handle can never touch its connection again
//! - Idle-timeout sweep reclaiming connections held without activity
//! - Non-blocking `acquire`, plus an async variant with timeout
//! - In-memory backend for tests and demos
//!
//! ## Quick Start
//!
//! ```rust
//! use esox_connpool::{ConnectionPool, MemoryServer, PoolConfiguration};
//!
//! let server = MemoryServer::new();
//! let config = PoolConfiguration::new()
//!     .with_min_size(2)
//!     .with_max_size(8)
//!     .with_growth_increment(2);
//! let pool = ConnectionPool::new(server.connector("mem://app"), config).unwrap();
//!
//! if let Some(conn) = pool.acquire().unwrap() {
//!     conn.with_connection(|c| c.execute("select 1")).unwrap();
//!     pool.release(&conn).unwrap();
//! }
//! ```

mod config;
mod connection;
mod errors;
mod handle;
mod memory;
mod pool;
mod status;
mod sweeper;

pub use config::{
    DEFAULT_GROWTH_INCREMENT, DEFAULT_MAX_SIZE, DEFAULT_MIN_SIZE, PoolConfiguration,
};
pub use connection::{Connection, Connector, ResourceError};
pub use errors::{PoolError, PoolResult};
pub use handle::{Handle, Phase};
pub use memory::{MemoryConnection, MemoryConnector, MemoryServer};
pub use pool::{ConnectionPool, PooledConnection};
pub use status::PoolStatus;
