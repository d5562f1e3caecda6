//! Pool configuration options

use std::time::Duration;

use crate::errors::{PoolError, PoolResult};

/// Default number of connections opened when the pool is created.
pub const DEFAULT_MIN_SIZE: usize = 10;
/// Default upper bound on the number of pooled connections.
pub const DEFAULT_MAX_SIZE: usize = 200;
/// Default number of connections opened per growth event.
pub const DEFAULT_GROWTH_INCREMENT: usize = 10;

/// Configuration for connection pool sizing and idle handling
///
/// # Examples
///
/// ```
/// use esox_connpool::PoolConfiguration;
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new()
///     .with_min_size(4)
///     .with_max_size(9)
///     .with_growth_increment(3)
///     .with_idle_timeout(Duration::from_secs(30));
///
/// assert_eq!(config.max_size, 9);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfiguration {
    /// Number of connections opened up front; the pool never shrinks below it
    pub min_size: usize,

    /// Maximum number of connections the pool may hold
    pub max_size: usize,

    /// Number of connections opened when every pooled connection is in use
    pub growth_increment: usize,

    /// How long a checked-out connection may go unused before it is reclaimed.
    /// `Duration::ZERO` disables the idle sweep.
    #[cfg_attr(feature = "serde", serde(with = "duration_millis"))]
    pub idle_timeout: Duration,

    /// How long [`acquire_async`](crate::ConnectionPool::acquire_async) keeps retrying
    #[cfg_attr(feature = "serde", serde(with = "duration_millis"))]
    pub acquire_timeout: Duration,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_MIN_SIZE,
            max_size: DEFAULT_MAX_SIZE,
            growth_increment: DEFAULT_GROWTH_INCREMENT,
            idle_timeout: Duration::ZERO,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfiguration {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum (and initial) pool size
    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    /// Set the maximum pool size
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_connpool::PoolConfiguration;
    ///
    /// let config = PoolConfiguration::new().with_max_size(50);
    ///
    /// assert_eq!(config.max_size, 50);
    /// ```
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set the number of connections opened per growth event
    pub fn with_growth_increment(mut self, increment: usize) -> Self {
        self.growth_increment = increment;
        self
    }

    /// Set the idle timeout for checked-out connections
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set how long the async acquire keeps retrying
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Whether the idle sweep is enabled
    pub fn sweeps_idle(&self) -> bool {
        !self.idle_timeout.is_zero()
    }

    /// Check the sizing invariants.
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_connpool::PoolConfiguration;
    ///
    /// let config = PoolConfiguration::new().with_min_size(5).with_max_size(2);
    /// assert!(config.validate().unwrap_err().is_invalid_argument());
    /// ```
    pub fn validate(&self) -> PoolResult<()> {
        if self.min_size < 1 {
            return Err(PoolError::invalid_argument("pool size must be positive"));
        }
        if self.min_size > self.max_size {
            return Err(PoolError::invalid_argument(format!(
                "minimum size ({}) cannot be greater than maximum size ({})",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

#[cfg(feature = "serde")]
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
