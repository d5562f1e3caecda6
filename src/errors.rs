//! Error types for the connection pool

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::connection::ResourceError;

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    /// A precondition on an argument was violated.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A handle or pool was used in the wrong lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The underlying resource failed to open or to run a delegated operation.
    #[error("Resource error: {0}")]
    Resource(#[source] Arc<dyn StdError + Send + Sync>),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl PoolError {
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        PoolError::InvalidArgument(msg.into())
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        PoolError::InvalidState(msg.into())
    }

    /// Whether this is an [`PoolError::InvalidState`] error.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, PoolError::InvalidState(_))
    }

    /// Whether this is an [`PoolError::InvalidArgument`] error.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, PoolError::InvalidArgument(_))
    }
}

impl From<ResourceError> for PoolError {
    fn from(err: ResourceError) -> Self {
        PoolError::Resource(Arc::from(err))
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

