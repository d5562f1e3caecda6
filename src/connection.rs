//! Collaborator traits for the physical resource behind a pooled handle

use std::error::Error;

/// Error reported by a driver when opening, probing or closing a connection.
pub type ResourceError = Box<dyn Error + Send + Sync>;

/// A physical connection owned by the pool.
///
/// Only the two calls the pool itself needs are part of the contract;
/// everything else a driver offers is reached through
/// [`Handle::with_connection`](crate::Handle::with_connection).
pub trait Connection: Send + 'static {
    /// Cheap liveness check. Must fail if the connection was invalidated
    /// on the server side.
    fn probe(&mut self) -> Result<(), ResourceError>;

    /// Close the physical connection.
    fn close(&mut self) -> Result<(), ResourceError>;
}

/// Opens new physical connections against a stored target.
///
/// # Examples
///
/// ```
/// use esox_connpool::{Connection, Connector, ResourceError};
///
/// struct Loopback;
///
/// impl Connection for Loopback {
///     fn probe(&mut self) -> Result<(), ResourceError> { Ok(()) }
///     fn close(&mut self) -> Result<(), ResourceError> { Ok(()) }
/// }
///
/// struct LoopbackConnector { url: String }
///
/// impl Connector for LoopbackConnector {
///     type Connection = Loopback;
///
///     fn connect(&self) -> Result<Loopback, ResourceError> {
///         if self.url.is_empty() {
///             return Err("empty url".into());
///         }
///         Ok(Loopback)
///     }
/// }
/// ```
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    /// Open a new physical connection.
    fn connect(&self) -> Result<Self::Connection, ResourceError>;
}
