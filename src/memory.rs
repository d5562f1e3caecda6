//! In-process backend for exercising a pool without a database

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::connection::{Connection, Connector, ResourceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    /// Killed on the server side; the client has not noticed yet.
    Invalidated,
    Closed,
}

#[derive(Default)]
struct ServerState {
    sessions: DashMap<u64, SessionState>,
    next_session: AtomicU64,
    opened: AtomicUsize,
    closed: AtomicUsize,
    refuse_connections: AtomicBool,
    fail_close: AtomicBool,
}

/// A fake database server that tracks every session opened against it.
///
/// Faults can be injected to drive the pool's recovery paths: sessions can
/// be invalidated server-side, new connections refused, and closes made to
/// fail (the session is still torn down).
///
/// # Examples
///
/// ```
/// use esox_connpool::{ConnectionPool, MemoryServer, PoolConfiguration};
///
/// let server = MemoryServer::new();
/// let pool = ConnectionPool::new(
///     server.connector("mem://orders"),
///     PoolConfiguration::new().with_min_size(2).with_max_size(4),
/// )
/// .unwrap();
///
/// assert_eq!(server.open_count(), 2);
/// pool.teardown();
/// assert_eq!(server.open_count(), 0);
/// ```
#[derive(Clone, Default)]
pub struct MemoryServer {
    state: Arc<ServerState>,
}

impl fmt::Debug for MemoryServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryServer")
            .field("open", &self.open_count())
            .field("opened_total", &self.opened_total())
            .field("closed_total", &self.closed_total())
            .finish()
    }
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector targeting this server.
    pub fn connector(&self, target: impl Into<String>) -> MemoryConnector {
        MemoryConnector {
            server: self.clone(),
            target: target.into(),
        }
    }

    /// Sessions not yet closed by a client, including invalidated ones.
    pub fn open_count(&self) -> usize {
        self.state
            .sessions
            .iter()
            .filter(|entry| *entry.value() != SessionState::Closed)
            .count()
    }

    pub fn opened_total(&self) -> usize {
        self.state.opened.load(Ordering::Relaxed)
    }

    pub fn closed_total(&self) -> usize {
        self.state.closed.load(Ordering::Relaxed)
    }

    /// Whether the session is open and healthy.
    pub fn is_live(&self, session: u64) -> bool {
        self.state
            .sessions
            .get(&session)
            .is_some_and(|state| *state == SessionState::Open)
    }

    /// Kill a session server-side. The client finds out on its next call.
    pub fn invalidate(&self, session: u64) {
        if let Some(mut state) = self.state.sessions.get_mut(&session)
            && *state == SessionState::Open
        {
            *state = SessionState::Invalidated;
        }
    }

    /// Kill every open session server-side.
    pub fn invalidate_all(&self) {
        for mut entry in self.state.sessions.iter_mut() {
            if *entry.value() == SessionState::Open {
                *entry.value_mut() = SessionState::Invalidated;
            }
        }
    }

    /// Make subsequent connection attempts fail.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::Relaxed);
    }

    /// Make subsequent closes report an error.
    pub fn set_fail_close(&self, fail: bool) {
        self.state.fail_close.store(fail, Ordering::Relaxed);
    }

    fn open_session(&self) -> Result<u64, ResourceError> {
        if self.state.refuse_connections.load(Ordering::Relaxed) {
            return Err("connection refused".into());
        }
        let session = self.state.next_session.fetch_add(1, Ordering::Relaxed);
        self.state.sessions.insert(session, SessionState::Open);
        self.state.opened.fetch_add(1, Ordering::Relaxed);
        Ok(session)
    }

    fn check(&self, session: u64) -> Result<(), ResourceError> {
        match self.state.sessions.get(&session).map(|state| *state) {
            Some(SessionState::Open) => Ok(()),
            Some(SessionState::Invalidated) => Err(format!("session {session} was terminated").into()),
            Some(SessionState::Closed) | None => Err(format!("session {session} is closed").into()),
        }
    }

    fn close_session(&self, session: u64) -> Result<(), ResourceError> {
        if let Some(mut state) = self.state.sessions.get_mut(&session)
            && *state != SessionState::Closed
        {
            *state = SessionState::Closed;
            self.state.closed.fetch_add(1, Ordering::Relaxed);
        }
        if self.state.fail_close.load(Ordering::Relaxed) {
            return Err(format!("error closing session {session}").into());
        }
        Ok(())
    }
}

/// Opens sessions against a [`MemoryServer`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    server: MemoryServer,
    target: String,
}

impl MemoryConnector {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn server(&self) -> &MemoryServer {
        &self.server
    }
}

impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    fn connect(&self) -> Result<MemoryConnection, ResourceError> {
        let session = self.server.open_session()?;
        Ok(MemoryConnection {
            server: self.server.clone(),
            session,
            executed: 0,
        })
    }
}

/// A client session on a [`MemoryServer`].
#[derive(Debug)]
pub struct MemoryConnection {
    server: MemoryServer,
    session: u64,
    executed: usize,
}

impl MemoryConnection {
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Run a statement. Returns the number of statements this session has
    /// executed so far.
    pub fn execute(&mut self, _statement: &str) -> Result<usize, ResourceError> {
        self.server.check(self.session)?;
        self.executed += 1;
        Ok(self.executed)
    }
}

impl Connection for MemoryConnection {
    fn probe(&mut self) -> Result<(), ResourceError> {
        self.server.check(self.session)
    }

    fn close(&mut self) -> Result<(), ResourceError> {
        self.server.close_session(self.session)
    }
}
