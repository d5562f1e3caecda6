//! Background sweep that reclaims connections held idle past the timeout

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::errors::{PoolError, PoolResult};

/// Shortest interval between sweeps.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Sweep cadence for an idle timeout: a fifth of the timeout, so a handle is
/// reclaimed at most 20% late.
pub(crate) fn sweep_interval(idle_timeout: Duration) -> Duration {
    (idle_timeout / 5).max(MIN_INTERVAL)
}

/// Owns the sweep thread.
///
/// Dropping the sender is the cancellation signal: it wakes the thread out
/// of its wait immediately, and `stop` joins it before returning.
pub(crate) struct Sweeper {
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    interval: Duration,
}

impl Sweeper {
    /// Spawn a thread that calls `sweep` every `interval` until stopped.
    /// `sweep` returns how many handles it reclaimed.
    pub(crate) fn start<F>(interval: Duration, sweep: F) -> PoolResult<Self>
    where
        F: Fn() -> usize + Send + 'static,
    {
        let (shutdown, signal) = channel::bounded::<()>(0);

        let thread = thread::Builder::new()
            .name("esox-connpool-sweeper".to_string())
            .spawn(move || {
                loop {
                    match signal.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let reclaimed = sweep();
                            if reclaimed > 0 {
                                debug!(reclaimed, "idle sweep reclaimed connections");
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(|err| PoolError::Resource(Arc::new(err)))?;

        debug!(?interval, "idle sweeper started");
        Ok(Self {
            shutdown: Some(shutdown),
            thread: Some(thread),
            interval,
        })
    }

    pub(crate) fn interval(&self) -> Duration {
        self.interval
    }

    /// Signal the thread and wait for it to exit. Idempotent.
    pub(crate) fn stop(&mut self) {
        drop(self.shutdown.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("idle sweeper panicked");
            }
            debug!("idle sweeper stopped");
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
