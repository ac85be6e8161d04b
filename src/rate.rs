//! Per-client admission rate limiting.
//!
//! [`PerClientLimiter`] shapes events to a configured rate for each client
//! ID independently: the first caller for a quiet client proceeds
//! immediately, later callers queue in FIFO order and are released one per
//! interval, and a bounded queue rejects the excess instead of letting
//! waiters pile up. A client's bookkeeping is dropped as soon as its queue
//! drains, so idle clients cost nothing.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error as ThisError;
use tokio::sync::oneshot;

/// Errors surfaced by limiters.
#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum Error {
    /// The per-client queue is full; the event was not enqueued.
    #[error("too many concurrent events")]
    TooManyEvents,
}

/// A per-client rate limiter, where clients are identified by an opaque ID.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Resolves when the operation should be allowed to continue for the
    /// given client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TooManyEvents`] without enqueueing when too many
    /// callers are already waiting for this client.
    async fn wait(&self, client_id: &str) -> Result<(), Error>;
}

/// A limiter that admits everything immediately.
pub struct NoopLimiter;

#[async_trait]
impl Limiter for NoopLimiter {
    async fn wait(&self, _client_id: &str) -> Result<(), Error> {
        Ok(())
    }
}

/// A [`Limiter`] allowing `rate` events per second per client, no bursting,
/// with at most `max_waiters` queued callers per client.
pub struct PerClientLimiter {
    interval: Duration,
    max_waiters: usize,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

#[derive(Default)]
struct Entry {
    waiters: usize,
    // The release channel the next enqueued caller will wait on.
    next_release: Option<oneshot::Receiver<()>>,
}

impl PerClientLimiter {
    /// Creates a limiter admitting `rate` events per second per client.
    ///
    /// # Panics
    ///
    /// Panics if `rate` is not a positive, finite number.
    #[must_use]
    pub fn new(rate: f64, max_waiters: usize) -> Self {
        assert!(rate.is_finite() && rate > 0.0, "rate must be positive");
        Self {
            interval: Duration::from_secs_f64(1.0 / rate),
            max_waiters,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl Limiter for PerClientLimiter {
    async fn wait(&self, client_id: &str) -> Result<(), Error> {
        // Take the current release channel (queueing behind whoever holds
        // it) and leave a fresh one for the caller after us.
        let (wait_for, release) = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = entries.entry(client_id.to_string()).or_default();
            let wait_for = if entry.next_release.is_some() {
                if entry.waiters == self.max_waiters {
                    return Err(Error::TooManyEvents);
                }
                entry.waiters += 1;
                entry.next_release.take()
            } else {
                None
            };
            let (release, next_release) = oneshot::channel();
            entry.next_release = Some(next_release);
            (wait_for, release)
        };

        if let Some(wait_for) = wait_for {
            // The sender is never dropped before firing, but a send into a
            // dropped queue slot is harmless either way.
            let _ = wait_for.await;
        }

        // Admitted. Release the next caller (if any) after one interval,
        // or garbage-collect the client's entry if the queue is empty.
        let entries = Arc::clone(&self.entries);
        let client_id = client_id.to_string();
        let interval = self.interval;
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let mut entries = entries.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = release.send(());
            let drained = match entries.get_mut(&client_id) {
                Some(entry) if entry.waiters == 0 => true,
                Some(entry) => {
                    entry.waiters -= 1;
                    false
                }
                None => false,
            };
            if drained {
                entries.remove(&client_id);
            }
        });
        Ok(())
    }
}
