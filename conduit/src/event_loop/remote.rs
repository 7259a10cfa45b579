//! Cross-thread entry point into a loop.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use mio::{Registry, Token, Waker};
use thiserror::Error;

use super::ring::Ring;
use super::{EventLoop, LoopError};
use crate::trace::warn;

pub(crate) type RemoteFn = Box<dyn FnOnce(&EventLoop) + Send>;

/// Errors from [`LoopHandle::queue_function`].
#[derive(Debug, Error)]
pub enum QueueError {
    /// The loop's remote queue is at capacity.
    #[error("remote queue of loop '{name}' is full ({capacity} items)")]
    Full { name: String, capacity: usize },
    /// The function was queued but the loop could not be woken.
    #[error("failed to wake loop: {0}")]
    Wake(io::Error),
}

/// State shared between a loop and its handles.
pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) queue: Ring<RemoteFn>,
    pub(crate) service_count: AtomicU64,
    waker: Waker,
}

impl Shared {
    pub(crate) fn new(
        name: String,
        capacity: usize,
        registry: &Registry,
        token: Token,
    ) -> Result<Self, LoopError> {
        Ok(Self {
            name,
            queue: Ring::with_capacity(capacity),
            service_count: AtomicU64::new(0),
            waker: Waker::new(registry, token).map_err(LoopError::Create)?,
        })
    }
}

/// Thread-safe handle to an [`EventLoop`].
///
/// Handles outlive their loop harmlessly: functions queued after the loop
/// is gone are dropped without running.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    pub(crate) const fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Name of the target loop.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queues `f` to run on the loop's thread.
    ///
    /// Functions queued from the same thread run in the order queued.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Full`] if the loop is not keeping up.
    pub fn queue_function<F>(&self, f: F) -> Result<(), QueueError>
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        if self.shared.queue.push(Box::new(f)).is_err() {
            warn!(name = %self.shared.name, "remote queue full");
            return Err(QueueError::Full {
                name: self.shared.name.clone(),
                capacity: self.shared.queue.capacity(),
            });
        }
        self.shared.waker.wake().map_err(QueueError::Wake)
    }

    /// Asks the loop to exit with `code`.
    ///
    /// # Errors
    ///
    /// Same as [`queue_function`](Self::queue_function).
    pub fn request_exit(&self, code: i32) -> Result<(), QueueError> {
        self.queue_function(move |l| l.request_exit(code))
    }

    /// Passes completed by the loop so far. A watchdog that sees this stop
    /// advancing knows the loop is stuck.
    #[must_use]
    pub fn service_count(&self) -> u64 {
        self.shared.service_count.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("name", &self.shared.name)
            .finish()
    }
}
