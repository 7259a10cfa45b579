//! Dedicated threads owning an event loop.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use core_affinity::CoreId;

use super::{EventLoop, LoopConfig, LoopError, LoopHandle, QueueError};
use crate::trace::{info, warn};

/// Configuration for [`LoopThread::spawn`].
#[derive(Debug, Clone, Default)]
pub struct LoopThreadConfig {
    /// Config of the loop the thread creates. Its name is also the thread
    /// name.
    pub loop_config: LoopConfig,
    /// Core to pin the thread to, if any.
    pub core: Option<usize>,
}

impl LoopThreadConfig {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            loop_config: LoopConfig::named(name),
            core: None,
        }
    }
}

/// An OS thread running an [`EventLoop`] until asked to exit.
pub struct LoopThread {
    handle: LoopHandle,
    join: JoinHandle<Result<i32, LoopError>>,
}

impl LoopThread {
    /// Spawns a named thread, creates its loop, runs `init` on it and then
    /// runs the loop. Whatever `init` returns (services, sessions) lives
    /// until the loop exits.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid, the thread cannot be
    /// spawned or the loop cannot be created.
    pub fn spawn<F, S>(config: LoopThreadConfig, init: F) -> Result<Self, LoopError>
    where
        F: FnOnce(&EventLoop) -> S + Send + 'static,
    {
        config.loop_config.validate()?;
        let name = config.loop_config.name.clone();
        let (tx, rx) = mpsc::sync_channel(1);

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                if let Some(core) = config.core {
                    if !core_affinity::set_for_current(CoreId { id: core }) {
                        warn!(core, "failed to pin loop thread");
                    }
                }
                let event_loop = match EventLoop::new(config.loop_config) {
                    Ok(l) => l,
                    Err(e) => {
                        // The spawner reports the error; the thread just ends.
                        let _ = tx.send(Err(e));
                        return Ok(0);
                    }
                };
                if tx.send(Ok(event_loop.handle())).is_err() {
                    return Ok(0);
                }
                let state = init(&event_loop);
                let code = event_loop.run();
                drop(state);
                code
            })
            .map_err(LoopError::Spawn)?;

        let handle = match rx.recv() {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                let _ = join.join();
                return Err(e);
            }
            Err(_) => {
                let _ = join.join();
                return Err(LoopError::Panicked(name));
            }
        };
        info!(name = %name, "loop thread started");
        Ok(Self { handle, join })
    }

    /// Handle for queueing work onto the thread's loop.
    #[must_use]
    pub const fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Asks the loop to exit with `code` and waits for the thread.
    ///
    /// # Errors
    ///
    /// Returns the loop's error, or [`LoopError::Panicked`] if the thread
    /// panicked.
    pub fn stop(self, code: i32) -> Result<i32, LoopError> {
        while let Err(e) = self.handle.request_exit(code) {
            match e {
                QueueError::Full { .. } => thread::yield_now(),
                // Queued, just not woken; the next wakeup will see it.
                QueueError::Wake(e) => {
                    warn!(name = %self.handle.name(), error = %e, "failed to wake loop");
                    break;
                }
            }
        }
        self.join()
    }

    /// Waits for the thread to finish on its own.
    ///
    /// # Errors
    ///
    /// Returns the loop's error, or [`LoopError::Panicked`] if the thread
    /// panicked.
    pub fn join(self) -> Result<i32, LoopError> {
        let name = self.handle.name().to_owned();
        self.join
            .join()
            .map_err(|_| LoopError::Panicked(name))?
    }
}
