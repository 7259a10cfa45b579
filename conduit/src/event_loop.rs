//! Per-thread cooperative event loop.
//!
//! One [`EventLoop`] lives on each thread that wants one. Everything that
//! happens on the loop (fd readiness, timer expiry, event reports, queued
//! calls) becomes an item on a FIFO ready list, and items are dispatched one
//! at a time, each running to completion.
//!
//! # Pass structure
//!
//! ```text
//! wait ──► collect fds ──► collect timers ──► drain remote queue ──► dispatch
//!  ▲      (mio::Poll)        (deadline heap)     (MPSC ring)        (snapshot)
//!  └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The wait uses a zero timeout when work is already pending, otherwise the
//! time to the nearest timer deadline. A pass dispatches exactly the items
//! present when dispatch starts; anything a handler adds waits for the next
//! pass.
//!
//! # Threads
//!
//! [`EventLoop`] is `!Send`. The only way in from another thread is
//! [`LoopHandle::queue_function`], which goes through a bounded lock-free
//! ring and a poll waker.
//!
//! # Re-entry
//!
//! Synchronous IPC calls run nested passes with [`EventLoop::run_until`]
//! while they wait. No other re-entry happens: handlers never run
//! concurrently and never run inside one another except through that path.

mod event;
mod fd;
mod remote;
mod ring;
mod thread;
mod timer;

pub use event::{ByValue, EventId, Handler, HandlerRef, RefCounted};
pub use fd::{FdEvents, FdMonitor, FdMonitorRef};
pub use remote::{LoopHandle, QueueError};
pub use thread::{LoopThread, LoopThreadConfig};
pub use timer::{Timer, TimerError, TimerRef};

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use mio::{Events, Poll, Token};
use thiserror::Error;

use crate::config::ConfigError;
use crate::handle::HandleError;
use crate::trace::{debug, info, trace};

use event::EventRegistry;
use fd::FdTable;
use remote::Shared;
use timer::TimerSet;

/// Poll token reserved for the cross-thread waker. Fd monitor tokens are
/// handle values, which are always odd, so they never collide with it.
const WAKER_TOKEN: Token = Token(0);

/// Configuration for an [`EventLoop`].
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Diagnostic name, used in logs and as the loop thread's name.
    pub name: String,
    /// Capacity of the cross-thread function queue.
    pub remote_queue_capacity: usize,
    /// Readiness events collected per wait.
    pub events_capacity: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            name: "conduit-loop".to_owned(),
            remote_queue_capacity: 1024,
            events_capacity: 256,
        }
    }
}

impl LoopConfig {
    /// Config with the given name and default sizes.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Checks sizes and name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::new("name", "must not be empty"));
        }
        if self.remote_queue_capacity == 0 {
            return Err(ConfigError::new("remote_queue_capacity", "must be > 0"));
        }
        if self.events_capacity == 0 {
            return Err(ConfigError::new("events_capacity", "must be > 0"));
        }
        Ok(())
    }
}

/// Errors from loop setup and operation.
#[derive(Debug, Error)]
pub enum LoopError {
    /// The OS readiness multiplexer could not be created.
    #[error("failed to create poller: {0}")]
    Create(io::Error),
    /// Waiting for readiness failed.
    #[error("poll failed: {0}")]
    Poll(io::Error),
    /// An fd could not be added to or changed in the poller.
    #[error("failed to register fd {fd}: {source}")]
    Register { fd: RawFd, source: io::Error },
    /// A handle table ran out of slots.
    #[error(transparent)]
    Handle(#[from] HandleError),
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The loop thread could not be started.
    #[error("failed to spawn loop thread: {0}")]
    Spawn(io::Error),
    /// The loop thread panicked.
    #[error("loop thread '{0}' panicked")]
    Panicked(String),
}

/// Outcome of a non-blocking [`EventLoop::service_loop`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serviced {
    /// At least one item was dispatched.
    Dispatched,
    /// Nothing was ready.
    WouldBlock,
}

/// A unit of work waiting on the ready list.
pub(crate) enum ReadyItem {
    Event {
        handler: HandlerRef,
        payload: Rc<dyn Any>,
    },
    Fd {
        monitor: FdMonitorRef,
        events: FdEvents,
    },
    Timer {
        timer: TimerRef,
        arm: u64,
    },
    Call(Box<dyn FnOnce(&EventLoop)>),
}

struct LoopInner {
    name: String,
    poll: RefCell<Poll>,
    events: RefCell<Events>,
    shared: Arc<Shared>,
    ready: RefCell<VecDeque<ReadyItem>>,
    registry: RefCell<EventRegistry>,
    fds: RefCell<FdTable>,
    timers: RefCell<TimerSet>,
    exit: Cell<Option<i32>>,
    sync_waits: Cell<u32>,
}

/// A single-threaded event loop.
///
/// Cloning is cheap and yields another reference to the same loop, which is
/// how sessions and handlers keep hold of it.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl EventLoop {
    /// Creates a loop owned by the calling thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the poller or waker
    /// cannot be created.
    pub fn new(config: LoopConfig) -> Result<Self, LoopError> {
        config.validate()?;
        let poll = Poll::new().map_err(LoopError::Create)?;
        let shared = Arc::new(Shared::new(
            config.name.clone(),
            config.remote_queue_capacity,
            poll.registry(),
            WAKER_TOKEN,
        )?);

        debug!(name = %config.name, fd = poll.as_raw_fd(), "event loop created");

        Ok(Self {
            inner: Rc::new(LoopInner {
                events: RefCell::new(Events::with_capacity(config.events_capacity)),
                registry: RefCell::new(EventRegistry::new(&config.name)),
                fds: RefCell::new(FdTable::new(&config.name)),
                timers: RefCell::new(TimerSet::new(&config.name)),
                name: config.name,
                poll: RefCell::new(poll),
                shared,
                ready: RefCell::new(VecDeque::new()),
                exit: Cell::new(None),
                sync_waits: Cell::new(0),
            }),
        })
    }

    /// Diagnostic name of this loop.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Thread-safe handle for queueing work onto this loop.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle::new(Arc::clone(&self.inner.shared))
    }

    /// Whether `other` refers to this same loop.
    #[must_use]
    pub fn same_loop(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Queues `f` to run on a later pass of this loop.
    pub fn queue_function(&self, f: impl FnOnce(&EventLoop) + 'static) {
        self.push_ready(ReadyItem::Call(Box::new(f)));
    }

    /// Makes [`run`](Self::run) return `code` once the current pass ends.
    pub fn request_exit(&self, code: i32) {
        debug!(name = %self.inner.name, code, "exit requested");
        self.inner.exit.set(Some(code));
    }

    #[must_use]
    pub fn exit_requested(&self) -> bool {
        self.inner.exit.get().is_some()
    }

    /// Runs passes until [`request_exit`](Self::request_exit) is called,
    /// returning the exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting for readiness fails.
    pub fn run(&self) -> Result<i32, LoopError> {
        info!(name = %self.inner.name, "event loop running");
        loop {
            if let Some(code) = self.inner.exit.take() {
                info!(name = %self.inner.name, code, "event loop exiting");
                return Ok(code);
            }
            self.pass(true)?;
        }
    }

    /// Runs nested passes until `done` returns true or an exit is requested.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting for readiness fails.
    pub fn run_until(&self, mut done: impl FnMut() -> bool) -> Result<(), LoopError> {
        while !done() && !self.exit_requested() {
            self.pass(true)?;
        }
        Ok(())
    }

    /// One pass without blocking, for driving this loop from a foreign one
    /// that watches [`as_raw_fd`](AsRawFd::as_raw_fd).
    ///
    /// # Errors
    ///
    /// Returns an error if polling fails.
    pub fn service_loop(&self) -> Result<Serviced, LoopError> {
        if self.pass(false)? > 0 {
            Ok(Serviced::Dispatched)
        } else {
            Ok(Serviced::WouldBlock)
        }
    }

    /// Number of completed passes, as seen by watchdogs.
    #[must_use]
    pub fn service_count(&self) -> u64 {
        self.inner.shared.service_count.load(Ordering::Relaxed)
    }

    pub(crate) fn push_ready(&self, item: ReadyItem) {
        self.inner.ready.borrow_mut().push_back(item);
    }

    /// Marks the start of a synchronous wait. Returns `None` if one is
    /// already in progress on this loop.
    pub(crate) fn begin_sync_wait(&self) -> Option<SyncWaitGuard> {
        if self.inner.sync_waits.get() > 0 {
            return None;
        }
        self.inner.sync_waits.set(1);
        Some(SyncWaitGuard {
            event_loop: self.clone(),
        })
    }

    fn pass(&self, block: bool) -> Result<usize, LoopError> {
        let timeout = if !block || !self.inner.ready.borrow().is_empty() {
            Some(Duration::ZERO)
        } else {
            self.next_timer_timeout()
        };

        self.wait(timeout)?;
        self.collect_expired_timers();
        self.drain_remote();

        let batch = self.inner.ready.borrow().len();
        let mut dispatched = 0;
        for _ in 0..batch {
            // Nested passes may have consumed part of the batch.
            let Some(item) = self.inner.ready.borrow_mut().pop_front() else {
                break;
            };
            self.dispatch(item);
            dispatched += 1;
        }

        self.inner.shared.service_count.fetch_add(1, Ordering::Relaxed);
        Ok(dispatched)
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<(), LoopError> {
        let mut events = self.inner.events.borrow_mut();
        loop {
            match self.inner.poll.borrow_mut().poll(&mut events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(LoopError::Poll(e)),
            }
        }

        let ready: Vec<_> = events
            .iter()
            .filter(|event| event.token() != WAKER_TOKEN)
            .map(|event| (event.token(), FdEvents::from_mio(event)))
            .collect();
        drop(events);

        for (token, readiness) in ready {
            self.fd_ready(token, readiness);
        }
        Ok(())
    }

    fn drain_remote(&self) {
        // Bound the drain so a flood of producers can't starve this pass.
        let limit = self.inner.shared.queue.capacity();
        for _ in 0..limit {
            // SAFETY: the loop's owning thread is the ring's only consumer;
            // EventLoop is !Send and owns the consumer side of `shared`.
            let Some(f) = (unsafe { self.inner.shared.queue.pop() }) else {
                break;
            };
            trace!(name = %self.inner.name, "remote call queued");
            self.push_ready(ReadyItem::Call(f));
        }
    }

    fn dispatch(&self, item: ReadyItem) {
        match item {
            ReadyItem::Event { handler, payload } => self.dispatch_event(handler, &payload),
            ReadyItem::Fd { monitor, events } => self.dispatch_fd(monitor, events),
            ReadyItem::Timer { timer, arm } => self.fire_timer(timer, arm),
            ReadyItem::Call(f) => f(self),
        }
    }
}

impl AsRawFd for EventLoop {
    /// The poller's fd, readable whenever the loop has something to service.
    fn as_raw_fd(&self) -> RawFd {
        self.inner.poll.borrow().as_raw_fd()
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.inner.name)
            .field("ready", &self.inner.ready.borrow().len())
            .finish_non_exhaustive()
    }
}

/// Ends a synchronous wait when dropped.
pub(crate) struct SyncWaitGuard {
    event_loop: EventLoop,
}

impl Drop for SyncWaitGuard {
    fn drop(&mut self) {
        self.event_loop.inner.sync_waits.set(0);
    }
}
