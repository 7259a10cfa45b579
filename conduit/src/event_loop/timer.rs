//! Loop timers.
//!
//! Armed timers sit in a min-heap keyed by absolute deadline. Stopping,
//! restarting or deleting a timer does not touch the heap; each arming gets
//! a fresh sequence number and stale heap entries are skipped when popped.
//! Once stale entries outnumber live timers the heap is rebuilt, so a long
//! timer restarted often does not pile up entries until its deadline.
//!
//! Repeating timers are re-armed from their previous deadline rather than
//! from the time the handler ran, so they do not drift.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

use super::{EventLoop, LoopError, ReadyItem};
use crate::handle::{HandleMap, SafeRef};
use crate::trace::trace;

/// Errors from timer operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimerError {
    /// The operation is not allowed while the timer runs.
    #[error("timer '{0}' is running")]
    Busy(String),
    /// The timer is not running.
    #[error("timer '{0}' is not running")]
    NotRunning(String),
    /// Start was called before a handler was set.
    #[error("timer '{0}' has no handler")]
    NoHandler(String),
}

type TimerCallback = Rc<dyn Fn(&EventLoop, TimerRef)>;

/// A loop timer. Only reachable through a [`TimerRef`].
pub struct Timer {
    name: String,
    interval: Duration,
    /// 0 repeats forever.
    repeat: u32,
    /// Expiries left in the current run when `repeat != 0`.
    remaining: u32,
    handler: Option<TimerCallback>,
    deadline: Option<Instant>,
    arm: u64,
    expiries: u64,
}

/// Reference to a timer.
pub type TimerRef = SafeRef<Timer>;

pub(crate) struct TimerSet {
    timers: HandleMap<Timer>,
    heap: BinaryHeap<Reverse<(Instant, u64, u64)>>,
    next_arm: u64,
}

impl TimerSet {
    pub(crate) fn new(loop_name: &str) -> Self {
        Self {
            timers: HandleMap::new(format!("{loop_name}.timers"), 16),
            heap: BinaryHeap::new(),
            next_arm: 1,
        }
    }

    fn get(&mut self, timer: TimerRef) -> &mut Timer {
        self.timers
            .lookup_mut(timer)
            .unwrap_or_else(|| panic!("unknown timer {timer}"))
    }

    fn arm(&mut self, timer: TimerRef, deadline: Instant) {
        let arm = self.next_arm;
        self.next_arm += 1;
        let t = self.get(timer);
        t.deadline = Some(deadline);
        t.arm = arm;
        self.heap.push(Reverse((deadline, arm, timer.into_raw())));
        if self.heap.len() > COMPACT_SLACK + 2 * self.timers.len() {
            self.compact();
        }
    }

    /// Drops heap entries whose timer was deleted, stopped or re-armed.
    fn compact(&mut self) {
        let timers = &self.timers;
        self.heap.retain(|Reverse((_, arm, raw))| {
            TimerRef::from_raw(*raw)
                .and_then(|t| timers.lookup(t))
                .is_some_and(|t| t.arm == *arm)
        });
    }
}

/// Stale heap entries tolerated before compacting.
const COMPACT_SLACK: usize = 64;

impl EventLoop {
    /// Creates a stopped one-shot timer with a zero interval and no handler.
    ///
    /// # Errors
    ///
    /// Returns an error if the timer table is exhausted.
    pub fn create_timer(&self, name: impl Into<String>) -> Result<TimerRef, LoopError> {
        let timer = self.inner.timers.borrow_mut().timers.create_ref(Timer {
            name: name.into(),
            interval: Duration::ZERO,
            repeat: 1,
            remaining: 0,
            handler: None,
            deadline: None,
            arm: 0,
            expiries: 0,
        })?;
        Ok(timer)
    }

    /// Deletes a timer, stopping it first if needed.
    ///
    /// # Panics
    ///
    /// Panics if `timer` is not live on this loop.
    pub fn delete_timer(&self, timer: TimerRef) {
        if self.inner.timers.borrow_mut().timers.delete_ref(timer).is_none() {
            panic!("unknown timer {timer}");
        }
    }

    /// Sets the interval. On a running timer the deadline moves as if the
    /// timer had been started with the new interval.
    ///
    /// # Panics
    ///
    /// Panics if `timer` is not live on this loop.
    pub fn set_timer_interval(&self, timer: TimerRef, interval: Duration) {
        let mut set = self.inner.timers.borrow_mut();
        let t = set.get(timer);
        let old = t.interval;
        t.interval = interval;
        if let Some(deadline) = t.deadline {
            set.arm(timer, deadline - old + interval);
        }
    }

    /// Sets the number of expiries per start. 0 means forever.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::Busy`] while the timer runs.
    ///
    /// # Panics
    ///
    /// Panics if `timer` is not live on this loop.
    pub fn set_timer_repeat(&self, timer: TimerRef, repeat: u32) -> Result<(), TimerError> {
        let mut set = self.inner.timers.borrow_mut();
        let t = set.get(timer);
        if t.deadline.is_some() {
            return Err(TimerError::Busy(t.name.clone()));
        }
        t.repeat = repeat;
        Ok(())
    }

    /// Sets the expiry handler.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::Busy`] while the timer runs.
    ///
    /// # Panics
    ///
    /// Panics if `timer` is not live on this loop.
    pub fn set_timer_handler(
        &self,
        timer: TimerRef,
        handler: impl Fn(&EventLoop, TimerRef) + 'static,
    ) -> Result<(), TimerError> {
        let mut set = self.inner.timers.borrow_mut();
        let t = set.get(timer);
        if t.deadline.is_some() {
            return Err(TimerError::Busy(t.name.clone()));
        }
        t.handler = Some(Rc::new(handler));
        Ok(())
    }

    /// Starts the timer. Its expiry count is reset.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::Busy`] if already running, or
    /// [`TimerError::NoHandler`] if no handler was set.
    ///
    /// # Panics
    ///
    /// Panics if `timer` is not live on this loop.
    pub fn start_timer(&self, timer: TimerRef) -> Result<(), TimerError> {
        let mut set = self.inner.timers.borrow_mut();
        let t = set.get(timer);
        if t.deadline.is_some() {
            return Err(TimerError::Busy(t.name.clone()));
        }
        if t.handler.is_none() {
            return Err(TimerError::NoHandler(t.name.clone()));
        }
        t.remaining = t.repeat;
        t.expiries = 0;
        let deadline = Instant::now() + t.interval;
        trace!(timer = %t.name, interval_us = t.interval.as_micros() as u64, "timer started");
        set.arm(timer, deadline);
        Ok(())
    }

    /// Stops the timer. An expiry already queued for dispatch is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::NotRunning`] if the timer is stopped.
    ///
    /// # Panics
    ///
    /// Panics if `timer` is not live on this loop.
    pub fn stop_timer(&self, timer: TimerRef) -> Result<(), TimerError> {
        let mut set = self.inner.timers.borrow_mut();
        let t = set.get(timer);
        if t.deadline.take().is_none() {
            return Err(TimerError::NotRunning(t.name.clone()));
        }
        t.arm = 0;
        Ok(())
    }

    /// Stops the timer if it runs, then starts it afresh.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::NoHandler`] if no handler was set.
    ///
    /// # Panics
    ///
    /// Panics if `timer` is not live on this loop.
    pub fn restart_timer(&self, timer: TimerRef) -> Result<(), TimerError> {
        if self.is_timer_running(timer) {
            self.stop_timer(timer)?;
        }
        self.start_timer(timer)
    }

    /// # Panics
    ///
    /// Panics if `timer` is not live on this loop.
    #[must_use]
    pub fn is_timer_running(&self, timer: TimerRef) -> bool {
        self.inner.timers.borrow_mut().get(timer).deadline.is_some()
    }

    /// Expiries since the timer was last started.
    ///
    /// # Panics
    ///
    /// Panics if `timer` is not live on this loop.
    #[must_use]
    pub fn timer_expiry_count(&self, timer: TimerRef) -> u64 {
        self.inner.timers.borrow_mut().get(timer).expiries
    }

    /// Time until the next expiry; zero when stopped or already due.
    ///
    /// # Panics
    ///
    /// Panics if `timer` is not live on this loop.
    #[must_use]
    pub fn timer_remaining(&self, timer: TimerRef) -> Duration {
        let deadline = self.inner.timers.borrow_mut().get(timer).deadline;
        match deadline {
            Some(d) => {
                let now = Instant::now();
                if d > now { d.duration_since(now) } else { Duration::ZERO }
            }
            None => Duration::ZERO,
        }
    }

    pub(crate) fn next_timer_timeout(&self) -> Option<Duration> {
        let set = self.inner.timers.borrow();
        let Reverse((deadline, _, _)) = set.heap.peek()?;
        let now = Instant::now();
        Some(if *deadline > now {
            deadline.duration_since(now)
        } else {
            Duration::ZERO
        })
    }

    pub(crate) fn collect_expired_timers(&self) {
        let now = Instant::now();
        let mut due = Vec::new();
        {
            let mut set = self.inner.timers.borrow_mut();
            while let Some(Reverse((deadline, arm, raw))) = set.heap.peek().copied() {
                if deadline > now {
                    break;
                }
                set.heap.pop();
                let Some(timer) = TimerRef::from_raw(raw) else {
                    continue;
                };
                if set.timers.lookup(timer).is_some_and(|t| t.arm == arm) {
                    due.push(ReadyItem::Timer { timer, arm });
                }
            }
        }
        for item in due {
            self.push_ready(item);
        }
    }

    pub(crate) fn fire_timer(&self, timer: TimerRef, arm: u64) {
        let handler = {
            let mut set = self.inner.timers.borrow_mut();
            let Some(t) = set.timers.lookup_mut(timer) else {
                return;
            };
            let Some(deadline) = t.deadline.filter(|_| t.arm == arm) else {
                return;
            };
            t.expiries += 1;
            let again = match t.repeat {
                0 => true,
                _ => {
                    t.remaining = t.remaining.saturating_sub(1);
                    t.remaining > 0
                }
            };
            let handler = t.handler.clone();
            let next = deadline + t.interval;
            trace!(timer = %t.name, expiries = t.expiries, again, "timer expired");
            if again {
                set.arm(timer, next);
            } else {
                t.deadline = None;
                t.arm = 0;
            }
            handler
        };
        if let Some(handler) = handler {
            handler(self, timer);
        }
    }
}
