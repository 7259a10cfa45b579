//! File descriptor monitors.
//!
//! Readiness is edge-triggered: a handler is told once per transition and
//! must drain the fd (read or write until `WouldBlock`) before it can expect
//! another notification.

use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

use bitflags::bitflags;
use mio::unix::SourceFd;
use mio::{Interest, Token};

use super::{EventLoop, LoopError, ReadyItem};
use crate::handle::{HandleMap, SafeRef};
use crate::trace::{debug, trace};

bitflags! {
    /// Readiness conditions on a monitored fd.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FdEvents: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        /// Peer hung up. Always reported, whatever the interest set.
        const HANGUP = 1 << 2;
        /// Error pending on the fd. Always reported.
        const ERROR = 1 << 3;
    }
}

impl FdEvents {
    pub(crate) fn from_mio(event: &mio::event::Event) -> Self {
        let mut events = Self::empty();
        if event.is_readable() {
            events |= Self::READABLE;
        }
        if event.is_writable() {
            events |= Self::WRITABLE;
        }
        if event.is_read_closed() || event.is_write_closed() {
            events |= Self::HANGUP;
        }
        if event.is_error() {
            events |= Self::ERROR;
        }
        events
    }

    fn interest(self) -> Option<Interest> {
        match (self.contains(Self::READABLE), self.contains(Self::WRITABLE)) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

type FdCallback = Rc<dyn Fn(&EventLoop, RawFd, FdEvents)>;

/// A registered fd monitor. Only reachable through an [`FdMonitorRef`].
pub struct FdMonitor {
    fd: RawFd,
    interest: FdEvents,
    registered: bool,
    callback: FdCallback,
}

/// Reference to a registered fd monitor.
pub type FdMonitorRef = SafeRef<FdMonitor>;

pub(crate) struct FdTable {
    monitors: HandleMap<FdMonitor>,
}

impl FdTable {
    pub(crate) fn new(loop_name: &str) -> Self {
        Self {
            monitors: HandleMap::new(format!("{loop_name}.fds"), 16),
        }
    }
}

fn token_of(monitor: FdMonitorRef) -> Token {
    // Handles are 64-bit and so is usize on every supported target.
    Token(monitor.into_raw() as usize)
}

impl EventLoop {
    /// Starts watching `fd` for the conditions in `interest`.
    ///
    /// The caller keeps ownership of `fd` and must remove the monitor before
    /// closing it.
    ///
    /// # Errors
    ///
    /// Returns an error if the fd cannot be registered with the poller.
    pub fn add_fd_monitor(
        &self,
        fd: RawFd,
        interest: FdEvents,
        handler: impl Fn(&EventLoop, RawFd, FdEvents) + 'static,
    ) -> Result<FdMonitorRef, LoopError> {
        let monitor = self.inner.fds.borrow_mut().monitors.create_ref(FdMonitor {
            fd,
            interest,
            registered: false,
            callback: Rc::new(handler),
        })?;

        if let Err(source) = self.apply_interest(monitor, interest) {
            self.inner.fds.borrow_mut().monitors.delete_ref(monitor);
            return Err(LoopError::Register { fd, source });
        }
        debug!(name = %self.inner.name, fd, ?interest, "fd monitor added");
        Ok(monitor)
    }

    /// Stops watching and forgets the monitor. Readiness already queued for
    /// it is discarded.
    ///
    /// # Panics
    ///
    /// Panics if `monitor` is not live on this loop.
    pub fn remove_fd_monitor(&self, monitor: FdMonitorRef) {
        let Some(removed) = self.inner.fds.borrow_mut().monitors.delete_ref(monitor) else {
            panic!("unknown fd monitor {monitor}");
        };
        if removed.registered {
            let poll = self.inner.poll.borrow();
            if let Err(e) = poll.registry().deregister(&mut SourceFd(&removed.fd)) {
                // Already closed fds drop out of epoll on their own.
                debug!(fd = removed.fd, error = %e, "deregister failed");
            }
        }
        debug!(name = %self.inner.name, fd = removed.fd, "fd monitor removed");
    }

    /// Adds conditions to a monitor's interest set.
    ///
    /// # Errors
    ///
    /// Returns an error if the poller rejects the change.
    ///
    /// # Panics
    ///
    /// Panics if `monitor` is not live on this loop.
    pub fn enable_fd_interest(
        &self,
        monitor: FdMonitorRef,
        events: FdEvents,
    ) -> Result<(), LoopError> {
        let interest = self.fd_interest(monitor) | events;
        self.change_interest(monitor, interest)
    }

    /// Removes conditions from a monitor's interest set.
    ///
    /// # Errors
    ///
    /// Returns an error if the poller rejects the change.
    ///
    /// # Panics
    ///
    /// Panics if `monitor` is not live on this loop.
    pub fn disable_fd_interest(
        &self,
        monitor: FdMonitorRef,
        events: FdEvents,
    ) -> Result<(), LoopError> {
        let interest = self.fd_interest(monitor) - events;
        self.change_interest(monitor, interest)
    }

    /// Current interest set of a monitor.
    ///
    /// # Panics
    ///
    /// Panics if `monitor` is not live on this loop.
    #[must_use]
    pub fn fd_interest(&self, monitor: FdMonitorRef) -> FdEvents {
        self.inner
            .fds
            .borrow()
            .monitors
            .lookup(monitor)
            .map(|m| m.interest)
            .unwrap_or_else(|| panic!("unknown fd monitor {monitor}"))
    }

    fn change_interest(&self, monitor: FdMonitorRef, interest: FdEvents) -> Result<(), LoopError> {
        let fd = {
            let mut fds = self.inner.fds.borrow_mut();
            let m = fds
                .monitors
                .lookup_mut(monitor)
                .unwrap_or_else(|| panic!("unknown fd monitor {monitor}"));
            if m.interest == interest {
                return Ok(());
            }
            m.interest = interest;
            m.fd
        };
        trace!(fd, ?interest, "fd interest changed");
        self.apply_interest(monitor, interest)
            .map_err(|source| LoopError::Register { fd, source })
    }

    fn apply_interest(&self, monitor: FdMonitorRef, interest: FdEvents) -> io::Result<()> {
        let mut fds = self.inner.fds.borrow_mut();
        let Some(m) = fds.monitors.lookup_mut(monitor) else {
            return Ok(());
        };
        let poll = self.inner.poll.borrow();
        let registry = poll.registry();
        let token = token_of(monitor);
        match (interest.interest(), m.registered) {
            (Some(i), false) => {
                registry.register(&mut SourceFd(&m.fd), token, i)?;
                m.registered = true;
            }
            (Some(i), true) => registry.reregister(&mut SourceFd(&m.fd), token, i)?,
            (None, true) => {
                registry.deregister(&mut SourceFd(&m.fd))?;
                m.registered = false;
            }
            (None, false) => {}
        }
        Ok(())
    }

    pub(crate) fn fd_ready(&self, token: Token, events: FdEvents) {
        let Some(monitor) = FdMonitorRef::from_raw(token.0 as u64) else {
            return;
        };
        let live = self.inner.fds.borrow().monitors.contains(monitor);
        if live {
            self.push_ready(ReadyItem::Fd { monitor, events });
        }
    }

    pub(crate) fn dispatch_fd(&self, monitor: FdMonitorRef, events: FdEvents) {
        let (fd, callback, events) = {
            let fds = self.inner.fds.borrow();
            let Some(m) = fds.monitors.lookup(monitor) else {
                return;
            };
            let wanted = m.interest | FdEvents::HANGUP | FdEvents::ERROR;
            (m.fd, Rc::clone(&m.callback), events & wanted)
        };
        if events.is_empty() {
            return;
        }
        callback(self, fd, events);
    }
}
