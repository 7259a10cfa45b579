//! Services: the listening side of messaging.
//!
//! A [`Service`] claims a name in a [`ServiceDirectory`], listens on the
//! address it gets back and turns every accepted connection into a
//! server-side [`Session`]. Open sessions are kept in a [`HandleMap`] and
//! handed out as [`SessionRef`]s, so a stale reference to a session that
//! has since closed simply stops resolving.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::AsRawFd;
use std::rc::Rc;

use thiserror::Error;

use super::MessagingConfig;
use super::directory::{DirectoryError, ServiceDirectory, TransportAddr};
use super::message::{Message, MessagePool};
use super::protocol::Protocol;
use super::session::{CloseHandler, CloseReason, ReceiveHandler, Session};
use super::socket::SeqPacket;
use crate::config::ConfigError;
use crate::event_loop::{EventLoop, FdEvents, FdMonitorRef, LoopError};
use crate::handle::{HandleError, HandleMap, SafeRef};
use crate::trace::{debug, info, warn};

/// Reference to an open server-side session of a service.
pub type SessionRef = SafeRef<Session>;

/// Reference to a service open or close handler.
pub type ServiceHandlerRef = SafeRef<ServiceHandler>;

type OpenHandler = Rc<dyn Fn(&EventLoop, &Session)>;

/// A registered service open or close handler.
pub struct ServiceHandler {
    kind: HandlerKind,
}

enum HandlerKind {
    Open(OpenHandler),
    Close(CloseHandler),
}

/// Errors from advertising a service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: TransportAddr,
        source: io::Error,
    },
    #[error(transparent)]
    Loop(#[from] LoopError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub(crate) struct ServiceInner {
    event_loop: EventLoop,
    protocol: Protocol,
    name: String,
    directory: Rc<dyn ServiceDirectory>,
    config: MessagingConfig,
    addr: TransportAddr,
    pool: MessagePool,
    listener: RefCell<Option<SeqPacket>>,
    monitor: Cell<Option<FdMonitorRef>>,
    withdrawn: Cell<bool>,
    sessions: RefCell<HandleMap<Session>>,
    handlers: RefCell<HandleMap<ServiceHandler>>,
    receive_handler: RefCell<Option<ReceiveHandler>>,
}

impl ServiceInner {
    fn accept_pending(self: &Rc<Self>) {
        loop {
            let accepted = {
                let guard = self.listener.borrow();
                let Some(listener) = guard.as_ref() else {
                    return;
                };
                listener.try_accept()
            };
            match accepted {
                Ok(Some(socket)) => self.admit(socket),
                Ok(None) => return,
                Err(e) => {
                    warn!(service = %self.name, error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn admit(self: &Rc<Self>, socket: SeqPacket) {
        let session = Session::server(
            &self.event_loop,
            self.protocol.clone(),
            self.name.clone(),
            self.config.clone(),
            self.pool.clone(),
            Rc::downgrade(self),
        );
        let slot = self.sessions.borrow_mut().create_ref(session.clone());
        let slot = match slot {
            Ok(slot) => slot,
            Err(e) => {
                warn!(service = %self.name, error = %e, "no room for session, dropping connection");
                return;
            }
        };
        session.set_slot(slot);
        debug!(service = %self.name, session = %session.id(), fd = socket.as_raw_fd(), "connection accepted");
        if let Err(e) = session.accept(socket) {
            warn!(service = %self.name, error = %e, "failed to set up session");
        }
    }

    pub(crate) fn receive_handler(&self) -> Option<ReceiveHandler> {
        self.receive_handler.borrow().clone()
    }

    pub(crate) fn session_opened(&self, session: &Session) {
        let handlers: Vec<OpenHandler> = self
            .handlers
            .borrow()
            .iter()
            .filter_map(|(_, h)| match &h.kind {
                HandlerKind::Open(f) => Some(Rc::clone(f)),
                HandlerKind::Close(_) => None,
            })
            .collect();
        for handler in handlers {
            let session = session.clone();
            self.event_loop
                .queue_function(move |l| handler(l, &session));
        }
    }

    pub(crate) fn session_closed(
        &self,
        slot: SessionRef,
        session: &Session,
        reason: CloseReason,
        was_open: bool,
    ) {
        self.sessions.borrow_mut().delete_ref(slot);
        if !was_open {
            return;
        }
        let handlers: Vec<CloseHandler> = self
            .handlers
            .borrow()
            .iter()
            .filter_map(|(_, h)| match &h.kind {
                HandlerKind::Close(f) => Some(Rc::clone(f)),
                HandlerKind::Open(_) => None,
            })
            .collect();
        for handler in handlers {
            let session = session.clone();
            self.event_loop
                .queue_function(move |l| handler(l, &session, reason));
        }
    }

    fn stop_listening(&self) {
        if let Some(monitor) = self.monitor.take() {
            self.event_loop.remove_fd_monitor(monitor);
        }
        if self.listener.borrow_mut().take().is_some() {
            self.directory.withdraw(&self.name);
            info!(service = %self.name, "service no longer accepting sessions");
        }
    }

    fn withdraw(&self) {
        if self.withdrawn.replace(true) {
            return;
        }
        self.stop_listening();
        let sessions: Vec<Session> = self
            .sessions
            .borrow()
            .iter()
            .map(|(_, s)| s.clone())
            .collect();
        for session in &sessions {
            session.close_with(CloseReason::Local);
        }
        info!(service = %self.name, severed = sessions.len(), "service withdrawn");
    }
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        self.withdraw();
    }
}

/// An advertised service.
///
/// Cloning yields another reference to the same service. The service is
/// withdrawn when [`withdraw`](Self::withdraw) is called or the last
/// reference is dropped.
#[derive(Clone)]
pub struct Service {
    inner: Rc<ServiceInner>,
}

impl Service {
    /// Claims `name` in `directory` and starts accepting sessions on
    /// `event_loop`.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid, the name cannot be
    /// claimed or the listening socket cannot be set up.
    pub fn advertise(
        event_loop: &EventLoop,
        protocol: Protocol,
        name: &str,
        directory: Rc<dyn ServiceDirectory>,
        config: MessagingConfig,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let addr = directory.advertise(name)?;
        let listener = match SeqPacket::listen(addr.path(), config.listen_backlog) {
            Ok(listener) => listener,
            Err(source) => {
                directory.withdraw(name);
                return Err(ServiceError::Listen { addr, source });
            }
        };
        let listen_fd = listener.as_raw_fd();

        let inner = Rc::new(ServiceInner {
            event_loop: event_loop.clone(),
            pool: MessagePool::new(
                format!("{name}/service"),
                config.pool_capacity,
                protocol.max_payload() as usize,
            ),
            sessions: RefCell::new(HandleMap::new(format!("{name}/sessions"), 8)),
            handlers: RefCell::new(HandleMap::new(format!("{name}/handlers"), 4)),
            protocol,
            name: name.to_owned(),
            directory,
            config,
            addr,
            listener: RefCell::new(Some(listener)),
            monitor: Cell::new(None),
            withdrawn: Cell::new(false),
            receive_handler: RefCell::new(None),
        });

        let weak = Rc::downgrade(&inner);
        let monitor = event_loop.add_fd_monitor(listen_fd, FdEvents::READABLE, move |_, _, _| {
            if let Some(inner) = weak.upgrade() {
                inner.accept_pending();
            }
        })?;
        inner.monitor.set(Some(monitor));

        info!(
            service = %inner.name,
            protocol = %inner.protocol,
            addr = %inner.addr,
            "service advertised"
        );
        Ok(Self { inner })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn protocol(&self) -> &Protocol {
        &self.inner.protocol
    }

    #[must_use]
    pub fn address(&self) -> &TransportAddr {
        &self.inner.addr
    }

    /// Pool shared by all sessions of this service.
    #[must_use]
    pub fn pool(&self) -> &MessagePool {
        &self.inner.pool
    }

    /// Handler for messages on sessions that have none of their own.
    pub fn set_receive_handler(&self, handler: impl Fn(&EventLoop, &Session, Message) + 'static) {
        *self.inner.receive_handler.borrow_mut() = Some(Rc::new(handler));
    }

    /// Adds a handler called whenever a session finishes its handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler table is exhausted.
    pub fn add_open_handler(
        &self,
        handler: impl Fn(&EventLoop, &Session) + 'static,
    ) -> Result<ServiceHandlerRef, HandleError> {
        self.inner.handlers.borrow_mut().create_ref(ServiceHandler {
            kind: HandlerKind::Open(Rc::new(handler)),
        })
    }

    /// Adds a handler called whenever an open session closes, for any
    /// reason.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler table is exhausted.
    pub fn add_close_handler(
        &self,
        handler: impl Fn(&EventLoop, &Session, CloseReason) + 'static,
    ) -> Result<ServiceHandlerRef, HandleError> {
        self.inner.handlers.borrow_mut().create_ref(ServiceHandler {
            kind: HandlerKind::Close(Rc::new(handler)),
        })
    }

    /// Removes an open or close handler.
    ///
    /// # Panics
    ///
    /// Panics if `handler` is not registered on this service.
    pub fn remove_handler(&self, handler: ServiceHandlerRef) {
        if self.inner.handlers.borrow_mut().delete_ref(handler).is_none() {
            panic!("unknown service handler {handler}");
        }
    }

    /// Sessions currently connected, in slot order.
    #[must_use]
    pub fn sessions(&self) -> Vec<(SessionRef, Session)> {
        self.inner
            .sessions
            .borrow()
            .iter()
            .map(|(r, s)| (r, s.clone()))
            .collect()
    }

    #[must_use]
    pub fn session(&self, session: SessionRef) -> Option<Session> {
        self.inner.sessions.borrow().lookup(session).cloned()
    }

    /// Force-closes one session. Returns false if it is already gone.
    pub fn kill_session(&self, session: SessionRef) -> bool {
        let Some(session) = self.session(session) else {
            return false;
        };
        session.kill();
        true
    }

    /// Stops accepting new sessions and releases the name. Sessions already
    /// open are left alone.
    pub fn hide(&self) {
        self.inner.stop_listening();
    }

    /// Stops accepting sessions, releases the name and closes every open
    /// session.
    pub fn withdraw(&self) {
        self.inner.withdraw();
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.inner.name)
            .field("protocol", &self.inner.protocol)
            .field("addr", &self.inner.addr)
            .field("sessions", &self.inner.sessions.borrow().len())
            .finish()
    }
}
