//! Sessions: one connection between a client and a service.
//!
//! # Lifecycle
//!
//! ```text
//! Closed ──open()──► Connecting ──WELCOME──► Open ──close/hangup/kill──► Closing ──► Closed
//!                        │
//!                        └── REJECT / timeout / hangup ─────────────────────────────► Closed
//! ```
//!
//! All I/O runs on the owning loop. Connecting never blocks: while the
//! listener's backlog is full the connect is retried from a timer, within
//! the handshake timeout. The socket is drained until it would block each
//! time it turns readable; handshake frames are handled inline, everything
//! else lands on a receive queue that is delivered one message per queued
//! call, so one chatty peer cannot hog a pass. A full receive queue stops
//! reading until it drains.
//!
//! When the peer hangs up, frames it sent before hanging up are still
//! delivered in order. The session sits in `Closing` until they are, then
//! closes with [`CloseReason::PeerClosed`].
//!
//! # Transactions
//!
//! Requests carry a non-zero correlation id that the server echoes in its
//! response. While [`Session::request_sync_response`] waits, only the
//! awaited response is taken off this session's receive queue; other
//! sessions and other loop work keep running in the nested passes.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use thiserror::Error;

use super::MessagingConfig;
use super::directory::{ServiceDirectory, TransportAddr};
use super::frame::{self, FrameHeader, HEADER_SIZE, Handshake, MAX_HANDSHAKE_PAYLOAD, RejectReason};
use super::message::{Message, MessageError, MessagePool};
use super::protocol::Protocol;
use super::service::{ServiceInner, SessionRef};
use super::socket::{PeerCredentials, Received, SeqPacket};
use crate::config::ConfigError;
use crate::event_loop::{EventLoop, FdEvents, FdMonitorRef, LoopError, TimerError, TimerRef};
use crate::trace::{debug, info, trace, warn};

/// Errors from session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session to '{0}' is not open")]
    NotOpen(String),
    #[error("session to '{0}' is already open or opening")]
    AlreadyOpen(String),
    /// The service could not be resolved or connected to.
    #[error("service '{service}' unavailable: {reason}")]
    Unavailable { service: String, reason: String },
    /// The service speaks a different protocol (name or hash differ).
    #[error("service '{0}' speaks a different protocol")]
    ProtocolMismatch(String),
    #[error("service '{service}' rejected the session: {reason:?}")]
    Rejected {
        service: String,
        reason: RejectReason,
    },
    /// The peer broke off or garbled the handshake.
    #[error("handshake with '{0}' failed")]
    Handshake(String),
    #[error("handshake with '{0}' timed out")]
    Timeout(String),
    /// The session closed before the operation completed.
    #[error("session closed")]
    Closed,
    #[error("message does not need a response")]
    NoResponseNeeded,
    /// A synchronous wait is already in progress on this loop.
    #[error("a synchronous wait is already in progress on this loop")]
    NestedSyncWait,
    #[error("operation requires a {0} session")]
    WrongRole(&'static str),
    /// The loop was asked to exit while waiting.
    #[error("wait interrupted by loop exit")]
    Interrupted,
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Loop(#[from] LoopError),
    #[error(transparent)]
    Timer(#[from] TimerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Protocol violations that get a session killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// A frame could not be decoded.
    Malformed,
    /// A frame exceeded the negotiated max payload.
    Oversized,
    /// A frame carried another protocol's hash.
    HashMismatch,
    /// More than one fd arrived with a frame.
    TooManyFds,
    /// A request was dropped without a response.
    UnansweredRequest,
    /// The socket failed.
    Transport(io::ErrorKind),
}

/// Why a session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The other end closed or went away.
    PeerClosed,
    /// This end called `close` or `kill`.
    Local,
    /// Killed for a protocol violation.
    Killed(Violation),
}

impl CloseReason {
    #[must_use]
    pub const fn is_killed(self) -> bool {
        matches!(self, Self::Killed(_))
    }
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Connecting,
    Open,
    Closing,
}

/// Identifies a session in logs.
///
/// Combines the process ID with a random nonce so sessions stay
/// distinguishable across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    pid: u32,
    nonce: u32,
}

impl SessionId {
    fn generate() -> Self {
        Self {
            pid: std::process::id(),
            nonce: rand::random(),
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:08x}", self.pid, self.nonce)
    }
}

/// How often a connect is retried while the listener's backlog is full.
const CONNECT_RETRY: Duration = Duration::from_millis(5);

pub(crate) type ReceiveHandler = Rc<dyn Fn(&EventLoop, &Session, Message)>;
pub(crate) type CloseHandler = Rc<dyn Fn(&EventLoop, &Session, CloseReason)>;
type OpenCallback = Box<dyn FnOnce(&EventLoop, &Session, Result<(), SessionError>)>;
type ResponseCallback = Box<dyn FnOnce(&EventLoop, Option<Message>)>;

enum Pending {
    Sync,
    Async(ResponseCallback),
}

struct Outgoing {
    frame: Vec<u8>,
    fd: Option<OwnedFd>,
}

/// Where the response to a received request goes.
pub(crate) struct ReplyRoute {
    session: Weak<SessionInner>,
    correlation: u32,
}

enum Role {
    Client {
        directory: Rc<dyn ServiceDirectory>,
    },
    Server {
        service: Weak<ServiceInner>,
        slot: Cell<Option<SessionRef>>,
    },
}

enum Inbound {
    Empty,
    Closed,
    Violation(Violation),
    Handshake(FrameHeader, Handshake),
    Message(Message),
}

pub(crate) struct SessionInner {
    id: SessionId,
    event_loop: EventLoop,
    protocol: Protocol,
    service_name: String,
    role: Role,
    config: MessagingConfig,
    pool: MessagePool,
    state: Cell<SessionState>,
    socket: RefCell<Option<SeqPacket>>,
    monitor: Cell<Option<FdMonitorRef>>,
    writable: Cell<bool>,
    handshake_timer: Cell<Option<TimerRef>>,
    connect_retry: Cell<Option<TimerRef>>,
    max_payload: Cell<u32>,
    peer: Cell<Option<PeerCredentials>>,
    tx_queue: RefCell<VecDeque<Outgoing>>,
    rx_queue: RefCell<VecDeque<Message>>,
    rx_scheduled: Cell<bool>,
    /// Reading stopped because the receive queue is full.
    rx_paused: Cell<bool>,
    /// The peer hung up; queued frames are being delivered before closing.
    hung_up: Cell<bool>,
    rx_buf: RefCell<Vec<u8>>,
    receive_handler: RefCell<Option<ReceiveHandler>>,
    close_handler: RefCell<Option<CloseHandler>>,
    transactions: RefCell<HashMap<u32, Pending>>,
    next_correlation: Cell<u32>,
    sync_wait: Cell<Option<u32>>,
    sync_result: RefCell<Option<Option<Message>>>,
    open_pending: Cell<bool>,
    open_callback: RefCell<Option<OpenCallback>>,
    open_result: RefCell<Option<Result<(), SessionError>>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            self.event_loop.remove_fd_monitor(monitor);
        }
        for timer in [self.handshake_timer.take(), self.connect_retry.take()]
            .into_iter()
            .flatten()
        {
            self.event_loop.delete_timer(timer);
        }
    }
}

/// A messaging session, client side or server side.
///
/// Cloning yields another reference to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Rc<SessionInner>,
}

impl Session {
    /// Creates a closed client session for `service_name`.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn new(
        event_loop: &EventLoop,
        protocol: Protocol,
        service_name: impl Into<String>,
        directory: Rc<dyn ServiceDirectory>,
        config: MessagingConfig,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let service_name = service_name.into();
        let pool = MessagePool::new(
            format!("{service_name}/client"),
            config.pool_capacity,
            protocol.max_payload() as usize,
        );
        Ok(Self::build(
            event_loop,
            protocol,
            service_name,
            Role::Client { directory },
            config,
            pool,
        ))
    }

    pub(crate) fn server(
        event_loop: &EventLoop,
        protocol: Protocol,
        service_name: String,
        config: MessagingConfig,
        pool: MessagePool,
        service: Weak<ServiceInner>,
    ) -> Self {
        Self::build(
            event_loop,
            protocol,
            service_name,
            Role::Server {
                service,
                slot: Cell::new(None),
            },
            config,
            pool,
        )
    }

    fn build(
        event_loop: &EventLoop,
        protocol: Protocol,
        service_name: String,
        role: Role,
        config: MessagingConfig,
        pool: MessagePool,
    ) -> Self {
        let max_payload = protocol.max_payload();
        Self {
            inner: Rc::new(SessionInner {
                id: SessionId::generate(),
                event_loop: event_loop.clone(),
                protocol,
                service_name,
                role,
                config,
                pool,
                state: Cell::new(SessionState::Closed),
                socket: RefCell::new(None),
                monitor: Cell::new(None),
                writable: Cell::new(false),
                handshake_timer: Cell::new(None),
                connect_retry: Cell::new(None),
                max_payload: Cell::new(max_payload),
                peer: Cell::new(None),
                tx_queue: RefCell::new(VecDeque::new()),
                rx_queue: RefCell::new(VecDeque::new()),
                rx_scheduled: Cell::new(false),
                rx_paused: Cell::new(false),
                hung_up: Cell::new(false),
                rx_buf: RefCell::new(Vec::new()),
                receive_handler: RefCell::new(None),
                close_handler: RefCell::new(None),
                transactions: RefCell::new(HashMap::new()),
                next_correlation: Cell::new(1),
                sync_wait: Cell::new(None),
                sync_result: RefCell::new(None),
                open_pending: Cell::new(false),
                open_callback: RefCell::new(None),
                open_result: RefCell::new(None),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.state.get()
    }

    #[must_use]
    pub fn protocol(&self) -> &Protocol {
        &self.inner.protocol
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    #[must_use]
    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    #[must_use]
    pub fn is_client(&self) -> bool {
        matches!(self.inner.role, Role::Client { .. })
    }

    /// Max payload in effect: the negotiated one once open, the protocol's
    /// before that.
    #[must_use]
    pub fn max_payload(&self) -> u32 {
        self.inner.max_payload.get()
    }

    /// Credentials of the peer process, known once the session is open.
    #[must_use]
    pub fn peer_credentials(&self) -> Option<PeerCredentials> {
        self.inner.peer.get()
    }

    /// The pool [`create_msg`](Self::create_msg) allocates from.
    #[must_use]
    pub fn pool(&self) -> &MessagePool {
        &self.inner.pool
    }

    /// Whether both handles refer to the same session.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Starts opening the session. `callback` runs on a later pass with the
    /// outcome. Resolution and connect failures are returned right away
    /// instead, and the callback is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not a closed client session or
    /// the service cannot be reached.
    pub fn open(
        &self,
        callback: impl FnOnce(&EventLoop, &Session, Result<(), SessionError>) + 'static,
    ) -> Result<(), SessionError> {
        self.check_openable()?;
        *self.inner.open_callback.borrow_mut() = Some(Box::new(callback));
        if let Err(e) = self.start_connect() {
            self.inner.open_callback.borrow_mut().take();
            return Err(e);
        }
        Ok(())
    }

    /// Opens the session, running the loop nested until the handshake
    /// completes.
    ///
    /// # Errors
    ///
    /// Returns the reason the open failed, or
    /// [`SessionError::NestedSyncWait`] if called during another
    /// synchronous wait on this loop.
    pub fn open_sync(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        let _wait = inner
            .event_loop
            .begin_sync_wait()
            .ok_or(SessionError::NestedSyncWait)?;
        inner.open_result.borrow_mut().take();
        self.start_connect()?;

        let waiting = Rc::clone(inner);
        inner
            .event_loop
            .run_until(move || waiting.open_result.borrow().is_some())?;

        let result = inner.open_result.borrow_mut().take();
        match result {
            Some(result) => result,
            None => {
                self.close_with(CloseReason::Local);
                Err(SessionError::Interrupted)
            }
        }
    }

    /// Allocates a message from this session's pool.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::OutOfMemory`] if the pool is exhausted.
    pub fn create_msg(&self) -> Result<Message, MessageError> {
        let lease = self.inner.pool.alloc()?;
        Ok(Message::new(lease, self.inner.max_payload.get() as usize))
    }

    /// Sends a one-way message. Sending a received request answers it, as
    /// [`Message::respond`] would.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not open or the payload exceeds
    /// the negotiated max.
    pub fn send(&self, mut msg: Message) -> Result<(), SessionError> {
        if let Some(route) = msg.take_reply() {
            return respond(&route, msg);
        }
        self.transmit(msg, 0)
    }

    /// Sends a request; `callback` gets the response, or `None` if the
    /// session closes first.
    ///
    /// # Errors
    ///
    /// Returns an error if this is not an open client session or the
    /// payload exceeds the negotiated max.
    pub fn request_response(
        &self,
        msg: Message,
        callback: impl FnOnce(&EventLoop, Option<Message>) + 'static,
    ) -> Result<(), SessionError> {
        let correlation = self.begin_transaction(Pending::Async(Box::new(callback)))?;
        if let Err(e) = self.transmit(msg, correlation) {
            self.inner.transactions.borrow_mut().remove(&correlation);
            return Err(e);
        }
        Ok(())
    }

    /// Sends a request and runs the loop nested until the response arrives.
    /// Returns `Ok(None)` if the session closes first.
    ///
    /// # Errors
    ///
    /// Returns an error if this is not an open client session, the payload
    /// exceeds the negotiated max, or another synchronous wait is in
    /// progress on this loop.
    pub fn request_sync_response(&self, msg: Message) -> Result<Option<Message>, SessionError> {
        let inner = &self.inner;
        let _wait = inner
            .event_loop
            .begin_sync_wait()
            .ok_or(SessionError::NestedSyncWait)?;
        let correlation = self.begin_transaction(Pending::Sync)?;
        inner.sync_result.borrow_mut().take();
        if let Err(e) = self.transmit(msg, correlation) {
            inner.transactions.borrow_mut().remove(&correlation);
            return Err(e);
        }

        inner.sync_wait.set(Some(correlation));
        self.resume_rx();
        let waiting = Rc::clone(inner);
        let outcome = inner
            .event_loop
            .run_until(move || waiting.sync_result.borrow().is_some());
        inner.sync_wait.set(None);
        inner.transactions.borrow_mut().remove(&correlation);
        let response = inner.sync_result.borrow_mut().take().flatten();

        // Messages held back during the wait.
        self.schedule_rx();
        outcome?;
        Ok(response)
    }

    /// Handler for messages received on this session. On server-side
    /// sessions it takes precedence over the service's handler.
    pub fn set_receive_handler(&self, handler: impl Fn(&EventLoop, &Session, Message) + 'static) {
        *self.inner.receive_handler.borrow_mut() = Some(Rc::new(handler));
    }

    /// Handler called once when the session closes for any reason other
    /// than this end's own `close` or `kill`.
    pub fn set_close_handler(
        &self,
        handler: impl Fn(&EventLoop, &Session, CloseReason) + 'static,
    ) {
        *self.inner.close_handler.borrow_mut() = Some(Rc::new(handler));
    }

    /// Closes the session. Unsent messages are released and pending
    /// requests complete with `None`. A client session can be opened again
    /// afterwards.
    pub fn close(&self) {
        self.close_with(CloseReason::Local);
    }

    /// Force-closes a server-side session. Same as [`close`](Self::close).
    pub fn kill(&self) {
        self.close_with(CloseReason::Local);
    }

    pub(crate) fn set_slot(&self, slot: SessionRef) {
        if let Role::Server { slot: cell, .. } = &self.inner.role {
            cell.set(Some(slot));
        }
    }

    /// Takes ownership of an accepted connection and waits for its HELLO.
    pub(crate) fn accept(&self, socket: SeqPacket) -> Result<(), SessionError> {
        if let Err(e) = self.attach(socket) {
            self.close_with(CloseReason::Local);
            return Err(e);
        }
        Ok(())
    }

    fn check_openable(&self) -> Result<(), SessionError> {
        if !self.is_client() {
            return Err(SessionError::WrongRole("client"));
        }
        if self.inner.state.get() != SessionState::Closed {
            return Err(SessionError::AlreadyOpen(self.inner.service_name.clone()));
        }
        Ok(())
    }

    fn start_connect(&self) -> Result<(), SessionError> {
        self.check_openable()?;
        let inner = &self.inner;
        let Role::Client { directory } = &inner.role else {
            return Err(SessionError::WrongRole("client"));
        };

        let unavailable = |reason: String| SessionError::Unavailable {
            service: inner.service_name.clone(),
            reason,
        };
        let addr = directory
            .resolve(&inner.service_name)
            .map_err(|e| unavailable(e.to_string()))?;
        let socket = SeqPacket::try_connect(addr.path()).map_err(|e| unavailable(e.to_string()))?;
        debug!(session = %inner.id, service = %inner.service_name, addr = %addr, "connecting");

        inner.open_pending.set(true);
        let started = self.begin_handshake().and_then(|()| match socket {
            Some(socket) => self.connected(socket),
            None => self.retry_connect_later(addr),
        });
        if let Err(e) = started {
            inner.open_pending.set(false);
            self.close_with(CloseReason::Local);
            return Err(e);
        }
        Ok(())
    }

    /// Watches a connected socket and says HELLO.
    fn connected(&self, socket: SeqPacket) -> Result<(), SessionError> {
        let inner = &self.inner;
        self.watch(socket)?;
        let mut hello = Vec::with_capacity(HEADER_SIZE + MAX_HANDSHAKE_PAYLOAD);
        Handshake::Hello {
            max_payload: inner.protocol.max_payload(),
            protocol: inner.protocol.name().to_owned(),
        }
        .encode(inner.protocol.hash(), &mut hello);
        self.queue_frame(hello, None);
        Ok(())
    }

    fn retry_connect_later(&self, addr: TransportAddr) -> Result<(), SessionError> {
        let inner = &self.inner;
        debug!(session = %inner.id, service = %inner.service_name, "listener backlog full, retrying");
        let event_loop = &inner.event_loop;
        let timer = event_loop.create_timer(format!("{}/connect", inner.id))?;
        inner.connect_retry.set(Some(timer));
        event_loop.set_timer_interval(timer, CONNECT_RETRY);
        event_loop.set_timer_repeat(timer, 0)?;
        let weak = Rc::downgrade(inner);
        event_loop.set_timer_handler(timer, move |_, _| {
            if let Some(inner) = weak.upgrade() {
                Session { inner }.retry_connect(&addr);
            }
        })?;
        event_loop.start_timer(timer)?;
        Ok(())
    }

    fn retry_connect(&self, addr: &TransportAddr) {
        let inner = &self.inner;
        if inner.state.get() != SessionState::Connecting {
            return;
        }
        let result = match SeqPacket::try_connect(addr.path()) {
            Ok(None) => return,
            Ok(Some(socket)) => {
                if let Some(timer) = inner.connect_retry.take() {
                    inner.event_loop.delete_timer(timer);
                }
                self.connected(socket)
            }
            Err(e) => Err(SessionError::Unavailable {
                service: inner.service_name.clone(),
                reason: e.to_string(),
            }),
        };
        if let Err(e) = result {
            self.finish_open(Err(e));
            self.close_with(CloseReason::Local);
        }
    }

    /// Enters `Connecting` and starts the handshake timeout.
    fn begin_handshake(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        inner.max_payload.set(inner.protocol.max_payload());
        inner.state.set(SessionState::Connecting);

        let event_loop = &inner.event_loop;
        let timer = event_loop.create_timer(format!("{}/handshake", inner.id))?;
        inner.handshake_timer.set(Some(timer));
        event_loop.set_timer_interval(timer, inner.config.handshake_timeout);
        let weak = Rc::downgrade(inner);
        event_loop.set_timer_handler(timer, move |_, _| {
            if let Some(inner) = weak.upgrade() {
                Session { inner }.on_handshake_timeout();
            }
        })?;
        event_loop.start_timer(timer)?;
        Ok(())
    }

    fn attach(&self, socket: SeqPacket) -> Result<(), SessionError> {
        self.begin_handshake()?;
        self.watch(socket)
    }

    fn watch(&self, socket: SeqPacket) -> Result<(), SessionError> {
        let inner = &self.inner;
        let weak = Rc::downgrade(inner);
        let monitor = inner.event_loop.add_fd_monitor(
            socket.as_raw_fd(),
            FdEvents::READABLE,
            move |_, _, events| {
                if let Some(inner) = weak.upgrade() {
                    Session { inner }.on_ready(events);
                }
            },
        )?;
        inner.monitor.set(Some(monitor));
        *inner.socket.borrow_mut() = Some(socket);
        Ok(())
    }

    fn on_handshake_timeout(&self) {
        if self.inner.state.get() != SessionState::Connecting {
            return;
        }
        warn!(session = %self.inner.id, service = %self.inner.service_name, "handshake timed out");
        self.finish_open(Err(SessionError::Timeout(self.inner.service_name.clone())));
        self.close_with(CloseReason::Local);
    }

    fn on_ready(&self, events: FdEvents) {
        if events.contains(FdEvents::WRITABLE) {
            self.flush();
        }
        if events.intersects(FdEvents::READABLE | FdEvents::HANGUP | FdEvents::ERROR) {
            self.drain_socket();
        }
    }

    fn drain_socket(&self) {
        let inner = &self.inner;
        loop {
            // A sync wait must see its response, so it reads past the limit.
            if inner.sync_wait.get().is_none()
                && inner.rx_queue.borrow().len() >= inner.config.rx_queue_limit
            {
                self.pause_rx();
                break;
            }
            match self.receive_one() {
                Inbound::Empty => break,
                Inbound::Closed => {
                    self.peer_hung_up();
                    return;
                }
                Inbound::Violation(violation) => {
                    self.close_with(CloseReason::Killed(violation));
                    return;
                }
                Inbound::Handshake(header, handshake) => self.on_handshake(header, handshake),
                Inbound::Message(msg) => {
                    trace!(
                        session = %self.inner.id,
                        msg_id = msg.msg_id(),
                        correlation = msg.correlation(),
                        "message received"
                    );
                    inner.rx_queue.borrow_mut().push_back(msg);
                }
            }
        }
        self.schedule_rx();
    }

    /// The peer closed its end. What it sent before is delivered first.
    fn peer_hung_up(&self) {
        let inner = &self.inner;
        if inner.state.get() != SessionState::Open || inner.rx_queue.borrow().is_empty() {
            self.close_with(CloseReason::PeerClosed);
            return;
        }
        debug!(
            session = %inner.id,
            queued = inner.rx_queue.borrow().len(),
            "peer hung up, delivering queued messages"
        );
        inner.hung_up.set(true);
        inner.state.set(SessionState::Closing);
        self.detach();
        self.schedule_rx();
    }

    fn pause_rx(&self) {
        let inner = &self.inner;
        let Some(monitor) = inner.monitor.get() else {
            return;
        };
        if inner.rx_paused.get() {
            return;
        }
        match inner.event_loop.disable_fd_interest(monitor, FdEvents::READABLE) {
            Ok(()) => {
                inner.rx_paused.set(true);
                debug!(session = %inner.id, "receive queue full, reading paused");
            }
            Err(e) => {
                warn!(session = %inner.id, error = %e, "failed to pause reading");
            }
        }
    }

    fn resume_rx(&self) {
        let inner = &self.inner;
        let Some(monitor) = inner.monitor.get() else {
            return;
        };
        if !inner.rx_paused.get() {
            return;
        }
        if let Err(e) = inner.event_loop.enable_fd_interest(monitor, FdEvents::READABLE) {
            warn!(session = %inner.id, error = %e, "failed to resume reading");
            return;
        }
        inner.rx_paused.set(false);
        // Readiness is edge-triggered; pick up what arrived while paused.
        self.drain_socket();
    }

    /// Reads and classifies one datagram.
    fn receive_one(&self) -> Inbound {
        let inner = &self.inner;
        let guard = inner.socket.borrow();
        let Some(socket) = guard.as_ref() else {
            return Inbound::Empty;
        };
        let mut buf = inner.rx_buf.borrow_mut();
        let limit = HEADER_SIZE + (inner.max_payload.get() as usize).max(MAX_HANDSHAKE_PAYLOAD);
        buf.resize(limit, 0);

        let (len, fd) = match socket.try_recv(&mut buf) {
            Ok(None) => return Inbound::Empty,
            Ok(Some(Received::Closed)) => return Inbound::Closed,
            Ok(Some(Received::Packet {
                truncated: true, ..
            })) => return Inbound::Violation(Violation::Oversized),
            Ok(Some(Received::Packet {
                extra_fds: true, ..
            })) => return Inbound::Violation(Violation::TooManyFds),
            Ok(Some(Received::Packet { len, fd, .. })) => (len, fd),
            Err(e) => {
                debug!(session = %inner.id, error = %e, "receive failed");
                return Inbound::Violation(Violation::Transport(e.kind()));
            }
        };

        let (header, payload) = match frame::decode_frame(&buf[..len]) {
            Ok(split) => split,
            Err(e) => {
                debug!(session = %inner.id, error = %e, "undecodable frame");
                return Inbound::Violation(Violation::Malformed);
            }
        };

        if inner.state.get() == SessionState::Connecting {
            return match Handshake::decode(&header, payload) {
                Ok(handshake) => Inbound::Handshake(header, handshake),
                Err(e) => {
                    debug!(session = %inner.id, error = %e, "bad handshake frame");
                    Inbound::Violation(Violation::Malformed)
                }
            };
        }

        if header.protocol_hash != inner.protocol.hash() {
            return Inbound::Violation(Violation::HashMismatch);
        }
        let max = inner.max_payload.get() as usize;
        if payload.len() > max {
            return Inbound::Violation(Violation::Oversized);
        }
        let reply = match &inner.role {
            Role::Server { .. } if header.correlation != 0 => Some(ReplyRoute {
                session: Rc::downgrade(inner),
                correlation: header.correlation,
            }),
            _ => None,
        };
        Inbound::Message(Message::received(
            inner.pool.alloc_forced(),
            max,
            header.msg_id,
            header.correlation,
            payload,
            fd,
            reply,
        ))
    }

    fn on_handshake(&self, header: FrameHeader, handshake: Handshake) {
        let inner = &self.inner;
        match (&inner.role, handshake) {
            (Role::Server { .. }, Handshake::Hello {
                max_payload,
                protocol,
            }) => {
                if protocol != inner.protocol.name() || header.protocol_hash != inner.protocol.hash()
                {
                    info!(
                        session = %inner.id,
                        service = %inner.service_name,
                        client_protocol = %protocol,
                        client_hash = header.protocol_hash,
                        "protocol mismatch, rejecting"
                    );
                    self.send_reject(RejectReason::ProtocolMismatch);
                    self.close_with(CloseReason::Local);
                    return;
                }
                let negotiated = max_payload.min(inner.protocol.max_payload());
                self.became_open(negotiated);

                let mut welcome = Vec::with_capacity(HEADER_SIZE + 4);
                Handshake::Welcome {
                    max_payload: negotiated,
                }
                .encode(inner.protocol.hash(), &mut welcome);
                self.queue_frame(welcome, None);

                if inner.state.get() == SessionState::Open {
                    if let Some(service) = self.service() {
                        service.session_opened(self);
                    }
                }
            }
            (Role::Client { .. }, Handshake::Welcome { max_payload }) => {
                self.became_open(max_payload.min(inner.protocol.max_payload()));
                self.finish_open(Ok(()));
            }
            (Role::Client { .. }, Handshake::Reject(reason)) => {
                let service = inner.service_name.clone();
                let err = match reason {
                    RejectReason::ProtocolMismatch => SessionError::ProtocolMismatch(service),
                    reason => SessionError::Rejected { service, reason },
                };
                info!(session = %inner.id, ?reason, "session rejected");
                self.finish_open(Err(err));
                self.close_with(CloseReason::Local);
            }
            (_, other) => {
                debug!(session = %inner.id, ?other, "unexpected handshake frame");
                self.close_with(CloseReason::Killed(Violation::Malformed));
            }
        }
    }

    fn became_open(&self, max_payload: u32) {
        let inner = &self.inner;
        if let Some(timer) = inner.handshake_timer.take() {
            inner.event_loop.delete_timer(timer);
        }
        inner.max_payload.set(max_payload);
        if let Some(socket) = inner.socket.borrow().as_ref() {
            match socket.peer_credentials() {
                Ok(cred) => inner.peer.set(Some(cred)),
                Err(e) => {
                    debug!(session = %inner.id, error = %e, "no peer credentials");
                }
            }
        }
        inner.state.set(SessionState::Open);
        info!(
            session = %inner.id,
            service = %inner.service_name,
            protocol = %inner.protocol,
            max_payload,
            "session open"
        );
    }

    /// Reports the outcome of an open to whoever is waiting for it.
    fn finish_open(&self, result: Result<(), SessionError>) {
        let inner = &self.inner;
        if !inner.open_pending.replace(false) {
            return;
        }
        let callback = inner.open_callback.borrow_mut().take();
        match callback {
            Some(callback) => {
                let session = self.clone();
                inner
                    .event_loop
                    .queue_function(move |l| callback(l, &session, result));
            }
            None => *inner.open_result.borrow_mut() = Some(result),
        }
    }

    fn send_reject(&self, reason: RejectReason) {
        let mut frame = Vec::with_capacity(HEADER_SIZE + 1);
        Handshake::Reject(reason).encode(self.inner.protocol.hash(), &mut frame);
        if let Some(socket) = self.inner.socket.borrow().as_ref() {
            if let Err(e) = socket.try_send(&frame, None) {
                debug!(session = %self.inner.id, error = %e, "reject not delivered");
            }
        }
    }

    fn begin_transaction(&self, pending: Pending) -> Result<u32, SessionError> {
        let inner = &self.inner;
        if !self.is_client() {
            return Err(SessionError::WrongRole("client"));
        }
        if inner.state.get() != SessionState::Open {
            return Err(SessionError::NotOpen(inner.service_name.clone()));
        }
        let mut transactions = inner.transactions.borrow_mut();
        let mut correlation = inner.next_correlation.get();
        // 0 marks one-way messages.
        while correlation == 0 || transactions.contains_key(&correlation) {
            correlation = correlation.wrapping_add(1);
        }
        inner.next_correlation.set(correlation.wrapping_add(1));
        transactions.insert(correlation, pending);
        Ok(correlation)
    }

    fn transmit(&self, mut msg: Message, correlation: u32) -> Result<(), SessionError> {
        let inner = &self.inner;
        if inner.state.get() != SessionState::Open {
            return Err(SessionError::NotOpen(inner.service_name.clone()));
        }
        let len = msg.payload().len();
        let max = inner.max_payload.get() as usize;
        if len > max {
            return Err(MessageError::PayloadTooLarge { len, max }.into());
        }

        let mut frame = Vec::with_capacity(HEADER_SIZE + len);
        frame::encode_frame(
            &mut frame,
            inner.protocol.hash(),
            msg.msg_id(),
            correlation,
            msg.payload(),
        );
        let fd = msg.take_outgoing_fd();
        trace!(
            session = %inner.id,
            msg_id = msg.msg_id(),
            correlation,
            len,
            fd = fd.as_ref().map_or(-1, AsRawFd::as_raw_fd),
            "message queued"
        );
        drop(msg);
        self.queue_frame(frame, fd);
        Ok(())
    }

    fn queue_frame(&self, frame: Vec<u8>, fd: Option<OwnedFd>) {
        self.inner
            .tx_queue
            .borrow_mut()
            .push_back(Outgoing { frame, fd });
        self.flush();
    }

    /// Sends queued frames until the queue is empty or the socket is full.
    fn flush(&self) {
        let inner = &self.inner;
        let outcome = loop {
            let mut tx = inner.tx_queue.borrow_mut();
            let Some(next) = tx.front() else {
                break Ok(true);
            };
            let guard = inner.socket.borrow();
            let Some(socket) = guard.as_ref() else {
                break Ok(true);
            };
            match socket.try_send(&next.frame, next.fd.as_ref().map(AsFd::as_fd)) {
                Ok(Some(_)) => {
                    tx.pop_front();
                }
                Ok(None) => break Ok(false),
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(drained) => self.set_writable_interest(!drained),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::BrokenPipe
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::NotConnected
                ) =>
            {
                self.close_with(CloseReason::PeerClosed);
            }
            Err(e) => {
                warn!(session = %inner.id, error = %e, "send failed");
                self.close_with(CloseReason::Killed(Violation::Transport(e.kind())));
            }
        }
    }

    fn set_writable_interest(&self, wanted: bool) {
        let inner = &self.inner;
        if inner.writable.get() == wanted {
            return;
        }
        let Some(monitor) = inner.monitor.get() else {
            return;
        };
        let changed = if wanted {
            inner
                .event_loop
                .enable_fd_interest(monitor, FdEvents::WRITABLE)
        } else {
            inner
                .event_loop
                .disable_fd_interest(monitor, FdEvents::WRITABLE)
        };
        match changed {
            Ok(()) => inner.writable.set(wanted),
            Err(e) => {
                warn!(session = %inner.id, error = %e, "failed to change write interest");
            }
        }
    }

    fn has_deliverable(&self) -> bool {
        if self.inner.hung_up.get() {
            return true;
        }
        let queue = self.inner.rx_queue.borrow();
        match self.inner.sync_wait.get() {
            Some(correlation) => queue.iter().any(|m| m.correlation() == correlation),
            None => !queue.is_empty(),
        }
    }

    fn schedule_rx(&self) {
        let inner = &self.inner;
        if inner.rx_scheduled.get() || !self.has_deliverable() {
            return;
        }
        inner.rx_scheduled.set(true);
        let weak = Rc::downgrade(inner);
        inner.event_loop.queue_function(move |_| {
            if let Some(inner) = weak.upgrade() {
                Session { inner }.deliver_next();
            }
        });
    }

    fn deliver_next(&self) {
        let inner = &self.inner;
        inner.rx_scheduled.set(false);
        let draining = inner.hung_up.get();
        if inner.state.get() != SessionState::Open && !draining {
            return;
        }
        let next = {
            let mut queue = inner.rx_queue.borrow_mut();
            match inner.sync_wait.get() {
                Some(correlation) => queue
                    .iter()
                    .position(|m| m.correlation() == correlation)
                    .and_then(|i| queue.remove(i)),
                None => queue.pop_front(),
            }
        };
        match next {
            Some(msg) => self.deliver(msg),
            None => {
                if let (true, Some(correlation)) = (draining, inner.sync_wait.get()) {
                    self.abandon_sync(correlation);
                }
            }
        }

        if draining {
            if inner.rx_queue.borrow().is_empty() && inner.sync_wait.get().is_none() {
                self.close_with(CloseReason::PeerClosed);
            } else {
                self.schedule_rx();
            }
            return;
        }
        if inner.rx_queue.borrow().len() < inner.config.rx_queue_limit {
            self.resume_rx();
        }
        self.schedule_rx();
    }

    /// Ends a sync wait whose response can no longer arrive.
    fn abandon_sync(&self, correlation: u32) {
        let inner = &self.inner;
        let pending = inner.transactions.borrow_mut().remove(&correlation);
        if let Some(Pending::Sync) = pending {
            *inner.sync_result.borrow_mut() = Some(None);
        }
    }

    fn deliver(&self, msg: Message) {
        let inner = &self.inner;
        let correlation = msg.correlation();
        if self.is_client() && correlation != 0 {
            let pending = inner.transactions.borrow_mut().remove(&correlation);
            match pending {
                Some(Pending::Sync) => *inner.sync_result.borrow_mut() = Some(Some(msg)),
                Some(Pending::Async(callback)) => callback(&inner.event_loop, Some(msg)),
                None => {
                    debug!(session = %inner.id, correlation, "response to abandoned request dropped");
                }
            }
            return;
        }

        let handler = inner.receive_handler.borrow().clone();
        let handler = handler.or_else(|| self.service().and_then(|s| s.receive_handler()));
        match handler {
            Some(handler) => handler(&inner.event_loop, self, msg),
            None => {
                warn!(session = %inner.id, msg_id = msg.msg_id(), "no receive handler, message dropped");
            }
        }
    }

    fn service(&self) -> Option<Rc<ServiceInner>> {
        match &self.inner.role {
            Role::Server { service, .. } => service.upgrade(),
            Role::Client { .. } => None,
        }
    }

    pub(crate) fn close_with(&self, reason: CloseReason) {
        let inner = &self.inner;
        let draining = inner.hung_up.replace(false);
        let prev = inner.state.get();
        if prev == SessionState::Closed || (prev == SessionState::Closing && !draining) {
            return;
        }
        let was_open = prev == SessionState::Open || draining;
        inner.state.set(SessionState::Closing);
        if reason.is_killed() {
            warn!(session = %inner.id, service = %inner.service_name, ?reason, "session killed");
        } else {
            info!(session = %inner.id, service = %inner.service_name, ?reason, "session closed");
        }

        self.detach();
        let unread = std::mem::take(&mut *inner.rx_queue.borrow_mut());
        for mut msg in unread {
            // Nobody can answer these any more.
            msg.take_reply();
        }
        let pending = std::mem::take(&mut *inner.transactions.borrow_mut());
        for (_, pending) in pending {
            match pending {
                Pending::Sync => *inner.sync_result.borrow_mut() = Some(None),
                Pending::Async(callback) => inner.event_loop.queue_function(move |l| callback(l, None)),
            }
        }
        inner.state.set(SessionState::Closed);

        if prev == SessionState::Connecting {
            let err = match reason {
                CloseReason::Local => SessionError::Closed,
                _ => SessionError::Handshake(inner.service_name.clone()),
            };
            self.finish_open(Err(err));
        }

        if was_open && reason != CloseReason::Local {
            let handler = inner.close_handler.borrow().clone();
            if let Some(handler) = handler {
                let session = self.clone();
                inner
                    .event_loop
                    .queue_function(move |l| handler(l, &session, reason));
            }
        }

        if let Role::Server { service, slot } = &inner.role {
            if let (Some(slot), Some(service)) = (slot.take(), service.upgrade()) {
                service.session_closed(slot, self, reason, was_open);
            }
        }
    }

    /// Stops all socket I/O and timers. Unsent frames are dropped.
    fn detach(&self) {
        let inner = &self.inner;
        if let Some(monitor) = inner.monitor.take() {
            inner.event_loop.remove_fd_monitor(monitor);
        }
        inner.socket.borrow_mut().take();
        inner.writable.set(false);
        inner.rx_paused.set(false);
        for timer in [inner.handshake_timer.take(), inner.connect_retry.take()]
            .into_iter()
            .flatten()
        {
            inner.event_loop.delete_timer(timer);
        }
        inner.tx_queue.borrow_mut().clear();
    }
}

/// Sends `msg` as the response travelling along `route`.
pub(crate) fn respond(route: &ReplyRoute, msg: Message) -> Result<(), SessionError> {
    let inner = route.session.upgrade().ok_or(SessionError::Closed)?;
    Session { inner }.transmit(msg, route.correlation)
}

/// A request was dropped unanswered: kill its session on the next pass.
pub(crate) fn unanswered(route: ReplyRoute) {
    let Some(inner) = route.session.upgrade() else {
        return;
    };
    if inner.state.get() != SessionState::Open {
        return;
    }
    let session = Session { inner };
    let event_loop = session.inner.event_loop.clone();
    event_loop.queue_function(move |_| {
        session.close_with(CloseReason::Killed(Violation::UnansweredRequest));
    });
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("service", &self.inner.service_name)
            .field("state", &self.inner.state.get())
            .field("client", &self.is_client())
            .finish_non_exhaustive()
    }
}
