//! Messages and the pools they are allocated from.

use std::cell::{Cell, RefCell};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::session::{self, ReplyRoute, SessionError};
use crate::trace::trace;

/// Errors from message allocation and payload access.
#[derive(Debug, Error)]
pub enum MessageError {
    /// Every message of the pool is in use.
    #[error("message pool '{pool}' exhausted ({capacity} messages)")]
    OutOfMemory { pool: String, capacity: usize },
    /// Payload larger than the session allows.
    #[error("payload of {len} bytes exceeds maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },
    /// Serializing a value into the payload failed.
    #[error("failed to encode payload: {0}")]
    Encode(postcard::Error),
    /// The payload does not hold a valid value of the requested type.
    #[error("failed to decode payload: {0}")]
    Decode(postcard::Error),
}

struct PoolInner {
    name: String,
    capacity: usize,
    in_use: Cell<usize>,
    spare: RefCell<Vec<Vec<u8>>>,
    buffer_size: usize,
}

/// Bounded pool of message buffers.
///
/// Each client session and each service owns one. Buffers are recycled when
/// messages are dropped or sent.
#[derive(Clone)]
pub struct MessagePool {
    inner: Rc<PoolInner>,
}

impl MessagePool {
    pub(crate) fn new(name: impl Into<String>, capacity: usize, buffer_size: usize) -> Self {
        Self {
            inner: Rc::new(PoolInner {
                name: name.into(),
                capacity,
                in_use: Cell::new(0),
                spare: RefCell::new(Vec::new()),
                buffer_size,
            }),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Messages currently allocated from this pool.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.inner.in_use.get()
    }

    pub(crate) fn alloc(&self) -> Result<Lease, MessageError> {
        if self.inner.in_use.get() >= self.inner.capacity {
            return Err(MessageError::OutOfMemory {
                pool: self.inner.name.clone(),
                capacity: self.inner.capacity,
            });
        }
        Ok(self.alloc_forced())
    }

    /// Allocates even past capacity. Inbound frames must land somewhere;
    /// the peer is bounded by its own pool.
    pub(crate) fn alloc_forced(&self) -> Lease {
        self.inner.in_use.set(self.inner.in_use.get() + 1);
        let buf = self
            .inner
            .spare
            .borrow_mut()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.inner.buffer_size));
        Lease {
            pool: Rc::clone(&self.inner),
            buf,
        }
    }
}

impl std::fmt::Debug for MessagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePool")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .field("in_use", &self.inner.in_use.get())
            .finish()
    }
}

/// A buffer checked out of a pool.
pub(crate) struct Lease {
    pool: Rc<PoolInner>,
    buf: Vec<u8>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.in_use.set(self.pool.in_use.get() - 1);
        let mut spare = self.pool.spare.borrow_mut();
        if spare.len() < self.pool.capacity {
            let mut buf = std::mem::take(&mut self.buf);
            buf.clear();
            spare.push(buf);
        }
    }
}

/// A message on a session.
///
/// Messages are single-owner: sending consumes them and dropping releases
/// them to their pool. A received request must be answered with
/// [`respond`](Self::respond); dropping it unanswered kills the session,
/// since the client would otherwise wait forever.
pub struct Message {
    msg_id: u32,
    correlation: u32,
    max_payload: usize,
    lease: Lease,
    outgoing_fd: Option<OwnedFd>,
    received_fd: Option<OwnedFd>,
    reply: Option<ReplyRoute>,
}

impl Message {
    pub(crate) fn new(lease: Lease, max_payload: usize) -> Self {
        Self {
            msg_id: 0,
            correlation: 0,
            max_payload,
            lease,
            outgoing_fd: None,
            received_fd: None,
            reply: None,
        }
    }

    pub(crate) fn received(
        mut lease: Lease,
        max_payload: usize,
        msg_id: u32,
        correlation: u32,
        payload: &[u8],
        fd: Option<OwnedFd>,
        reply: Option<ReplyRoute>,
    ) -> Self {
        lease.buf.clear();
        lease.buf.extend_from_slice(payload);
        Self {
            msg_id,
            correlation,
            max_payload,
            lease,
            outgoing_fd: None,
            received_fd: fd,
            reply,
        }
    }

    #[must_use]
    pub const fn msg_id(&self) -> u32 {
        self.msg_id
    }

    pub fn set_msg_id(&mut self, msg_id: u32) {
        self.msg_id = msg_id;
    }

    pub(crate) const fn correlation(&self) -> u32 {
        self.correlation
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.lease.buf
    }

    /// Largest payload this message may carry.
    #[must_use]
    pub const fn max_payload_size(&self) -> usize {
        self.max_payload
    }

    /// Replaces the payload.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::PayloadTooLarge`] if `bytes` does not fit;
    /// the payload is left unchanged.
    pub fn set_payload(&mut self, bytes: &[u8]) -> Result<(), MessageError> {
        if bytes.len() > self.max_payload {
            return Err(MessageError::PayloadTooLarge {
                len: bytes.len(),
                max: self.max_payload,
            });
        }
        self.lease.buf.clear();
        self.lease.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Serializes `value` as the payload with postcard.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the result does not fit.
    pub fn encode<T: Serialize>(&mut self, value: &T) -> Result<(), MessageError> {
        let bytes = postcard::to_allocvec(value).map_err(MessageError::Encode)?;
        self.set_payload(&bytes)
    }

    /// Deserializes the payload with postcard.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a valid `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, MessageError> {
        postcard::from_bytes(self.payload()).map_err(MessageError::Decode)
    }

    /// Attaches an fd to send with this message. Only one fd can be
    /// attached; a second one is handed back untouched.
    ///
    /// # Errors
    ///
    /// Returns `fd` if an fd is already attached.
    pub fn set_fd(&mut self, fd: OwnedFd) -> Result<(), OwnedFd> {
        if self.outgoing_fd.is_some() {
            return Err(fd);
        }
        self.outgoing_fd = Some(fd);
        Ok(())
    }

    /// Takes the fd that arrived with this message, if any. Later calls
    /// return `None`.
    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        self.received_fd.take()
    }

    /// Raw number of the received fd without taking it; `-1` if none.
    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.received_fd.as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }

    /// Whether this is a received request awaiting [`respond`](Self::respond).
    #[must_use]
    pub const fn needs_response(&self) -> bool {
        self.reply.is_some()
    }

    /// Sends this message back as the response to the request it carried.
    /// Payload, message id and attached fd are whatever they are now.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoResponseNeeded`] if this is not a received
    /// request, or [`SessionError::Closed`] if the session is gone.
    pub fn respond(mut self) -> Result<(), SessionError> {
        let route = self.reply.take().ok_or(SessionError::NoResponseNeeded)?;
        session::respond(&route, self)
    }

    pub(crate) fn take_reply(&mut self) -> Option<ReplyRoute> {
        self.reply.take()
    }

    pub(crate) fn take_outgoing_fd(&mut self) -> Option<OwnedFd> {
        self.outgoing_fd.take()
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if let Some(route) = self.reply.take() {
            trace!(msg_id = self.msg_id, "request dropped without response");
            session::unanswered(route);
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("msg_id", &self.msg_id)
            .field("correlation", &self.correlation)
            .field("len", &self.lease.buf.len())
            .field("outgoing_fd", &self.outgoing_fd)
            .field("received_fd", &self.received_fd)
            .field("needs_response", &self.reply.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::os::unix::net::UnixStream;

    fn message(pool: &MessagePool, max: usize) -> Message {
        Message::new(pool.alloc().unwrap(), max)
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        let pool = MessagePool::new("tiny", 2, 16);
        let a = pool.alloc().unwrap();
        let _b = pool.alloc().unwrap();

        assert!(matches!(
            pool.alloc(),
            Err(MessageError::OutOfMemory { capacity: 2, .. })
        ));
        drop(a);
        assert_eq!(pool.in_use(), 1);
        assert!(pool.alloc().is_ok());
    }

    #[test]
    fn forced_allocation_ignores_capacity() {
        let pool = MessagePool::new("forced", 1, 16);
        let _a = pool.alloc().unwrap();
        let _b = pool.alloc_forced();

        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn payload_is_bounded() {
        let pool = MessagePool::new("bounded", 1, 4);
        let mut msg = message(&pool, 4);

        msg.set_payload(b"ping").unwrap();
        assert!(matches!(
            msg.set_payload(b"pings"),
            Err(MessageError::PayloadTooLarge { len: 5, max: 4 })
        ));
        assert_eq!(msg.payload(), b"ping");
    }

    #[test]
    fn second_fd_is_always_rejected() {
        let pool = MessagePool::new("fds", 1, 0);
        let mut msg = message(&pool, 0);
        let (a, b) = UnixStream::pair().unwrap();

        assert!(msg.set_fd(OwnedFd::from(a)).is_ok());
        let back = msg.set_fd(OwnedFd::from(b)).unwrap_err();
        assert!(back.as_raw_fd() >= 0);
    }

    #[test]
    fn received_fd_is_taken_once() {
        let pool = MessagePool::new("rx", 1, 8);
        let (a, _b) = UnixStream::pair().unwrap();
        let raw = a.as_raw_fd();
        let mut msg = Message::received(pool.alloc_forced(), 8, 7, 0, b"x", Some(a.into()), None);

        assert_eq!(msg.raw_fd(), raw);
        assert!(msg.take_fd().is_some());
        assert!(msg.take_fd().is_none());
        assert_eq!(msg.raw_fd(), -1);
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Reading {
        sensor: u16,
        value: i32,
    }

    #[test]
    fn typed_payload_via_postcard() {
        let pool = MessagePool::new("typed", 1, 32);
        let mut msg = message(&pool, 32);
        let reading = Reading {
            sensor: 3,
            value: -40,
        };

        msg.encode(&reading).unwrap();
        assert_eq!(msg.decode::<Reading>().unwrap(), reading);
    }

    #[test]
    fn respond_on_fresh_message_is_an_error() {
        let pool = MessagePool::new("fresh", 1, 0);
        let msg = message(&pool, 0);

        assert!(!msg.needs_response());
        assert!(matches!(msg.respond(), Err(SessionError::NoResponseNeeded)));
    }
}
