//! Local-socket messaging between event loops.
//!
//! A server [`Service::advertise`]s a name in a [`ServiceDirectory`]; a
//! client creates a [`Session`] for that name and opens it. After a
//! handshake that checks both ends speak the same [`Protocol`], either side
//! exchanges [`Message`]s: one-way sends, or requests the server answers
//! with [`Message::respond`]. A message may carry one file descriptor.
//!
//! Sessions and services belong to the [`EventLoop`](crate::event_loop::EventLoop)
//! they were created on. Everything they report (received messages, close
//! notifications, open outcomes) arrives through that loop's handlers.

pub mod frame;

mod directory;
mod message;
mod protocol;
mod service;
mod session;
mod socket;

pub use directory::{
    DirectoryError, MAX_SERVICE_NAME, PathDirectory, ServiceDirectory, TransportAddr,
};
pub use frame::{FrameError, RejectReason};
pub use message::{Message, MessageError, MessagePool};
pub use protocol::{MAX_PAYLOAD_LIMIT, Protocol};
pub use service::{Service, ServiceError, ServiceHandler, ServiceHandlerRef, SessionRef};
pub use session::{CloseReason, Session, SessionError, SessionId, SessionState, Violation};
pub use socket::{PeerCredentials, Received, SeqPacket};

use std::time::Duration;

use crate::config::ConfigError;

/// Configuration shared by client sessions and services.
#[derive(Debug, Clone)]
pub struct MessagingConfig {
    /// Messages a client session or a service can have allocated at once.
    pub pool_capacity: usize,
    /// How long a session may stay in the handshake.
    pub handshake_timeout: Duration,
    /// Pending-connection backlog of a service's listening socket.
    pub listen_backlog: i32,
    /// Received messages a session queues before it stops reading its
    /// socket. Not applied while a synchronous request waits.
    pub rx_queue_limit: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 64,
            handshake_timeout: Duration::from_secs(5),
            listen_backlog: 16,
            rx_queue_limit: 16,
        }
    }
}

impl MessagingConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_capacity == 0 {
            return Err(ConfigError::new("pool_capacity", "must be > 0"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::new("handshake_timeout", "must be > 0"));
        }
        if self.listen_backlog <= 0 {
            return Err(ConfigError::new("listen_backlog", "must be > 0"));
        }
        if self.rx_queue_limit == 0 {
            return Err(ConfigError::new("rx_queue_limit", "must be > 0"));
        }
        Ok(())
    }
}
