//! Per-thread cooperative event loops, safe references and local-socket
//! messaging with fd passing.
//!
//! - [`event_loop`]: one `!Send` loop per thread dispatching fd readiness,
//!   timers, events and queued calls from a FIFO ready list.
//! - [`handle`]: generational tables issuing opaque references that never
//!   alias a pointer and go stale on delete.
//! - [`messaging`]: sessions over Unix `SOCK_SEQPACKET` sockets with a
//!   protocol handshake, request/response and fd passing.

pub mod config;
pub mod event_loop;
pub mod handle;
pub mod messaging;
mod trace;

pub use config::ConfigError;
pub use event_loop::{EventLoop, LoopConfig, LoopError, LoopHandle, LoopThread, LoopThreadConfig};
pub use handle::{HandleError, HandleMap, SafeRef};
pub use messaging::{
    CloseReason, Message, MessagingConfig, PathDirectory, Protocol, Service, ServiceDirectory,
    Session, SessionError,
};
pub use trace::init_tracing;

// Re-export serde traits for typed payloads.
pub use serde::{Deserialize, Serialize};
