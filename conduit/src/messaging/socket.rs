//! Non-blocking Unix `SOCK_SEQPACKET` sockets with fd passing.
//!
//! Sequenced-packet sockets keep datagram boundaries, so one `send` is one
//! frame on the other side, while still being connection oriented: a peer
//! hanging up shows up as a zero-length read.

use std::io::{self, IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::Path;

use rustix::io::Errno;
use rustix::net::{
    self, AddressFamily, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, ReturnFlags,
    SendAncillaryBuffer, SendAncillaryMessage, SendFlags, SocketAddrUnix, SocketFlags, SocketType,
};

/// Credentials of the process on the other end, captured at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

/// Result of receiving one datagram.
#[derive(Debug)]
pub enum Received {
    /// A datagram of `len` bytes.
    Packet {
        len: usize,
        /// First fd passed with the datagram.
        fd: Option<OwnedFd>,
        /// More than one fd arrived, or the control data was cut short.
        extra_fds: bool,
        /// The datagram did not fit the buffer.
        truncated: bool,
    },
    /// The peer closed its end.
    Closed,
}

/// A non-blocking sequenced-packet socket.
pub struct SeqPacket {
    fd: OwnedFd,
}

impl SeqPacket {
    /// Creates a listening socket at `path`, replacing a stale socket file.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created, bound or listened on.
    pub fn listen(path: &Path, backlog: i32) -> io::Result<Self> {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let fd = net::socket_with(
            AddressFamily::UNIX,
            SocketType::SEQPACKET,
            SocketFlags::NONBLOCK | SocketFlags::CLOEXEC,
            None,
        )?;
        let addr = SocketAddrUnix::new(path)?;
        net::bind(&fd, &addr)?;
        net::listen(&fd, backlog)?;
        Ok(Self { fd })
    }

    /// Connects to a listening socket at `path` without blocking.
    ///
    /// Returns `Ok(None)` while the listener's backlog is full; the caller
    /// retries later. A Unix socket connect never stays in progress, so a
    /// returned socket is already connected.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing listens at `path`.
    pub fn try_connect(path: &Path) -> io::Result<Option<Self>> {
        let fd = net::socket_with(
            AddressFamily::UNIX,
            SocketType::SEQPACKET,
            SocketFlags::NONBLOCK | SocketFlags::CLOEXEC,
            None,
        )?;
        let addr = SocketAddrUnix::new(path)?;
        match net::connect(&fd, &addr) {
            Ok(()) => Ok(Some(Self { fd })),
            Err(Errno::AGAIN) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Accepts one pending connection, `Ok(None)` if none is waiting.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn try_accept(&self) -> io::Result<Option<Self>> {
        match net::accept_with(&self.fd, SocketFlags::NONBLOCK | SocketFlags::CLOEXEC) {
            Ok(fd) => Ok(Some(Self { fd })),
            Err(Errno::AGAIN) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Sends one datagram with an optional fd, `Ok(None)` if the socket
    /// buffer is full.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure; `BrokenPipe` if the peer is gone.
    pub fn try_send(&self, frame: &[u8], fd: Option<BorrowedFd<'_>>) -> io::Result<Option<usize>> {
        let fds = fd.map(|fd| [fd]);
        let mut space = [MaybeUninit::<u8>::uninit(); rustix::cmsg_space!(ScmRights(1))];
        let mut control = SendAncillaryBuffer::new(&mut space);
        if let Some(fds) = &fds {
            if !control.push(SendAncillaryMessage::ScmRights(fds)) {
                return Err(io::Error::other("control buffer too small for fd"));
            }
        }

        match net::sendmsg(
            &self.fd,
            &[IoSlice::new(frame)],
            &mut control,
            SendFlags::NOSIGNAL | SendFlags::DONTWAIT,
        ) {
            Ok(n) => Ok(Some(n)),
            Err(Errno::AGAIN) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Receives one datagram into `buf`, `Ok(None)` if nothing is queued.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn try_recv(&self, buf: &mut [u8]) -> io::Result<Option<Received>> {
        // Room for one fd plus one spare so a second one shows up as extra
        // rather than as truncated control data.
        let mut space = [MaybeUninit::<u8>::uninit(); rustix::cmsg_space!(ScmRights(2))];
        let mut control = RecvAncillaryBuffer::new(&mut space);

        let msg = match net::recvmsg(
            &self.fd,
            &mut [IoSliceMut::new(buf)],
            &mut control,
            RecvFlags::CMSG_CLOEXEC | RecvFlags::DONTWAIT,
        ) {
            Ok(msg) => msg,
            Err(Errno::AGAIN) => return Ok(None),
            Err(Errno::CONNRESET) => return Ok(Some(Received::Closed)),
            Err(e) => return Err(e.into()),
        };

        let mut fd = None;
        let mut extra_fds = msg.flags.contains(ReturnFlags::CTRUNC);
        for message in control.drain() {
            if let RecvAncillaryMessage::ScmRights(rights) = message {
                for received in rights {
                    if fd.is_none() {
                        fd = Some(received);
                    } else {
                        // Dropping closes it.
                        extra_fds = true;
                    }
                }
            }
        }

        let truncated = msg.flags.contains(ReturnFlags::TRUNC);
        if msg.bytes == 0 && fd.is_none() && !truncated {
            return Ok(Some(Received::Closed));
        }
        Ok(Some(Received::Packet {
            len: msg.bytes,
            fd,
            extra_fds,
            truncated,
        }))
    }

    /// Credentials of the connected peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is not connected.
    pub fn peer_credentials(&self) -> io::Result<PeerCredentials> {
        let cred = net::sockopt::socket_peercred(&self.fd)?;
        Ok(PeerCredentials {
            pid: cred.pid.as_raw_nonzero().get(),
            uid: cred.uid.as_raw(),
            gid: cred.gid.as_raw(),
        })
    }
}

impl AsFd for SeqPacket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for SeqPacket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl std::fmt::Debug for SeqPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeqPacket")
            .field("fd", &self.fd.as_raw_fd())
            .finish()
    }
}
