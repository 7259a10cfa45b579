//! Session wire format.
//!
//! One frame per `SOCK_SEQPACKET` datagram, all integers little endian:
//!
//! ```text
//! ┌────────────────┬────────────────┬────────────────┬────────────────┐
//! │ Proto hash (4) │ Msg ID (4)     │ Correlation (4)│ Payload len (4)│
//! ├────────────────┴────────────────┴────────────────┴────────────────┤
//! │ Payload (payload len bytes)                                       │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Correlation 0 marks a one-way message; anything else is a request or
//! the response to one. An attached fd rides as `SCM_RIGHTS` ancillary data.
//!
//! # Handshake
//!
//! The first frame each way is a handshake frame. Handshake message ids are
//! only interpreted before the session is open, so they don't take any ids
//! away from user protocols.
//!
//! - HELLO (client → server): `max payload (4) | protocol name`
//! - WELCOME (server → client): `negotiated max payload (4)`, the minimum of
//!   both sides
//! - REJECT (server → client): `reason (1)`, after which the server closes

use thiserror::Error;

/// Size of the fixed frame header.
pub const HEADER_SIZE: usize = 16;

/// Longest protocol name a HELLO may carry.
pub const MAX_PROTOCOL_NAME: usize = 128;

/// Largest handshake payload.
pub const MAX_HANDSHAKE_PAYLOAD: usize = 4 + MAX_PROTOCOL_NAME;

/// Message ids of handshake frames.
pub mod msg_id {
    pub const HELLO: u32 = 0xFFFF_FF01;
    pub const WELCOME: u32 = 0xFFFF_FF02;
    pub const REJECT: u32 = 0xFFFF_FF03;
}

/// Errors decoding a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Datagram shorter than the data it must contain.
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
    /// Header payload length disagrees with the datagram.
    #[error("payload length {declared} does not match {actual} bytes received")]
    LengthMismatch { declared: usize, actual: usize },
    /// A frame that should have been a handshake frame wasn't.
    #[error("unexpected handshake message id 0x{0:08x}")]
    UnknownHandshake(u32),
    /// Protocol name is too long or not UTF-8.
    #[error("invalid protocol name in handshake")]
    InvalidName,
}

/// Decoded fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub protocol_hash: u32,
    pub msg_id: u32,
    pub correlation: u32,
    pub payload_len: u32,
}

/// Writer for encoding frames.
struct FrameWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> FrameWriter<'a> {
    fn new(buf: &'a mut Vec<u8>) -> Self {
        buf.clear();
        Self { buf }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Write the header with a placeholder length and return its position.
    fn write_header(&mut self, protocol_hash: u32, msg_id: u32, correlation: u32) -> usize {
        self.put_u32(protocol_hash);
        self.put_u32(msg_id);
        self.put_u32(correlation);
        let len_pos = self.buf.len();
        self.put_u32(0);
        len_pos
    }

    /// Patch the payload length after writing the payload.
    fn patch_length(&mut self, len_pos: usize) {
        // Payloads are bounded by the protocol max, far below u32::MAX.
        let payload_len = (self.buf.len() - HEADER_SIZE) as u32;
        self.buf[len_pos..len_pos + 4].copy_from_slice(&payload_len.to_le_bytes());
    }
}

/// Reader for decoding frames.
struct FrameReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> FrameReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    const fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        if self.remaining() < n {
            return Err(FrameError::BufferTooSmall {
                need: n,
                have: self.remaining(),
            });
        }
        let bytes = &self.buf[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(bytes)
    }

    fn take_u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32, FrameError> {
        let mut arr = [0u8; 4];
        arr.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(arr))
    }

    fn rest(&mut self) -> &'a [u8] {
        let bytes = &self.buf[self.cursor..];
        self.cursor = self.buf.len();
        bytes
    }
}

/// Encode a user frame into `buf`, replacing its contents.
pub fn encode_frame(
    buf: &mut Vec<u8>,
    protocol_hash: u32,
    msg_id: u32,
    correlation: u32,
    payload: &[u8],
) {
    let mut w = FrameWriter::new(buf);
    let len_pos = w.write_header(protocol_hash, msg_id, correlation);
    w.put_bytes(payload);
    w.patch_length(len_pos);
}

/// Split a datagram into header and payload.
pub fn decode_frame(bytes: &[u8]) -> Result<(FrameHeader, &[u8]), FrameError> {
    let mut r = FrameReader::new(bytes);
    let header = FrameHeader {
        protocol_hash: r.take_u32()?,
        msg_id: r.take_u32()?,
        correlation: r.take_u32()?,
        payload_len: r.take_u32()?,
    };
    let payload = r.rest();
    if payload.len() != header.payload_len as usize {
        return Err(FrameError::LengthMismatch {
            declared: header.payload_len as usize,
            actual: payload.len(),
        });
    }
    Ok((header, payload))
}

/// Why a server turned a client away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    /// Protocol name or hash differs from the service's.
    ProtocolMismatch = 0x01,
    /// The service is no longer taking sessions.
    Unavailable = 0x02,
    /// Generic/unknown error.
    Unknown = 0xFF,
}

impl From<u8> for RejectReason {
    fn from(v: u8) -> Self {
        match v {
            0x01 => Self::ProtocolMismatch,
            0x02 => Self::Unavailable,
            _ => Self::Unknown,
        }
    }
}

/// Handshake frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    Hello { max_payload: u32, protocol: String },
    Welcome { max_payload: u32 },
    Reject(RejectReason),
}

impl Handshake {
    /// Encode into `buf`, replacing its contents.
    pub fn encode(&self, protocol_hash: u32, buf: &mut Vec<u8>) {
        let mut w = FrameWriter::new(buf);
        match self {
            Self::Hello {
                max_payload,
                protocol,
            } => {
                let len_pos = w.write_header(protocol_hash, msg_id::HELLO, 0);
                w.put_u32(*max_payload);
                w.put_bytes(protocol.as_bytes());
                w.patch_length(len_pos);
            }
            Self::Welcome { max_payload } => {
                let len_pos = w.write_header(protocol_hash, msg_id::WELCOME, 0);
                w.put_u32(*max_payload);
                w.patch_length(len_pos);
            }
            Self::Reject(reason) => {
                let len_pos = w.write_header(protocol_hash, msg_id::REJECT, 0);
                w.put_u8(*reason as u8);
                w.patch_length(len_pos);
            }
        }
    }

    /// Decode the payload of a frame whose header was already split off.
    pub fn decode(header: &FrameHeader, payload: &[u8]) -> Result<Self, FrameError> {
        let mut r = FrameReader::new(payload);
        match header.msg_id {
            msg_id::HELLO => {
                let max_payload = r.take_u32()?;
                let name = r.rest();
                if name.len() > MAX_PROTOCOL_NAME {
                    return Err(FrameError::InvalidName);
                }
                let protocol = std::str::from_utf8(name)
                    .map_err(|_| FrameError::InvalidName)?
                    .to_owned();
                Ok(Self::Hello {
                    max_payload,
                    protocol,
                })
            }
            msg_id::WELCOME => Ok(Self::Welcome {
                max_payload: r.take_u32()?,
            }),
            msg_id::REJECT => Ok(Self::Reject(RejectReason::from(r.take_u8()?))),
            other => Err(FrameError::UnknownHandshake(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_little_endian() {
        let mut buf = Vec::new();
        encode_frame(&mut buf, 0x0403_0201, 7, 0x0c0b_0a09, b"ping");

        assert_eq!(
            &buf[..HEADER_SIZE],
            &[1, 2, 3, 4, 7, 0, 0, 0, 9, 10, 11, 12, 4, 0, 0, 0]
        );
        assert_eq!(&buf[HEADER_SIZE..], b"ping");
    }

    #[test]
    fn decode_splits_header_and_payload() {
        let mut buf = Vec::new();
        encode_frame(&mut buf, 0xabcd, 7, 3, b"ping");
        let (header, payload) = decode_frame(&buf).unwrap();

        assert_eq!(
            header,
            FrameHeader {
                protocol_hash: 0xabcd,
                msg_id: 7,
                correlation: 3,
                payload_len: 4,
            }
        );
        assert_eq!(payload, b"ping");
    }

    #[test]
    fn empty_request_is_valid() {
        let mut buf = Vec::new();
        encode_frame(&mut buf, 1, 0, 0, &[]);
        let (header, payload) = decode_frame(&buf).unwrap();

        assert_eq!(header.msg_id, 0);
        assert!(payload.is_empty());
    }

    #[test]
    fn short_datagram_is_rejected() {
        assert_eq!(
            decode_frame(&[0u8; 10]),
            Err(FrameError::BufferTooSmall { need: 4, have: 2 })
        );
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut buf = Vec::new();
        encode_frame(&mut buf, 1, 1, 0, b"abc");
        buf.push(0);

        assert_eq!(
            decode_frame(&buf),
            Err(FrameError::LengthMismatch {
                declared: 3,
                actual: 4
            })
        );
    }

    #[test]
    fn hello_carries_name_and_max() {
        let hello = Handshake::Hello {
            max_payload: 512,
            protocol: "echo".into(),
        };
        let mut buf = Vec::new();
        hello.encode(0x1234, &mut buf);

        let (header, payload) = decode_frame(&buf).unwrap();
        assert_eq!(header.msg_id, msg_id::HELLO);
        assert_eq!(header.protocol_hash, 0x1234);
        assert_eq!(Handshake::decode(&header, payload).unwrap(), hello);
    }

    #[test]
    fn reject_reason_survives_unknown_values() {
        let mut buf = Vec::new();
        Handshake::Reject(RejectReason::ProtocolMismatch).encode(0, &mut buf);
        let (header, payload) = decode_frame(&buf).unwrap();
        assert_eq!(
            Handshake::decode(&header, payload).unwrap(),
            Handshake::Reject(RejectReason::ProtocolMismatch)
        );

        assert_eq!(RejectReason::from(0x42), RejectReason::Unknown);
    }

    #[test]
    fn user_frame_is_not_a_handshake() {
        let mut buf = Vec::new();
        encode_frame(&mut buf, 0, 7, 0, b"");
        let (header, payload) = decode_frame(&buf).unwrap();

        assert_eq!(
            Handshake::decode(&header, payload),
            Err(FrameError::UnknownHandshake(7))
        );
    }

    #[test]
    fn oversized_name_is_rejected() {
        let hello = Handshake::Hello {
            max_payload: 1,
            protocol: "x".repeat(MAX_PROTOCOL_NAME + 1),
        };
        let mut buf = Vec::new();
        hello.encode(0, &mut buf);
        let (header, payload) = decode_frame(&buf).unwrap();

        assert_eq!(
            Handshake::decode(&header, payload),
            Err(FrameError::InvalidName)
        );
    }
}
