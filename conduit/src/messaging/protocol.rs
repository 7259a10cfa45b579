//! Protocol identity shared by both ends of a session.

use std::fmt;

use type_hash::TypeHash;

use super::frame::MAX_PROTOCOL_NAME;

/// Hard ceiling on a protocol's max payload. A frame must fit in one
/// datagram under the default socket buffer size.
pub const MAX_PAYLOAD_LIMIT: u32 = 64 * 1024;

/// A protocol: its name, a structural hash stamped on every frame, and the
/// largest payload a message may carry.
///
/// Two ends interoperate only if name and hash both match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Protocol {
    name: String,
    hash: u32,
    max_payload: u32,
}

impl Protocol {
    /// Creates a protocol with an explicit hash.
    ///
    /// # Panics
    ///
    /// Panics if `name` is empty or longer than [`MAX_PROTOCOL_NAME`], or if
    /// `max_payload` exceeds [`MAX_PAYLOAD_LIMIT`].
    #[must_use]
    pub fn new(name: impl Into<String>, hash: u32, max_payload: u32) -> Self {
        let name = name.into();
        assert!(
            !name.is_empty() && name.len() <= MAX_PROTOCOL_NAME,
            "protocol name must be 1..={MAX_PROTOCOL_NAME} bytes"
        );
        assert!(
            max_payload <= MAX_PAYLOAD_LIMIT,
            "max payload must be <= {MAX_PAYLOAD_LIMIT}"
        );
        Self {
            name,
            hash,
            max_payload,
        }
    }

    /// Creates a protocol whose hash is derived from the structure of `T`,
    /// so any change to the message schema changes the hash.
    ///
    /// # Panics
    ///
    /// Same conditions as [`Protocol::new`].
    #[must_use]
    pub fn of<T: TypeHash>(name: impl Into<String>, max_payload: u32) -> Self {
        let wide = T::type_hash();
        // Fold to the 32 bits carried on the wire.
        let hash = (wide ^ (wide >> 32)) as u32;
        Self::new(name, hash, max_payload)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn hash(&self) -> u32 {
        self.hash
    }

    #[must_use]
    pub const fn max_payload(&self) -> u32 {
        self.max_payload
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:08x}", self.name, self.hash)
    }
}
