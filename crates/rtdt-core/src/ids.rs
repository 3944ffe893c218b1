//! Peer and session identifiers.

use rtdt_crypto::constant_time::ct_eq;
use std::fmt;

/// Caller-declared identity of a relay participant inside a session.
///
/// Zero is reserved for the server.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PeerId(pub u32);

impl PeerId {
    /// The server's own identity.
    pub const SERVER: PeerId = PeerId(0);

    /// Raw value.
    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Returns `true` for the reserved server identity.
    #[must_use]
    pub fn is_server(self) -> bool {
        self.0 == 0
    }

    /// Next identity, skipping the reserved zero value on wraparound.
    #[must_use]
    pub fn next(self) -> PeerId {
        match self.0.wrapping_add(1) {
            0 => PeerId(1),
            v => PeerId(v),
        }
    }
}

impl From<u32> for PeerId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({:08x})", self.0)
    }
}

/// Server-internal session identifier, derived by keyed hash.
///
/// Equality is constant-time.
#[derive(Clone, Copy, Default, Hash)]
pub struct SessionId([u8; 32]);

impl SessionId {
    /// Create from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl PartialEq for SessionId {
    fn eq(&self, other: &Self) -> bool {
        ct_eq(&self.0, &other.0)
    }
}

impl Eq for SessionId {}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", hex::encode(&self.0[..8]))
    }
}
