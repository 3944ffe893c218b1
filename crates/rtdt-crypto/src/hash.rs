//! Keyed BLAKE3 derivation of server-internal session identifiers.
//!
//! The hasher key is generated once per server instance and never leaves the
//! process, so session identifiers cannot be predicted from the public
//! cookie contents.

use rand_core::{CryptoRng, RngCore};
use zeroize::ZeroizeOnDrop;

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Derives session identifiers from `(owner secret, server secret, size)`.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SessionHasher {
    key: [u8; 32],
}

impl SessionHasher {
    /// Create a hasher with a random key.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut key = [0u8; 32];
        rng.fill_bytes(&mut key);
        Self { key }
    }

    /// Create a hasher with a fixed key.
    #[must_use]
    pub fn with_key(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Keyed hash of `server_secret || owner_secret || size_be`.
    #[must_use]
    pub fn session_id(
        &self,
        owner_secret: &[u8; 32],
        server_secret: &[u8; 32],
        size: u32,
    ) -> HashOutput {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        hasher.update(server_secret);
        hasher.update(owner_secret);
        hasher.update(&size.to_be_bytes());
        *hasher.finalize().as_bytes()
    }
}

impl std::fmt::Debug for SessionHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionHasher(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_session_id_deterministic() {
        let hasher = SessionHasher::with_key([1u8; 32]);
        let a = hasher.session_id(&[2u8; 32], &[3u8; 32], 4);
        let b = hasher.session_id(&[2u8; 32], &[3u8; 32], 4);
        assert_eq!(a, b);
    }

    #[test]
    fn test_session_id_depends_on_every_input() {
        let hasher = SessionHasher::generate(&mut OsRng);
        let base = hasher.session_id(&[2u8; 32], &[3u8; 32], 4);

        assert_ne!(base, hasher.session_id(&[9u8; 32], &[3u8; 32], 4));
        assert_ne!(base, hasher.session_id(&[2u8; 32], &[9u8; 32], 4));
        assert_ne!(base, hasher.session_id(&[2u8; 32], &[3u8; 32], 5));
    }

    #[test]
    fn test_owner_and_server_secrets_not_interchangeable() {
        let hasher = SessionHasher::generate(&mut OsRng);
        let a = hasher.session_id(&[2u8; 32], &[3u8; 32], 4);
        let b = hasher.session_id(&[3u8; 32], &[2u8; 32], 4);
        assert_ne!(a, b);
    }

    #[test]
    fn test_different_hasher_keys_diverge() {
        let a = SessionHasher::with_key([1u8; 32]).session_id(&[0u8; 32], &[0u8; 32], 2);
        let b = SessionHasher::with_key([2u8; 32]).session_id(&[0u8; 32], &[0u8; 32], 2);
        assert_ne!(a, b);
    }
}
