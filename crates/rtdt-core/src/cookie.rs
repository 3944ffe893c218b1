//! Join and rotation cookies.
//!
//! Cookies are minted by an external issuer holding the cookie key and are
//! opaque to clients. The relay only opens and validates them. Each kind is
//! sealed with its own associated-data label so a join cookie can never be
//! replayed as a rotation cookie or the reverse.
//!
//! Join cookie plaintext (97 bytes, big-endian):
//!
//! ```text
//! server_secret[32] | owner_secret[32] | size u32 | peer_id u32 |
//! end_timestamp i64 | payment_tag u64 | publish_allowance u64 | is_admin u8
//! ```
//!
//! Rotation cookie plaintext (116 bytes):
//!
//! ```text
//! server_secret[32] | old_owner_secret[32] | new_owner_secret[32] |
//! size u32 | timestamp i64 | payment_tag u64
//! ```

use crate::error::CookieError;
use crate::ids::PeerId;
use rtdt_crypto::CryptoError;
use rtdt_crypto::aead::AeadKey;

/// Join cookie plaintext size.
pub const JOIN_COOKIE_SIZE: usize = 97;

/// Rotation cookie plaintext size.
pub const ROTATE_COOKIE_SIZE: usize = 116;

const JOIN_COOKIE_AAD: &[u8] = b"rtdt join cookie v1";
const ROTATE_COOKIE_AAD: &[u8] = b"rtdt rotate cookie v1";

/// Sequential big-endian reader over a fixed-size plaintext.
struct Reader<'a> {
    b: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(b: &'a [u8]) -> Self {
        Self { b, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.b[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u32(&mut self) -> u32 {
        u32::from_be_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_be_bytes(self.take())
    }

    fn i64(&mut self) -> i64 {
        i64::from_be_bytes(self.take())
    }
}

fn check_len(b: &[u8], expected: usize) -> Result<(), CookieError> {
    if b.len() != expected {
        return Err(CookieError::InvalidLength {
            expected,
            actual: b.len(),
        });
    }
    Ok(())
}

/// Open with the current key, falling back to each retired key in order.
fn open_with_keys(
    sealed: &[u8],
    aad: &[u8],
    key: &AeadKey,
    old_keys: &[AeadKey],
) -> Result<Vec<u8>, CookieError> {
    std::iter::once(key)
        .chain(old_keys)
        .find_map(|k| k.open(sealed, aad).ok())
        .ok_or(CookieError::Decrypt)
}

/// Credential admitting one peer id into one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinCookie {
    /// Secret shared by every cookie the server issues for a session
    pub server_secret: [u8; 32],
    /// Secret chosen by the session owner
    pub owner_secret: [u8; 32],
    /// Session size (fan-out limit)
    pub size: u32,
    /// Peer id this cookie is bound to
    pub peer_id: PeerId,
    /// Unix timestamp after which the cookie is rejected
    pub end_timestamp: i64,
    /// Idempotency key of the backing payment
    pub payment_tag: u64,
    /// Bytes the payment allows the peer to relay
    pub publish_allowance: u64,
    /// Whether the peer may kick others and rotate the session
    pub is_admin: bool,
}

impl JoinCookie {
    /// Plaintext encoding.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; JOIN_COOKIE_SIZE] {
        let mut out = [0u8; JOIN_COOKIE_SIZE];
        out[0..32].copy_from_slice(&self.server_secret);
        out[32..64].copy_from_slice(&self.owner_secret);
        out[64..68].copy_from_slice(&self.size.to_be_bytes());
        out[68..72].copy_from_slice(&self.peer_id.0.to_be_bytes());
        out[72..80].copy_from_slice(&self.end_timestamp.to_be_bytes());
        out[80..88].copy_from_slice(&self.payment_tag.to_be_bytes());
        out[88..96].copy_from_slice(&self.publish_allowance.to_be_bytes());
        out[96] = u8::from(self.is_admin);
        out
    }

    /// Parse the plaintext encoding.
    ///
    /// # Errors
    ///
    /// Returns `CookieError::InvalidLength` on a size mismatch.
    pub fn from_bytes(b: &[u8]) -> Result<Self, CookieError> {
        check_len(b, JOIN_COOKIE_SIZE)?;
        let mut r = Reader::new(b);
        Ok(Self {
            server_secret: r.take(),
            owner_secret: r.take(),
            size: r.u32(),
            peer_id: PeerId(r.u32()),
            end_timestamp: r.i64(),
            payment_tag: r.u64(),
            publish_allowance: r.u64(),
            is_admin: r.take::<1>()[0] != 0,
        })
    }

    /// Seal under the cookie key.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if sealing fails.
    pub fn encrypt(&self, key: &AeadKey) -> Result<Vec<u8>, CryptoError> {
        key.seal(&self.to_bytes(), JOIN_COOKIE_AAD)
    }

    /// Open with `key` or any of `old_keys`.
    ///
    /// # Errors
    ///
    /// Returns `CookieError::Decrypt` if no key opens the cookie, or
    /// `CookieError::InvalidLength` for a malformed plaintext.
    pub fn decrypt(sealed: &[u8], key: &AeadKey, old_keys: &[AeadKey]) -> Result<Self, CookieError> {
        let plain = open_with_keys(sealed, JOIN_COOKIE_AAD, key, old_keys)?;
        Self::from_bytes(&plain)
    }
}

/// Credential moving a session to a new owner secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotateCookie {
    /// Server secret of the session
    pub server_secret: [u8; 32],
    /// Owner secret the session is currently derived from
    pub old_owner_secret: [u8; 32],
    /// Owner secret to derive the new session id from
    pub new_owner_secret: [u8; 32],
    /// Session size
    pub size: u32,
    /// Unix timestamp the cookie was minted at
    pub timestamp: i64,
    /// Idempotency key of the rotation payment
    pub payment_tag: u64,
}

impl RotateCookie {
    /// Plaintext encoding.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; ROTATE_COOKIE_SIZE] {
        let mut out = [0u8; ROTATE_COOKIE_SIZE];
        out[0..32].copy_from_slice(&self.server_secret);
        out[32..64].copy_from_slice(&self.old_owner_secret);
        out[64..96].copy_from_slice(&self.new_owner_secret);
        out[96..100].copy_from_slice(&self.size.to_be_bytes());
        out[100..108].copy_from_slice(&self.timestamp.to_be_bytes());
        out[108..116].copy_from_slice(&self.payment_tag.to_be_bytes());
        out
    }

    /// Parse the plaintext encoding.
    ///
    /// # Errors
    ///
    /// Returns `CookieError::InvalidLength` on a size mismatch.
    pub fn from_bytes(b: &[u8]) -> Result<Self, CookieError> {
        check_len(b, ROTATE_COOKIE_SIZE)?;
        let mut r = Reader::new(b);
        Ok(Self {
            server_secret: r.take(),
            old_owner_secret: r.take(),
            new_owner_secret: r.take(),
            size: r.u32(),
            timestamp: r.i64(),
            payment_tag: r.u64(),
        })
    }

    /// Seal under the cookie key.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if sealing fails.
    pub fn encrypt(&self, key: &AeadKey) -> Result<Vec<u8>, CryptoError> {
        key.seal(&self.to_bytes(), ROTATE_COOKIE_AAD)
    }

    /// Open with `key` or any of `old_keys`.
    ///
    /// # Errors
    ///
    /// Returns `CookieError::Decrypt` if no key opens the cookie, or
    /// `CookieError::InvalidLength` for a malformed plaintext.
    pub fn decrypt(sealed: &[u8], key: &AeadKey, old_keys: &[AeadKey]) -> Result<Self, CookieError> {
        let plain = open_with_keys(sealed, ROTATE_COOKIE_AAD, key, old_keys)?;
        Self::from_bytes(&plain)
    }
}
