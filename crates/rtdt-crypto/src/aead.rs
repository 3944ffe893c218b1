//! `XChaCha20-Poly1305` AEAD sealing.
//!
//! Every sealed message in RTDT (transport datagrams and cookies) uses the
//! same layout:
//!
//! ```text
//! nonce (24 bytes) || ciphertext || tag (16 bytes)
//! ```
//!
//! The nonce is drawn fresh from the OS RNG for every message. The 192-bit
//! nonce space makes random collisions negligible, so no per-key counter
//! state is needed and concurrent writers can share one key.
//!
//! ## Usage
//!
//! ```ignore
//! use rtdt_crypto::aead::AeadKey;
//!
//! let key = AeadKey::generate(&mut OsRng);
//! let mut sealed = Vec::new();
//! key.seal_into(b"frame", b"", &mut sealed)?;
//!
//! let mut plain = [0u8; 64];
//! let n = key.open_into(&sealed, b"", &mut plain)?;
//! assert_eq!(&plain[..n], b"frame");
//! ```

use crate::CryptoError;
use chacha20poly1305::{
    XChaCha20Poly1305,
    aead::{AeadInPlace, KeyInit},
};
use rand_core::{CryptoRng, OsRng, RngCore};
use zeroize::ZeroizeOnDrop;

/// Authentication tag size (16 bytes / 128 bits).
pub const TAG_SIZE: usize = 16;

/// XChaCha20-Poly1305 nonce size (24 bytes / 192 bits).
pub const NONCE_SIZE: usize = 24;

/// AEAD key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce (24 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a nonce from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generate a random nonce.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Get raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    fn as_generic(&self) -> &chacha20poly1305::XNonce {
        chacha20poly1305::XNonce::from_slice(&self.0)
    }
}

/// Authentication tag (16 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tag([u8; TAG_SIZE]);

impl Tag {
    /// Create a tag from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; TAG_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; TAG_SIZE] {
        &self.0
    }
}

/// AEAD encryption key (32 bytes).
///
/// Used both as a per-connection transport key (the KEM shared secret) and
/// as the cookie key. Key is zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if slice length is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_SIZE] =
            slice
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_SIZE,
                    actual: slice.len(),
                })?;
        Ok(Self(bytes))
    }

    /// Parse a key from its hex encoding.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyMaterial` if the string is not hex, or
    /// `CryptoError::InvalidKeyLength` if it does not decode to 32 bytes.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let raw = hex::decode(s.trim()).map_err(|_| CryptoError::InvalidKeyMaterial)?;
        Self::from_slice(&raw)
    }

    /// Generate a random key.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Get raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with extreme care - this exposes the raw key material.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Hex encoding of the key.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Encrypt in-place, returning the authentication tag.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if AEAD encryption fails.
    pub fn encrypt_in_place(
        &self,
        nonce: &Nonce,
        buffer: &mut [u8],
        aad: &[u8],
    ) -> Result<Tag, CryptoError> {
        let cipher = XChaCha20Poly1305::new((&self.0).into());

        let tag = cipher
            .encrypt_in_place_detached(nonce.as_generic(), aad, buffer)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut tag_bytes = [0u8; TAG_SIZE];
        tag_bytes.copy_from_slice(&tag);
        Ok(Tag(tag_bytes))
    }

    /// Decrypt in-place, verifying the authentication tag.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` on authentication failure.
    pub fn decrypt_in_place(
        &self,
        nonce: &Nonce,
        buffer: &mut [u8],
        tag: &Tag,
        aad: &[u8],
    ) -> Result<(), CryptoError> {
        let cipher = XChaCha20Poly1305::new((&self.0).into());

        cipher
            .decrypt_in_place_detached(
                nonce.as_generic(),
                aad,
                buffer,
                chacha20poly1305::Tag::from_slice(&tag.0),
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Seal `plaintext` under a fresh random nonce, writing
    /// `nonce || ciphertext || tag` into `out`.
    ///
    /// `out` is cleared first; its capacity is reused so callers on the hot
    /// path can keep one scratch buffer per task.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if AEAD encryption fails.
    pub fn seal_into(
        &self,
        plaintext: &[u8],
        aad: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), CryptoError> {
        let nonce = Nonce::generate(&mut OsRng);

        out.clear();
        out.extend_from_slice(nonce.as_bytes());
        out.extend_from_slice(plaintext);
        let tag = self.encrypt_in_place(&nonce, &mut out[NONCE_SIZE..], aad)?;
        out.extend_from_slice(tag.as_bytes());
        Ok(())
    }

    /// Open a `nonce || ciphertext || tag` message into `out`, returning the
    /// plaintext length.
    ///
    /// # Errors
    ///
    /// - `CryptoError::SealedTooShort` if `sealed` cannot hold nonce and tag
    /// - `CryptoError::BufferTooSmall` if `out` cannot hold the plaintext
    /// - `CryptoError::DecryptionFailed` on authentication failure
    pub fn open_into(
        &self,
        sealed: &[u8],
        aad: &[u8],
        out: &mut [u8],
    ) -> Result<usize, CryptoError> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::SealedTooShort(sealed.len()));
        }

        let (nonce_bytes, rest) = sealed.split_at(NONCE_SIZE);
        let (ciphertext, tag_bytes) = rest.split_at(rest.len() - TAG_SIZE);
        let nonce = Nonce::from_bytes(
            nonce_bytes
                .try_into()
                .map_err(|_| CryptoError::SealedTooShort(sealed.len()))?,
        );
        let tag = Tag::from_bytes(
            tag_bytes
                .try_into()
                .map_err(|_| CryptoError::SealedTooShort(sealed.len()))?,
        );

        let n = ciphertext.len();
        if out.len() < n {
            return Err(CryptoError::BufferTooSmall {
                needed: n,
                available: out.len(),
            });
        }

        out[..n].copy_from_slice(ciphertext);
        self.decrypt_in_place(&nonce, &mut out[..n], &tag, aad)?;
        Ok(n)
    }

    /// Seal into a newly allocated buffer.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if AEAD encryption fails.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut out = Vec::with_capacity(plaintext.len() + NONCE_SIZE + TAG_SIZE);
        self.seal_into(plaintext, aad, &mut out)?;
        Ok(out)
    }

    /// Open into a newly allocated buffer.
    ///
    /// # Errors
    ///
    /// See [`AeadKey::open_into`].
    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut out = vec![0u8; sealed.len().saturating_sub(NONCE_SIZE + TAG_SIZE)];
        let n = self.open_into(sealed, aad, &mut out)?;
        out.truncate(n);
        Ok(out)
    }
}

impl std::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AeadKey(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = AeadKey::generate(&mut OsRng);
        let mut sealed = Vec::new();
        key.seal_into(b"hello relay", b"aad", &mut sealed).unwrap();

        assert_eq!(sealed.len(), 11 + NONCE_SIZE + TAG_SIZE);

        let mut out = [0u8; 64];
        let n = key.open_into(&sealed, b"aad", &mut out).unwrap();
        assert_eq!(&out[..n], b"hello relay");
    }

    #[test]
    fn test_fresh_nonce_per_message() {
        let key = AeadKey::generate(&mut OsRng);
        let a = key.seal(b"same", b"").unwrap();
        let b = key.seal(b"same", b"").unwrap();

        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_open_tampered_fails() {
        let key = AeadKey::generate(&mut OsRng);
        let mut sealed = key.seal(b"payload", b"").unwrap();
        sealed[NONCE_SIZE] ^= 0xFF;

        assert!(matches!(
            key.open(&sealed, b""),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_open_wrong_aad_fails() {
        let key = AeadKey::generate(&mut OsRng);
        let sealed = key.seal(b"payload", b"join").unwrap();
        assert!(key.open(&sealed, b"rotate").is_err());
    }

    #[test]
    fn test_open_wrong_key_fails() {
        let key = AeadKey::generate(&mut OsRng);
        let other = AeadKey::generate(&mut OsRng);
        let sealed = key.seal(b"payload", b"").unwrap();
        assert!(other.open(&sealed, b"").is_err());
    }

    #[test]
    fn test_open_short_input() {
        let key = AeadKey::generate(&mut OsRng);
        let short = [0u8; NONCE_SIZE + TAG_SIZE - 1];

        assert!(matches!(
            key.open_into(&short, b"", &mut [0u8; 8]),
            Err(CryptoError::SealedTooShort(39))
        ));
    }

    #[test]
    fn test_open_empty_plaintext() {
        let key = AeadKey::generate(&mut OsRng);
        let sealed = key.seal(b"", b"").unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + TAG_SIZE);
        assert!(key.open(&sealed, b"").unwrap().is_empty());
    }

    #[test]
    fn test_open_into_small_buffer() {
        let key = AeadKey::generate(&mut OsRng);
        let sealed = key.seal(&[7u8; 32], b"").unwrap();

        let err = key.open_into(&sealed, b"", &mut [0u8; 16]).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::BufferTooSmall {
                needed: 32,
                available: 16
            }
        ));
    }

    #[test]
    fn test_key_hex_roundtrip() {
        let key = AeadKey::generate(&mut OsRng);
        let parsed = AeadKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(key.as_bytes(), parsed.as_bytes());
    }

    #[test]
    fn test_key_from_hex_wrong_length() {
        assert!(matches!(
            AeadKey::from_hex("abcd"),
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 2
            })
        ));
        assert!(AeadKey::from_hex("zz").is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = AeadKey::new([0x42; KEY_SIZE]);
        assert_eq!(format!("{key:?}"), "AeadKey(<redacted>)");
    }
}
