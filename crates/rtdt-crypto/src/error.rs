//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Sealed input is shorter than nonce plus tag
    #[error("sealed message too short: {0} bytes")]
    SealedTooShort(usize),

    /// Output buffer cannot hold the result
    #[error("output buffer too small: need {needed}, have {available}")]
    BufferTooSmall {
        /// Bytes required
        needed: usize,
        /// Bytes available
        available: usize,
    },

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// KEM ciphertext could not be parsed
    #[error("invalid KEM ciphertext length: {0}")]
    InvalidCiphertext(usize),

    /// Invalid key material (corrupted or wrong format)
    #[error("invalid key material")]
    InvalidKeyMaterial,

    /// Key file could not be read or written
    #[error("key file error: {0}")]
    KeyFile(#[from] std::io::Error),
}
