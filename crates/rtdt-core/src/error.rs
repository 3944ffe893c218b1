//! Error types for the RTDT wire protocol.

use thiserror::Error;

/// Core protocol errors
#[derive(Debug, Error)]
pub enum Error {
    /// Frame parsing error
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Server command parsing error
    #[error("command error: {0}")]
    Command(#[from] CommandError),

    /// Cookie decoding error
    #[error("cookie error: {0}")]
    Cookie(#[from] CookieError),

    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] rtdt_crypto::CryptoError),
}

/// Frame-level errors
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame too short to parse
    #[error("frame too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Frame larger than a datagram can carry
    #[error("frame too large: max {max}, got {actual}")]
    TooLarge {
        /// Maximum size
        max: usize,
        /// Actual size
        actual: usize,
    },
}

/// Server command errors
#[derive(Debug, Error)]
pub enum CommandError {
    /// Packet carries no command tag
    #[error("empty command payload")]
    Empty,

    /// Unknown command tag
    #[error("unknown server cmd type {0}")]
    UnknownType(u8),

    /// Payload has the wrong size for its command
    #[error("{cmd} payload: expected {expected} bytes, got {actual}")]
    PayloadSize {
        /// Command name
        cmd: &'static str,
        /// Expected size
        expected: usize,
        /// Actual size
        actual: usize,
    },

    /// Payload exceeds the command maximum
    #[error("{cmd} payload too large: max {max}, got {actual}")]
    PayloadTooLarge {
        /// Command name
        cmd: &'static str,
        /// Maximum size
        max: usize,
        /// Actual size
        actual: usize,
    },
}

/// Cookie errors
#[derive(Debug, Error)]
pub enum CookieError {
    /// No configured key opened the cookie
    #[error("cookie could not be decrypted with any key")]
    Decrypt,

    /// Decrypted plaintext has the wrong size
    #[error("invalid cookie length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected size
        expected: usize,
        /// Actual size
        actual: usize,
    },
}
