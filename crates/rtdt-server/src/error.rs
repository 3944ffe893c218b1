//! Error types for the relay server.
//!
//! Errors raised while handling a datagram are never fatal: the read loop
//! logs them (when configured) and raises the ban score of the offending
//! connection. Only socket failures and setup problems end `Server::run`.

use rtdt_core::ErrorCode;
use rtdt_core::error::{CommandError, FrameError};
use rtdt_crypto::CryptoError;
use std::borrow::Cow;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the relay server
#[derive(Debug, Error)]
pub enum ServerError {
    // ============ Client-visible errors ============
    /// Error with a stable code that may be disclosed in a reply
    #[error("{0}")]
    Coded(ErrorCode),

    // ============ Local errors ============
    /// Ping arrived sooner than the minimum ping interval
    #[error("ping too recent (last ping {0:?} ago)")]
    PingTooRecent(Duration),

    /// Ping or pong payload too large
    #[error("ping payload too large ({0} bytes)")]
    PingTooLarge(usize),

    /// Connection read silence exceeded the maximum ping interval
    #[error("connection timed out")]
    ConnTimedOut,

    /// Connection reached the maximum ban score
    #[error("ban score reached")]
    BanScoreReached,

    /// Peer is not bound to a session on this connection
    #[error("peer not in session")]
    NotInSession,

    /// Peer re-joined a session with a different size
    #[error("session size mismatch (bound {bound}, requested {requested})")]
    SessionSizeMismatch {
        /// Size of the existing binding
        bound: usize,
        /// Size in the new cookie
        requested: usize,
    },

    /// Unknown command tag
    #[error("unknown command type {0}")]
    UnknownCommand(u8),

    /// Command that clients may not send or with a malformed payload
    #[error("invalid command: {0}")]
    InvalidCommand(Cow<'static, str>),

    /// Packet addressed to the server carried a non-zero target
    #[error("internal command with non-zero target")]
    NonZeroTarget,

    /// Outbound message larger than a sealed datagram can carry
    #[error("message too large to send ({0} bytes)")]
    MessageTooLarge(usize),

    // ============ Setup errors ============
    /// Invalid configuration
    #[error("invalid config: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// `Server::run` was called twice
    #[error("server already running")]
    AlreadyRunning,

    /// A server task panicked or was aborted
    #[error("server task failed: {0}")]
    TaskFailed(Cow<'static, str>),

    /// Kernel statistics unavailable
    #[error("kernel stats: {0}")]
    KernelStats(Cow<'static, str>),

    // ============ Wrapped errors ============
    /// Socket I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Malformed frame
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

impl ServerError {
    /// Code to disclose in a reply for this error.
    ///
    /// Local errors have no wire code and map to `NoError`.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Coded(code) => *code,
            _ => ErrorCode::NoError,
        }
    }
}

impl From<ErrorCode> for ServerError {
    fn from(code: ErrorCode) -> Self {
        Self::Coded(code)
    }
}

impl From<CommandError> for ServerError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::UnknownType(t) => Self::UnknownCommand(t),
            other => Self::InvalidCommand(other.to_string().into()),
        }
    }
}

/// Result type for server operations
pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            ServerError::from(ErrorCode::Banned).error_code(),
            ErrorCode::Banned
        );
        assert_eq!(ServerError::NotInSession.error_code(), ErrorCode::NoError);
        assert_eq!(
            ServerError::PingTooLarge(65).error_code(),
            ErrorCode::NoError
        );
    }

    #[test]
    fn test_command_error_conversion() {
        assert!(matches!(
            ServerError::from(CommandError::UnknownType(42)),
            ServerError::UnknownCommand(42)
        ));
        assert!(matches!(
            ServerError::from(CommandError::Empty),
            ServerError::InvalidCommand(_)
        ));
    }

    #[test]
    fn test_display() {
        let err = ServerError::Coded(ErrorCode::JoinCookieExpired);
        assert_eq!(err.to_string(), "join cookie expired");
    }
}
