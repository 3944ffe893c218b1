//! Stable numeric error codes carried in command replies.
//!
//! Values never change between versions so that clients can branch on them.

use std::fmt;

/// Error code reported to clients in join, kick, leave and rotate replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorCode {
    /// Success, or disclosure disabled
    #[default]
    NoError,
    /// Join cookie failed to decrypt
    JoinCookieInvalid,
    /// Join cookie was minted for another peer id
    JoinCookieWrongPeerId,
    /// Join cookie end timestamp has passed
    JoinCookieExpired,
    /// Join cookie payment already redeemed elsewhere
    JoinCookiePaymentReused,
    /// Caller is not bound in a session
    SourcePeerNotInSession,
    /// Caller is not a session admin
    SourcePeerNotAdmin,
    /// Kick target is not bound in the caller's session
    TargetPeerNotInSession,
    /// Caller is banned from the session
    Banned,
    /// Rotation cookie failed to decrypt
    InvalidRotCookie,
    /// Rotation cookie lifetime has passed
    ExpiredRotCookie,
    /// Rotation cookie names a different current session
    MismatchedOldSessId,
    /// Rotation cookie payment tag already redeemed
    AlreadyUsedRotCookie,
    /// Code not known to this version
    Unknown(u64),
}

impl ErrorCode {
    /// Wire value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        match self {
            Self::NoError => 0,
            Self::JoinCookieInvalid => 0x1_0000_0001,
            Self::JoinCookieWrongPeerId => 0x1_0000_0002,
            Self::JoinCookieExpired => 0x1_0000_0003,
            Self::JoinCookiePaymentReused => 0x1_0000_0004,
            Self::SourcePeerNotInSession => 0x1_0000_0005,
            Self::SourcePeerNotAdmin => 0x1_0000_0006,
            Self::TargetPeerNotInSession => 0x1_0000_0007,
            Self::Banned => 0x1_0000_0008,
            Self::InvalidRotCookie => 0x1_0000_0009,
            Self::ExpiredRotCookie => 0x1_0000_000a,
            Self::MismatchedOldSessId => 0x1_0000_000b,
            Self::AlreadyUsedRotCookie => 0x1_0000_000c,
            Self::Unknown(v) => v,
        }
    }

    /// Parse a wire value.
    #[must_use]
    pub const fn from_u64(v: u64) -> Self {
        match v {
            0 => Self::NoError,
            0x1_0000_0001 => Self::JoinCookieInvalid,
            0x1_0000_0002 => Self::JoinCookieWrongPeerId,
            0x1_0000_0003 => Self::JoinCookieExpired,
            0x1_0000_0004 => Self::JoinCookiePaymentReused,
            0x1_0000_0005 => Self::SourcePeerNotInSession,
            0x1_0000_0006 => Self::SourcePeerNotAdmin,
            0x1_0000_0007 => Self::TargetPeerNotInSession,
            0x1_0000_0008 => Self::Banned,
            0x1_0000_0009 => Self::InvalidRotCookie,
            0x1_0000_000a => Self::ExpiredRotCookie,
            0x1_0000_000b => Self::MismatchedOldSessId,
            0x1_0000_000c => Self::AlreadyUsedRotCookie,
            other => Self::Unknown(other),
        }
    }

    /// Returns `true` for [`ErrorCode::NoError`].
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::NoError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoError => "no error",
            Self::JoinCookieInvalid => "invalid join cookie",
            Self::JoinCookieWrongPeerId => "join cookie for wrong peer id",
            Self::JoinCookieExpired => "join cookie expired",
            Self::JoinCookiePaymentReused => "join cookie payment reused",
            Self::SourcePeerNotInSession => "source peer not in session",
            Self::SourcePeerNotAdmin => "source peer not session admin",
            Self::TargetPeerNotInSession => "target peer not in session",
            Self::Banned => "peer is banned from session",
            Self::InvalidRotCookie => "invalid rotate cookie",
            Self::ExpiredRotCookie => "expired rotate cookie",
            Self::MismatchedOldSessId => "rotate cookie old session id mismatch",
            Self::AlreadyUsedRotCookie => "rotate cookie already used",
            Self::Unknown(v) => return write!(f, "unknown error code {v:#x}"),
        };
        f.write_str(s)
    }
}

impl From<u64> for ErrorCode {
    fn from(v: u64) -> Self {
        Self::from_u64(v)
    }
}

impl From<ErrorCode> for u64 {
    fn from(code: ErrorCode) -> Self {
        code.as_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ErrorCode::NoError.as_u64(), 0);
        assert_eq!(ErrorCode::JoinCookieInvalid.as_u64(), 0x100000001);
        assert_eq!(ErrorCode::Banned.as_u64(), 0x100000008);
        assert_eq!(ErrorCode::AlreadyUsedRotCookie.as_u64(), 0x10000000c);
    }

    #[test]
    fn test_known_codes_parse_back() {
        for v in (0x1_0000_0001u64..=0x1_0000_000c).chain([0]) {
            let code = ErrorCode::from_u64(v);
            assert!(!matches!(code, ErrorCode::Unknown(_)), "{v:#x}");
            assert_eq!(code.as_u64(), v);
        }
    }

    #[test]
    fn test_unknown_code() {
        let code = ErrorCode::from_u64(0x2_0000_0000);
        assert_eq!(code, ErrorCode::Unknown(0x2_0000_0000));
        assert_eq!(code.to_string(), "unknown error code 0x200000000");
    }
}
