//! Internal server commands.
//!
//! A command travels in the data of a framed packet addressed to the server
//! (`Target == 0`): one tag byte followed by a fixed per-command payload.
//! Replies and unsolicited reports come back with `Source == 0`.
//!
//! | Command | Payload |
//! |---------|---------|
//! | Ping / Pong | opaque, at most [`MAX_PING_PAYLOAD_SIZE`] bytes |
//! | JoinSession | sealed join cookie |
//! | JoinSessionReply | `err u64` |
//! | LeaveSession | empty |
//! | LeaveSessionReply | `err u64` |
//! | KickPeer | `target u32 \| ban_seconds u32` |
//! | KickPeerReply | `target u32 \| err u64` |
//! | MembersBitmap | serialized roaring bitmap of peer ids |
//! | RotateCookies | sealed rotation cookie |
//! | RotateCookiesReply | `err u64` |

use crate::MAX_PING_PAYLOAD_SIZE;
use crate::code::ErrorCode;
use crate::error::CommandError;
use crate::frame::FramedPacket;
use crate::ids::PeerId;

/// Command tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServerCmdType {
    /// Keepalive and RTT measurement
    Ping = 1,
    /// Response to a ping
    Pong = 2,
    /// Bind to a session with a join cookie
    JoinSession = 3,
    /// Result of a join
    JoinSessionReply = 4,
    /// Unbind from a session
    LeaveSession = 5,
    /// Result of a leave
    LeaveSessionReply = 6,
    /// Admin kick request, also sent to the kicked peer
    KickPeer = 7,
    /// Result of a kick
    KickPeerReply = 8,
    /// Current session membership
    MembersBitmap = 9,
    /// Admin session id rotation
    RotateCookies = 10,
    /// Result of a rotation
    RotateCookiesReply = 11,
}

impl TryFrom<u8> for ServerCmdType {
    type Error = CommandError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Ping),
            2 => Ok(Self::Pong),
            3 => Ok(Self::JoinSession),
            4 => Ok(Self::JoinSessionReply),
            5 => Ok(Self::LeaveSession),
            6 => Ok(Self::LeaveSessionReply),
            7 => Ok(Self::KickPeer),
            8 => Ok(Self::KickPeerReply),
            9 => Ok(Self::MembersBitmap),
            10 => Ok(Self::RotateCookies),
            11 => Ok(Self::RotateCookiesReply),
            other => Err(CommandError::UnknownType(other)),
        }
    }
}

/// Decoded server command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerCmd {
    /// Ping with opaque payload
    Ping(Vec<u8>),
    /// Pong echoing a ping payload
    Pong(Vec<u8>),
    /// Join request
    JoinSession {
        /// Sealed join cookie
        cookie: Vec<u8>,
    },
    /// Join result
    JoinSessionReply {
        /// Error code, zero when hidden or successful
        err: ErrorCode,
    },
    /// Leave request
    LeaveSession,
    /// Leave result
    LeaveSessionReply {
        /// Error code
        err: ErrorCode,
    },
    /// Kick request or kicked report
    KickPeer {
        /// Peer to remove
        target: PeerId,
        /// Ban duration, zero for no ban
        ban_seconds: u32,
    },
    /// Kick result
    KickPeerReply {
        /// Peer that was to be removed
        target: PeerId,
        /// Error code
        err: ErrorCode,
    },
    /// Membership listing
    MembersBitmap(Vec<u8>),
    /// Rotation request
    RotateCookies {
        /// Sealed rotation cookie
        cookie: Vec<u8>,
    },
    /// Rotation result
    RotateCookiesReply {
        /// Error code
        err: ErrorCode,
    },
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn read_u64(b: &[u8]) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[..8]);
    u64::from_be_bytes(a)
}

fn expect_len(cmd: &'static str, payload: &[u8], expected: usize) -> Result<(), CommandError> {
    if payload.len() != expected {
        return Err(CommandError::PayloadSize {
            cmd,
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn decode_err(cmd: &'static str, payload: &[u8]) -> Result<ErrorCode, CommandError> {
    expect_len(cmd, payload, 8)?;
    Ok(ErrorCode::from_u64(read_u64(payload)))
}

impl ServerCmd {
    /// Tag of this command.
    #[must_use]
    pub fn cmd_type(&self) -> ServerCmdType {
        match self {
            Self::Ping(_) => ServerCmdType::Ping,
            Self::Pong(_) => ServerCmdType::Pong,
            Self::JoinSession { .. } => ServerCmdType::JoinSession,
            Self::JoinSessionReply { .. } => ServerCmdType::JoinSessionReply,
            Self::LeaveSession => ServerCmdType::LeaveSession,
            Self::LeaveSessionReply { .. } => ServerCmdType::LeaveSessionReply,
            Self::KickPeer { .. } => ServerCmdType::KickPeer,
            Self::KickPeerReply { .. } => ServerCmdType::KickPeerReply,
            Self::MembersBitmap(_) => ServerCmdType::MembersBitmap,
            Self::RotateCookies { .. } => ServerCmdType::RotateCookies,
            Self::RotateCookiesReply { .. } => ServerCmdType::RotateCookiesReply,
        }
    }

    /// Decode a payload for the given tag.
    ///
    /// # Errors
    ///
    /// Returns `CommandError::PayloadSize` or `CommandError::PayloadTooLarge`
    /// when the payload does not fit the command layout.
    pub fn decode(cmd: ServerCmdType, payload: &[u8]) -> Result<Self, CommandError> {
        Ok(match cmd {
            ServerCmdType::Ping | ServerCmdType::Pong => {
                if payload.len() > MAX_PING_PAYLOAD_SIZE {
                    return Err(CommandError::PayloadTooLarge {
                        cmd: "ping",
                        max: MAX_PING_PAYLOAD_SIZE,
                        actual: payload.len(),
                    });
                }
                if cmd == ServerCmdType::Ping {
                    Self::Ping(payload.to_vec())
                } else {
                    Self::Pong(payload.to_vec())
                }
            }
            ServerCmdType::JoinSession => Self::JoinSession {
                cookie: payload.to_vec(),
            },
            ServerCmdType::JoinSessionReply => Self::JoinSessionReply {
                err: decode_err("join reply", payload)?,
            },
            ServerCmdType::LeaveSession => Self::LeaveSession,
            ServerCmdType::LeaveSessionReply => Self::LeaveSessionReply {
                err: decode_err("leave reply", payload)?,
            },
            ServerCmdType::KickPeer => {
                expect_len("kick", payload, 8)?;
                Self::KickPeer {
                    target: PeerId(read_u32(payload)),
                    ban_seconds: read_u32(&payload[4..]),
                }
            }
            ServerCmdType::KickPeerReply => {
                expect_len("kick reply", payload, 12)?;
                Self::KickPeerReply {
                    target: PeerId(read_u32(payload)),
                    err: ErrorCode::from_u64(read_u64(&payload[4..])),
                }
            }
            ServerCmdType::MembersBitmap => Self::MembersBitmap(payload.to_vec()),
            ServerCmdType::RotateCookies => Self::RotateCookies {
                cookie: payload.to_vec(),
            },
            ServerCmdType::RotateCookiesReply => Self::RotateCookiesReply {
                err: decode_err("rotate reply", payload)?,
            },
        })
    }

    /// Append the payload (without the tag byte) to `out`.
    pub fn write_payload(&self, out: &mut Vec<u8>) {
        match self {
            Self::Ping(data) | Self::Pong(data) | Self::MembersBitmap(data) => {
                out.extend_from_slice(data);
            }
            Self::JoinSession { cookie } | Self::RotateCookies { cookie } => {
                out.extend_from_slice(cookie);
            }
            Self::JoinSessionReply { err }
            | Self::LeaveSessionReply { err }
            | Self::RotateCookiesReply { err } => {
                out.extend_from_slice(&err.as_u64().to_be_bytes());
            }
            Self::LeaveSession => {}
            Self::KickPeer {
                target,
                ban_seconds,
            } => {
                out.extend_from_slice(&target.0.to_be_bytes());
                out.extend_from_slice(&ban_seconds.to_be_bytes());
            }
            Self::KickPeerReply { target, err } => {
                out.extend_from_slice(&target.0.to_be_bytes());
                out.extend_from_slice(&err.as_u64().to_be_bytes());
            }
        }
    }

    /// Wrap in a framed packet.
    #[must_use]
    pub fn to_packet(&self, target: PeerId, source: PeerId, sequence: u32) -> FramedPacket {
        let mut data = vec![self.cmd_type() as u8];
        self.write_payload(&mut data);
        FramedPacket {
            target,
            source,
            sequence,
            data,
        }
    }

    /// Decode the command carried by a framed packet.
    ///
    /// # Errors
    ///
    /// Returns a `CommandError` for a missing or unknown tag or a malformed
    /// payload.
    pub fn from_packet(pkt: &FramedPacket) -> Result<Self, CommandError> {
        let (cmd, payload) = pkt.server_cmd()?;
        Self::decode(cmd, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_stable() {
        assert_eq!(ServerCmdType::Ping as u8, 1);
        assert_eq!(ServerCmdType::MembersBitmap as u8, 9);
        assert_eq!(ServerCmdType::RotateCookiesReply as u8, 11);
        assert!(matches!(
            ServerCmdType::try_from(12),
            Err(CommandError::UnknownType(12))
        ));
    }

    #[test]
    fn test_kick_layout() {
        let cmd = ServerCmd::KickPeer {
            target: PeerId(0x0102_0304),
            ban_seconds: 60,
        };
        let pkt = cmd.to_packet(PeerId::SERVER, PeerId(9), 3);
        assert_eq!(pkt.data, vec![7, 1, 2, 3, 4, 0, 0, 0, 60]);
        assert_eq!(ServerCmd::from_packet(&pkt).unwrap(), cmd);
    }

    #[test]
    fn test_kick_reply_layout() {
        let cmd = ServerCmd::KickPeerReply {
            target: PeerId(2),
            err: ErrorCode::SourcePeerNotAdmin,
        };
        let mut payload = Vec::new();
        cmd.write_payload(&mut payload);
        assert_eq!(payload, vec![0, 0, 0, 2, 0, 0, 0, 1, 0, 0, 0, 6]);
        assert_eq!(
            ServerCmd::decode(ServerCmdType::KickPeerReply, &payload).unwrap(),
            cmd
        );
    }

    #[test]
    fn test_reply_with_wrong_size() {
        assert!(matches!(
            ServerCmd::decode(ServerCmdType::JoinSessionReply, &[0; 4]),
            Err(CommandError::PayloadSize {
                expected: 8,
                actual: 4,
                ..
            })
        ));
    }

    #[test]
    fn test_ping_payload_limit() {
        let ok = vec![1u8; MAX_PING_PAYLOAD_SIZE];
        assert_eq!(
            ServerCmd::decode(ServerCmdType::Ping, &ok).unwrap(),
            ServerCmd::Ping(ok)
        );

        let big = vec![1u8; MAX_PING_PAYLOAD_SIZE + 1];
        assert!(matches!(
            ServerCmd::decode(ServerCmdType::Pong, &big),
            Err(CommandError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_empty_packet() {
        let pkt = FramedPacket::default();
        assert!(matches!(
            ServerCmd::from_packet(&pkt),
            Err(CommandError::Empty)
        ));
    }
}
