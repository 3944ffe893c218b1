//! # RTDT Core
//!
//! Wire protocol for the RTDT (Real-Time Data Transfer) relay.
//!
//! This crate provides:
//! - The framed packet codec (12-byte header, in-place rewriting)
//! - The receive-side sequence window tracker
//! - Internal server command payloads
//! - Join and rotation cookie encodings
//! - Stable numeric error codes carried in command replies
//!
//! ## Packet Layout
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬─────────────────────┐
//! │ Target (u32) │ Source (u32) │ Seq (u32)    │ Data (variable)     │
//! └──────────────┴──────────────┴──────────────┴─────────────────────┘
//! ```
//!
//! All fields are big-endian. `Target == 0` addresses the server; a packet
//! with `Source == Target` carries session data to be relayed.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod code;
pub mod command;
pub mod cookie;
pub mod error;
pub mod frame;
pub mod ids;
pub mod seq;

pub use code::ErrorCode;
pub use command::{ServerCmd, ServerCmdType};
pub use cookie::{JoinCookie, RotateCookie};
pub use error::Error;
pub use frame::{FramedPacket, FramedPktBuf};
pub use ids::{PeerId, SessionId};
pub use seq::{SeqTracker, SeqWindow};

/// Framed packet header size in bytes
pub const HEADER_SIZE: usize = 12;

/// Maximum size of a single datagram, sealed or not
pub const MAX_MESSAGE_SIZE: usize = 1 << 16;

/// Maximum payload accepted in ping and pong commands
pub const MAX_PING_PAYLOAD_SIZE: usize = 64;
