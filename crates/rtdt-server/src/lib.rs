//! # RTDT Server
//!
//! Relay engine for the RTDT (Real-Time Data Transfer) protocol.
//!
//! Peers send each frame once to the server over UDP and the server fans it
//! out to every other peer bound to the same session. Admission is by join
//! cookie; relayed bytes are charged against the payments carried by those
//! cookies.
//!
//! This crate provides:
//! - UDP listeners with a KEM handshake and per-datagram AEAD sealing
//! - The session table: join, leave, kick/ban and session id rotation
//! - Byte allowance metering against redeemed payments
//! - Background loops: stale connection sweep, payment expiry, membership
//!   listings, kernel queue statistics and traffic reports
//!
//! ## Example
//!
//! ```rust,no_run
//! use rtdt_server::{Server, ServerConfig};
//!
//! # async fn example() -> Result<(), rtdt_server::ServerError> {
//! let config = ServerConfig::with_listen_addr("0.0.0.0:7010".parse().unwrap());
//! let server = Server::bind(config).await?;
//!
//! let token = server.shutdown_token();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     token.cancel();
//! });
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod commands;
mod config;
mod conn;
mod error;
mod kernel_stats;
mod listener;
mod payment;
mod peer;
mod server;
mod session;
mod stats;
mod time;

pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use kernel_stats::{KernelStatsTracker, NullKernelStatsTracker, UdpProcStats};
pub use server::Server;
pub use stats::{
    FWD_DELAY_BUCKETS_US, HistogramSnapshot, ListenerStats, StatsSnapshot, format_bytes,
    format_count, format_rate,
};
