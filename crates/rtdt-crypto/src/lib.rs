//! # RTDT Crypto
//!
//! Cryptographic primitives for the RTDT relay.
//!
//! This crate provides:
//! - ML-KEM-768 key encapsulation for the transport handshake
//! - `XChaCha20-Poly1305` sealing of datagrams and cookies
//! - Keyed BLAKE3 derivation of server-internal session identifiers
//! - Constant-time comparison helpers
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Encapsulation | ML-KEM-768 | NIST level 3 |
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | Session ID | keyed BLAKE3 | 128-bit collision |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod constant_time;
pub mod error;
pub mod hash;
pub mod kem;

pub use error::CryptoError;

/// Bytes added by sealing a message with a random nonce prefix
pub const SEAL_OVERHEAD: usize = aead::NONCE_SIZE + aead::TAG_SIZE;
