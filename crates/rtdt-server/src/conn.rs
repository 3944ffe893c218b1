//! Per-address connection state.

use crate::peer::PeerSession;
use crate::time::AtomicTime;
use dashmap::DashMap;
use rtdt_core::{PeerId, SeqTracker};
use rtdt_crypto::aead::AeadKey;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::net::UdpSocket;

/// A remote address known to one listener.
///
/// Created pending (handshake reply sent, key derived) or established.
/// Holds the peer sessions bound through this address.
pub(crate) struct Conn {
    pub(crate) addr: SocketAddr,
    pub(crate) socket: Arc<UdpSocket>,
    pub(crate) session_key: Option<AeadKey>,

    pub(crate) last_read: AtomicTime,
    pub(crate) last_ping: AtomicTime,
    pub(crate) recv_seq: SeqTracker,
    send_seq: AtomicU32,
    ban_score: AtomicU64,

    is_pending: AtomicBool,
    pending_ciphertext: Mutex<Option<Arc<[u8]>>>,

    pub(crate) sessions: DashMap<PeerId, Arc<PeerSession>>,
}

impl Conn {
    /// Established connection without transport encryption.
    pub(crate) fn unencrypted(addr: SocketAddr, socket: Arc<UdpSocket>, now: Instant) -> Self {
        Self::build(addr, socket, None, None, now)
    }

    /// Connection waiting for the client to prove it holds `key`.
    pub(crate) fn pending(
        addr: SocketAddr,
        socket: Arc<UdpSocket>,
        key: AeadKey,
        ciphertext: Arc<[u8]>,
        now: Instant,
    ) -> Self {
        Self::build(addr, socket, Some(key), Some(ciphertext), now)
    }

    fn build(
        addr: SocketAddr,
        socket: Arc<UdpSocket>,
        session_key: Option<AeadKey>,
        ciphertext: Option<Arc<[u8]>>,
        now: Instant,
    ) -> Self {
        Self {
            addr,
            socket,
            session_key,
            last_read: AtomicTime::with_value(now, now),
            last_ping: AtomicTime::new(now),
            recv_seq: SeqTracker::new(),
            send_seq: AtomicU32::new(0),
            ban_score: AtomicU64::new(0),
            is_pending: AtomicBool::new(ciphertext.is_some()),
            pending_ciphertext: Mutex::new(ciphertext),
            sessions: DashMap::new(),
        }
    }

    /// Next outbound sequence number, starting at 1.
    pub(crate) fn next_send_seq(&self) -> u32 {
        self.send_seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    pub(crate) fn add_ban_score(&self, points: u64) {
        self.ban_score.fetch_add(points, Ordering::Relaxed);
    }

    pub(crate) fn ban_score(&self) -> u64 {
        self.ban_score.load(Ordering::Relaxed)
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.is_pending.load(Ordering::Acquire)
    }

    /// Handshake ciphertext while the connection is pending.
    pub(crate) fn pending_ciphertext(&self) -> Option<Arc<[u8]>> {
        if !self.is_pending() {
            return None;
        }
        self.pending_ciphertext
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Leave the pending state. Returns `true` only for the caller that made
    /// the transition.
    pub(crate) fn complete_handshake(&self) -> bool {
        let mut guard = self
            .pending_ciphertext
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let was_pending = guard.take().is_some();
        self.is_pending.store(false, Ordering::Release);
        was_pending
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("addr", &self.addr)
            .field("encrypted", &self.session_key.is_some())
            .field("pending", &self.is_pending())
            .field("ban_score", &self.ban_score())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::rngs::OsRng;

    pub(crate) async fn test_socket() -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap())
    }

    #[tokio::test]
    async fn test_send_seq_starts_at_one() {
        let conn = Conn::unencrypted("127.0.0.1:9".parse().unwrap(), test_socket().await, Instant::now());
        assert_eq!(conn.next_send_seq(), 1);
        assert_eq!(conn.next_send_seq(), 2);
    }

    #[tokio::test]
    async fn test_pending_transition() {
        let ct: Arc<[u8]> = Arc::from(vec![7u8; 16]);
        let conn = Conn::pending(
            "127.0.0.1:9".parse().unwrap(),
            test_socket().await,
            AeadKey::generate(&mut OsRng),
            ct.clone(),
            Instant::now(),
        );

        assert!(conn.is_pending());
        assert_eq!(conn.pending_ciphertext().as_deref(), Some(&ct[..]));

        assert!(conn.complete_handshake());
        assert!(!conn.is_pending());
        assert!(conn.pending_ciphertext().is_none());
        assert!(!conn.complete_handshake());
    }

    #[tokio::test]
    async fn test_unencrypted_is_established() {
        let conn = Conn::unencrypted("127.0.0.1:9".parse().unwrap(), test_socket().await, Instant::now());
        assert!(!conn.is_pending());
        assert!(conn.session_key.is_none());
        conn.add_ban_score(3);
        assert_eq!(conn.ban_score(), 3);
    }
}
