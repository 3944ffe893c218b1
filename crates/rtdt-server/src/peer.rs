//! Binding of one peer id, on one connection, into one session.

use crate::conn::Conn;
use crate::payment::Payment;
use crate::session::Session;
use rtdt_core::PeerId;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A peer bound into a session through a connection.
pub(crate) struct PeerSession {
    pub(crate) peer_id: PeerId,
    pub(crate) session: Arc<Session>,
    pub(crate) conn: Arc<Conn>,
    /// Fan-out limit carried by the join cookie
    pub(crate) size: usize,
    pub(crate) is_admin: bool,
    payments: Mutex<Vec<Arc<Payment>>>,
}

impl PeerSession {
    pub(crate) fn new(
        peer_id: PeerId,
        session: Arc<Session>,
        conn: Arc<Conn>,
        size: usize,
        is_admin: bool,
    ) -> Self {
        Self {
            peer_id,
            session,
            conn,
            size,
            is_admin,
            payments: Mutex::new(Vec::new()),
        }
    }

    fn payments(&self) -> MutexGuard<'_, Vec<Arc<Payment>>> {
        self.payments.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Same binding moved to another connection, keeping the payments.
    ///
    /// The payment list is a snapshot: a payment the old binding exhausts
    /// afterwards stays listed here until this binding spills past it.
    pub(crate) fn moved_to(&self, conn: Arc<Conn>, is_admin: bool) -> Self {
        Self {
            peer_id: self.peer_id,
            session: self.session.clone(),
            conn,
            size: self.size,
            is_admin,
            payments: Mutex::new(self.payments().clone()),
        }
    }

    /// Attach a payment. A payment already attached under the same tag is
    /// not added twice, and an overdrawn one is not added at all.
    pub(crate) fn add_payment(&self, payment: Arc<Payment>) {
        if payment.remaining() < 0 {
            return;
        }
        let mut payments = self.payments();
        if payments.iter().any(|p| p.tag == payment.tag) {
            return;
        }
        payments.push(payment);
    }

    /// Charge `n` bytes against the attached payments.
    ///
    /// Either the full amount is charged or nothing is: when the remaining
    /// allowances do not cover `n` the payments are left untouched. Payments
    /// driven below zero are detached and their overdraft carried to the
    /// next one.
    pub(crate) fn deduct_allowance(&self, n: i64) -> bool {
        let mut payments = self.payments();

        let total = payments
            .iter()
            .map(|p| p.remaining().max(0))
            .fold(0i64, i64::saturating_add);
        if total < n {
            return false;
        }

        let mut n = n;
        while n > 0 && !payments.is_empty() {
            let left = payments[0].deduct(n);
            if left >= 0 {
                return true;
            }
            payments.remove(0);
            // Debt the payment already carried is never charged again
            n = (-left).min(n);
        }
        false
    }

    #[cfg(test)]
    pub(crate) fn payment_count(&self) -> usize {
        self.payments().len()
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer_id", &self.peer_id)
            .field("addr", &self.conn.addr)
            .field("size", &self.size)
            .field("is_admin", &self.is_admin)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::tests::test_socket;
    use rtdt_core::SessionId;
    use std::time::Instant;

    async fn peer_session() -> PeerSession {
        let conn = Arc::new(Conn::unencrypted(
            "127.0.0.1:9".parse().unwrap(),
            test_socket().await,
            Instant::now(),
        ));
        let sess = Arc::new(Session::new(SessionId::from_bytes([1; 32])));
        PeerSession::new(PeerId(1), sess, conn, 4, false)
    }

    #[tokio::test]
    async fn test_allowance_spans_payments() {
        let ps = peer_session().await;
        ps.add_payment(Arc::new(Payment::new(1, 100, 0)));
        ps.add_payment(Arc::new(Payment::new(2, 50, 0)));

        assert!(ps.deduct_allowance(120));
        assert_eq!(ps.payment_count(), 1);

        // 30 left, nothing is charged
        assert!(!ps.deduct_allowance(40));
        assert_eq!(ps.payment_count(), 1);
        assert!(ps.deduct_allowance(30));
    }

    #[tokio::test]
    async fn test_exact_drain_keeps_payment() {
        let ps = peer_session().await;
        let p = Arc::new(Payment::new(1, 100, 0));
        ps.add_payment(p.clone());

        assert!(ps.deduct_allowance(100));
        assert_eq!(p.remaining(), 0);
        assert!(!ps.deduct_allowance(1));
    }

    #[tokio::test]
    async fn test_no_payments() {
        let ps = peer_session().await;
        assert!(!ps.deduct_allowance(1));
    }

    #[tokio::test]
    async fn test_add_payment_dedups_tag() {
        let ps = peer_session().await;
        let p = Arc::new(Payment::new(9, 100, 0));
        ps.add_payment(p.clone());
        ps.add_payment(p);
        assert_eq!(ps.payment_count(), 1);
        assert!(!ps.deduct_allowance(150));
    }

    #[tokio::test]
    async fn test_shared_payment() {
        let a = peer_session().await;
        let b = peer_session().await;
        let p = Arc::new(Payment::new(3, 100, 0));
        a.add_payment(p.clone());
        b.add_payment(p.clone());

        assert!(a.deduct_allowance(60));
        assert!(!b.deduct_allowance(60));
        assert!(b.deduct_allowance(40));
        assert_eq!(p.remaining(), 0);
    }

    #[tokio::test]
    async fn test_rejoin_does_not_reattach_overdrawn_payment() {
        let ps = peer_session().await;
        let first = Arc::new(Payment::new(1, 100, 0));
        let second = Arc::new(Payment::new(2, 50, 0));
        ps.add_payment(first.clone());
        ps.add_payment(second.clone());

        assert!(ps.deduct_allowance(120));
        assert!(first.remaining() < 0);
        assert_eq!(second.remaining(), 30);

        // Same cookie joined again hands back the overdrawn payment
        ps.add_payment(first.clone());
        assert_eq!(ps.payment_count(), 1);

        let third = Arc::new(Payment::new(3, 100, 0));
        ps.add_payment(third.clone());
        // 30 from the second payment, the remaining 10 from the third
        assert!(ps.deduct_allowance(40));
        assert_eq!(third.remaining(), 90);
        assert_eq!(ps.payment_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_overdrawn_payment_charges_only_the_packet() {
        let ps = peer_session().await;
        let stale = Arc::new(Payment::new(1, 10, 0));
        let live = Arc::new(Payment::new(2, 100, 0));
        ps.add_payment(stale.clone());
        ps.add_payment(live.clone());

        // Overdrawn through another binding holding the same payment
        stale.deduct(50);
        assert!(ps.deduct_allowance(20));
        assert_eq!(live.remaining(), 80);
        assert_eq!(ps.payment_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_deductions_never_overspend() {
        use std::sync::atomic::{AtomicU64, Ordering};

        let ps = peer_session().await;
        ps.add_payment(Arc::new(Payment::new(1, 1000, 0)));
        ps.add_payment(Arc::new(Payment::new(2, 500, 0)));

        let accepted = AtomicU64::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..50 {
                        if ps.deduct_allowance(10) {
                            accepted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        assert_eq!(accepted.load(Ordering::Relaxed), 150);
        assert!(!ps.deduct_allowance(1));
    }

    #[tokio::test]
    async fn test_moved_keeps_payments() {
        let ps = peer_session().await;
        ps.add_payment(Arc::new(Payment::new(1, 10, 0)));
        let other = Arc::new(Conn::unencrypted(
            "127.0.0.1:10".parse().unwrap(),
            test_socket().await,
            Instant::now(),
        ));
        let moved = ps.moved_to(other, true);
        assert_eq!(moved.payment_count(), 1);
        assert!(moved.deduct_allowance(10));
    }
}
