//! Redeemed payments.
//!
//! A join cookie carries a payment tag and an allowance. The first redemption
//! of a tag creates the payment; later redemptions (re-joins, other peers
//! holding a copy of the cookie) share the same remaining allowance. Rotation
//! cookies are single use and tracked in a separate ledger.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// A redeemed payment with a shared remaining allowance.
#[derive(Debug)]
pub(crate) struct Payment {
    pub(crate) tag: u64,
    /// Unix seconds after which the payment is dropped from the ledger
    pub(crate) end_timestamp: i64,
    remaining: AtomicI64,
}

impl Payment {
    pub(crate) fn new(tag: u64, allowance: u64, end_timestamp: i64) -> Self {
        Self {
            tag,
            end_timestamp,
            remaining: AtomicI64::new(i64::try_from(allowance).unwrap_or(i64::MAX)),
        }
    }

    pub(crate) fn remaining(&self) -> i64 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Subtract `n`, returning the new remaining allowance.
    pub(crate) fn deduct(&self, n: i64) -> i64 {
        self.remaining.fetch_sub(n, Ordering::AcqRel) - n
    }
}

/// Global ledgers of redeemed join payments and rotation tags.
#[derive(Debug, Default)]
pub(crate) struct PaymentLedger {
    payments: DashMap<u64, Arc<Payment>>,
    rot_payments: DashMap<u64, i64>,
}

impl PaymentLedger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Redeem a join payment, reusing the existing payment for a known tag.
    pub(crate) fn redeem(&self, tag: u64, allowance: u64, end_timestamp: i64) -> Arc<Payment> {
        self.payments
            .entry(tag)
            .or_insert_with(|| Arc::new(Payment::new(tag, allowance, end_timestamp)))
            .clone()
    }

    /// Redeem a rotation tag. Returns `false` if it was already used.
    pub(crate) fn redeem_rotation(&self, tag: u64, end_timestamp: i64) -> bool {
        match self.rot_payments.entry(tag) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(end_timestamp);
                true
            }
        }
    }

    /// Drop payments and rotation tags that expired before `now`.
    ///
    /// Returns the number of payments and rotation tags dropped.
    pub(crate) fn sweep(&self, now: i64) -> (usize, usize) {
        let payments_before = self.payments.len();
        self.payments.retain(|tag, p| {
            let keep = p.end_timestamp >= now;
            if !keep {
                tracing::trace!("Dropping payment tag {tag} from redeemed payments table");
            }
            keep
        });

        let rot_before = self.rot_payments.len();
        self.rot_payments.retain(|tag, end| {
            let keep = *end >= now;
            if !keep {
                tracing::trace!("Dropping payment tag {tag} from redeemed rotation payments");
            }
            keep
        });

        (
            payments_before.saturating_sub(self.payments.len()),
            rot_before.saturating_sub(self.rot_payments.len()),
        )
    }

    pub(crate) fn len(&self) -> usize {
        self.payments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redeem_reuses_tag() {
        let ledger = PaymentLedger::new();
        let a = ledger.redeem(1, 100, 10);
        let b = ledger.redeem(1, 5000, 99);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.remaining(), 100);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_rotation_single_use() {
        let ledger = PaymentLedger::new();
        assert!(ledger.redeem_rotation(7, 100));
        assert!(!ledger.redeem_rotation(7, 100));
        assert!(ledger.redeem_rotation(8, 100));
    }

    #[test]
    fn test_sweep_drops_expired() {
        let ledger = PaymentLedger::new();
        ledger.redeem(1, 100, 10);
        ledger.redeem(2, 100, 50);
        ledger.redeem_rotation(3, 10);
        ledger.redeem_rotation(4, 50);

        assert_eq!(ledger.sweep(20), (1, 1));
        assert_eq!(ledger.len(), 1);
        assert!(!ledger.redeem_rotation(4, 50));
        assert!(ledger.redeem_rotation(3, 50));
    }

    #[test]
    fn test_deduct() {
        let p = Payment::new(1, 100, 0);
        assert_eq!(p.deduct(30), 70);
        assert_eq!(p.deduct(80), -10);
        assert_eq!(p.remaining(), -10);
    }

    #[test]
    fn test_huge_allowance_clamps() {
        let p = Payment::new(1, u64::MAX, 0);
        assert_eq!(p.remaining(), i64::MAX);
    }
}
