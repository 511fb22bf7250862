//! Per-node bandwidth ledger.
//!
//! Tracks one direction of a node's capacity (upload or download): the
//! available counter plus the open reservations keyed by (peer, block).
//! Crediting always removes the key first, so a reservation can only ever be
//! returned once no matter how many times release is called for it.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;

use crate::config::ReservationPolicy;

/// Slack allowed for floating point drift when crediting capacity back.
const CREDIT_TOLERANCE: f64 = 1e-6;

/// Identifies a reservation by the counterpart peer and block index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReservationKey {
    pub peer: String,
    pub block: u32,
}

impl ReservationKey {
    pub fn new(peer: impl Into<String>, block: u32) -> Self {
        Self {
            peer: peer.into(),
            block,
        }
    }
}

impl fmt::Display for ReservationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.peer, self.block)
    }
}

#[derive(Debug)]
struct LedgerState {
    available: f64,
    reservations: HashMap<ReservationKey, f64>,
}

/// Capacity counter with an attached reservation ledger.
///
/// Invariants held under the ledger lock:
/// - `0 <= available <= maximum`
/// - `available + sum(reservations) == maximum` (up to float drift)
#[derive(Debug)]
pub struct BandwidthLedger {
    maximum: f64,
    state: Mutex<LedgerState>,
}

impl BandwidthLedger {
    /// Creates a ledger with the full capacity available.
    pub fn new(maximum: f64) -> Self {
        let maximum = maximum.max(0.0);
        Self {
            maximum,
            state: Mutex::new(LedgerState {
                available: maximum,
                reservations: HashMap::new(),
            }),
        }
    }

    /// Maximum capacity in bytes per second.
    pub fn maximum(&self) -> f64 {
        self.maximum
    }

    /// Capacity not currently reserved.
    pub fn available(&self) -> f64 {
        self.state.lock().available
    }

    /// Capacity currently reserved.
    pub fn in_use(&self) -> f64 {
        (self.maximum - self.available()).max(0.0)
    }

    /// Number of open reservations.
    pub fn open_reservations(&self) -> usize {
        self.state.lock().reservations.len()
    }

    /// Sum of all open reservations.
    pub fn total_reserved(&self) -> f64 {
        self.state.lock().reservations.values().sum()
    }

    /// Sum of the open reservations held for one peer.
    pub fn reserved_for(&self, peer: &str) -> f64 {
        self.state
            .lock()
            .reservations
            .iter()
            .filter(|(key, _)| key.peer == peer)
            .map(|(_, amount)| amount)
            .sum()
    }

    /// Amount reserved under `key`, if any.
    pub fn reservation(&self, key: &ReservationKey) -> Option<f64> {
        self.state.lock().reservations.get(key).copied()
    }

    /// Upload-side grant applying the reservation policy.
    ///
    /// Computes `min(requested, maximum / cap, available)` and grants it only
    /// when positive and strictly above `maximum / floor`. Returns `None` for a
    /// refusal. A key that already holds a reservation is refused so the
    /// outstanding entry is never overwritten.
    pub fn grant(
        &self,
        key: ReservationKey,
        requested: f64,
        policy: &ReservationPolicy,
    ) -> Option<f64> {
        let mut state = self.state.lock();

        if state.reservations.contains_key(&key) {
            return None;
        }

        let reserved = requested
            .min(policy.cap(self.maximum))
            .min(state.available);

        if reserved > 0.0 && reserved > policy.floor(self.maximum) {
            state.available = (state.available - reserved).max(0.0);
            state.reservations.insert(key, reserved);
            Some(reserved)
        } else {
            None
        }
    }

    /// Download-side reservation of an amount already agreed with a peer.
    ///
    /// All or nothing: returns `false` without reserving when the key is
    /// already reserved, the amount is not positive, or it exceeds what is
    /// available.
    pub fn reserve(&self, key: ReservationKey, amount: f64) -> bool {
        let mut state = self.state.lock();

        if state.reservations.contains_key(&key) {
            return false;
        }
        if amount <= 0.0 || amount > state.available {
            return false;
        }

        state.available -= amount;
        state.reservations.insert(key, amount);
        true
    }

    /// Releases the reservation under `key` and credits it back.
    ///
    /// Returns the credited amount, or `None` when no reservation exists
    /// (already released or never granted).
    pub fn release(&self, key: &ReservationKey) -> Option<f64> {
        let mut state = self.state.lock();
        let amount = state.reservations.remove(key)?;

        let credited = state.available + amount;
        debug_assert!(
            credited <= self.maximum * (1.0 + CREDIT_TOLERANCE) + CREDIT_TOLERANCE,
            "double credit on {key}: {credited} exceeds maximum {}",
            self.maximum
        );
        state.available = credited.min(self.maximum);
        Some(amount)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn key(peer: &str, block: u32) -> ReservationKey {
        ReservationKey::new(peer, block)
    }

    #[test]
    fn test_grant_caps_at_quarter_of_maximum() {
        let ledger = BandwidthLedger::new(1200.0);
        let policy = ReservationPolicy::default();

        let granted = ledger.grant(key("a", 0), 10_000.0, &policy);
        assert_eq!(granted, Some(300.0));
        assert_eq!(ledger.available(), 900.0);
        assert_eq!(ledger.open_reservations(), 1);
    }

    #[test]
    fn test_grant_limited_by_requester_capacity() {
        let ledger = BandwidthLedger::new(1200.0);
        let policy = ReservationPolicy::default();

        assert_eq!(ledger.grant(key("a", 0), 250.0, &policy), Some(250.0));
        assert_eq!(ledger.available(), 950.0);
    }

    #[test]
    fn test_grant_refused_at_or_below_floor() {
        let ledger = BandwidthLedger::new(1200.0);
        let policy = ReservationPolicy::default();

        // Floor is 200: a grant must be strictly above it.
        assert_eq!(ledger.grant(key("a", 0), 200.0, &policy), None);
        assert_eq!(ledger.grant(key("a", 0), 0.0, &policy), None);
        assert_eq!(ledger.available(), 1200.0);
        assert_eq!(ledger.open_reservations(), 0);
    }

    #[test]
    fn test_grant_refused_when_available_below_floor() {
        let ledger = BandwidthLedger::new(800.0);
        let policy = ReservationPolicy::default();

        // Drain down to 800 / 8 = 100 available.
        for (block, requested) in [(0, 200.0), (1, 200.0), (2, 150.0), (3, 150.0)] {
            assert!(ledger.grant(key("drain", block), requested, &policy).is_some());
        }
        assert_eq!(ledger.available(), 100.0);

        assert_eq!(ledger.grant(key("b", 7), f64::MAX, &policy), None);
        assert_eq!(ledger.available(), 100.0);
    }

    #[test]
    fn test_duplicate_key_is_refused() {
        let ledger = BandwidthLedger::new(1200.0);
        let policy = ReservationPolicy::default();

        assert!(ledger.grant(key("a", 3), 1000.0, &policy).is_some());
        assert_eq!(ledger.grant(key("a", 3), 1000.0, &policy), None);
        assert_eq!(ledger.reserved_for("a"), 300.0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let ledger = BandwidthLedger::new(1200.0);
        let policy = ReservationPolicy::default();
        ledger.grant(key("a", 1), 1000.0, &policy);

        assert_eq!(ledger.release(&key("a", 1)), Some(300.0));
        assert_eq!(ledger.release(&key("a", 1)), None);
        assert_eq!(ledger.available(), 1200.0);
        assert_eq!(ledger.in_use(), 0.0);
    }

    #[test]
    fn test_release_unknown_key_is_noop() {
        let ledger = BandwidthLedger::new(500.0);
        assert_eq!(ledger.release(&key("ghost", 9)), None);
        assert_eq!(ledger.available(), 500.0);
    }

    #[test]
    fn test_reserve_requires_full_amount() {
        let ledger = BandwidthLedger::new(100.0);

        assert!(ledger.reserve(key("up", 0), 80.0));
        assert!(!ledger.reserve(key("up", 1), 80.0));
        assert_eq!(ledger.available(), 20.0);
        assert_eq!(ledger.reservation(&key("up", 1)), None);

        assert!(ledger.reserve(key("up", 1), 20.0));
        assert_eq!(ledger.available(), 0.0);
        assert!(!ledger.reserve(key("up", 2), 10.0));
        assert!(!ledger.reserve(key("up", 0), 0.0));
        assert_eq!(ledger.total_reserved(), 100.0);
    }

    #[test]
    fn test_reserved_for_sums_per_peer() {
        let ledger = BandwidthLedger::new(1000.0);
        ledger.reserve(key("a", 0), 100.0);
        ledger.reserve(key("a", 1), 150.0);
        ledger.reserve(key("b", 0), 50.0);

        assert_eq!(ledger.reserved_for("a"), 250.0);
        assert_eq!(ledger.reserved_for("b"), 50.0);
        assert_eq!(ledger.reserved_for("c"), 0.0);
        assert_eq!(ledger.total_reserved(), 300.0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Grant { peer: u8, block: u8, requested: f64 },
        Release { peer: u8, block: u8 },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4, 0u8..8, 0.0f64..2000.0).prop_map(|(peer, block, requested)| Op::Grant {
                peer,
                block,
                requested
            }),
            (0u8..4, 0u8..8).prop_map(|(peer, block)| Op::Release { peer, block }),
        ]
    }

    proptest! {
        #[test]
        fn prop_ledger_matches_counter(
            maximum in 1.0f64..10_000.0,
            ops in proptest::collection::vec(op_strategy(), 0..64),
        ) {
            let ledger = BandwidthLedger::new(maximum);
            let policy = ReservationPolicy::default();

            for op in ops {
                match op {
                    Op::Grant { peer, block, requested } => {
                        ledger.grant(key(&peer.to_string(), u32::from(block)), requested, &policy);
                    }
                    Op::Release { peer, block } => {
                        ledger.release(&key(&peer.to_string(), u32::from(block)));
                    }
                }

                let available = ledger.available();
                prop_assert!(available >= 0.0);
                prop_assert!(available <= maximum);
                let drift = (available + ledger.total_reserved() - maximum).abs();
                prop_assert!(drift <= maximum * 1e-9 + 1e-9);
            }
        }
    }
}
