//! Exposure ledger: the single source of truth for committed, open, and
//! pending shares per market side.
//!
//! The ledger is pure in-memory bookkeeping with no network I/O. Callers
//! drive it in lifecycle order per logical order:
//!
//! 1. `reserve_pending` before the exchange call,
//! 2. `promote_to_open` on acknowledgement,
//! 3. `on_fill` / `on_cancel_open` / `on_reject_pending` as the order
//!    resolves.
//!
//! Because the reservation lands before the network call suspends, a cap
//! check performed immediately afterwards already sees the in-flight
//! quantity. That ordering is what keeps caps safe under concurrent
//! requests on the same market side.

use std::collections::HashMap;

use rust_decimal::Decimal;
use tracing::{error, warn};

use crate::market::{Asset, Outcome};
use crate::metrics;

/// Key for one ledger entry: a market and the asset it trades.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LedgerKey {
    /// Market identifier.
    pub market_id: String,
    /// Underlying asset.
    pub asset: Asset,
}

impl LedgerKey {
    /// Create a new ledger key.
    pub fn new(market_id: impl Into<String>, asset: Asset) -> Self {
        Self {
            market_id: market_id.into(),
            asset,
        }
    }
}

/// Per-(market, asset) exposure counters, one pair of counters per side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Confirmed holdings, Up side.
    pub position_up: Decimal,
    /// Confirmed holdings, Down side.
    pub position_down: Decimal,
    /// Resting order shares, Up side.
    pub open_up: Decimal,
    /// Resting order shares, Down side.
    pub open_down: Decimal,
    /// Requested but unacknowledged shares, Up side.
    pub pending_up: Decimal,
    /// Requested but unacknowledged shares, Down side.
    pub pending_down: Decimal,
}

impl LedgerEntry {
    fn position(&self, side: Outcome) -> Decimal {
        match side {
            Outcome::Up => self.position_up,
            Outcome::Down => self.position_down,
        }
    }

    fn open(&self, side: Outcome) -> Decimal {
        match side {
            Outcome::Up => self.open_up,
            Outcome::Down => self.open_down,
        }
    }

    fn pending(&self, side: Outcome) -> Decimal {
        match side {
            Outcome::Up => self.pending_up,
            Outcome::Down => self.pending_down,
        }
    }

    fn position_mut(&mut self, side: Outcome) -> &mut Decimal {
        match side {
            Outcome::Up => &mut self.position_up,
            Outcome::Down => &mut self.position_down,
        }
    }

    fn open_mut(&mut self, side: Outcome) -> &mut Decimal {
        match side {
            Outcome::Up => &mut self.open_up,
            Outcome::Down => &mut self.open_down,
        }
    }

    fn pending_mut(&mut self, side: Outcome) -> &mut Decimal {
        match side {
            Outcome::Up => &mut self.pending_up,
            Outcome::Down => &mut self.pending_down,
        }
    }

    /// Effective exposure for one side: position + open + pending.
    pub fn effective(&self, side: Outcome) -> Decimal {
        self.position(side) + self.open(side) + self.pending(side)
    }

    fn is_empty(&self) -> bool {
        *self == LedgerEntry::default()
    }
}

/// Snapshot of one side's exposure at cap-check time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureSnapshot {
    /// Confirmed holdings.
    pub position: Decimal,
    /// Resting order shares.
    pub open: Decimal,
    /// Unacknowledged shares.
    pub pending: Decimal,
    /// position + open + pending.
    pub effective: Decimal,
}

/// Side-effect-free result of a cap check.
///
/// A passing check does not reserve anything; the caller must follow up
/// with [`ExposureLedger::reserve_pending`] before submitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapCheck {
    /// Whether any quantity may be sent.
    pub allowed: bool,
    /// Whether the side is already at or over cap.
    pub blocked: bool,
    /// Requested quantity clamped to remaining headroom.
    pub clamped_qty: Decimal,
    /// The exposure the check was computed against.
    pub snapshot: ExposureSnapshot,
}

/// One detected invariant breach: a side whose effective exposure
/// exceeds the cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapBreach {
    /// Market in breach.
    pub key: LedgerKey,
    /// Side in breach.
    pub side: Outcome,
    /// Effective exposure observed.
    pub effective: Decimal,
    /// Configured cap.
    pub cap: Decimal,
}

/// In-memory exposure ledger keyed by (market, asset).
///
/// Entries are created lazily on first reference and removed by
/// [`clear_market`](ExposureLedger::clear_market) after settlement.
#[derive(Debug)]
pub struct ExposureLedger {
    entries: HashMap<LedgerKey, LedgerEntry>,
    cap: Decimal,
}

impl ExposureLedger {
    /// Create a ledger with the given per-side cap.
    pub fn new(cap: Decimal) -> Self {
        Self {
            entries: HashMap::new(),
            cap,
        }
    }

    /// The configured per-side cap.
    pub fn cap(&self) -> Decimal {
        self.cap
    }

    /// Number of markets currently tracked.
    pub fn market_count(&self) -> usize {
        self.entries.len()
    }

    fn entry_mut(&mut self, key: &LedgerKey) -> &mut LedgerEntry {
        self.entries.entry(key.clone()).or_default()
    }

    /// Step A: reserve quantity as pending before the exchange call.
    pub fn reserve_pending(&mut self, key: &LedgerKey, side: Outcome, qty: Decimal) {
        if qty <= Decimal::ZERO {
            return;
        }
        *self.entry_mut(key).pending_mut(side) += qty;
    }

    /// Step B: acknowledged by the exchange; move pending into open.
    pub fn promote_to_open(&mut self, key: &LedgerKey, side: Outcome, qty: Decimal) {
        if qty <= Decimal::ZERO {
            return;
        }
        let entry = self.entry_mut(key);
        let moved = qty.min(entry.pending(side));
        *entry.pending_mut(side) -= moved;
        *entry.open_mut(side) += moved;
    }

    /// Step C: filled (partially or fully); subtract from open only.
    ///
    /// Confirmed-position bookkeeping is the caller's job via
    /// [`increment_position`](ExposureLedger::increment_position).
    pub fn on_fill(&mut self, key: &LedgerKey, side: Outcome, qty: Decimal) {
        if qty <= Decimal::ZERO {
            return;
        }
        let entry = self.entry_mut(key);
        let open = entry.open_mut(side);
        *open = (*open - qty).max(Decimal::ZERO);
    }

    /// Step D: cancelled or expired; subtract from open, clamping at zero.
    pub fn on_cancel_open(&mut self, key: &LedgerKey, side: Outcome, qty: Decimal) {
        if qty <= Decimal::ZERO {
            return;
        }
        let entry = self.entry_mut(key);
        let open = entry.open_mut(side);
        *open = (*open - qty).max(Decimal::ZERO);
    }

    /// Step D: rejected before acknowledgement; subtract from pending,
    /// clamping at zero.
    pub fn on_reject_pending(&mut self, key: &LedgerKey, side: Outcome, qty: Decimal) {
        if qty <= Decimal::ZERO {
            return;
        }
        let entry = self.entry_mut(key);
        let pending = entry.pending_mut(side);
        *pending = (*pending - qty).max(Decimal::ZERO);
    }

    /// Overwrite the confirmed position for one side.
    pub fn sync_position(&mut self, key: &LedgerKey, side: Outcome, qty: Decimal) {
        if qty < Decimal::ZERO {
            return;
        }
        *self.entry_mut(key).position_mut(side) = qty;
    }

    /// Add confirmed shares to one side.
    pub fn increment_position(&mut self, key: &LedgerKey, side: Outcome, qty: Decimal) {
        if qty <= Decimal::ZERO {
            return;
        }
        *self.entry_mut(key).position_mut(side) += qty;
    }

    /// Delete the entry for a retired market.
    pub fn clear_market(&mut self, key: &LedgerKey) {
        self.entries.remove(key);
    }

    /// Effective exposure for one side: position + open + pending.
    pub fn effective_exposure(&self, key: &LedgerKey, side: Outcome) -> Decimal {
        self.entries
            .get(key)
            .map(|e| e.effective(side))
            .unwrap_or(Decimal::ZERO)
    }

    /// A read-only view of the entry, if one exists.
    pub fn entry(&self, key: &LedgerKey) -> Option<&LedgerEntry> {
        self.entries.get(key)
    }

    /// The only legitimate pre-order gate.
    ///
    /// `remaining = cap - effective`; a non-positive remainder blocks the
    /// request, otherwise the quantity is clamped to the remainder. The
    /// caller decides whether a clamped size is still worth sending, and
    /// must reserve separately if it proceeds.
    pub fn check_cap(&self, key: &LedgerKey, side: Outcome, qty: Decimal) -> CapCheck {
        let entry = self.entries.get(key).cloned().unwrap_or_default();
        let snapshot = ExposureSnapshot {
            position: entry.position(side),
            open: entry.open(side),
            pending: entry.pending(side),
            effective: entry.effective(side),
        };

        if qty <= Decimal::ZERO {
            return CapCheck {
                allowed: false,
                blocked: false,
                clamped_qty: Decimal::ZERO,
                snapshot,
            };
        }

        let remaining = self.cap - snapshot.effective;
        if remaining <= Decimal::ZERO {
            metrics::inc_cap_blocks();
            return CapCheck {
                allowed: false,
                blocked: true,
                clamped_qty: Decimal::ZERO,
                snapshot,
            };
        }

        let clamped = qty.min(remaining);
        if clamped < qty {
            metrics::inc_cap_clamps();
            warn!(
                market = %key.market_id,
                asset = %key.asset,
                side = %side,
                requested = %qty,
                clamped = %clamped,
                effective = %snapshot.effective,
                "cap check clamped request to remaining headroom"
            );
        }

        CapCheck {
            allowed: true,
            blocked: false,
            clamped_qty: clamped,
            snapshot,
        }
    }

    /// Recompute exposure on every entry and flag any side over cap.
    ///
    /// This is a detector, not a preventer: a breach means a caller
    /// violated the lifecycle ordering, and is logged as a defect signal
    /// rather than silently corrected.
    pub fn assert_invariants(&self) -> Vec<CapBreach> {
        let mut breaches = Vec::new();
        for (key, entry) in &self.entries {
            for side in [Outcome::Up, Outcome::Down] {
                let effective = entry.effective(side);
                if effective > self.cap {
                    error!(
                        market = %key.market_id,
                        asset = %key.asset,
                        side = %side,
                        effective = %effective,
                        cap = %self.cap,
                        "exposure invariant breached"
                    );
                    metrics::inc_ledger_breaches();
                    breaches.push(CapBreach {
                        key: key.clone(),
                        side,
                        effective,
                        cap: self.cap,
                    });
                }
            }
        }
        breaches
    }

    /// Drop entries that have returned to all-zero counters.
    pub fn prune_empty(&mut self) {
        self.entries.retain(|_, e| !e.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn key() -> LedgerKey {
        LedgerKey::new("mkt-1", Asset::Btc)
    }

    fn ledger() -> ExposureLedger {
        ExposureLedger::new(dec!(100))
    }

    #[test]
    fn lifecycle_moves_quantity_through_counters() {
        let mut l = ledger();
        let k = key();

        l.reserve_pending(&k, Outcome::Up, dec!(30));
        assert_eq!(l.entry(&k).unwrap().pending_up, dec!(30));

        l.promote_to_open(&k, Outcome::Up, dec!(30));
        let e = l.entry(&k).unwrap();
        assert_eq!(e.pending_up, dec!(0));
        assert_eq!(e.open_up, dec!(30));

        l.on_fill(&k, Outcome::Up, dec!(12));
        l.increment_position(&k, Outcome::Up, dec!(12));
        let e = l.entry(&k).unwrap();
        assert_eq!(e.open_up, dec!(18));
        assert_eq!(e.position_up, dec!(12));

        // effective unchanged by a fill that moves open into position
        assert_eq!(l.effective_exposure(&k, Outcome::Up), dec!(30));
    }

    #[test]
    fn mutators_ignore_non_positive_input() {
        let mut l = ledger();
        let k = key();

        l.reserve_pending(&k, Outcome::Up, dec!(0));
        l.reserve_pending(&k, Outcome::Up, dec!(-5));
        l.increment_position(&k, Outcome::Down, dec!(-1));
        assert_eq!(l.effective_exposure(&k, Outcome::Up), dec!(0));
        assert_eq!(l.effective_exposure(&k, Outcome::Down), dec!(0));
    }

    #[test]
    fn sync_position_overwrites_and_rejects_negative() {
        let mut l = ledger();
        let k = key();

        l.increment_position(&k, Outcome::Up, dec!(12));
        l.sync_position(&k, Outcome::Up, dec!(7));
        assert_eq!(l.entry(&k).unwrap().position_up, dec!(7));

        // reconciling to zero clears the side
        l.sync_position(&k, Outcome::Up, dec!(0));
        assert_eq!(l.entry(&k).unwrap().position_up, dec!(0));

        // negative input leaves the ledger untouched
        l.sync_position(&k, Outcome::Up, dec!(-3));
        assert_eq!(l.entry(&k).unwrap().position_up, dec!(0));
    }

    #[test]
    fn prune_drops_only_zeroed_entries() {
        let mut l = ledger();
        let k = key();
        let other = LedgerKey::new("mkt-2", Asset::Eth);

        l.increment_position(&k, Outcome::Up, dec!(5));
        l.reserve_pending(&other, Outcome::Down, dec!(3));
        l.on_reject_pending(&other, Outcome::Down, dec!(3));

        l.prune_empty();
        assert!(l.entry(&k).is_some());
        assert!(l.entry(&other).is_none());
    }

    #[test]
    fn cancel_and_reject_clamp_at_zero() {
        let mut l = ledger();
        let k = key();

        l.reserve_pending(&k, Outcome::Up, dec!(10));
        l.promote_to_open(&k, Outcome::Up, dec!(10));

        // cancel more than open
        l.on_cancel_open(&k, Outcome::Up, dec!(25));
        assert_eq!(l.entry(&k).unwrap().open_up, dec!(0));

        // repeated cancel is a no-op
        l.on_cancel_open(&k, Outcome::Up, dec!(25));
        assert_eq!(l.entry(&k).unwrap().open_up, dec!(0));

        l.reserve_pending(&k, Outcome::Down, dec!(4));
        l.on_reject_pending(&k, Outcome::Down, dec!(9));
        assert_eq!(l.entry(&k).unwrap().pending_down, dec!(0));
    }

    #[test]
    fn promote_never_exceeds_pending() {
        let mut l = ledger();
        let k = key();

        l.reserve_pending(&k, Outcome::Up, dec!(10));
        l.promote_to_open(&k, Outcome::Up, dec!(50));
        let e = l.entry(&k).unwrap();
        assert_eq!(e.pending_up, dec!(0));
        assert_eq!(e.open_up, dec!(10));
    }

    #[test]
    fn cap_check_clamps_to_headroom() {
        let mut l = ledger();
        let k = key();

        // existing UP effective = 85
        l.increment_position(&k, Outcome::Up, dec!(50));
        l.reserve_pending(&k, Outcome::Up, dec!(15));
        l.promote_to_open(&k, Outcome::Up, dec!(15));
        l.reserve_pending(&k, Outcome::Up, dec!(20));

        let check = l.check_cap(&k, Outcome::Up, dec!(30));
        assert!(check.allowed);
        assert!(!check.blocked);
        assert_eq!(check.clamped_qty, dec!(15));
        assert_eq!(check.snapshot.effective, dec!(85));
    }

    #[test]
    fn cap_check_blocks_at_cap() {
        let mut l = ledger();
        let k = key();

        l.increment_position(&k, Outcome::Up, dec!(100));

        let check = l.check_cap(&k, Outcome::Up, dec!(1));
        assert!(!check.allowed);
        assert!(check.blocked);
        assert_eq!(check.clamped_qty, dec!(0));
    }

    #[test]
    fn cap_check_does_not_mutate() {
        let mut l = ledger();
        let k = key();
        l.increment_position(&k, Outcome::Up, dec!(40));

        let before = l.entry(&k).unwrap().clone();
        let _ = l.check_cap(&k, Outcome::Up, dec!(30));
        assert_eq!(l.entry(&k).unwrap(), &before);
    }

    #[test]
    fn gated_mutations_never_exceed_cap() {
        let mut l = ledger();
        let k = key();

        // repeatedly request more than headroom; always reserve the
        // clamped quantity the gate returned
        for _ in 0..10 {
            let check = l.check_cap(&k, Outcome::Up, dec!(37));
            if !check.allowed {
                break;
            }
            l.reserve_pending(&k, Outcome::Up, check.clamped_qty);
            assert!(l.effective_exposure(&k, Outcome::Up) <= dec!(100));
        }
        assert_eq!(l.effective_exposure(&k, Outcome::Up), dec!(100));
        assert!(l.assert_invariants().is_empty());
    }

    #[test]
    fn assert_invariants_detects_breach() {
        let mut l = ledger();
        let k = key();

        // bypass the gate to simulate a caller-ordering bug
        l.increment_position(&k, Outcome::Up, dec!(90));
        l.reserve_pending(&k, Outcome::Up, dec!(20));

        let breaches = l.assert_invariants();
        assert_eq!(breaches.len(), 1);
        assert_eq!(breaches[0].side, Outcome::Up);
        assert_eq!(breaches[0].effective, dec!(110));
    }

    #[test]
    fn clear_market_removes_entry() {
        let mut l = ledger();
        let k = key();

        l.increment_position(&k, Outcome::Up, dec!(10));
        assert_eq!(l.market_count(), 1);

        l.clear_market(&k);
        assert_eq!(l.market_count(), 0);
        assert_eq!(l.effective_exposure(&k, Outcome::Up), dec!(0));
    }
}
