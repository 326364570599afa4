//! Sticky fill-quality kill switch.
//!
//! Watches observed fills for two degradation signals: fills arriving
//! without fee data, and the trailing maker ratio dropping below its
//! floor. Once tripped, entries stay disabled until an operator resets
//! it; hedges and cancels keep working so open positions can still be
//! managed.

use std::collections::VecDeque;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::warn;

use crate::config::Config;
use crate::metrics;

/// Snapshot of the switch for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct KillSwitchStatus {
    /// Whether entries are disabled.
    pub tripped: bool,
    /// What tripped it.
    pub reason: Option<String>,
    /// Fills observed since start.
    pub fills_observed: u64,
    /// Entry evaluations since start.
    pub evaluations: u64,
    /// Evaluations skipped on a stale book.
    pub stale_book_skips: u64,
    /// Maker fills since start.
    pub maker_fills: u64,
    /// Taker fills since start.
    pub taker_fills: u64,
    /// Fills that arrived without fee data.
    pub missing_fee_fills: u64,
    /// Maker fills in the trailing window.
    pub window_maker_fills: usize,
    /// Size of the trailing window.
    pub window_len: usize,
}

/// Sticky kill switch over fill-quality signals.
#[derive(Debug)]
pub struct KillSwitch {
    tripped: bool,
    reason: Option<String>,
    require_fee_data: bool,
    window_size: usize,
    min_maker_ratio: Decimal,
    window: VecDeque<bool>,
    fills_observed: u64,
    evaluations: u64,
    stale_book_skips: u64,
    maker_fills: u64,
    taker_fills: u64,
    missing_fee_fills: u64,
}

impl KillSwitch {
    /// Build from config thresholds.
    pub fn new(config: &Config) -> Self {
        Self {
            tripped: false,
            reason: None,
            require_fee_data: config.require_fee_data,
            window_size: config.maker_ratio_window,
            min_maker_ratio: config.min_maker_ratio,
            window: VecDeque::with_capacity(config.maker_ratio_window),
            fills_observed: 0,
            evaluations: 0,
            stale_book_skips: 0,
            maker_fills: 0,
            taker_fills: 0,
            missing_fee_fills: 0,
        }
    }

    /// Whether entries are currently allowed.
    pub fn entries_allowed(&self) -> bool {
        !self.tripped
    }

    /// Why the switch tripped, if it did.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Count one pass through the entry gates.
    pub fn record_evaluation(&mut self) {
        self.evaluations += 1;
    }

    /// Count an evaluation dropped for a stale book.
    pub fn record_stale_book(&mut self) {
        self.stale_book_skips += 1;
    }

    /// Record an observed fill.
    ///
    /// `maker` and `fee_rate_bps` come straight from the exchange's
    /// order view; either being absent is itself a signal.
    pub fn record_fill(&mut self, maker: Option<bool>, fee_rate_bps: Option<Decimal>) {
        self.fills_observed += 1;
        match maker {
            Some(true) => self.maker_fills += 1,
            _ => self.taker_fills += 1,
        }

        if fee_rate_bps.is_none() {
            self.missing_fee_fills += 1;
            if self.require_fee_data {
                self.trip("fill arrived without fee data");
                return;
            }
        }

        self.window.push_back(maker.unwrap_or(false));
        if self.window.len() > self.window_size {
            self.window.pop_front();
        }

        if self.window.len() == self.window_size {
            let makers = self.window.iter().filter(|m| **m).count();
            let ratio = Decimal::from(makers) / Decimal::from(self.window_size);
            if ratio < self.min_maker_ratio {
                self.trip(&format!(
                    "maker ratio {} below floor {} over {} fills",
                    ratio, self.min_maker_ratio, self.window_size
                ));
            }
        }
    }

    fn trip(&mut self, reason: &str) {
        if self.tripped {
            return;
        }
        warn!(reason = %reason, "kill switch tripped, entries disabled");
        metrics::inc_kill_switch_trips();
        self.tripped = true;
        self.reason = Some(reason.to_string());
    }

    /// Operator reset. Clears the trailing window too, so one bad run
    /// does not instantly re-trip.
    pub fn reset(&mut self) {
        self.tripped = false;
        self.reason = None;
        self.window.clear();
    }

    /// Snapshot for the status endpoint.
    pub fn status(&self) -> KillSwitchStatus {
        KillSwitchStatus {
            tripped: self.tripped,
            reason: self.reason.clone(),
            fills_observed: self.fills_observed,
            evaluations: self.evaluations,
            stale_book_skips: self.stale_book_skips,
            maker_fills: self.maker_fills,
            taker_fills: self.taker_fills,
            missing_fee_fills: self.missing_fee_fills,
            window_maker_fills: self.window.iter().filter(|m| **m).count(),
            window_len: self.window.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use rust_decimal_macros::dec;

    fn switch() -> KillSwitch {
        let mut config = test_config();
        config.maker_ratio_window = 4;
        config.min_maker_ratio = dec!(0.5);
        KillSwitch::new(&config)
    }

    #[test]
    fn missing_fee_data_trips_immediately() {
        let mut ks = switch();
        ks.record_fill(Some(true), None);
        assert!(!ks.entries_allowed());
        assert!(ks.reason().unwrap().contains("fee data"));
    }

    #[test]
    fn missing_fee_tolerated_when_not_required() {
        let mut config = test_config();
        config.require_fee_data = false;
        let mut ks = KillSwitch::new(&config);
        ks.record_fill(Some(true), None);
        assert!(ks.entries_allowed());
    }

    #[test]
    fn low_maker_ratio_trips_after_full_window() {
        let mut ks = switch();
        ks.record_fill(Some(false), Some(dec!(0)));
        ks.record_fill(Some(false), Some(dec!(0)));
        ks.record_fill(Some(false), Some(dec!(0)));
        // window not full yet
        assert!(ks.entries_allowed());
        ks.record_fill(Some(true), Some(dec!(0)));
        // 1/4 maker < 0.5
        assert!(!ks.entries_allowed());
    }

    #[test]
    fn healthy_maker_ratio_stays_armed() {
        let mut ks = switch();
        for _ in 0..8 {
            ks.record_fill(Some(true), Some(dec!(0)));
        }
        assert!(ks.entries_allowed());
    }

    #[test]
    fn counters_track_evaluations_and_fill_mix() {
        let mut config = test_config();
        config.require_fee_data = false;
        let mut ks = KillSwitch::new(&config);

        ks.record_evaluation();
        ks.record_evaluation();
        ks.record_stale_book();
        ks.record_fill(Some(true), Some(dec!(0)));
        ks.record_fill(Some(false), Some(dec!(0)));
        ks.record_fill(None, None);

        let status = ks.status();
        assert_eq!(status.evaluations, 2);
        assert_eq!(status.stale_book_skips, 1);
        assert_eq!(status.maker_fills, 1);
        assert_eq!(status.taker_fills, 2);
        assert_eq!(status.missing_fee_fills, 1);
        assert_eq!(status.fills_observed, 3);
    }

    #[test]
    fn trip_is_sticky_until_reset() {
        let mut ks = switch();
        ks.record_fill(Some(true), None);
        assert!(!ks.entries_allowed());

        // good fills do not untrip it
        for _ in 0..8 {
            ks.record_fill(Some(true), Some(dec!(0)));
        }
        assert!(!ks.entries_allowed());

        ks.reset();
        assert!(ks.entries_allowed());
        assert!(ks.reason().is_none());
        assert_eq!(ks.status().window_len, 0);
    }
}
