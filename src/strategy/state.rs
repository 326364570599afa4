//! Per-market phase machine and entry/hedge bookkeeping.
//!
//! A market walks Idle -> HasEntry -> HedgeInProgress -> Done, one step
//! at a time, never backwards — with one exception: an entry order that
//! dies without a single fill releases the market back to Idle.

use rust_decimal::Decimal;
use strum::{Display, EnumString};
use time::OffsetDateTime;

use crate::error::StrategyError;
use crate::market::types::{Market, Outcome};
use crate::trading::order::Side;

/// Lifecycle phase of a market under management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default)]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    /// No position, eligible for entry.
    #[default]
    Idle,
    /// Entry order placed or filled.
    HasEntry,
    /// Hedge order placed.
    HedgeInProgress,
    /// Hedged or retired; nothing more happens here.
    Done,
}

impl Phase {
    /// Whether the machine may step from `self` to `to`.
    pub fn can_advance(self, to: Phase) -> bool {
        matches!(
            (self, to),
            (Phase::Idle, Phase::HasEntry)
                | (Phase::HasEntry, Phase::HedgeInProgress)
                | (Phase::HedgeInProgress, Phase::Done)
        )
    }
}

/// Why an entry order belongs to the order (entry vs hedge leg).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum OrderIntent {
    /// First leg into the market.
    Entry,
    /// Opposite-outcome leg locking the position.
    Hedge,
}

/// An order the engine is currently tracking.
#[derive(Debug, Clone)]
pub struct LiveOrder {
    /// Exchange order id.
    pub order_id: String,
    /// Token the order trades.
    pub token_id: String,
    /// Order side.
    pub side: Side,
    /// Which leg this order is.
    pub intent: OrderIntent,
    /// Requested size in shares.
    pub requested: Decimal,
    /// Submitted limit price.
    pub price: Decimal,
    /// Shares observed filled so far.
    pub filled: Decimal,
}

/// Reasons an entry evaluation declined to trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum SkipReason {
    /// No book data arrived for one or both outcomes.
    NoBook,
    /// The book is older than the staleness bound.
    StaleBook,
    /// Outside the entry window of the market's life.
    OutsideEntryWindow,
    /// The model cell has too few samples.
    UntrustedCell,
    /// The model has no fair price for the cell.
    NoFairPrice,
    /// Fair-versus-ask edge below the entry threshold.
    EdgeBelowThreshold,
    /// Bid/ask spread too wide.
    SpreadTooWide,
    /// Not enough depth near the touch.
    DepthTooThin,
    /// Market already carries a position.
    ExistingPosition,
    /// An order is already in flight for this market.
    OrderInFlight,
    /// Too many markets already entered for this asset.
    MaxMarketsPerAsset,
    /// The kill switch is tripped.
    KillSwitch,
    /// The exposure cap blocked the full size.
    CapBlocked,
}

/// Mutable per-market strategy state.
#[derive(Debug, Clone)]
pub struct MarketState {
    /// The market being managed.
    pub market: Market,
    /// Current phase.
    phase: Phase,
    /// Outcome the entry leg bought.
    pub entry_outcome: Option<Outcome>,
    /// Average entry fill price.
    pub entry_avg_price: Option<Decimal>,
    /// Entry shares filled so far.
    pub entry_filled: Decimal,
    /// When the first entry fill was observed.
    pub entry_fill_at: Option<OffsetDateTime>,
    /// Hedge shares filled so far.
    pub hedge_filled: Decimal,
    /// The order currently in flight, if any.
    pub live_order: Option<LiveOrder>,
    /// When the last hedge attempt was made.
    pub last_hedge_attempt: Option<OffsetDateTime>,
}

impl MarketState {
    /// Fresh state for a market.
    pub fn new(market: Market) -> Self {
        Self {
            market,
            phase: Phase::Idle,
            entry_outcome: None,
            entry_avg_price: None,
            entry_filled: Decimal::ZERO,
            entry_fill_at: None,
            hedge_filled: Decimal::ZERO,
            live_order: None,
            last_hedge_attempt: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Step the phase machine forward.
    pub fn advance(&mut self, to: Phase) -> Result<(), StrategyError> {
        if !self.phase.can_advance(to) {
            return Err(StrategyError::IllegalTransition {
                market_id: self.market.id.clone(),
                from: self.phase.to_string(),
                to: to.to_string(),
            });
        }
        self.phase = to;
        Ok(())
    }

    /// Abort path: release a market whose entry order died unfilled.
    ///
    /// Only legal from `HasEntry` with zero filled shares; a partially
    /// filled entry keeps the market committed.
    pub fn reset_unfilled_entry(&mut self) -> Result<(), StrategyError> {
        if self.phase != Phase::HasEntry || self.entry_filled > Decimal::ZERO {
            return Err(StrategyError::IllegalTransition {
                market_id: self.market.id.clone(),
                from: self.phase.to_string(),
                to: Phase::Idle.to_string(),
            });
        }
        self.phase = Phase::Idle;
        self.entry_outcome = None;
        self.entry_avg_price = None;
        self.entry_fill_at = None;
        self.live_order = None;
        Ok(())
    }

    /// Whether this market holds any filled shares.
    pub fn has_position(&self) -> bool {
        self.entry_filled > Decimal::ZERO || self.hedge_filled > Decimal::ZERO
    }

    /// Seconds since the first entry fill, if any.
    pub fn secs_since_entry_fill(&self) -> Option<i64> {
        self.entry_fill_at
            .map(|at| (OffsetDateTime::now_utc() - at).whole_seconds())
    }

    /// Seconds since the last hedge attempt, if any.
    pub fn secs_since_hedge_attempt(&self) -> Option<i64> {
        self.last_hedge_attempt
            .map(|at| (OffsetDateTime::now_utc() - at).whole_seconds())
    }
}
