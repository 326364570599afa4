//! Order book types and data structures.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::market::Outcome;

/// Single price level in an order book.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PriceLevel {
    /// Price at this level.
    pub price: Decimal,
    /// Total size available at this price.
    pub size: Decimal,
}

impl PriceLevel {
    /// Create a new price level.
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// L2 order book for one outcome.
#[derive(Debug, Clone)]
pub struct OutcomeBook {
    /// Token ID this book represents.
    pub token_id: String,
    /// Which outcome (Up or Down).
    pub outcome: Outcome,
    /// Bid levels sorted by price descending.
    pub bids: Vec<PriceLevel>,
    /// Ask levels sorted by price ascending.
    pub asks: Vec<PriceLevel>,
    /// When this book was last updated.
    pub updated_at: OffsetDateTime,
}

impl Default for OutcomeBook {
    fn default() -> Self {
        Self {
            token_id: String::new(),
            outcome: Outcome::default(),
            bids: Vec::new(),
            asks: Vec::new(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }
}

impl OutcomeBook {
    /// Get the best bid price.
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    /// Get the best ask price.
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Get the spread between best bid and ask.
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// Get size available at best bid.
    pub fn bid_size(&self) -> Decimal {
        self.bids.first().map(|l| l.size).unwrap_or(Decimal::ZERO)
    }

    /// Get size available at best ask.
    pub fn ask_size(&self) -> Decimal {
        self.asks.first().map(|l| l.size).unwrap_or(Decimal::ZERO)
    }

    /// Check if the book has no levels on either side.
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Check if the book is inverted (best_ask < best_bid).
    pub fn is_inverted(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => ask < bid,
            _ => false,
        }
    }

    /// Milliseconds since the book was last updated.
    pub fn age_ms(&self) -> i64 {
        let age = OffsetDateTime::now_utc() - self.updated_at;
        age.whole_milliseconds() as i64
    }

    /// Whether the book is older than the given threshold.
    pub fn is_stale(&self, max_age_ms: i64) -> bool {
        self.age_ms() > max_age_ms
    }
}
