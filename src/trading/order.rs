//! Order types and the canonical execution result shapes.
//!
//! All exchange responses are normalized into [`OrderView`] and
//! [`PlaceOrderOutcome`] at the client boundary; downstream code depends
//! only on these shapes.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// Buy order.
    #[strum(serialize = "BUY", serialize = "buy")]
    Buy,
    /// Sell order.
    #[strum(serialize = "SELL", serialize = "sell")]
    Sell,
}

/// Order time-in-force.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    /// Good-till-cancelled: rests on the book until filled or cancelled.
    #[default]
    #[strum(serialize = "GTC", serialize = "gtc")]
    GTC,
    /// Fill-or-kill: must fill entirely or cancel.
    #[strum(serialize = "FOK", serialize = "fok")]
    FOK,
    /// Fill-and-kill: fill what's available, cancel the rest.
    #[strum(serialize = "FAK", serialize = "fak")]
    FAK,
}

/// Order parameters for submission.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    /// Token ID to trade.
    pub token_id: String,
    /// Order side (buy/sell).
    pub side: Side,
    /// Limit price.
    pub price: Decimal,
    /// Order size in shares.
    pub size: Decimal,
    /// Time-in-force.
    pub order_type: OrderType,
}

impl OrderRequest {
    /// Create a new buy order.
    pub fn buy(token_id: impl Into<String>, price: Decimal, size: Decimal) -> Self {
        Self {
            token_id: token_id.into(),
            side: Side::Buy,
            price,
            size,
            order_type: OrderType::GTC,
        }
    }

    /// Create a new sell order.
    pub fn sell(token_id: impl Into<String>, price: Decimal, size: Decimal) -> Self {
        Self {
            token_id: token_id.into(),
            side: Side::Sell,
            price,
            size,
            order_type: OrderType::GTC,
        }
    }

    /// Set time-in-force.
    pub fn with_type(mut self, order_type: OrderType) -> Self {
        self.order_type = order_type;
        self
    }

    /// Validate order parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.token_id.is_empty() {
            return Err("token_id is required".to_string());
        }
        if self.price <= Decimal::ZERO || self.price >= Decimal::ONE {
            return Err(format!("price must be within (0, 1): {}", self.price));
        }
        if self.size <= Decimal::ZERO {
            return Err("size must be positive".to_string());
        }
        Ok(())
    }
}

/// Order status reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Order is pending.
    #[strum(serialize = "pending", serialize = "PENDING")]
    Pending,
    /// Order is live on the book.
    #[strum(serialize = "live", serialize = "LIVE", serialize = "open", serialize = "OPEN")]
    Live,
    /// Order is fully filled.
    #[strum(serialize = "filled", serialize = "FILLED", serialize = "matched", serialize = "MATCHED")]
    Filled,
    /// Order was cancelled.
    #[strum(
        serialize = "canceled",
        serialize = "cancelled",
        serialize = "CANCELED",
        serialize = "CANCELLED"
    )]
    Canceled,
    /// Order was rejected.
    #[strum(serialize = "rejected", serialize = "REJECTED")]
    Rejected,
    /// Order expired.
    #[strum(serialize = "expired", serialize = "EXPIRED")]
    Expired,
}

impl OrderStatus {
    /// Check if status is terminal (won't change).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }

    /// Check if the order was fully filled.
    pub fn is_filled(&self) -> bool {
        matches!(self, OrderStatus::Filled)
    }
}

/// Canonical order view normalized from the exchange's status response.
#[derive(Debug, Clone)]
pub struct OrderView {
    /// Order ID.
    pub order_id: String,
    /// Current status, if the exchange reported a recognizable one.
    pub status: Option<OrderStatus>,
    /// Matched size so far.
    pub matched: Decimal,
    /// Original requested size.
    pub original: Decimal,
    /// Average fill price, if reported.
    pub avg_price: Option<Decimal>,
    /// Fee rate in basis points, if reported.
    pub fee_rate_bps: Option<Decimal>,
    /// Whether the fill rested as a maker order, if reported.
    pub maker: Option<bool>,
}

impl OrderView {
    /// Whether the order can no longer change.
    pub fn is_terminal(&self) -> bool {
        self.status.map(|s| s.is_terminal()).unwrap_or(false)
    }
}

/// Fill classification after the single post-submit verification poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FillStatus {
    /// Matched at least the original size.
    Filled,
    /// Matched some, but less than the original size.
    Partial,
    /// Still live on the book.
    Open,
    /// Verification itself failed; the order is placed but unobserved.
    Pending,
    /// Could not classify the response.
    Unknown,
}

/// Closed set of placement failure reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureReason {
    /// Book depth below the minimum, or order too large for the touch.
    NoLiquidity,
    /// Edge-protection block armed or detected.
    Cloudflare,
    /// Authentication failed even after the single credential retry.
    Auth,
    /// Insufficient balance.
    Balance,
    /// No order book exists for the token.
    NoOrderbook,
    /// Anything else.
    Unknown,
}

/// Outcome of one `place_order` call, normalized at the client boundary.
#[derive(Debug, Clone)]
pub struct PlaceOrderOutcome {
    /// Whether the exchange accepted the order.
    ///
    /// A placed-but-unverified order is still a success with
    /// `fill_status = Pending`; reporting it failed would invite the
    /// caller to double-submit into an existing position.
    pub success: bool,
    /// Exchange order id when accepted.
    pub order_id: Option<String>,
    /// Fill classification from the verification poll.
    pub fill_status: Option<FillStatus>,
    /// Failure reason when not successful.
    pub failure: Option<FailureReason>,
    /// Price actually submitted (after improvement).
    pub submitted_price: Option<Decimal>,
}

impl PlaceOrderOutcome {
    /// A failed placement.
    pub fn failed(reason: FailureReason) -> Self {
        Self {
            success: false,
            order_id: None,
            fill_status: None,
            failure: Some(reason),
            submitted_price: None,
        }
    }

    /// A successful placement.
    pub fn placed(order_id: String, fill_status: FillStatus, submitted_price: Decimal) -> Self {
        Self {
            success: true,
            order_id: Some(order_id),
            fill_status: Some(fill_status),
            failure: None,
            submitted_price: Some(submitted_price),
        }
    }
}
