//! Order book measurements used by the entry gates and the execution
//! client's liquidity precheck.

use rust_decimal::Decimal;

use super::types::{OutcomeBook, PriceLevel};
use crate::trading::Side;

/// Price window around the touch inside which depth counts as actionable.
pub const TOUCH_WINDOW: Decimal = Decimal::from_parts(5, 0, 0, false, 2); // 0.05

/// One price tick on the CLOB.
pub const TICK: Decimal = Decimal::from_parts(1, 0, 0, false, 2); // 0.01

/// Calculate the mid price from best bid and ask.
pub fn mid_price(book: &OutcomeBook) -> Option<Decimal> {
    match (book.best_bid(), book.best_ask()) {
        (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
        _ => None,
    }
}

/// Depth within [`TOUCH_WINDOW`] of the touch on the side a given order
/// would hit: asks for a buy, bids for a sell.
///
/// Whole-ladder totals overstate what is actually reachable; only size
/// near the touch matters for a marketable order.
pub fn depth_near_touch(book: &OutcomeBook, side: Side) -> Decimal {
    match side {
        Side::Buy => {
            let Some(best) = book.best_ask() else {
                return Decimal::ZERO;
            };
            sum_within(&book.asks, |p| p <= best + TOUCH_WINDOW)
        }
        Side::Sell => {
            let Some(best) = book.best_bid() else {
                return Decimal::ZERO;
            };
            sum_within(&book.bids, |p| p >= best - TOUCH_WINDOW)
        }
    }
}

fn sum_within(levels: &[PriceLevel], keep: impl Fn(Decimal) -> bool) -> Decimal {
    levels.iter().filter(|l| keep(l.price)).map(|l| l.size).sum()
}

/// Compute a non-crossing maker buy price.
///
/// Joins the bid, improving by one tick when the spread allows it
/// without touching the ask. Returns `None` when the book has no bid or
/// the result would not be a resting order.
pub fn maker_buy_price(book: &OutcomeBook) -> Option<Decimal> {
    let bid = book.best_bid()?;
    match book.best_ask() {
        Some(ask) if ask - bid > TICK => Some(bid + TICK),
        Some(_) => Some(bid),
        None => Some(bid),
    }
}
