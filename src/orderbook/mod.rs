//! Order book types and measurements.
//!
//! This module handles:
//! - Order book types and data structures
//! - Depth, mid-price, and maker-price calculations

pub mod analysis;
pub mod types;

pub use analysis::{depth_near_touch, maker_buy_price, mid_price};
pub use types::{OutcomeBook, PriceLevel};
