//! Market data for 15-minute Up/Down prediction markets.
//!
//! This module handles:
//! - Market and outcome types
//! - The exchange API seam and its real CLOB client
//! - A scripted mock exchange for testing

pub mod client;
pub mod mock;
pub mod types;

pub use client::{ClobClient, ExchangeApi, PositionRecord, PositionsPage};
pub use mock::{MockExchange, SubmitFailure};
pub use types::{Asset, Market, Outcome};
