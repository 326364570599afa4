//! Edge-trading bot for 15-minute Polymarket Up/Down markets.
//!
//! The bot buys the underpriced outcome of a 15-minute binary market
//! when an empirical fair-price model says the ask is cheap, then locks
//! the position by buying the opposite outcome once the market corrects.
//! A separate engine redeems winning positions on Polygon.
//!
//! # Modules
//!
//! - [`config`]: Configuration loading from environment
//! - [`error`]: Unified error types
//! - [`ledger`]: Exposure accounting and the per-side cap
//! - [`market`]: Exchange client, market types, and the API seam
//! - [`orderbook`]: Order book types and touch analysis
//! - [`feed`]: Polling market data feed
//! - [`trading`]: Order types and the execution client
//! - [`strategy`]: Fair-price model, phase machine, and the engine
//! - [`redemption`]: On-chain claim redemption
//! - [`signing`]: L1 wallet auth and L2 HMAC headers
//! - [`audit`]: Structured decision trail
//! - [`api`]: HTTP API for health/status and operator actions
//! - [`utils`]: Utility functions

pub mod api;
pub mod audit;
pub mod config;
pub mod error;
pub mod feed;
pub mod ledger;
pub mod market;
pub mod metrics;
pub mod orderbook;
pub mod redemption;
pub mod signing;
pub mod strategy;
pub mod trading;
pub mod utils;

pub use config::Config;
pub use error::{BotError, Result};
