//! Order types and the execution client.
//!
//! This module handles:
//! - Order request, status, and outcome types
//! - The rate-limited, cooldown-aware execution client

pub mod client;
pub mod order;

pub use client::ExecutionClient;
pub use order::{
    FailureReason, FillStatus, OrderRequest, OrderStatus, OrderType, OrderView, PlaceOrderOutcome,
    Side,
};
