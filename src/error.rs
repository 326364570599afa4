//! Unified error types for the trading engine.

use rust_decimal::Decimal;
use thiserror::Error;

/// Unified error type for the bot.
#[derive(Error, Debug)]
pub enum BotError {
    /// Configuration loading error.
    #[error("configuration error: {0}")]
    Config(#[from] envy::Error),

    /// Market-data error.
    #[error("market error: {0}")]
    Market(#[from] MarketError),

    /// Order execution error.
    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Strategy evaluation error.
    #[error("strategy error: {0}")]
    Strategy(#[from] StrategyError),

    /// Claim redemption error.
    #[error("redemption error: {0}")]
    Redemption(#[from] RedemptionError),

    /// HTTP request error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Market-data fetch and parse errors.
#[derive(Error, Debug)]
pub enum MarketError {
    /// Failed to fetch data for a token.
    #[error("failed to fetch {token_id}: {reason}")]
    FetchFailed {
        /// The token that failed.
        token_id: String,
        /// Reason for failure.
        reason: String,
    },

    /// No order book exists for the token.
    #[error("no order book for token {token_id}")]
    NoOrderBook {
        /// The token without a book.
        token_id: String,
    },

    /// Failed to parse market data.
    #[error("failed to parse market data: {0}")]
    ParseError(String),

    /// HTTP request failed.
    #[error("http request failed: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Order placement, cancellation, and status errors.
///
/// These are classified at the exchange client boundary; the execution
/// client maps them into the closed `FailureReason` set.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// Exchange rejected the credentials (HTTP 401).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Edge-protection block detected (HTTP 403 with WAF signature).
    #[error("edge-protection block: {0}")]
    EdgeBlocked(String),

    /// Insufficient balance reported by the exchange.
    #[error("insufficient balance: need {required}, have {available}")]
    InsufficientBalance {
        /// Required amount.
        required: Decimal,
        /// Available amount.
        available: Decimal,
    },

    /// Order submission failed.
    #[error("order submission failed: {0}")]
    SubmissionFailed(String),

    /// Failed to cancel an order.
    #[error("failed to cancel order {order_id}: {reason}")]
    CancelFailed {
        /// Order ID that failed to cancel.
        order_id: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to get order status.
    #[error("failed to get status for {order_id}: {reason}")]
    StatusFailed {
        /// Order ID.
        order_id: String,
        /// Reason for failure.
        reason: String,
    },

    /// Balance query failed and no cached value exists.
    #[error("balance unavailable: {0}")]
    BalanceUnavailable(String),

    /// Signing error.
    #[error("signing error: {0}")]
    SigningError(String),

    /// Credential derivation failed.
    #[error("credential derivation failed: {0}")]
    CredentialsFailed(String),

    /// Invalid order parameters.
    #[error("invalid order parameters: {0}")]
    InvalidParams(String),
}

/// Strategy-level errors. Most unmet entry conditions are skips, not
/// errors; this covers genuinely broken state.
#[derive(Error, Debug)]
pub enum StrategyError {
    /// A state transition that the phase machine forbids.
    #[error("illegal transition for market {market_id}: {from} -> {to}")]
    IllegalTransition {
        /// Market attempting the transition.
        market_id: String,
        /// Current phase.
        from: String,
        /// Requested phase.
        to: String,
    },

    /// Price model table could not be loaded.
    #[error("price model load failed: {0}")]
    ModelLoadFailed(String),
}

/// Claim redemption errors, split along the retryability boundary.
#[derive(Error, Debug)]
pub enum RedemptionError {
    /// Wallet cannot afford worst-case gas. Not retryable until funded.
    #[error("insufficient funds: balance {balance_wei} wei < required {required_wei} wei")]
    InsufficientFunds {
        /// Native balance in wei.
        balance_wei: u128,
        /// Worst-case gas cost in wei.
        required_wei: u128,
    },

    /// Transient chain failure (nonce conflict, timeout, rate limit).
    #[error("retryable chain error: {0}")]
    Retryable(String),

    /// Non-retryable failure.
    #[error("fatal chain error: {0}")]
    Fatal(String),

    /// Malformed condition id or address.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl RedemptionError {
    /// Whether the redemption engine should schedule a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RedemptionError::Retryable(_))
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, BotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redemption_retryability() {
        assert!(RedemptionError::Retryable("nonce too low".into()).is_retryable());
        assert!(!RedemptionError::InsufficientFunds {
            balance_wei: 0,
            required_wei: 1,
        }
        .is_retryable());
        assert!(!RedemptionError::Fatal("reverted".into()).is_retryable());
    }
}
