//! Market types for 15-minute Up/Down prediction markets.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use time::OffsetDateTime;

/// Underlying asset of an Up/Down market.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Asset {
    /// Bitcoin.
    #[default]
    Btc,
    /// Ethereum.
    Eth,
    /// Solana.
    Sol,
    /// XRP.
    Xrp,
}

/// Market outcome for Up/Down binary markets.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Asset goes up (YES token).
    #[strum(serialize = "up", serialize = "yes", serialize = "UP", serialize = "YES")]
    #[default]
    Up,
    /// Asset goes down (NO token).
    #[strum(serialize = "down", serialize = "no", serialize = "DOWN", serialize = "NO")]
    Down,
}

impl Outcome {
    /// Get the opposite outcome.
    pub fn opposite(&self) -> Self {
        match self {
            Outcome::Up => Outcome::Down,
            Outcome::Down => Outcome::Up,
        }
    }
}

/// Active 15-minute market information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    /// Market slug (e.g., "btc-updown-15m-1765301400").
    pub slug: String,
    /// Unique market identifier.
    pub id: String,
    /// Underlying asset.
    #[serde(default)]
    pub asset: Asset,
    /// Settlement condition id (0x-prefixed bytes32 hex).
    pub condition_id: String,
    /// UP (YES) token ID for the CLOB.
    pub up_token_id: String,
    /// DOWN (NO) token ID for the CLOB.
    pub down_token_id: String,
    /// Unix timestamp when the market opened.
    pub start_timestamp: i64,
    /// Unix timestamp when the market closes (start + 900s).
    pub end_timestamp: i64,
    /// Market question text.
    #[serde(default)]
    pub question: Option<String>,
}

impl Market {
    /// Duration of a 15-minute market in seconds.
    pub const WINDOW_SECONDS: i64 = 900;

    /// Get the token ID for a given outcome.
    pub fn token_id(&self, outcome: Outcome) -> &str {
        match outcome {
            Outcome::Up => &self.up_token_id,
            Outcome::Down => &self.down_token_id,
        }
    }

    /// The outcome a token id belongs to, if it belongs to this market.
    pub fn outcome_of(&self, token_id: &str) -> Option<Outcome> {
        if token_id == self.up_token_id {
            Some(Outcome::Up)
        } else if token_id == self.down_token_id {
            Some(Outcome::Down)
        } else {
            None
        }
    }

    /// Check if the market is closed.
    pub fn is_closed(&self) -> bool {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        now >= self.end_timestamp
    }

    /// Seconds elapsed since the market opened.
    pub fn elapsed_secs(&self) -> i64 {
        OffsetDateTime::now_utc().unix_timestamp() - self.start_timestamp
    }

    /// Get remaining time until the market closes.
    pub fn time_remaining(&self) -> Option<std::time::Duration> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let remaining = self.end_timestamp - now;
        if remaining <= 0 {
            None
        } else {
            Some(std::time::Duration::from_secs(remaining as u64))
        }
    }

}

#[cfg(test)]
pub(crate) fn test_market(id: &str) -> Market {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    Market {
        slug: format!("btc-updown-15m-{}", id),
        id: id.to_string(),
        asset: Asset::Btc,
        condition_id: format!("0x{:064x}", 0xabcdu64),
        up_token_id: format!("{}-up", id),
        down_token_id: format!("{}-down", id),
        start_timestamp: now - 120,
        end_timestamp: now + Market::WINDOW_SECONDS - 120,
        question: None,
    }
}
