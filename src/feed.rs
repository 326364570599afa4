//! Market data feed.
//!
//! Polls the exchange for both outcome books of every watched market
//! and emits [`FeedEvent`]s over a channel. When a market's window
//! closes, a single `Retired` event is emitted and the market is
//! dropped from the poll set.

use std::path::Path;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{BotError, MarketError};
use crate::market::client::ExchangeApi;
use crate::market::types::Market;
use crate::orderbook::types::OutcomeBook;

/// Both books of one market at one instant.
#[derive(Debug, Clone)]
pub struct MarketTick {
    /// The market.
    pub market: Market,
    /// UP outcome book.
    pub up_book: OutcomeBook,
    /// DOWN outcome book.
    pub down_book: OutcomeBook,
    /// When the tick was assembled.
    pub ts: OffsetDateTime,
}

/// Events the feed emits to the strategy engine.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// Fresh books for a live market.
    Tick(MarketTick),
    /// The market's window has closed.
    Retired {
        /// Id of the retired market.
        market_id: String,
    },
}

/// Load the market watchlist from a JSON file.
pub fn load_watchlist(path: impl AsRef<Path>) -> Result<Vec<Market>, BotError> {
    let text = std::fs::read_to_string(path.as_ref())?;
    let markets: Vec<Market> = serde_json::from_str(&text)?;
    info!(count = markets.len(), "loaded watchlist");
    Ok(markets)
}

/// Spawn the polling feed task.
///
/// The task exits when every market has retired or the receiver side
/// of the channel goes away.
pub fn spawn_polling_feed(
    exchange: Arc<dyn ExchangeApi>,
    mut markets: Vec<Market>,
    poll_interval_ms: u64,
    tx: mpsc::Sender<FeedEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_millis(poll_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while !markets.is_empty() {
            interval.tick().await;

            let mut retired = Vec::new();
            for market in &markets {
                if market.is_closed() {
                    retired.push(market.id.clone());
                    continue;
                }

                match fetch_tick(exchange.as_ref(), market).await {
                    Ok(tick) => {
                        if tx.send(FeedEvent::Tick(tick)).await.is_err() {
                            debug!("feed receiver dropped, stopping");
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(market_id = %market.id, error = %e, "tick fetch failed");
                    }
                }
            }

            for market_id in retired {
                markets.retain(|m| m.id != market_id);
                info!(market_id = %market_id, "market retired");
                if tx.send(FeedEvent::Retired { market_id }).await.is_err() {
                    return;
                }
            }
        }
        info!("all markets retired, feed stopping");
    })
}

async fn fetch_tick(exchange: &dyn ExchangeApi, market: &Market) -> Result<MarketTick, MarketError> {
    let mut up_book = exchange.fetch_book(&market.up_token_id).await?;
    up_book.outcome = crate::market::types::Outcome::Up;
    let mut down_book = exchange.fetch_book(&market.down_token_id).await?;
    down_book.outcome = crate::market::types::Outcome::Down;

    Ok(MarketTick {
        market: market.clone(),
        up_book,
        down_book,
        ts: OffsetDateTime::now_utc(),
    })
}
