//! Rate-limited, cooldown-aware execution client.
//!
//! Every order passes through one gauntlet: cooldown check, request
//! throttle, liquidity precheck against a short-lived book cache, price
//! improvement, balance check, credential handling with a single
//! regenerate-and-retry on 401, submission, and one verification poll.
//! The result is always a [`PlaceOrderOutcome`]; callers never see raw
//! exchange errors.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::ExecutionError;
use crate::market::client::ExchangeApi;
use crate::metrics;
use crate::orderbook::analysis::depth_near_touch;
use crate::orderbook::types::OutcomeBook;
use crate::signing::ApiCredentials;

use super::order::{
    FailureReason, FillStatus, OrderRequest, OrderStatus, OrderView, PlaceOrderOutcome, Side,
};

/// Half-dollar boundary for the price improvement tiers.
const HALF: Decimal = Decimal::from_parts(50, 0, 0, false, 2);
/// Highest price ever submitted for a buy.
const PRICE_CAP: Decimal = Decimal::from_parts(99, 0, 0, false, 2);
/// Lowest price ever submitted for a sell.
const PRICE_FLOOR: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

#[derive(Debug, Clone, Copy)]
struct CachedBalance {
    value: Decimal,
    fetched_at: Instant,
}

struct SimState {
    balance: Mutex<Decimal>,
    next_id: AtomicU32,
}

/// Execution client wrapping an [`ExchangeApi`].
pub struct ExecutionClient {
    exchange: Arc<dyn ExchangeApi>,
    config: Config,
    creds: Mutex<Option<ApiCredentials>>,
    last_request: Mutex<Option<Instant>>,
    cooldown_until: Mutex<Option<Instant>>,
    book_cache: DashMap<String, OutcomeBook>,
    balance_cache: Mutex<Option<CachedBalance>>,
    sim: Option<SimState>,
}

impl ExecutionClient {
    /// Create a client over the given exchange.
    pub fn new(exchange: Arc<dyn ExchangeApi>, config: Config) -> Self {
        let sim = config.dry_run.then(|| SimState {
            balance: Mutex::new(config.sim_balance),
            next_id: AtomicU32::new(1),
        });
        let creds = if config.has_api_credentials() {
            Some(ApiCredentials::new(
                config.polymarket_api_key.clone().unwrap_or_default(),
                config.polymarket_api_secret.clone().unwrap_or_default(),
                config.polymarket_api_passphrase.clone().unwrap_or_default(),
            ))
        } else {
            None
        };

        Self {
            exchange,
            config,
            creds: Mutex::new(creds),
            last_request: Mutex::new(None),
            cooldown_until: Mutex::new(None),
            book_cache: DashMap::new(),
            balance_cache: Mutex::new(None),
            sim,
        }
    }

    /// Whether the client runs in simulation mode.
    pub fn is_dry_run(&self) -> bool {
        self.sim.is_some()
    }

    /// Whether the edge-protection cooldown is currently armed.
    pub async fn in_cooldown(&self) -> bool {
        matches!(*self.cooldown_until.lock().await, Some(until) if Instant::now() < until)
    }

    async fn arm_cooldown(&self) {
        let until = Instant::now() + Duration::from_secs(self.config.block_cooldown_secs);
        *self.cooldown_until.lock().await = Some(until);
        metrics::inc_cooldowns_armed();
        warn!(
            cooldown_secs = self.config.block_cooldown_secs,
            "edge-protection block, cooling down"
        );
    }

    /// Enforce the minimum interval between exchange requests.
    async fn throttle(&self) {
        let interval = Duration::from_millis(self.config.min_request_interval_ms);
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                tokio::time::sleep(interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Book for a token, served from cache when fresh.
    pub async fn book(&self, token_id: &str) -> Result<OutcomeBook, crate::error::MarketError> {
        if let Some(cached) = self.book_cache.get(token_id) {
            if !cached.is_stale(self.config.book_cache_ttl_ms as i64) {
                return Ok(cached.clone());
            }
        }
        let book = self.exchange.fetch_book(token_id).await?;
        self.book_cache.insert(token_id.to_string(), book.clone());
        Ok(book)
    }

    /// Available balance, cached with a short TTL.
    ///
    /// Falls back to the last known value when a refresh fails; a stale
    /// balance beats an aborted trading cycle.
    pub async fn balance(&self) -> Result<Decimal, ExecutionError> {
        if let Some(sim) = &self.sim {
            return Ok(*sim.balance.lock().await);
        }

        let ttl = Duration::from_secs(self.config.balance_cache_ttl_secs);
        let mut cache = self.balance_cache.lock().await;
        if let Some(cached) = *cache {
            if cached.fetched_at.elapsed() < ttl {
                return Ok(cached.value);
            }
        }

        let creds = self.ensure_credentials().await?;
        match self.exchange.fetch_balance(&creds).await {
            Ok(value) => {
                *cache = Some(CachedBalance {
                    value,
                    fetched_at: Instant::now(),
                });
                Ok(value)
            }
            Err(e) => match *cache {
                Some(stale) => {
                    warn!(error = %e, "balance refresh failed, serving stale value");
                    Ok(stale.value)
                }
                None => Err(e),
            },
        }
    }

    async fn ensure_credentials(&self) -> Result<ApiCredentials, ExecutionError> {
        let mut guard = self.creds.lock().await;
        if let Some(creds) = guard.as_ref() {
            return Ok(creds.clone());
        }
        let creds = self.exchange.derive_credentials().await?;
        *guard = Some(creds.clone());
        Ok(creds)
    }

    async fn regenerate_credentials(&self) -> Result<ApiCredentials, ExecutionError> {
        let mut guard = self.creds.lock().await;
        let creds = self.exchange.derive_credentials().await?;
        *guard = Some(creds.clone());
        Ok(creds)
    }

    /// Shift the limit price toward the market to improve fill odds.
    ///
    /// Cheaper contracts get the small improvement, expensive ones the
    /// larger one; results are clamped inside the valid price band.
    fn improve_price(&self, side: Side, price: Decimal) -> Decimal {
        let improvement = if price < HALF {
            self.config.price_improvement_low
        } else {
            self.config.price_improvement_high
        };
        match side {
            Side::Buy => (price + improvement).min(PRICE_CAP),
            Side::Sell => (price - improvement).max(PRICE_FLOOR),
        }
    }

    /// Place an order through the full gauntlet.
    #[instrument(skip(self, request), fields(token_id = %request.token_id, side = %request.side, price = %request.price, size = %request.size))]
    pub async fn place_order(&self, request: OrderRequest) -> PlaceOrderOutcome {
        let timer = metrics::LatencyTimer::order_place();

        if self.in_cooldown().await {
            debug!("rejecting order during cooldown");
            metrics::inc_orders_failed(FailureReason::Cloudflare);
            return PlaceOrderOutcome::failed(FailureReason::Cloudflare);
        }

        self.throttle().await;

        // liquidity precheck against a recent book
        let book = match self.book(&request.token_id).await {
            Ok(book) => book,
            Err(crate::error::MarketError::NoOrderBook { .. }) => {
                metrics::inc_orders_failed(FailureReason::NoOrderbook);
                return PlaceOrderOutcome::failed(FailureReason::NoOrderbook);
            }
            Err(e) => {
                warn!(error = %e, "book fetch failed before submit");
                metrics::inc_orders_failed(FailureReason::Unknown);
                return PlaceOrderOutcome::failed(FailureReason::Unknown);
            }
        };

        let depth = depth_near_touch(&book, request.side);
        if depth < self.config.min_submit_depth {
            debug!(depth = %depth, min = %self.config.min_submit_depth, "insufficient depth");
            metrics::inc_orders_failed(FailureReason::NoLiquidity);
            return PlaceOrderOutcome::failed(FailureReason::NoLiquidity);
        }

        let submit_price = self.improve_price(request.side, request.price);
        let submit_request = OrderRequest {
            price: submit_price,
            ..request.clone()
        };

        if request.side == Side::Buy {
            let cost = submit_price * request.size;
            match self.balance().await {
                Ok(available) if available < cost => {
                    debug!(cost = %cost, available = %available, "insufficient balance");
                    metrics::inc_orders_failed(FailureReason::Balance);
                    return PlaceOrderOutcome::failed(FailureReason::Balance);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "balance check failed");
                    metrics::inc_orders_failed(FailureReason::Balance);
                    return PlaceOrderOutcome::failed(FailureReason::Balance);
                }
            }
        }

        if let Some(sim) = &self.sim {
            let outcome = self.simulate_order(sim, &submit_request, &book).await;
            metrics::inc_orders_placed();
            timer.observe();
            return outcome;
        }

        let creds = match self.ensure_credentials().await {
            Ok(creds) => creds,
            Err(e) => {
                warn!(error = %e, "credential setup failed");
                metrics::inc_orders_failed(FailureReason::Auth);
                return PlaceOrderOutcome::failed(FailureReason::Auth);
            }
        };

        let order_id = match self.exchange.submit_order(&submit_request, &creds).await {
            Ok(id) => id,
            Err(ExecutionError::Unauthorized(_)) => {
                // one credential regeneration, then give up
                info!("401 on submit, regenerating credentials");
                let retry = async {
                    let creds = self.regenerate_credentials().await?;
                    self.exchange.submit_order(&submit_request, &creds).await
                };
                match retry.await {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(error = %e, "submit failed after credential retry");
                        metrics::inc_orders_failed(FailureReason::Auth);
                        return PlaceOrderOutcome::failed(FailureReason::Auth);
                    }
                }
            }
            Err(ExecutionError::EdgeBlocked(_)) => {
                self.arm_cooldown().await;
                metrics::inc_orders_failed(FailureReason::Cloudflare);
                return PlaceOrderOutcome::failed(FailureReason::Cloudflare);
            }
            Err(ExecutionError::InsufficientBalance { .. }) => {
                metrics::inc_orders_failed(FailureReason::Balance);
                return PlaceOrderOutcome::failed(FailureReason::Balance);
            }
            Err(e) => {
                warn!(error = %e, "order submission failed");
                metrics::inc_orders_failed(FailureReason::Unknown);
                return PlaceOrderOutcome::failed(FailureReason::Unknown);
            }
        };

        // one verification poll; a failure here is not a failed order
        let fill_status = match self.exchange.order_status(&order_id, &creds).await {
            Ok(view) => classify_fill(&view),
            Err(e) => {
                warn!(order_id = %order_id, error = %e, "verification poll failed");
                FillStatus::Pending
            }
        };

        info!(order_id = %order_id, fill_status = %fill_status, price = %submit_price, "order placed");
        metrics::inc_orders_placed();
        timer.observe();
        PlaceOrderOutcome::placed(order_id, fill_status, submit_price)
    }

    /// Simulated placement for dry-run mode.
    async fn simulate_order(
        &self,
        sim: &SimState,
        request: &OrderRequest,
        book: &OutcomeBook,
    ) -> PlaceOrderOutcome {
        let id = sim.next_id.fetch_add(1, Ordering::SeqCst);
        let order_id = format!("sim-{}", id);

        // marketable orders fill instantly against the touch
        let fill_status = match request.side {
            Side::Buy => match book.best_ask() {
                Some(ask) if request.price >= ask => FillStatus::Filled,
                _ => FillStatus::Open,
            },
            Side::Sell => match book.best_bid() {
                Some(bid) if request.price <= bid => FillStatus::Filled,
                _ => FillStatus::Open,
            },
        };

        if fill_status == FillStatus::Filled && request.side == Side::Buy {
            let mut balance = sim.balance.lock().await;
            *balance -= request.price * request.size;
        }

        info!(order_id = %order_id, fill_status = %fill_status, "simulated order");
        PlaceOrderOutcome::placed(order_id, fill_status, request.price)
    }

    /// Cancel a resting order.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn cancel_order(&self, order_id: &str) -> Result<(), ExecutionError> {
        if self.sim.is_some() {
            debug!("simulated cancel");
            return Ok(());
        }

        self.throttle().await;
        let creds = self.ensure_credentials().await?;
        match self.exchange.cancel_order(order_id, &creds).await {
            Err(ExecutionError::Unauthorized(_)) => {
                let creds = self.regenerate_credentials().await?;
                self.exchange.cancel_order(order_id, &creds).await
            }
            Err(ExecutionError::EdgeBlocked(msg)) => {
                self.arm_cooldown().await;
                Err(ExecutionError::EdgeBlocked(msg))
            }
            other => other,
        }
    }

    /// Current view of an order.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn order_status(&self, order_id: &str) -> Result<OrderView, ExecutionError> {
        if self.sim.is_some() {
            // simulated orders never change after placement
            return Ok(OrderView {
                order_id: order_id.to_string(),
                status: Some(OrderStatus::Live),
                matched: Decimal::ZERO,
                original: Decimal::ZERO,
                avg_price: None,
                fee_rate_bps: Some(Decimal::ZERO),
                maker: Some(true),
            });
        }

        self.throttle().await;
        let creds = self.ensure_credentials().await?;
        match self.exchange.order_status(order_id, &creds).await {
            Err(ExecutionError::Unauthorized(_)) => {
                let creds = self.regenerate_credentials().await?;
                self.exchange.order_status(order_id, &creds).await
            }
            other => other,
        }
    }
}

/// Classify a verification poll into a fill status.
fn classify_fill(view: &OrderView) -> FillStatus {
    if view.original > Decimal::ZERO && view.matched >= view.original {
        return FillStatus::Filled;
    }
    if view.matched > Decimal::ZERO {
        return FillStatus::Partial;
    }
    match view.status {
        Some(OrderStatus::Live) | Some(OrderStatus::Pending) => FillStatus::Open,
        Some(OrderStatus::Filled) => FillStatus::Filled,
        _ => FillStatus::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::market::mock::{MockExchange, SubmitFailure};
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn live_config() -> Config {
        let mut config = test_config();
        config.dry_run = false;
        config
    }

    fn client_with(exchange: &MockExchange, config: Config) -> ExecutionClient {
        ExecutionClient::new(Arc::new(exchange.clone()), config)
    }

    fn deep_book(exchange: &MockExchange, token_id: &str) {
        exchange.set_book(
            token_id,
            vec![(dec!(0.46), dec!(100))],
            vec![(dec!(0.48), dec!(100))],
        );
    }

    #[tokio::test]
    async fn placement_improves_price_and_verifies() {
        let exchange = MockExchange::new();
        deep_book(&exchange, "tok");
        exchange.set_balance(dec!(500));

        let client = client_with(&exchange, live_config());
        let outcome = client
            .place_order(OrderRequest::buy("tok", dec!(0.47), dec!(10)))
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.submitted_price, Some(dec!(0.48)));
        assert_eq!(outcome.fill_status, Some(FillStatus::Open));
        assert_eq!(exchange.submit_calls(), 1);
        assert_eq!(exchange.status_calls(), 1);
    }

    #[tokio::test]
    async fn improvement_tiers_split_at_half() {
        let exchange = MockExchange::new();
        let client = client_with(&exchange, live_config());

        assert_eq!(client.improve_price(Side::Buy, dec!(0.30)), dec!(0.31));
        assert_eq!(client.improve_price(Side::Buy, dec!(0.60)), dec!(0.62));
        assert_eq!(client.improve_price(Side::Buy, dec!(0.98)), dec!(0.99));
        assert_eq!(client.improve_price(Side::Sell, dec!(0.30)), dec!(0.29));
        assert_eq!(client.improve_price(Side::Sell, dec!(0.01)), dec!(0.01));
    }

    #[tokio::test]
    async fn missing_book_fails_with_no_orderbook() {
        let exchange = MockExchange::new();
        let client = client_with(&exchange, live_config());

        let outcome = client
            .place_order(OrderRequest::buy("missing", dec!(0.50), dec!(10)))
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(FailureReason::NoOrderbook));
        assert_eq!(exchange.submit_calls(), 0);
    }

    #[tokio::test]
    async fn thin_book_fails_with_no_liquidity() {
        let exchange = MockExchange::new();
        exchange.set_book("tok", vec![], vec![(dec!(0.48), dec!(2))]);

        let client = client_with(&exchange, live_config());
        let outcome = client
            .place_order(OrderRequest::buy("tok", dec!(0.47), dec!(10)))
            .await;

        assert_eq!(outcome.failure, Some(FailureReason::NoLiquidity));
        assert_eq!(exchange.submit_calls(), 0);
    }

    #[tokio::test]
    async fn low_balance_fails_before_submit() {
        let exchange = MockExchange::new();
        deep_book(&exchange, "tok");
        exchange.set_balance(dec!(1));

        let client = client_with(&exchange, live_config());
        let outcome = client
            .place_order(OrderRequest::buy("tok", dec!(0.47), dec!(10)))
            .await;

        assert_eq!(outcome.failure, Some(FailureReason::Balance));
        assert_eq!(exchange.submit_calls(), 0);
    }

    #[tokio::test]
    async fn unauthorized_submit_retries_once_with_fresh_credentials() {
        let exchange = MockExchange::new();
        deep_book(&exchange, "tok");
        exchange.set_balance(dec!(500));
        exchange.fail_submits(SubmitFailure::UnauthorizedOnce);

        let client = client_with(&exchange, live_config());
        let outcome = client
            .place_order(OrderRequest::buy("tok", dec!(0.47), dec!(10)))
            .await;

        assert!(outcome.success);
        assert_eq!(exchange.submit_calls(), 2);
        assert_eq!(exchange.derive_calls(), 2);
    }

    #[tokio::test]
    async fn persistent_unauthorized_fails_as_auth() {
        let exchange = MockExchange::new();
        deep_book(&exchange, "tok");
        exchange.set_balance(dec!(500));
        exchange.fail_submits(SubmitFailure::AlwaysUnauthorized);

        let client = client_with(&exchange, live_config());
        let outcome = client
            .place_order(OrderRequest::buy("tok", dec!(0.47), dec!(10)))
            .await;

        assert_eq!(outcome.failure, Some(FailureReason::Auth));
        // one original attempt, one retry, never a third
        assert_eq!(exchange.submit_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn edge_block_arms_cooldown() {
        let exchange = MockExchange::new();
        deep_book(&exchange, "tok");
        exchange.set_balance(dec!(500));
        exchange.fail_submits(SubmitFailure::EdgeBlocked);

        let client = client_with(&exchange, live_config());
        let first = client
            .place_order(OrderRequest::buy("tok", dec!(0.47), dec!(10)))
            .await;
        assert_eq!(first.failure, Some(FailureReason::Cloudflare));
        assert_eq!(exchange.submit_calls(), 1);

        // during cooldown, orders fail fast without touching the exchange
        let second = client
            .place_order(OrderRequest::buy("tok", dec!(0.47), dec!(10)))
            .await;
        assert_eq!(second.failure, Some(FailureReason::Cloudflare));
        assert_eq!(exchange.submit_calls(), 1);

        // after the window the client tries again
        tokio::time::advance(Duration::from_secs(121)).await;
        let third = client
            .place_order(OrderRequest::buy("tok", dec!(0.47), dec!(10)))
            .await;
        assert_eq!(third.failure, Some(FailureReason::Cloudflare));
        assert_eq!(exchange.submit_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_are_throttled() {
        let exchange = MockExchange::new();
        deep_book(&exchange, "tok");
        exchange.set_balance(dec!(500));

        let client = client_with(&exchange, live_config());
        let start = Instant::now();

        client
            .place_order(OrderRequest::buy("tok", dec!(0.47), dec!(1)))
            .await;
        client
            .place_order(OrderRequest::buy("tok", dec!(0.47), dec!(1)))
            .await;

        // second submit must wait out the minimum interval
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn failed_verification_reports_pending() {
        let exchange = MockExchange::new();
        deep_book(&exchange, "tok");
        exchange.set_balance(dec!(500));
        exchange.fail_status_polls(true);

        let client = client_with(&exchange, live_config());
        let outcome = client
            .place_order(OrderRequest::buy("tok", dec!(0.47), dec!(10)))
            .await;

        assert!(outcome.success, "placed order must not be reported failed");
        assert_eq!(outcome.fill_status, Some(FillStatus::Pending));
    }

    #[tokio::test]
    async fn dry_run_fills_marketable_orders_and_debits_balance() {
        let exchange = MockExchange::new();
        deep_book(&exchange, "tok");

        let mut config = test_config();
        config.dry_run = true;
        let client = client_with(&exchange, config);

        let outcome = client
            .place_order(OrderRequest::buy("tok", dec!(0.48), dec!(10)))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.fill_status, Some(FillStatus::Filled));
        assert_eq!(exchange.submit_calls(), 0);

        // 100 - 0.49 * 10 (one tick of improvement below half)
        assert_eq!(client.balance().await.unwrap(), dec!(95.1));
    }

    #[tokio::test]
    async fn stale_balance_served_when_refresh_fails() {
        let exchange = MockExchange::new();
        exchange.set_balance(dec!(42));

        let mut config = live_config();
        config.balance_cache_ttl_secs = 0;
        let client = client_with(&exchange, config);

        assert_eq!(client.balance().await.unwrap(), dec!(42));
        exchange.fail_balance_fetches(true);
        assert_eq!(client.balance().await.unwrap(), dec!(42));
    }

    #[test]
    fn fill_classification() {
        let view = |matched, original, status| OrderView {
            order_id: "o".into(),
            status,
            matched,
            original,
            avg_price: None,
            fee_rate_bps: None,
            maker: None,
        };

        assert_eq!(
            classify_fill(&view(dec!(10), dec!(10), Some(OrderStatus::Filled))),
            FillStatus::Filled
        );
        assert_eq!(
            classify_fill(&view(dec!(4), dec!(10), Some(OrderStatus::Live))),
            FillStatus::Partial
        );
        assert_eq!(
            classify_fill(&view(dec!(0), dec!(10), Some(OrderStatus::Live))),
            FillStatus::Open
        );
        assert_eq!(
            classify_fill(&view(dec!(0), dec!(10), None)),
            FillStatus::Unknown
        );
    }
}
