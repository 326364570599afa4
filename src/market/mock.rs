//! In-memory exchange for unit tests.
//!
//! Implements [`ExchangeApi`] against scripted books, balances, and
//! order views so the execution client and engines can be exercised
//! without a network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::{ExecutionError, MarketError};
use crate::orderbook::types::{OutcomeBook, PriceLevel};
use crate::signing::ApiCredentials;
use crate::trading::order::{OrderRequest, OrderStatus, OrderView};

use super::client::{ExchangeApi, PositionRecord, PositionsPage};
use super::types::Outcome;

/// Scripted submit failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitFailure {
    /// Fail the first submit with 401, succeed afterwards.
    UnauthorizedOnce,
    /// Fail every submit with 401.
    AlwaysUnauthorized,
    /// Fail every submit with an edge-protection block.
    EdgeBlocked,
    /// Fail every submit with insufficient balance.
    Balance,
}

/// Scripted exchange backend.
#[derive(Clone, Default)]
pub struct MockExchange {
    inner: Arc<MockInner>,
}

#[derive(Default)]
struct MockInner {
    books: Mutex<HashMap<String, OutcomeBook>>,
    position_pages: Mutex<Vec<Vec<PositionRecord>>>,
    balance: Mutex<Decimal>,
    order_views: Mutex<HashMap<String, OrderView>>,
    submit_failure: Mutex<Option<SubmitFailure>>,
    fail_status: AtomicBool,
    fail_balance: AtomicBool,
    submit_calls: AtomicU32,
    status_calls: AtomicU32,
    cancel_calls: AtomicU32,
    derive_calls: AtomicU32,
    next_order_id: AtomicU32,
}

impl MockExchange {
    /// Fresh exchange with no scripted data.
    pub fn new() -> Self {
        Self::default()
    }

    /// Test credentials accepted by the mock.
    pub fn test_credentials() -> ApiCredentials {
        ApiCredentials::new("mock-key".into(), "bW9jay1zZWNyZXQ=".into(), "mock-pass".into())
    }

    /// Script an order book for a token.
    pub fn set_book(&self, token_id: &str, bids: Vec<(Decimal, Decimal)>, asks: Vec<(Decimal, Decimal)>) {
        let to_levels = |pairs: Vec<(Decimal, Decimal)>| {
            pairs
                .into_iter()
                .map(|(price, size)| PriceLevel { price, size })
                .collect::<Vec<_>>()
        };
        let mut bids = to_levels(bids);
        let mut asks = to_levels(asks);
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));

        self.inner.books.lock().unwrap().insert(
            token_id.to_string(),
            OutcomeBook {
                token_id: token_id.to_string(),
                outcome: Outcome::Up,
                bids,
                asks,
                updated_at: time::OffsetDateTime::now_utc(),
            },
        );
    }

    /// Script the balance.
    pub fn set_balance(&self, balance: Decimal) {
        *self.inner.balance.lock().unwrap() = balance;
    }

    /// Script the positions feed as pages served in order.
    pub fn set_position_pages(&self, pages: Vec<Vec<PositionRecord>>) {
        *self.inner.position_pages.lock().unwrap() = pages;
    }

    /// Script the view returned by `order_status` for an order id.
    pub fn script_status(&self, order_id: &str, view: OrderView) {
        self.inner
            .order_views
            .lock()
            .unwrap()
            .insert(order_id.to_string(), view);
    }

    /// Arm a submit failure mode.
    pub fn fail_submits(&self, mode: SubmitFailure) {
        *self.inner.submit_failure.lock().unwrap() = Some(mode);
    }

    /// Make status polls fail.
    pub fn fail_status_polls(&self, fail: bool) {
        self.inner.fail_status.store(fail, Ordering::SeqCst);
    }

    /// Make balance fetches fail.
    pub fn fail_balance_fetches(&self, fail: bool) {
        self.inner.fail_balance.store(fail, Ordering::SeqCst);
    }

    /// Number of submit calls observed.
    pub fn submit_calls(&self) -> u32 {
        self.inner.submit_calls.load(Ordering::SeqCst)
    }

    /// Number of status calls observed.
    pub fn status_calls(&self) -> u32 {
        self.inner.status_calls.load(Ordering::SeqCst)
    }

    /// Number of cancel calls observed.
    pub fn cancel_calls(&self) -> u32 {
        self.inner.cancel_calls.load(Ordering::SeqCst)
    }

    /// Number of credential derivations observed.
    pub fn derive_calls(&self) -> u32 {
        self.inner.derive_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn fetch_book(&self, token_id: &str) -> Result<OutcomeBook, MarketError> {
        self.inner
            .books
            .lock()
            .unwrap()
            .get(token_id)
            .cloned()
            .ok_or_else(|| MarketError::NoOrderBook {
                token_id: token_id.to_string(),
            })
    }

    async fn fetch_balance(&self, _creds: &ApiCredentials) -> Result<Decimal, ExecutionError> {
        if self.inner.fail_balance.load(Ordering::SeqCst) {
            return Err(ExecutionError::BalanceUnavailable("scripted failure".into()));
        }
        Ok(*self.inner.balance.lock().unwrap())
    }

    async fn submit_order(
        &self,
        request: &OrderRequest,
        _creds: &ApiCredentials,
    ) -> Result<String, ExecutionError> {
        self.inner.submit_calls.fetch_add(1, Ordering::SeqCst);

        let mut failure = self.inner.submit_failure.lock().unwrap();
        match *failure {
            Some(SubmitFailure::UnauthorizedOnce) => {
                *failure = None;
                return Err(ExecutionError::Unauthorized("scripted 401".into()));
            }
            Some(SubmitFailure::AlwaysUnauthorized) => {
                return Err(ExecutionError::Unauthorized("scripted 401".into()));
            }
            Some(SubmitFailure::EdgeBlocked) => {
                return Err(ExecutionError::EdgeBlocked("scripted block".into()));
            }
            Some(SubmitFailure::Balance) => {
                return Err(ExecutionError::InsufficientBalance {
                    required: request.price * request.size,
                    available: Decimal::ZERO,
                });
            }
            None => {}
        }
        drop(failure);

        let id = self.inner.next_order_id.fetch_add(1, Ordering::SeqCst);
        let order_id = format!("mock-order-{}", id);

        // default view: resting, unfilled; tests re-script as needed
        self.inner.order_views.lock().unwrap().insert(
            order_id.clone(),
            OrderView {
                order_id: order_id.clone(),
                status: Some(OrderStatus::Live),
                matched: Decimal::ZERO,
                original: request.size,
                avg_price: Some(request.price),
                fee_rate_bps: Some(Decimal::ZERO),
                maker: Some(true),
            },
        );

        Ok(order_id)
    }

    async fn cancel_order(
        &self,
        order_id: &str,
        _creds: &ApiCredentials,
    ) -> Result<(), ExecutionError> {
        self.inner.cancel_calls.fetch_add(1, Ordering::SeqCst);

        let mut views = self.inner.order_views.lock().unwrap();
        match views.get_mut(order_id) {
            Some(view) => {
                view.status = Some(OrderStatus::Canceled);
                Ok(())
            }
            None => Err(ExecutionError::CancelFailed {
                order_id: order_id.to_string(),
                reason: "unknown order".to_string(),
            }),
        }
    }

    async fn order_status(
        &self,
        order_id: &str,
        _creds: &ApiCredentials,
    ) -> Result<OrderView, ExecutionError> {
        self.inner.status_calls.fetch_add(1, Ordering::SeqCst);

        if self.inner.fail_status.load(Ordering::SeqCst) {
            return Err(ExecutionError::StatusFailed {
                order_id: order_id.to_string(),
                reason: "scripted failure".to_string(),
            });
        }

        self.inner
            .order_views
            .lock()
            .unwrap()
            .get(order_id)
            .cloned()
            .ok_or_else(|| ExecutionError::StatusFailed {
                order_id: order_id.to_string(),
                reason: "unknown order".to_string(),
            })
    }

    async fn fetch_positions(&self, cursor: Option<&str>) -> Result<PositionsPage, MarketError> {
        let pages = self.inner.position_pages.lock().unwrap();
        let index = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let positions = pages.get(index).cloned().unwrap_or_default();
        let next_cursor = (index + 1 < pages.len()).then(|| (index + 1).to_string());
        Ok(PositionsPage {
            positions,
            next_cursor,
        })
    }

    async fn derive_credentials(&self) -> Result<ApiCredentials, ExecutionError> {
        self.inner.derive_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::test_credentials())
    }

    fn wallet_address(&self) -> &str {
        "0x0000000000000000000000000000000000000001"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn scripted_book_roundtrip() {
        let exchange = MockExchange::new();
        exchange.set_book(
            "tok",
            vec![(dec!(0.48), dec!(50))],
            vec![(dec!(0.52), dec!(50))],
        );

        let book = exchange.fetch_book("tok").await.unwrap();
        assert_eq!(book.best_bid(), Some(dec!(0.48)));
        assert_eq!(book.best_ask(), Some(dec!(0.52)));

        assert!(exchange.fetch_book("missing").await.is_err());
    }

    #[tokio::test]
    async fn submit_creates_live_order() {
        let exchange = MockExchange::new();
        let creds = MockExchange::test_credentials();
        let request = OrderRequest::buy("tok", dec!(0.50), dec!(10));

        let order_id = exchange.submit_order(&request, &creds).await.unwrap();
        assert_eq!(exchange.submit_calls(), 1);

        let view = exchange.order_status(&order_id, &creds).await.unwrap();
        assert_eq!(view.status, Some(OrderStatus::Live));
        assert_eq!(view.original, dec!(10));
        assert_eq!(view.matched, dec!(0));

        exchange.cancel_order(&order_id, &creds).await.unwrap();
        let view = exchange.order_status(&order_id, &creds).await.unwrap();
        assert_eq!(view.status, Some(OrderStatus::Canceled));
    }

    #[tokio::test]
    async fn unauthorized_once_recovers() {
        let exchange = MockExchange::new();
        let creds = MockExchange::test_credentials();
        exchange.fail_submits(SubmitFailure::UnauthorizedOnce);

        let request = OrderRequest::buy("tok", dec!(0.50), dec!(10));
        let first = exchange.submit_order(&request, &creds).await;
        assert!(matches!(first, Err(ExecutionError::Unauthorized(_))));

        let second = exchange.submit_order(&request, &creds).await;
        assert!(second.is_ok());
        assert_eq!(exchange.submit_calls(), 2);
    }

    #[tokio::test]
    async fn paged_positions_walk() {
        let exchange = MockExchange::new();
        exchange.set_position_pages(vec![
            vec![PositionRecord {
                condition_id: "0xaa".into(),
                token_id: "tok-1".into(),
                size: dec!(10),
                value: dec!(9),
                redeemable: true,
            }],
            vec![PositionRecord {
                condition_id: "0xbb".into(),
                token_id: "tok-2".into(),
                size: dec!(5),
                value: dec!(5),
                redeemable: false,
            }],
        ]);

        let first = exchange.fetch_positions(None).await.unwrap();
        assert_eq!(first.positions.len(), 1);
        let cursor = first.next_cursor.unwrap();

        let second = exchange.fetch_positions(Some(&cursor)).await.unwrap();
        assert_eq!(second.positions[0].condition_id, "0xbb");
        assert!(second.next_cursor.is_none());
    }
}
