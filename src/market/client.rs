//! CLOB exchange client.
//!
//! [`ExchangeApi`] is the seam the execution client and redemption
//! engine depend on; [`ClobClient`] is the real HTTP implementation.
//! HTTP status and body quirks are classified into typed errors here so
//! nothing upstream ever inspects a response.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::error::{ExecutionError, MarketError};
use crate::orderbook::types::{OutcomeBook, PriceLevel};
use crate::signing::{self, ApiCredentials, HmacAuth};
use crate::trading::order::{OrderRequest, OrderStatus, OrderView};

use super::types::Outcome;

/// One page of the positions feed.
#[derive(Debug, Clone, Default)]
pub struct PositionsPage {
    /// Position records on this page.
    pub positions: Vec<PositionRecord>,
    /// Cursor for the next page, absent on the last one.
    pub next_cursor: Option<String>,
}

/// A settled or open position reported by the data API.
#[derive(Debug, Clone, Deserialize)]
pub struct PositionRecord {
    /// Settlement condition id.
    #[serde(alias = "conditionId", default)]
    pub condition_id: String,
    /// Token id of the held outcome.
    #[serde(alias = "asset", default)]
    pub token_id: String,
    /// Held size in shares.
    #[serde(default)]
    pub size: Decimal,
    /// Current cash value in dollars.
    #[serde(alias = "currentValue", default)]
    pub value: Decimal,
    /// Whether the market has resolved and the position can be redeemed.
    #[serde(default)]
    pub redeemable: bool,
}

/// Exchange operations the rest of the engine depends on.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Fetch the L2 order book for a token.
    async fn fetch_book(&self, token_id: &str) -> Result<OutcomeBook, MarketError>;

    /// Fetch the available USDC balance.
    async fn fetch_balance(&self, creds: &ApiCredentials) -> Result<Decimal, ExecutionError>;

    /// Submit an order, returning the exchange order id.
    async fn submit_order(
        &self,
        request: &OrderRequest,
        creds: &ApiCredentials,
    ) -> Result<String, ExecutionError>;

    /// Cancel a resting order.
    async fn cancel_order(
        &self,
        order_id: &str,
        creds: &ApiCredentials,
    ) -> Result<(), ExecutionError>;

    /// Fetch the current view of an order.
    async fn order_status(
        &self,
        order_id: &str,
        creds: &ApiCredentials,
    ) -> Result<OrderView, ExecutionError>;

    /// Fetch one page of wallet positions.
    async fn fetch_positions(&self, cursor: Option<&str>) -> Result<PositionsPage, MarketError>;

    /// Derive (or re-derive) API credentials from the wallet key.
    async fn derive_credentials(&self) -> Result<ApiCredentials, ExecutionError>;

    /// Wallet address backing this client.
    fn wallet_address(&self) -> &str;
}

/// Order book response from the CLOB.
#[derive(Debug, Clone, Deserialize)]
struct OrderBookResponse {
    bids: Option<Vec<RawLevel>>,
    asks: Option<Vec<RawLevel>>,
}

/// Single raw price level; the CLOB sends prices and sizes as strings.
#[derive(Debug, Clone, Deserialize, Serialize)]
struct RawLevel {
    price: String,
    size: String,
}

#[derive(Debug, Clone, Deserialize)]
struct BalanceAllowanceResponse {
    balance: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SubmitResponse {
    #[serde(alias = "orderID", alias = "orderId")]
    order_id: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(alias = "errorMsg", default)]
    error_msg: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OrderStatusResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(alias = "size_matched", alias = "sizeMatched", default)]
    matched: Option<String>,
    #[serde(alias = "original_size", alias = "originalSize", default)]
    original: Option<String>,
    #[serde(default)]
    price: Option<String>,
    #[serde(alias = "fee_rate_bps", alias = "feeRateBps", default)]
    fee_rate_bps: Option<String>,
    #[serde(default)]
    maker: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
struct PositionsResponse {
    #[serde(default)]
    data: Vec<PositionRecord>,
    #[serde(alias = "next_cursor", alias = "nextCursor", default)]
    next_cursor: Option<String>,
}

/// Real CLOB API client with a tuned HTTP stack.
#[derive(Debug, Clone)]
pub struct ClobClient {
    http: reqwest::Client,
    clob_url: String,
    data_url: String,
    private_key: String,
    address: String,
}

impl ClobClient {
    /// Create a client from config.
    pub fn new(config: &Config) -> Result<Self, ExecutionError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.http_timeout_ms))
            .connect_timeout(std::time::Duration::from_millis(500))
            // disable Nagle's algorithm
            .tcp_nodelay(true)
            .tcp_keepalive(std::time::Duration::from_secs(30))
            .pool_max_idle_per_host(config.http_pool_size)
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .build()
            .map_err(|e| ExecutionError::SubmissionFailed(format!("http client: {}", e)))?;

        let address = signing::address_from_private_key(&config.polymarket_private_key)?;

        Ok(Self {
            http,
            clob_url: config.polymarket_clob_url.clone(),
            data_url: config.polymarket_data_url.clone(),
            private_key: config.polymarket_private_key.clone(),
            address,
        })
    }

    /// Base CLOB URL.
    pub fn clob_url(&self) -> &str {
        &self.clob_url
    }

    fn auth(&self, creds: &ApiCredentials) -> HmacAuth {
        HmacAuth::new(creds.clone(), self.address.clone())
    }

    /// Classify an order-path HTTP failure into a typed error.
    ///
    /// 401 means the credentials were rejected; 403 with an HTML
    /// challenge body means the edge protection fired. Everything else
    /// is an ordinary submission failure.
    fn classify_http_failure(status: reqwest::StatusCode, body: &str) -> ExecutionError {
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return ExecutionError::Unauthorized(format!("HTTP 401: {}", truncate(body, 200)));
        }
        if status == reqwest::StatusCode::FORBIDDEN && looks_like_edge_block(body) {
            return ExecutionError::EdgeBlocked(format!("HTTP 403: {}", truncate(body, 200)));
        }
        ExecutionError::SubmissionFailed(format!("HTTP {}: {}", status, truncate(body, 200)))
    }

    fn parse_levels(levels: Option<Vec<RawLevel>>) -> Vec<PriceLevel> {
        levels
            .unwrap_or_default()
            .into_iter()
            .filter_map(|level| {
                let price: Decimal = level.price.parse().ok()?;
                let size: Decimal = level.size.parse().ok()?;
                (size > Decimal::ZERO).then_some(PriceLevel { price, size })
            })
            .collect()
    }
}

/// WAF challenge pages are HTML, never JSON.
fn looks_like_edge_block(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("cloudflare")
        || lower.contains("just a moment")
        || lower.contains("attention required")
        || lower.starts_with("<!doctype html")
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl ExchangeApi for ClobClient {
    #[instrument(skip(self), fields(token_id = %token_id))]
    async fn fetch_book(&self, token_id: &str) -> Result<OutcomeBook, MarketError> {
        let url = format!("{}/book", self.clob_url);

        let response = self
            .http
            .get(&url)
            .query(&[("token_id", token_id)])
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(MarketError::NoOrderBook {
                token_id: token_id.to_string(),
            });
        }
        if !status.is_success() {
            return Err(MarketError::FetchFailed {
                token_id: token_id.to_string(),
                reason: format!("HTTP {}", status),
            });
        }

        let book: OrderBookResponse = response
            .json()
            .await
            .map_err(|e| MarketError::ParseError(format!("order book: {}", e)))?;

        let mut bids = Self::parse_levels(book.bids);
        let mut asks = Self::parse_levels(book.asks);
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));

        Ok(OutcomeBook {
            token_id: token_id.to_string(),
            // the caller re-tags this with the market's outcome
            outcome: Outcome::Up,
            bids,
            asks,
            updated_at: time::OffsetDateTime::now_utc(),
        })
    }

    #[instrument(skip(self, creds))]
    async fn fetch_balance(&self, creds: &ApiCredentials) -> Result<Decimal, ExecutionError> {
        let path = "/balance-allowance";
        let url = format!("{}{}", self.clob_url, path);
        let headers = self.auth(creds).build_headers("GET", path, None)?;

        let response = self
            .http
            .get(&url)
            .headers(headers)
            .query(&[("asset_type", "COLLATERAL")])
            .send()
            .await
            .map_err(|e| ExecutionError::BalanceUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match Self::classify_http_failure(status, &body) {
                e @ (ExecutionError::Unauthorized(_) | ExecutionError::EdgeBlocked(_)) => e,
                _ => ExecutionError::BalanceUnavailable(format!("HTTP {}", status)),
            });
        }

        let parsed: BalanceAllowanceResponse = response
            .json()
            .await
            .map_err(|e| ExecutionError::BalanceUnavailable(format!("parse: {}", e)))?;

        // balance arrives in USDC wei (6 decimals)
        let balance_wei: Decimal = parsed
            .balance
            .as_deref()
            .unwrap_or("0")
            .parse()
            .unwrap_or(Decimal::ZERO);
        let balance = balance_wei / Decimal::new(1_000_000, 0);

        debug!(balance = %balance, "fetched balance");
        Ok(balance)
    }

    #[instrument(skip(self, creds), fields(token_id = %request.token_id, side = %request.side, price = %request.price, size = %request.size))]
    async fn submit_order(
        &self,
        request: &OrderRequest,
        creds: &ApiCredentials,
    ) -> Result<String, ExecutionError> {
        request
            .validate()
            .map_err(ExecutionError::InvalidParams)?;

        let path = "/order";
        let url = format!("{}{}", self.clob_url, path);
        let body = json!({
            "order": {
                "tokenID": request.token_id,
                "side": request.side.to_string(),
                "price": request.price.to_string(),
                "size": request.size.to_string(),
                "maker": self.address,
            },
            "owner": creds.api_key,
            "orderType": request.order_type.to_string(),
        });
        let body_str = serde_json::to_string(&body)
            .map_err(|e| ExecutionError::SubmissionFailed(format!("serialize: {}", e)))?;

        let headers = self.auth(creds).build_headers("POST", path, Some(&body_str))?;

        let response = self
            .http
            .post(&url)
            .headers(headers)
            .header("Content-Type", "application/json")
            .body(body_str)
            .send()
            .await
            .map_err(|e| ExecutionError::SubmissionFailed(e.to_string()))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Self::classify_http_failure(status, &text));
        }

        let parsed: SubmitResponse = serde_json::from_str(&text)
            .map_err(|e| ExecutionError::SubmissionFailed(format!("parse: {}", e)))?;

        if parsed.success == Some(false) {
            let msg = parsed.error_msg.unwrap_or_else(|| "rejected".to_string());
            if msg.to_ascii_lowercase().contains("balance") {
                return Err(ExecutionError::InsufficientBalance {
                    required: request.price * request.size,
                    available: Decimal::ZERO,
                });
            }
            return Err(ExecutionError::SubmissionFailed(msg));
        }

        parsed
            .order_id
            .ok_or_else(|| ExecutionError::SubmissionFailed("response carried no order id".into()))
    }

    #[instrument(skip(self, creds), fields(order_id = %order_id))]
    async fn cancel_order(
        &self,
        order_id: &str,
        creds: &ApiCredentials,
    ) -> Result<(), ExecutionError> {
        let path = "/order";
        let url = format!("{}{}", self.clob_url, path);
        let body = json!({ "orderID": order_id });
        let body_str = serde_json::to_string(&body)
            .map_err(|e| ExecutionError::CancelFailed {
                order_id: order_id.to_string(),
                reason: format!("serialize: {}", e),
            })?;

        let headers = self
            .auth(creds)
            .build_headers("DELETE", path, Some(&body_str))?;

        let response = self
            .http
            .delete(&url)
            .headers(headers)
            .header("Content-Type", "application/json")
            .body(body_str)
            .send()
            .await
            .map_err(|e| ExecutionError::CancelFailed {
                order_id: order_id.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match Self::classify_http_failure(status, &body) {
                e @ (ExecutionError::Unauthorized(_) | ExecutionError::EdgeBlocked(_)) => e,
                _ => ExecutionError::CancelFailed {
                    order_id: order_id.to_string(),
                    reason: format!("HTTP {}", status),
                },
            });
        }

        Ok(())
    }

    #[instrument(skip(self, creds), fields(order_id = %order_id))]
    async fn order_status(
        &self,
        order_id: &str,
        creds: &ApiCredentials,
    ) -> Result<OrderView, ExecutionError> {
        let path = format!("/data/order/{}", order_id);
        let url = format!("{}{}", self.clob_url, path);
        let headers = self.auth(creds).build_headers("GET", &path, None)?;

        let response = self
            .http
            .get(&url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| ExecutionError::StatusFailed {
                order_id: order_id.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match Self::classify_http_failure(status, &body) {
                e @ (ExecutionError::Unauthorized(_) | ExecutionError::EdgeBlocked(_)) => e,
                _ => ExecutionError::StatusFailed {
                    order_id: order_id.to_string(),
                    reason: format!("HTTP {}", status),
                },
            });
        }

        let parsed: OrderStatusResponse =
            response.json().await.map_err(|e| ExecutionError::StatusFailed {
                order_id: order_id.to_string(),
                reason: format!("parse: {}", e),
            })?;

        let parse_dec = |s: &Option<String>| -> Decimal {
            s.as_deref()
                .and_then(|v| v.parse().ok())
                .unwrap_or(Decimal::ZERO)
        };

        // unknown statuses are preserved as None rather than guessed at
        let order_status = parsed
            .status
            .as_deref()
            .and_then(|s| s.parse::<OrderStatus>().ok());
        if order_status.is_none() {
            warn!(order_id = %order_id, status = ?parsed.status, "unrecognized order status");
        }

        Ok(OrderView {
            order_id: order_id.to_string(),
            status: order_status,
            matched: parse_dec(&parsed.matched),
            original: parse_dec(&parsed.original),
            avg_price: parsed.price.as_deref().and_then(|v| v.parse().ok()),
            fee_rate_bps: parsed.fee_rate_bps.as_deref().and_then(|v| v.parse().ok()),
            maker: parsed.maker,
        })
    }

    #[instrument(skip(self))]
    async fn fetch_positions(&self, cursor: Option<&str>) -> Result<PositionsPage, MarketError> {
        let url = format!("{}/positions", self.data_url);

        let mut query: Vec<(&str, String)> = vec![("user", self.address.clone())];
        if let Some(c) = cursor {
            query.push(("cursor", c.to_string()));
        }

        let response = self.http.get(&url).query(&query).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MarketError::FetchFailed {
                token_id: "positions".to_string(),
                reason: format!("HTTP {}", status),
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| MarketError::ParseError(format!("positions body: {}", e)))?;

        // The feed responds with either a bare array or a paged envelope.
        if let Ok(positions) = serde_json::from_str::<Vec<PositionRecord>>(&text) {
            return Ok(PositionsPage {
                positions,
                next_cursor: None,
            });
        }

        let parsed: PositionsResponse = serde_json::from_str(&text)
            .map_err(|e| MarketError::ParseError(format!("positions: {}", e)))?;

        let next_cursor = parsed
            .next_cursor
            .filter(|c| !c.is_empty() && c != "LTE=");

        Ok(PositionsPage {
            positions: parsed.data,
            next_cursor,
        })
    }

    #[instrument(skip(self))]
    async fn derive_credentials(&self) -> Result<ApiCredentials, ExecutionError> {
        let url = format!("{}/auth/derive-api-key", self.clob_url);
        let headers = signing::build_l1_headers(&self.private_key, 0).await?;

        let mut request = self.http.get(&url);
        for (key, value) in headers {
            request = request.header(&key, &value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ExecutionError::CredentialsFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecutionError::CredentialsFailed(format!(
                "HTTP {}: {}",
                status,
                truncate(&body, 200)
            )));
        }

        let creds: ApiCredentials = response
            .json()
            .await
            .map_err(|e| ExecutionError::CredentialsFailed(format!("parse: {}", e)))?;

        debug!(api_key = %creds.api_key, "derived api credentials");
        Ok(creds)
    }

    fn wallet_address(&self) -> &str {
        &self.address
    }
}
