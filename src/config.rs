//! Application configuration loaded from environment variables.

use rust_decimal::Decimal;
use serde::Deserialize;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // === Polymarket Credentials ===
    /// Wallet private key (hex, starts with 0x).
    pub polymarket_private_key: String,

    /// Optional pre-generated API key (derived from the wallet if absent).
    #[serde(default)]
    pub polymarket_api_key: Option<String>,

    /// Optional API secret.
    #[serde(default)]
    pub polymarket_api_secret: Option<String>,

    /// Optional API passphrase.
    #[serde(default)]
    pub polymarket_api_passphrase: Option<String>,

    /// CLOB API base URL.
    #[serde(default = "default_clob_url")]
    pub polymarket_clob_url: String,

    /// Data API base URL (positions feed).
    #[serde(default = "default_data_url")]
    pub polymarket_data_url: String,

    /// Polygon RPC URL for settlement redemptions.
    #[serde(default = "default_polygon_rpc")]
    pub polygon_rpc_url: String,

    // === Risk Caps ===
    /// Maximum effective exposure per market side, in shares.
    #[serde(default = "default_exposure_cap")]
    pub exposure_cap_shares: Decimal,

    /// Maximum simultaneously-entered markets per asset.
    #[serde(default = "default_max_markets_per_asset")]
    pub max_markets_per_asset: usize,

    // === Entry Parameters ===
    /// Minimum edge (fair minus tradeable price) required to enter.
    #[serde(default = "default_min_entry_edge")]
    pub min_entry_edge: Decimal,

    /// Entry order size in shares.
    #[serde(default = "default_entry_size")]
    pub entry_size: Decimal,

    /// Maximum bid/ask spread tolerated for entry.
    #[serde(default = "default_max_entry_spread")]
    pub max_entry_spread: Decimal,

    /// Minimum book depth near the touch for entry, in shares.
    #[serde(default = "default_min_entry_depth")]
    pub min_entry_depth: Decimal,

    /// Earliest second of the market window at which entries open.
    #[serde(default = "default_entry_window_start")]
    pub entry_window_start_secs: i64,

    /// Latest second of the market window at which entries close.
    #[serde(default = "default_entry_window_end")]
    pub entry_window_end_secs: i64,

    /// Maximum book age before a tick is considered stale.
    #[serde(default = "default_max_book_age_ms")]
    pub max_book_age_ms: i64,

    // === Hedge Parameters ===
    /// Minimum seconds between entry fill and first hedge attempt.
    #[serde(default = "default_hedge_dwell")]
    pub hedge_dwell_secs: i64,

    /// Edge on the entry side below which the market counts as corrected.
    #[serde(default = "default_corrected_edge")]
    pub corrected_edge_threshold: Decimal,

    /// Per-share unrealized gain that triggers a hedge.
    #[serde(default = "default_profit_trigger")]
    pub hedge_profit_trigger: Decimal,

    /// Seconds before market close after which no hedge is attempted.
    #[serde(default = "default_hedge_deadline")]
    pub hedge_deadline_secs: i64,

    /// Hedge size as a ratio of entry shares.
    #[serde(default = "default_hedge_ratio")]
    pub hedge_ratio: Decimal,

    /// Minimum hedge size in shares.
    #[serde(default = "default_hedge_min")]
    pub hedge_min_shares: Decimal,

    /// Maximum hedge size in shares.
    #[serde(default = "default_hedge_max")]
    pub hedge_max_shares: Decimal,

    /// Maximum ask price at which a hedge is bought.
    #[serde(default = "default_hedge_ask_ceiling")]
    pub hedge_ask_ceiling: Decimal,

    /// Maximum entry-average + hedge-ask combined price.
    #[serde(default = "default_combined_ceiling")]
    pub combined_price_ceiling: Decimal,

    /// Minimum seconds between hedge attempts on the same market.
    #[serde(default = "default_hedge_retry")]
    pub hedge_retry_secs: i64,

    // === Execution Client ===
    /// Minimum milliseconds between exchange order requests.
    #[serde(default = "default_min_request_interval")]
    pub min_request_interval_ms: u64,

    /// Cooldown after an edge-protection block, in seconds.
    #[serde(default = "default_block_cooldown")]
    pub block_cooldown_secs: u64,

    /// Minimum book depth required before submitting, in shares.
    #[serde(default = "default_min_submit_depth")]
    pub min_submit_depth: Decimal,

    /// Book cache TTL for the liquidity precheck, in milliseconds.
    #[serde(default = "default_book_cache_ttl")]
    pub book_cache_ttl_ms: u64,

    /// Balance cache TTL in seconds.
    #[serde(default = "default_balance_cache_ttl")]
    pub balance_cache_ttl_secs: u64,

    /// Price improvement below 50 cents.
    #[serde(default = "default_improvement_low")]
    pub price_improvement_low: Decimal,

    /// Price improvement at or above 50 cents.
    #[serde(default = "default_improvement_high")]
    pub price_improvement_high: Decimal,

    /// HTTP timeout in milliseconds.
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,

    /// HTTP connection pool size per host.
    #[serde(default = "default_http_pool_size")]
    pub http_pool_size: usize,

    // === Kill Switch ===
    /// Whether fills must carry fee data; a missing-fee fill trips the switch.
    #[serde(default)]
    pub require_fee_data: bool,

    /// Trailing fill window size for the maker-ratio check.
    #[serde(default = "default_maker_window")]
    pub maker_ratio_window: usize,

    /// Minimum maker-fill ratio over the trailing window.
    #[serde(default = "default_min_maker_ratio")]
    pub min_maker_ratio: Decimal,

    // === Redemption Engine ===
    /// Seconds between redemption cycles.
    #[serde(default = "default_claim_interval")]
    pub claim_interval_secs: u64,

    /// Maximum redemptions submitted per cycle.
    #[serde(default = "default_claim_batch")]
    pub claim_batch_size: usize,

    /// Minimum position value worth claiming, in dollars.
    #[serde(default = "default_min_claim_value")]
    pub min_claim_value: Decimal,

    /// Maximum retries per failed claim.
    #[serde(default = "default_claim_max_retries")]
    pub claim_max_retries: u32,

    /// Base retry backoff in seconds; grows linearly with attempt count.
    #[serde(default = "default_claim_backoff")]
    pub claim_retry_backoff_secs: u64,

    /// Delay between claims within a batch, in milliseconds.
    #[serde(default = "default_inter_claim_delay")]
    pub inter_claim_delay_ms: u64,

    /// Append-only journal of confirmed condition ids.
    #[serde(default)]
    pub claim_journal_path: Option<String>,

    // === External Inputs ===
    /// JSON table backing the fair-price model.
    #[serde(default)]
    pub price_model_path: Option<String>,

    /// JSON watchlist of markets to trade (supplied by upstream discovery).
    #[serde(default)]
    pub watchlist_path: Option<String>,

    /// Feed poll interval in milliseconds.
    #[serde(default = "default_feed_poll_interval")]
    pub feed_poll_interval_ms: u64,

    /// Optional JSONL file for audit events.
    #[serde(default)]
    pub audit_log_path: Option<String>,

    // === Operation Modes ===
    /// Simulation mode (no real orders, no real claims).
    #[serde(default = "default_true")]
    pub dry_run: bool,

    /// Starting balance for simulation.
    #[serde(default = "default_sim_balance")]
    pub sim_balance: Decimal,

    /// Cancel resting orders on shutdown.
    #[serde(default)]
    pub cancel_on_shutdown: bool,

    // === Server Configuration ===
    /// HTTP server port for health/status endpoints.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Enable the Prometheus exporter.
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Prometheus exporter port.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub rust_log: String,
}

fn default_clob_url() -> String {
    "https://clob.polymarket.com".to_string()
}

fn default_data_url() -> String {
    "https://data-api.polymarket.com".to_string()
}

fn default_polygon_rpc() -> String {
    "https://polygon-bor-rpc.publicnode.com".to_string()
}

fn default_exposure_cap() -> Decimal {
    Decimal::new(100, 0)
}

fn default_max_markets_per_asset() -> usize {
    3
}

fn default_min_entry_edge() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_entry_size() -> Decimal {
    Decimal::new(20, 0)
}

fn default_max_entry_spread() -> Decimal {
    Decimal::new(6, 2) // 0.06
}

fn default_min_entry_depth() -> Decimal {
    Decimal::new(10, 0)
}

fn default_entry_window_start() -> i64 {
    60
}

fn default_entry_window_end() -> i64 {
    720
}

fn default_max_book_age_ms() -> i64 {
    3000
}

fn default_hedge_dwell() -> i64 {
    30
}

fn default_corrected_edge() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn default_profit_trigger() -> Decimal {
    Decimal::new(4, 2) // 0.04 per share
}

fn default_hedge_deadline() -> i64 {
    60
}

fn default_hedge_ratio() -> Decimal {
    Decimal::ONE
}

fn default_hedge_min() -> Decimal {
    Decimal::new(5, 0)
}

fn default_hedge_max() -> Decimal {
    Decimal::new(100, 0)
}

fn default_hedge_ask_ceiling() -> Decimal {
    Decimal::new(85, 2) // 0.85
}

fn default_combined_ceiling() -> Decimal {
    Decimal::new(99, 2) // 0.99
}

fn default_hedge_retry() -> i64 {
    10
}

fn default_min_request_interval() -> u64 {
    500
}

fn default_block_cooldown() -> u64 {
    60
}

fn default_min_submit_depth() -> Decimal {
    Decimal::new(10, 0)
}

fn default_book_cache_ttl() -> u64 {
    750
}

fn default_balance_cache_ttl() -> u64 {
    10
}

fn default_improvement_low() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_improvement_high() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn default_http_timeout_ms() -> u64 {
    2000
}

fn default_http_pool_size() -> usize {
    10
}

fn default_maker_window() -> usize {
    20
}

fn default_min_maker_ratio() -> Decimal {
    Decimal::new(5, 1) // 0.5
}

fn default_claim_interval() -> u64 {
    300
}

fn default_claim_batch() -> usize {
    5
}

fn default_min_claim_value() -> Decimal {
    Decimal::ONE
}

fn default_claim_max_retries() -> u32 {
    3
}

fn default_claim_backoff() -> u64 {
    30
}

fn default_inter_claim_delay() -> u64 {
    12_000
}

fn default_feed_poll_interval() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_sim_balance() -> Decimal {
    Decimal::new(100, 0)
}

fn default_port() -> u16 {
    8080
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from environment, reading .env file first.
    pub fn load() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Check if the configuration is valid.
    pub fn validate(&self) -> Result<(), String> {
        if self.polymarket_private_key.is_empty() {
            return Err("POLYMARKET_PRIVATE_KEY is required".to_string());
        }

        if !self.polymarket_private_key.starts_with("0x") {
            return Err("POLYMARKET_PRIVATE_KEY must start with 0x".to_string());
        }

        if self.exposure_cap_shares <= Decimal::ZERO {
            return Err("EXPOSURE_CAP_SHARES must be positive".to_string());
        }

        if self.entry_size <= Decimal::ZERO {
            return Err("ENTRY_SIZE must be positive".to_string());
        }

        if self.entry_size > self.exposure_cap_shares {
            return Err("ENTRY_SIZE must not exceed EXPOSURE_CAP_SHARES".to_string());
        }

        if self.entry_window_start_secs >= self.entry_window_end_secs {
            return Err("entry window start must precede its end".to_string());
        }

        if self.hedge_min_shares > self.hedge_max_shares {
            return Err("HEDGE_MIN_SHARES must not exceed HEDGE_MAX_SHARES".to_string());
        }

        if self.hedge_ratio <= Decimal::ZERO {
            return Err("HEDGE_RATIO must be positive".to_string());
        }

        if self.min_maker_ratio < Decimal::ZERO || self.min_maker_ratio > Decimal::ONE {
            return Err("MIN_MAKER_RATIO must be within [0, 1]".to_string());
        }

        if self.combined_price_ceiling >= Decimal::ONE {
            return Err("COMBINED_PRICE_CEILING must be below 1.0".to_string());
        }

        Ok(())
    }

    /// Whether pre-generated API credentials are fully present.
    pub fn has_api_credentials(&self) -> bool {
        self.polymarket_api_key.is_some()
            && self.polymarket_api_secret.is_some()
            && self.polymarket_api_passphrase.is_some()
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        polymarket_private_key:
            "0x0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef".to_string(),
        polymarket_api_key: None,
        polymarket_api_secret: None,
        polymarket_api_passphrase: None,
        polymarket_clob_url: default_clob_url(),
        polymarket_data_url: default_data_url(),
        polygon_rpc_url: default_polygon_rpc(),
        exposure_cap_shares: default_exposure_cap(),
        max_markets_per_asset: default_max_markets_per_asset(),
        min_entry_edge: default_min_entry_edge(),
        entry_size: default_entry_size(),
        max_entry_spread: default_max_entry_spread(),
        min_entry_depth: default_min_entry_depth(),
        entry_window_start_secs: default_entry_window_start(),
        entry_window_end_secs: default_entry_window_end(),
        max_book_age_ms: default_max_book_age_ms(),
        hedge_dwell_secs: default_hedge_dwell(),
        corrected_edge_threshold: default_corrected_edge(),
        hedge_profit_trigger: default_profit_trigger(),
        hedge_deadline_secs: default_hedge_deadline(),
        hedge_ratio: default_hedge_ratio(),
        hedge_min_shares: default_hedge_min(),
        hedge_max_shares: default_hedge_max(),
        hedge_ask_ceiling: default_hedge_ask_ceiling(),
        combined_price_ceiling: default_combined_ceiling(),
        hedge_retry_secs: default_hedge_retry(),
        min_request_interval_ms: default_min_request_interval(),
        block_cooldown_secs: default_block_cooldown(),
        min_submit_depth: default_min_submit_depth(),
        book_cache_ttl_ms: default_book_cache_ttl(),
        balance_cache_ttl_secs: default_balance_cache_ttl(),
        price_improvement_low: default_improvement_low(),
        price_improvement_high: default_improvement_high(),
        http_timeout_ms: default_http_timeout_ms(),
        http_pool_size: default_http_pool_size(),
        require_fee_data: true,
        maker_ratio_window: default_maker_window(),
        min_maker_ratio: default_min_maker_ratio(),
        claim_interval_secs: default_claim_interval(),
        claim_batch_size: default_claim_batch(),
        min_claim_value: default_min_claim_value(),
        claim_max_retries: default_claim_max_retries(),
        claim_retry_backoff_secs: default_claim_backoff(),
        inter_claim_delay_ms: default_inter_claim_delay(),
        claim_journal_path: None,
        price_model_path: None,
        watchlist_path: None,
        feed_poll_interval_ms: default_feed_poll_interval(),
        audit_log_path: None,
        dry_run: true,
        sim_balance: default_sim_balance(),
        cancel_on_shutdown: false,
        port: default_port(),
        metrics_enabled: true,
        metrics_port: default_metrics_port(),
        rust_log: default_log_level(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values_are_sensible() {
        assert_eq!(default_exposure_cap(), Decimal::new(100, 0));
        assert_eq!(default_min_submit_depth(), Decimal::new(10, 0));
        assert_eq!(default_claim_interval(), 300);
        assert!(default_true());
    }

    #[test]
    fn validate_rejects_empty_private_key() {
        let mut config = test_config();
        config.polymarket_private_key = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_invalid_private_key_prefix() {
        let mut config = test_config();
        config.polymarket_private_key = "abc123".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_entry_size_over_cap() {
        let mut config = test_config();
        config.entry_size = Decimal::new(500, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(test_config().validate().is_ok());
    }
}
