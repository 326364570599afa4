//! Claim redemption engine.
//!
//! Periodically walks the positions feed for redeemable conditions and
//! redeems them on Polygon, at most one cycle in flight at a time. A
//! JSONL journal of confirmed conditions makes redemption idempotent
//! across restarts; failed claims are retried with a linear backoff
//! until a retry budget is exhausted.

pub mod chain;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::audit::{AuditEvent, AuditHandle};
use crate::config::Config;
use crate::error::RedemptionError;
use crate::market::client::ExchangeApi;
use crate::metrics;

pub use chain::{PolygonChain, RedeemReceipt, SettlementChain, MIN_NATIVE_GAS_WEI};

/// One confirmed redemption, as journaled.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalEntry {
    condition_id: String,
    tx_hash: String,
    value: Decimal,
    claimed_at: String,
}

/// A condition worth redeeming, after collapsing duplicate rows.
#[derive(Debug, Clone)]
struct Claimable {
    condition_id: String,
    value: Decimal,
}

#[derive(Debug)]
struct RetryState {
    attempts: u32,
    ready_at: Instant,
    value: Decimal,
}

#[derive(Default)]
struct EngineState {
    claimed: HashSet<String>,
    abandoned: HashSet<String>,
    retries: HashMap<String, RetryState>,
}

/// Summary of one redemption cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    /// Another cycle was already in flight.
    pub skipped: bool,
    /// Redeemable conditions considered this cycle.
    pub considered: usize,
    /// Claims submitted on chain.
    pub submitted: usize,
    /// Claims confirmed.
    pub confirmed: usize,
    /// Claims scheduled for retry.
    pub retried: usize,
    /// Claims abandoned.
    pub failed: usize,
}

impl CycleReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// The redemption engine.
pub struct RedemptionEngine {
    exchange: Arc<dyn ExchangeApi>,
    chain: Arc<dyn SettlementChain>,
    config: Config,
    audit: AuditHandle,
    state: Mutex<EngineState>,
    last_report: Arc<RwLock<Option<CycleReport>>>,
}

impl RedemptionEngine {
    /// Build an engine, loading the claim journal when one is configured.
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        chain: Arc<dyn SettlementChain>,
        config: Config,
        audit: AuditHandle,
    ) -> Self {
        let mut state = EngineState::default();
        if let Some(path) = &config.claim_journal_path {
            state.claimed = load_journal(path);
        }

        Self {
            exchange,
            chain,
            config,
            audit,
            state: Mutex::new(state),
            last_report: Arc::new(RwLock::new(None)),
        }
    }

    /// Shared handle to the most recent cycle report, for the status
    /// endpoint.
    pub fn report_handle(&self) -> Arc<RwLock<Option<CycleReport>>> {
        Arc::clone(&self.last_report)
    }

    /// Run cycles forever at the configured interval.
    pub async fn run(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.claim_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            interval_secs = self.config.claim_interval_secs,
            dry_run = self.config.dry_run,
            "redemption engine running"
        );
        loop {
            interval.tick().await;
            let report = self.run_cycle().await;
            if !report.skipped {
                debug!(?report, "redemption cycle finished");
            }
        }
    }

    /// Run one redemption cycle.
    ///
    /// Cycles are single-flight: if one is already in progress, the
    /// call returns immediately with a skipped report.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> CycleReport {
        let mut state = match self.state.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("redemption cycle already in flight, skipping");
                return CycleReport::skipped();
            }
        };

        let timer = metrics::LatencyTimer::redemption_cycle();
        let report = self.cycle(&mut state).await;
        timer.observe();

        if let Ok(mut guard) = self.last_report.write() {
            *guard = Some(report.clone());
        }
        report
    }

    async fn cycle(&self, state: &mut EngineState) -> CycleReport {
        let mut report = CycleReport::default();
        let now = Instant::now();

        // due retries go first; they have already waited their backoff
        let mut batch: Vec<Claimable> = state
            .retries
            .iter()
            .filter(|(_, retry)| retry.ready_at <= now)
            .map(|(condition_id, retry)| Claimable {
                condition_id: condition_id.clone(),
                value: retry.value,
            })
            .collect();

        match self.fetch_claimables().await {
            Ok(fresh) => {
                for claimable in fresh {
                    if state.claimed.contains(&claimable.condition_id)
                        || state.abandoned.contains(&claimable.condition_id)
                        || state.retries.contains_key(&claimable.condition_id)
                        || batch.iter().any(|c| c.condition_id == claimable.condition_id)
                    {
                        continue;
                    }
                    batch.push(claimable);
                }
            }
            Err(e) => {
                warn!(error = %e, "positions fetch failed, serving retries only");
            }
        }

        report.considered = batch.len();
        batch.truncate(self.config.claim_batch_size);

        if batch.is_empty() {
            return report;
        }

        let mut first = true;
        for claimable in batch {
            if !first && self.config.inter_claim_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.inter_claim_delay_ms)).await;
            }
            first = false;

            // every submission is preceded by a gas preflight; an
            // unfunded wallet postpones the rest of the batch
            if !self.config.dry_run {
                match self.chain.native_balance().await {
                    Ok(balance) if balance < MIN_NATIVE_GAS_WEI => {
                        warn!(
                            balance_wei = balance,
                            required_wei = MIN_NATIVE_GAS_WEI,
                            "wallet cannot afford gas, postponing remaining claims"
                        );
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "gas preflight failed, postponing remaining claims");
                        break;
                    }
                }
            }

            self.audit.emit(AuditEvent::ClaimAttempt {
                condition_id: claimable.condition_id.clone(),
                value: claimable.value,
            });
            report.submitted += 1;

            if self.config.dry_run {
                info!(
                    condition_id = %claimable.condition_id,
                    value = %claimable.value,
                    "dry run, claim simulated"
                );
                state.claimed.insert(claimable.condition_id.clone());
                report.confirmed += 1;
                continue;
            }

            match self.chain.redeem(&claimable.condition_id).await {
                Ok(receipt) => {
                    self.confirm(&mut *state, &claimable, &receipt).await;
                    report.confirmed += 1;
                }
                Err(RedemptionError::InsufficientFunds {
                    balance_wei,
                    required_wei,
                }) => {
                    warn!(
                        balance_wei,
                        required_wei, "wallet ran out of gas mid-batch, stopping"
                    );
                    break;
                }
                Err(e) if e.is_retryable() => {
                    self.schedule_retry(&mut *state, &claimable, &e, &mut report);
                }
                Err(e) => {
                    warn!(condition_id = %claimable.condition_id, error = %e, "claim abandoned");
                    metrics::inc_claims_failed();
                    state.retries.remove(&claimable.condition_id);
                    state.abandoned.insert(claimable.condition_id.clone());
                    report.failed += 1;
                    self.audit.emit(AuditEvent::ClaimResult {
                        condition_id: claimable.condition_id.clone(),
                        success: false,
                        tx_hash: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        report
    }

    async fn confirm(&self, state: &mut EngineState, claimable: &Claimable, receipt: &RedeemReceipt) {
        info!(
            condition_id = %claimable.condition_id,
            tx_hash = %receipt.tx_hash,
            value = %claimable.value,
            payout_wei = ?receipt.payout_wei,
            "claim confirmed"
        );
        metrics::inc_claims_confirmed();
        state.claimed.insert(claimable.condition_id.clone());
        state.retries.remove(&claimable.condition_id);

        if let Some(path) = &self.config.claim_journal_path {
            let entry = JournalEntry {
                condition_id: claimable.condition_id.clone(),
                tx_hash: receipt.tx_hash.clone(),
                value: claimable.value,
                claimed_at: OffsetDateTime::now_utc().to_string(),
            };
            if let Err(e) = append_journal(path, &entry).await {
                warn!(error = %e, "journal append failed");
            }
        }

        self.audit.emit(AuditEvent::ClaimResult {
            condition_id: claimable.condition_id.clone(),
            success: true,
            tx_hash: Some(receipt.tx_hash.clone()),
            error: None,
        });
    }

    fn schedule_retry(
        &self,
        state: &mut EngineState,
        claimable: &Claimable,
        error: &RedemptionError,
        report: &mut CycleReport,
    ) {
        let attempts = state
            .retries
            .get(&claimable.condition_id)
            .map(|r| r.attempts)
            .unwrap_or(0)
            + 1;

        if attempts > self.config.claim_max_retries {
            warn!(
                condition_id = %claimable.condition_id,
                attempts,
                "retry budget exhausted, abandoning claim"
            );
            metrics::inc_claims_failed();
            state.retries.remove(&claimable.condition_id);
            state.abandoned.insert(claimable.condition_id.clone());
            report.failed += 1;
            self.audit.emit(AuditEvent::ClaimResult {
                condition_id: claimable.condition_id.clone(),
                success: false,
                tx_hash: None,
                error: Some(error.to_string()),
            });
            return;
        }

        let backoff =
            Duration::from_secs(self.config.claim_retry_backoff_secs * u64::from(attempts));
        debug!(
            condition_id = %claimable.condition_id,
            attempts,
            backoff_secs = backoff.as_secs(),
            "claim retry scheduled"
        );
        metrics::inc_claims_retried();
        state.retries.insert(
            claimable.condition_id.clone(),
            RetryState {
                attempts,
                ready_at: Instant::now() + backoff,
                value: claimable.value,
            },
        );
        report.retried += 1;
        self.audit.emit(AuditEvent::ClaimResult {
            condition_id: claimable.condition_id.clone(),
            success: false,
            tx_hash: None,
            error: Some(error.to_string()),
        });
    }

    /// Walk the paged positions feed and collapse it into claimables.
    async fn fetch_claimables(&self) -> Result<Vec<Claimable>, crate::error::MarketError> {
        let mut cursor: Option<String> = None;
        let mut by_condition: BTreeMap<String, Decimal> = BTreeMap::new();

        loop {
            let page = self.exchange.fetch_positions(cursor.as_deref()).await?;
            for position in page.positions {
                if !position.redeemable || position.condition_id.trim().is_empty() {
                    continue;
                }
                // a condition-level redeem burns every index set at
                // once; duplicate rows collapse to the highest-value one
                let entry = by_condition
                    .entry(position.condition_id.clone())
                    .or_insert(Decimal::ZERO);
                if position.value > *entry {
                    *entry = position.value;
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(by_condition
            .into_iter()
            .filter(|(_, value)| *value >= self.config.min_claim_value)
            .map(|(condition_id, value)| Claimable {
                condition_id,
                value,
            })
            .collect())
    }
}

fn load_journal(path: &str) -> HashSet<String> {
    let mut claimed = HashSet::new();
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return claimed,
        Err(e) => {
            warn!(path = %path, error = %e, "journal unreadable, starting empty");
            return claimed;
        }
    };

    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<JournalEntry>(line) {
            Ok(entry) => {
                claimed.insert(entry.condition_id);
            }
            Err(e) => warn!(error = %e, "skipping malformed journal line"),
        }
    }

    info!(count = claimed.len(), "loaded claim journal");
    claimed
}

async fn append_journal(path: &str, entry: &JournalEntry) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::chain::mock::MockChain;
    use super::*;
    use crate::audit::AuditHandle;
    use crate::config::test_config;
    use crate::market::client::PositionRecord;
    use crate::market::mock::MockExchange;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn record(condition_id: &str, value: Decimal, redeemable: bool) -> PositionRecord {
        PositionRecord {
            condition_id: condition_id.to_string(),
            token_id: format!("{}-tok", condition_id),
            size: value,
            value,
            redeemable,
        }
    }

    fn live_config() -> Config {
        let mut config = test_config();
        config.dry_run = false;
        config.inter_claim_delay_ms = 0;
        config
    }

    fn engine_with(
        exchange: &MockExchange,
        chain: Arc<MockChain>,
        config: Config,
    ) -> RedemptionEngine {
        RedemptionEngine::new(
            Arc::new(exchange.clone()),
            chain,
            config,
            AuditHandle::disabled(),
        )
    }

    #[tokio::test]
    async fn cycle_claims_redeemable_positions_once() {
        let exchange = MockExchange::new();
        exchange.set_position_pages(vec![vec![
            record("0xaa", dec!(10), true),
            record("0xbb", dec!(3), false),
        ]]);
        let chain = Arc::new(MockChain::new());
        let engine = engine_with(&exchange, Arc::clone(&chain), live_config());

        let report = engine.run_cycle().await;
        assert_eq!(report.considered, 1);
        assert_eq!(report.confirmed, 1);
        assert_eq!(chain.redeem_calls(), 1);

        // already claimed: the next cycle does nothing
        let report = engine.run_cycle().await;
        assert_eq!(report.considered, 0);
        assert_eq!(chain.redeem_calls(), 1);
    }

    #[tokio::test]
    async fn duplicate_rows_collapse_into_one_claim() {
        let exchange = MockExchange::new();
        exchange.set_position_pages(vec![
            vec![record("0xaa", dec!(4), true)],
            vec![record("0xaa", dec!(6), true), record("0xcc", dec!(2), true)],
        ]);
        let chain = Arc::new(MockChain::new());
        let engine = engine_with(&exchange, Arc::clone(&chain), live_config());

        let report = engine.run_cycle().await;
        assert_eq!(report.considered, 2);
        assert_eq!(report.confirmed, 2);
        assert_eq!(chain.redeem_calls(), 2);
    }

    #[tokio::test]
    async fn duplicate_dust_rows_stay_below_the_minimum() {
        let exchange = MockExchange::new();
        // two 0.60 rows for one condition: the claimable is worth 0.60,
        // not 1.20, so it stays under the $1 minimum
        exchange.set_position_pages(vec![vec![
            record("0xaa", dec!(0.60), true),
            record("0xaa", dec!(0.60), true),
        ]]);
        let chain = Arc::new(MockChain::new());
        let engine = engine_with(&exchange, Arc::clone(&chain), live_config());

        let report = engine.run_cycle().await;
        assert_eq!(report.considered, 0);
        assert_eq!(chain.redeem_calls(), 0);
    }

    #[tokio::test]
    async fn dust_positions_are_ignored() {
        let exchange = MockExchange::new();
        // 0.40 below the $1 minimum
        exchange.set_position_pages(vec![vec![record("0xaa", dec!(0.40), true)]]);
        let chain = Arc::new(MockChain::new());
        let engine = engine_with(&exchange, Arc::clone(&chain), live_config());

        let report = engine.run_cycle().await;
        assert_eq!(report.considered, 0);
        assert_eq!(chain.redeem_calls(), 0);
    }

    #[tokio::test]
    async fn batch_size_caps_a_cycle() {
        let exchange = MockExchange::new();
        exchange.set_position_pages(vec![(0..8)
            .map(|i| record(&format!("0x{:02x}", i + 1), dec!(5), true))
            .collect()]);
        let chain = Arc::new(MockChain::new());
        let mut config = live_config();
        config.claim_batch_size = 3;
        let engine = engine_with(&exchange, Arc::clone(&chain), config);

        let report = engine.run_cycle().await;
        assert_eq!(report.submitted, 3);
        assert_eq!(chain.redeem_calls(), 3);
    }

    #[tokio::test]
    async fn unfunded_wallet_postpones_all_claims() {
        let exchange = MockExchange::new();
        exchange.set_position_pages(vec![vec![record("0xaa", dec!(10), true)]]);
        let chain = Arc::new(MockChain::new());
        chain.set_balance_wei(MIN_NATIVE_GAS_WEI - 1);
        let engine = engine_with(&exchange, Arc::clone(&chain), live_config());

        let report = engine.run_cycle().await;
        assert_eq!(report.submitted, 0);
        assert_eq!(chain.redeem_calls(), 0);
    }

    #[tokio::test]
    async fn wallet_drained_mid_batch_postpones_the_rest() {
        let exchange = MockExchange::new();
        exchange.set_position_pages(vec![vec![
            record("0xaa", dec!(10), true),
            record("0xbb", dec!(10), true),
        ]]);
        let chain = Arc::new(MockChain::new());
        let engine = engine_with(&exchange, Arc::clone(&chain), live_config());

        // the first redeem spends the wallet down past the gas floor
        chain.drain_after_next_balance_check();

        let report = engine.run_cycle().await;
        assert_eq!(report.submitted, 1);
        assert_eq!(chain.redeem_calls(), 1);
    }

    #[tokio::test]
    async fn every_cycle_publishes_a_report() {
        let exchange = MockExchange::new();
        let chain = Arc::new(MockChain::new());
        let engine = engine_with(&exchange, chain, live_config());
        let handle = engine.report_handle();

        // nothing to claim, but the status endpoint still sees the cycle
        let report = engine.run_cycle().await;
        assert_eq!(report.considered, 0);
        let published = handle.read().unwrap().clone().expect("report published");
        assert_eq!(published.considered, 0);
        assert!(!published.skipped);
    }

    #[tokio::test]
    async fn fatal_failure_abandons_without_retry() {
        let exchange = MockExchange::new();
        exchange.set_position_pages(vec![vec![record("0xaa", dec!(10), true)]]);
        let chain = Arc::new(MockChain::new());
        chain.fail_condition("0xaa", RedemptionError::Fatal("execution reverted".into()));
        let engine = engine_with(&exchange, Arc::clone(&chain), live_config());

        let report = engine.run_cycle().await;
        assert_eq!(report.failed, 1);
        assert_eq!(chain.redeem_calls(), 1);

        // abandoned conditions never come back
        let report = engine.run_cycle().await;
        assert_eq!(report.submitted, 0);
        assert_eq!(chain.redeem_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failure_waits_out_backoff_then_succeeds() {
        let exchange = MockExchange::new();
        exchange.set_position_pages(vec![vec![record("0xaa", dec!(10), true)]]);
        let chain = Arc::new(MockChain::new());
        chain.fail_condition("0xaa", RedemptionError::Retryable("nonce too low".into()));
        let engine = engine_with(&exchange, Arc::clone(&chain), live_config());

        let report = engine.run_cycle().await;
        assert_eq!(report.retried, 1);
        assert_eq!(chain.redeem_calls(), 1);

        // backoff not yet elapsed: the retry stays parked
        let report = engine.run_cycle().await;
        assert_eq!(report.submitted, 0);
        assert_eq!(chain.redeem_calls(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        chain.clear_failure("0xaa");

        let report = engine.run_cycle().await;
        assert_eq!(report.confirmed, 1);
        assert_eq!(chain.redeem_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_exhaustion_abandons_the_claim() {
        let exchange = MockExchange::new();
        exchange.set_position_pages(vec![vec![record("0xaa", dec!(10), true)]]);
        let chain = Arc::new(MockChain::new());
        chain.fail_condition("0xaa", RedemptionError::Retryable("timeout".into()));
        let mut config = live_config();
        config.claim_max_retries = 2;
        let engine = engine_with(&exchange, Arc::clone(&chain), config);

        // attempts 1 and 2 schedule retries; attempt 3 exhausts the budget
        for _ in 0..2 {
            let report = engine.run_cycle().await;
            assert_eq!(report.retried, 1);
            tokio::time::advance(Duration::from_secs(120)).await;
        }
        let report = engine.run_cycle().await;
        assert_eq!(report.failed, 1);

        let report = engine.run_cycle().await;
        assert_eq!(report.submitted, 0);
    }

    #[tokio::test]
    async fn concurrent_cycle_is_skipped() {
        let exchange = MockExchange::new();
        let chain = Arc::new(MockChain::new());
        let engine = engine_with(&exchange, chain, live_config());

        let _guard = engine.state.lock().await;
        let report = engine.run_cycle().await;
        assert!(report.skipped);
    }

    #[tokio::test]
    async fn journal_survives_restart() {
        let dir = std::env::temp_dir().join("edge-journal-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("journal-{}.jsonl", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let exchange = MockExchange::new();
        exchange.set_position_pages(vec![vec![record("0xaa", dec!(10), true)]]);
        let chain = Arc::new(MockChain::new());
        let mut config = live_config();
        config.claim_journal_path = Some(path.to_string_lossy().into_owned());

        let engine = engine_with(&exchange, Arc::clone(&chain), config.clone());
        let report = engine.run_cycle().await;
        assert_eq!(report.confirmed, 1);
        assert_eq!(chain.redeem_calls(), 1);

        // a fresh engine over the same journal does not double-claim
        let restarted = engine_with(&exchange, Arc::clone(&chain), config);
        let report = restarted.run_cycle().await;
        assert_eq!(report.submitted, 0);
        assert_eq!(chain.redeem_calls(), 1);
    }

    #[tokio::test]
    async fn dry_run_never_touches_the_chain() {
        let exchange = MockExchange::new();
        exchange.set_position_pages(vec![vec![record("0xaa", dec!(10), true)]]);
        let chain = Arc::new(MockChain::new());
        let mut config = live_config();
        config.dry_run = true;
        let engine = engine_with(&exchange, Arc::clone(&chain), config);

        let report = engine.run_cycle().await;
        assert_eq!(report.confirmed, 1);
        assert_eq!(chain.redeem_calls(), 0);
    }
}
