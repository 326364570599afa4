//! Strategy engine: drives entries, hedges, and the exposure ledger
//! from the market data feed.
//!
//! The engine owns all mutable trading state and runs on a single task;
//! every tick is processed to completion before the next one starts, so
//! the ledger lifecycle ordering holds without locks.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::audit::{AuditEvent, AuditHandle};
use crate::config::Config;
use crate::feed::{FeedEvent, MarketTick};
use crate::ledger::{ExposureLedger, LedgerKey};
use crate::market::types::{Market, Outcome};
use crate::metrics;
use crate::orderbook::analysis::{depth_near_touch, maker_buy_price, mid_price};
use crate::orderbook::types::OutcomeBook;
use crate::trading::client::ExecutionClient;
use crate::trading::order::{FillStatus, OrderRequest, Side};

use super::kill_switch::{KillSwitch, KillSwitchStatus};
use super::model::{PriceCell, PriceModel};
use super::state::{LiveOrder, MarketState, OrderIntent, Phase, SkipReason};

/// Ticks between ledger invariant sweeps.
const INVARIANT_CHECK_TICKS: u32 = 50;

/// One market's line in the status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MarketSummary {
    /// Market id.
    pub market_id: String,
    /// Current phase.
    pub phase: String,
    /// Entry shares filled.
    pub entry_filled: Decimal,
    /// Hedge shares filled.
    pub hedge_filled: Decimal,
}

/// Snapshot of the engine for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    /// Markets currently tracked.
    pub tracked_markets: usize,
    /// Markets with a ledger entry.
    pub ledger_markets: usize,
    /// Entered (non-idle) market count per asset.
    pub entered_by_asset: BTreeMap<String, usize>,
    /// Entry orders placed since start.
    pub entries_placed: u64,
    /// Hedge orders placed since start.
    pub hedges_placed: u64,
    /// Per-market summaries.
    pub markets: Vec<MarketSummary>,
    /// Kill switch snapshot.
    pub kill_switch: KillSwitchStatus,
}

/// The trading engine.
pub struct StrategyEngine {
    config: Config,
    exec: Arc<ExecutionClient>,
    model: Arc<dyn PriceModel>,
    kill_switch: Arc<Mutex<KillSwitch>>,
    ledger: ExposureLedger,
    states: HashMap<String, MarketState>,
    audit: AuditHandle,
    status: Arc<RwLock<Option<EngineStatus>>>,
    entries_placed: u64,
    hedges_placed: u64,
    ticks_since_sweep: u32,
}

impl StrategyEngine {
    /// Build an engine.
    pub fn new(
        config: Config,
        exec: Arc<ExecutionClient>,
        model: Arc<dyn PriceModel>,
        kill_switch: Arc<Mutex<KillSwitch>>,
        audit: AuditHandle,
    ) -> Self {
        let ledger = ExposureLedger::new(config.exposure_cap_shares);
        Self {
            config,
            exec,
            model,
            kill_switch,
            ledger,
            states: HashMap::new(),
            audit,
            status: Arc::new(RwLock::new(None)),
            entries_placed: 0,
            hedges_placed: 0,
            ticks_since_sweep: 0,
        }
    }

    /// Handle to the status snapshot, for the API server.
    pub fn status_handle(&self) -> Arc<RwLock<Option<EngineStatus>>> {
        Arc::clone(&self.status)
    }

    /// Read-only view of the ledger.
    pub fn ledger(&self) -> &ExposureLedger {
        &self.ledger
    }

    /// Current state of a market, if tracked.
    pub fn market_state(&self, market_id: &str) -> Option<&MarketState> {
        self.states.get(market_id)
    }

    /// Cancel every in-flight order. Called on shutdown.
    pub async fn cancel_live_orders(&mut self) {
        for state in self.states.values_mut() {
            let Some(order) = state.live_order.take() else {
                continue;
            };
            match self.exec.cancel_order(&order.order_id).await {
                Ok(()) => {
                    let key = ledger_key(&state.market);
                    if let Some(side) = state.market.outcome_of(&order.token_id) {
                        let remaining = (order.requested - order.filled).max(Decimal::ZERO);
                        self.ledger.on_cancel_open(&key, side, remaining);
                    }
                    info!(order_id = %order.order_id, "order cancelled on shutdown");
                }
                Err(e) => {
                    warn!(order_id = %order.order_id, error = %e, "shutdown cancel failed");
                }
            }
        }
    }

    /// Run until the feed closes.
    pub async fn run(&mut self, mut rx: mpsc::Receiver<FeedEvent>) {
        info!("strategy engine running");
        while let Some(event) = rx.recv().await {
            self.handle_event(event).await;
        }
        info!("feed closed, strategy engine stopping");
    }

    /// Process one feed event.
    pub async fn handle_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Tick(tick) => self.on_tick(tick).await,
            FeedEvent::Retired { market_id } => self.on_retired(&market_id).await,
        }
        self.publish_status();
    }

    #[instrument(skip(self, tick), fields(market_id = %tick.market.id))]
    async fn on_tick(&mut self, tick: MarketTick) {
        let market_id = tick.market.id.clone();
        let mut state = self
            .states
            .remove(&market_id)
            .unwrap_or_else(|| MarketState::new(tick.market.clone()));

        if state.live_order.is_some() {
            self.poll_live_order(&mut state).await;
        }

        match state.phase() {
            Phase::Idle => self.evaluate_entry(&mut state, &tick).await,
            Phase::HasEntry | Phase::HedgeInProgress => {
                // hedge work strictly preempts any further entry thinking
                if state.live_order.is_none() && state.entry_filled > Decimal::ZERO {
                    self.evaluate_hedge(&mut state, &tick).await;
                }
            }
            Phase::Done => {}
        }

        self.states.insert(market_id, state);

        self.ticks_since_sweep += 1;
        if self.ticks_since_sweep >= INVARIANT_CHECK_TICKS {
            self.ticks_since_sweep = 0;
            self.sweep_invariants();
        }
    }

    /// Poll the in-flight order and apply observed fill deltas.
    async fn poll_live_order(&mut self, state: &mut MarketState) {
        let Some(order) = state.live_order.clone() else {
            return;
        };

        let view = match self.exec.order_status(&order.order_id).await {
            Ok(view) => view,
            Err(e) => {
                debug!(order_id = %order.order_id, error = %e, "order poll failed, keeping order");
                return;
            }
        };

        let key = ledger_key(&state.market);
        let side = match state.market.outcome_of(&order.token_id) {
            Some(side) => side,
            None => {
                warn!(order_id = %order.order_id, token_id = %order.token_id, "order token not in market");
                return;
            }
        };

        let delta = view.matched - order.filled;
        if delta > Decimal::ZERO {
            self.ledger.on_fill(&key, side, delta);
            self.ledger.increment_position(&key, side, delta);

            if let Some(live) = state.live_order.as_mut() {
                live.filled = view.matched;
            }
            metrics::inc_fills_observed(view.maker.unwrap_or(false));
            self.audit.emit(AuditEvent::Fill {
                market_id: state.market.id.clone(),
                order_id: order.order_id.clone(),
                delta,
                total: view.matched,
                maker: view.maker,
                fee_rate_bps: view.fee_rate_bps,
            });

            let mut ks = lock_kill_switch(&self.kill_switch);
            let was_allowed = ks.entries_allowed();
            ks.record_fill(view.maker, view.fee_rate_bps);
            if was_allowed && !ks.entries_allowed() {
                self.audit.emit(AuditEvent::KillSwitchTripped {
                    reason: ks.reason().unwrap_or("unknown").to_string(),
                });
            }
            drop(ks);

            match order.intent {
                OrderIntent::Entry => {
                    if state.entry_fill_at.is_none() {
                        state.entry_fill_at = Some(OffsetDateTime::now_utc());
                    }
                    state.entry_filled = view.matched;
                    state.entry_avg_price = view.avg_price.or(Some(order.price));
                }
                OrderIntent::Hedge => {
                    state.hedge_filled += delta;
                }
            }
        }

        let fully_filled = view.original > Decimal::ZERO && view.matched >= view.original;
        if fully_filled || view.is_terminal() {
            let remaining = (order.requested - view.matched).max(Decimal::ZERO);
            if remaining > Decimal::ZERO {
                self.ledger.on_cancel_open(&key, side, remaining);
            }
            state.live_order = None;

            match order.intent {
                OrderIntent::Entry if state.entry_filled == Decimal::ZERO => {
                    // entry died without a single fill: release the market
                    if state.reset_unfilled_entry().is_ok() {
                        info!(market_id = %state.market.id, "unfilled entry released");
                        self.emit_transition(&state.market.id, Phase::HasEntry, Phase::Idle);
                    }
                }
                OrderIntent::Hedge if fully_filled => {
                    if state.advance(Phase::Done).is_ok() {
                        info!(market_id = %state.market.id, "hedge complete");
                        self.emit_transition(&state.market.id, Phase::HedgeInProgress, Phase::Done);
                    }
                }
                _ => {}
            }
        }
    }

    /// Evaluate the entry gates and place an entry when they all pass.
    async fn evaluate_entry(&mut self, state: &mut MarketState, tick: &MarketTick) {
        let market = &tick.market;
        lock_kill_switch(&self.kill_switch).record_evaluation();

        if state.live_order.is_some() {
            return self.skip(&market.id, SkipReason::OrderInFlight);
        }
        if state.has_position() {
            return self.skip(&market.id, SkipReason::ExistingPosition);
        }
        if !lock_kill_switch(&self.kill_switch).entries_allowed() {
            return self.skip(&market.id, SkipReason::KillSwitch);
        }

        if tick.up_book.is_empty() || tick.down_book.is_empty() {
            return self.skip(&market.id, SkipReason::NoBook);
        }
        let max_age = self.config.max_book_age_ms;
        if tick.up_book.is_stale(max_age) || tick.down_book.is_stale(max_age) {
            lock_kill_switch(&self.kill_switch).record_stale_book();
            return self.skip(&market.id, SkipReason::StaleBook);
        }

        let elapsed = market.elapsed_secs();
        if elapsed < self.config.entry_window_start_secs
            || elapsed > self.config.entry_window_end_secs
        {
            return self.skip(&market.id, SkipReason::OutsideEntryWindow);
        }

        let Some(mid) = mid_price(&tick.up_book) else {
            return self.skip(&market.id, SkipReason::NoBook);
        };
        let remaining = Market::WINDOW_SECONDS - elapsed;
        let cell = PriceCell::from_observation(market.asset, mid, remaining);

        if !self.model.is_trusted(&cell) {
            return self.skip(&market.id, SkipReason::UntrustedCell);
        }
        let Some(fair) = self.model.fair_price(&cell) else {
            return self.skip(&market.id, SkipReason::NoFairPrice);
        };

        let Some((outcome, book, ask, edge)) = best_entry_side(fair, tick) else {
            return self.skip(&market.id, SkipReason::NoBook);
        };
        if edge < self.config.min_entry_edge {
            return self.skip(&market.id, SkipReason::EdgeBelowThreshold);
        }

        match book.spread() {
            Some(spread) if spread <= self.config.max_entry_spread => {}
            _ => return self.skip(&market.id, SkipReason::SpreadTooWide),
        }
        if depth_near_touch(book, Side::Buy) < self.config.min_entry_depth {
            return self.skip(&market.id, SkipReason::DepthTooThin);
        }

        let entered_for_asset = self
            .states
            .values()
            .filter(|s| s.market.asset == market.asset && s.phase() != Phase::Idle)
            .count();
        if entered_for_asset >= self.config.max_markets_per_asset {
            return self.skip(&market.id, SkipReason::MaxMarketsPerAsset);
        }

        let key = ledger_key(market);
        let check = self.ledger.check_cap(&key, outcome, self.config.entry_size);
        if !check.allowed {
            return self.skip(&market.id, SkipReason::CapBlocked);
        }
        let size = check.clamped_qty;

        // rest inside the spread instead of hitting the ask
        let Some(price) = maker_buy_price(book) else {
            return self.skip(&market.id, SkipReason::NoBook);
        };

        debug!(
            market_id = %market.id,
            outcome = %outcome,
            fair = %fair,
            ask = %ask,
            edge = %edge,
            price = %price,
            size = %size,
            "entry gates passed"
        );
        self.place_leg(state, outcome, price, size, OrderIntent::Entry).await;
    }

    /// Evaluate the hedge triggers and place a hedge when they all hold.
    async fn evaluate_hedge(&mut self, state: &mut MarketState, tick: &MarketTick) {
        let market = &tick.market;
        let Some(entry_outcome) = state.entry_outcome else {
            return;
        };
        let Some(entry_avg) = state.entry_avg_price else {
            return;
        };

        // space out repeated attempts
        if let Some(since) = state.secs_since_hedge_attempt() {
            if since < self.config.hedge_retry_secs {
                return;
            }
        }

        // never hedge in the final stretch of the window
        let remaining = match market.time_remaining() {
            Some(d) => d.as_secs() as i64,
            None => return,
        };
        if remaining < self.config.hedge_deadline_secs {
            return;
        }

        // target size before triggers: nothing to do when already hedged
        let target = (state.entry_filled * self.config.hedge_ratio)
            .clamp(self.config.hedge_min_shares, self.config.hedge_max_shares);
        let outstanding = target - state.hedge_filled;
        if outstanding <= Decimal::ZERO {
            if state.phase() == Phase::HedgeInProgress && state.advance(Phase::Done).is_ok() {
                self.emit_transition(&market.id, Phase::HedgeInProgress, Phase::Done);
            }
            return;
        }

        // dwell: let the position breathe after the first fill
        match state.secs_since_entry_fill() {
            Some(since) if since >= self.config.hedge_dwell_secs => {}
            _ => return,
        }

        let (entry_book, hedge_book) = match entry_outcome {
            Outcome::Up => (&tick.up_book, &tick.down_book),
            Outcome::Down => (&tick.down_book, &tick.up_book),
        };

        // the market must have corrected: the edge that justified entry
        // is gone (or the model can no longer see one)
        let edge_now = current_edge(self.model.as_ref(), market, entry_outcome, tick);
        if let Some(edge) = edge_now {
            if edge > self.config.corrected_edge_threshold {
                return;
            }
        }

        // unrealized gain per share must clear the trigger
        let Some(entry_bid) = entry_book.best_bid() else {
            return;
        };
        if entry_bid - entry_avg < self.config.hedge_profit_trigger {
            return;
        }

        // hedge price gates
        let Some(hedge_ask) = hedge_book.best_ask() else {
            return;
        };
        if hedge_ask > self.config.hedge_ask_ceiling {
            return;
        }
        if entry_avg + hedge_ask > self.config.combined_price_ceiling {
            return;
        }

        let hedge_outcome = entry_outcome.opposite();
        let key = ledger_key(market);
        let check = self.ledger.check_cap(&key, hedge_outcome, outstanding);
        if !check.allowed {
            return self.skip(&market.id, SkipReason::CapBlocked);
        }

        state.last_hedge_attempt = Some(OffsetDateTime::now_utc());
        debug!(
            market_id = %market.id,
            hedge_outcome = %hedge_outcome,
            ask = %hedge_ask,
            size = %check.clamped_qty,
            "hedge triggers passed"
        );
        self.place_leg(state, hedge_outcome, hedge_ask, check.clamped_qty, OrderIntent::Hedge)
            .await;
    }

    /// Place one leg (entry or hedge) with full ledger bracketing.
    async fn place_leg(
        &mut self,
        state: &mut MarketState,
        outcome: Outcome,
        price: Decimal,
        size: Decimal,
        intent: OrderIntent,
    ) {
        let market = state.market.clone();
        let token_id = market.token_id(outcome).to_string();
        let key = ledger_key(&market);

        self.ledger.reserve_pending(&key, outcome, size);
        self.audit.emit(AuditEvent::OrderAttempt {
            market_id: market.id.clone(),
            token_id: token_id.clone(),
            side: Side::Buy.to_string(),
            intent: intent.to_string(),
            price,
            size,
        });

        let outcome_result = self
            .exec
            .place_order(OrderRequest::buy(token_id.clone(), price, size))
            .await;

        self.audit.emit(AuditEvent::OrderResult {
            market_id: market.id.clone(),
            order_id: outcome_result.order_id.clone(),
            success: outcome_result.success,
            fill_status: outcome_result.fill_status.map(|f| f.to_string()),
            failure: outcome_result.failure.map(|f| f.to_string()),
        });

        if !outcome_result.success {
            self.ledger.on_reject_pending(&key, outcome, size);
            return;
        }

        self.ledger.promote_to_open(&key, outcome, size);

        let order_id = outcome_result
            .order_id
            .unwrap_or_else(|| "unknown".to_string());
        let submitted_price = outcome_result.submitted_price.unwrap_or(price);

        match intent {
            OrderIntent::Entry => {
                if state.advance(Phase::HasEntry).is_err() {
                    warn!(market_id = %market.id, "entry placed from unexpected phase");
                }
                state.entry_outcome = Some(outcome);
                self.entries_placed += 1;
                self.emit_transition(&market.id, Phase::Idle, Phase::HasEntry);
            }
            OrderIntent::Hedge => {
                if state.phase() == Phase::HasEntry {
                    if state.advance(Phase::HedgeInProgress).is_err() {
                        warn!(market_id = %market.id, "hedge placed from unexpected phase");
                    }
                    self.emit_transition(&market.id, Phase::HasEntry, Phase::HedgeInProgress);
                }
                self.hedges_placed += 1;
            }
        }

        state.live_order = Some(LiveOrder {
            order_id,
            token_id,
            side: Side::Buy,
            intent,
            requested: size,
            price: submitted_price,
            filled: Decimal::ZERO,
        });

        // dry-run orders fill at placement and are never pollable
        if self.exec.is_dry_run() && outcome_result.fill_status == Some(FillStatus::Filled) {
            self.ledger.on_fill(&key, outcome, size);
            self.ledger.increment_position(&key, outcome, size);
            state.live_order = None;
            match intent {
                OrderIntent::Entry => {
                    state.entry_filled = size;
                    state.entry_avg_price = Some(submitted_price);
                    state.entry_fill_at = Some(OffsetDateTime::now_utc());
                }
                OrderIntent::Hedge => {
                    state.hedge_filled += size;
                    if state.advance(Phase::Done).is_ok() {
                        self.emit_transition(&market.id, Phase::HedgeInProgress, Phase::Done);
                    }
                }
            }
        }
    }

    /// Cleanup for a market whose window closed.
    #[instrument(skip(self))]
    async fn on_retired(&mut self, market_id: &str) {
        let Some(state) = self.states.remove(market_id) else {
            return;
        };

        if let Some(order) = &state.live_order {
            if let Err(e) = self.exec.cancel_order(&order.order_id).await {
                warn!(order_id = %order.order_id, error = %e, "cancel on retirement failed");
            }
        }

        self.ledger.clear_market(&ledger_key(&state.market));
        info!(market_id = %market_id, phase = %state.phase(), "market retired and cleared");
        self.audit.emit(AuditEvent::PhaseTransition {
            market_id: market_id.to_string(),
            from: state.phase().to_string(),
            to: "retired".to_string(),
        });
    }

    fn sweep_invariants(&mut self) {
        self.ledger.prune_empty();
        for breach in self.ledger.assert_invariants() {
            self.audit.emit(AuditEvent::LedgerBreach {
                market_id: breach.key.market_id.clone(),
                asset: breach.key.asset.to_string(),
                side: breach.side.to_string(),
                effective: breach.effective,
                cap: breach.cap,
            });
        }
    }

    fn skip(&self, market_id: &str, reason: SkipReason) {
        debug!(market_id = %market_id, reason = %reason, "entry skipped");
        metrics::inc_entry_skips(&reason.to_string());
        self.audit.emit(AuditEvent::EntrySkip {
            market_id: market_id.to_string(),
            reason: reason.to_string(),
        });
    }

    fn emit_transition(&self, market_id: &str, from: Phase, to: Phase) {
        self.audit.emit(AuditEvent::PhaseTransition {
            market_id: market_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    fn publish_status(&self) {
        let markets = self
            .states
            .values()
            .map(|s| MarketSummary {
                market_id: s.market.id.clone(),
                phase: s.phase().to_string(),
                entry_filled: s.entry_filled,
                hedge_filled: s.hedge_filled,
            })
            .collect();

        let mut entered_by_asset = BTreeMap::new();
        for state in self.states.values() {
            if state.phase() != Phase::Idle {
                *entered_by_asset
                    .entry(state.market.asset.to_string())
                    .or_insert(0usize) += 1;
            }
        }

        let snapshot = EngineStatus {
            tracked_markets: self.states.len(),
            ledger_markets: self.ledger.market_count(),
            entered_by_asset,
            entries_placed: self.entries_placed,
            hedges_placed: self.hedges_placed,
            markets,
            kill_switch: lock_kill_switch(&self.kill_switch).status(),
        };

        if let Ok(mut guard) = self.status.write() {
            *guard = Some(snapshot);
        }
    }
}

fn ledger_key(market: &Market) -> LedgerKey {
    LedgerKey::new(market.id.clone(), market.asset)
}

fn lock_kill_switch(ks: &Mutex<KillSwitch>) -> std::sync::MutexGuard<'_, KillSwitch> {
    ks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Pick the more underpriced outcome, if any side has an ask.
///
/// The model prices the UP outcome; DOWN's fair value is its
/// complement.
fn best_entry_side<'t>(
    fair: Decimal,
    tick: &'t MarketTick,
) -> Option<(Outcome, &'t OutcomeBook, Decimal, Decimal)> {
    let mut best: Option<(Outcome, &OutcomeBook, Decimal, Decimal)> = None;

    if let Some(ask) = tick.up_book.best_ask() {
        best = Some((Outcome::Up, &tick.up_book, ask, fair - ask));
    }
    if let Some(ask) = tick.down_book.best_ask() {
        let edge = (Decimal::ONE - fair) - ask;
        if best.map(|(_, _, _, e)| edge > e).unwrap_or(true) {
            best = Some((Outcome::Down, &tick.down_book, ask, edge));
        }
    }

    best
}

/// Edge on the entry side at current prices, if the model still has a
/// fair price for the cell.
fn current_edge(
    model: &dyn PriceModel,
    market: &Market,
    entry_outcome: Outcome,
    tick: &MarketTick,
) -> Option<Decimal> {
    let mid = mid_price(&tick.up_book)?;
    let remaining = Market::WINDOW_SECONDS - market.elapsed_secs();
    let cell = PriceCell::from_observation(market.asset, mid, remaining);
    let fair = model.fair_price(&cell)?;

    match entry_outcome {
        Outcome::Up => tick.up_book.best_ask().map(|ask| fair - ask),
        Outcome::Down => tick
            .down_book
            .best_ask()
            .map(|ask| (Decimal::ONE - fair) - ask),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::market::mock::MockExchange;
    use crate::market::types::test_market;
    use crate::orderbook::types::PriceLevel;
    use crate::strategy::model::FixedModel;
    use crate::trading::order::{OrderStatus, OrderView};
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn book(token_id: &str, outcome: Outcome, bid: Decimal, ask: Decimal) -> OutcomeBook {
        OutcomeBook {
            token_id: token_id.to_string(),
            outcome,
            bids: vec![PriceLevel::new(bid, dec!(100))],
            asks: vec![PriceLevel::new(ask, dec!(100))],
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    fn tick_for(market: &Market, up_bid: Decimal, up_ask: Decimal) -> MarketTick {
        MarketTick {
            market: market.clone(),
            up_book: book(&market.up_token_id, Outcome::Up, up_bid, up_ask),
            down_book: book(&market.down_token_id, Outcome::Down, dec!(0.40), dec!(0.60)),
            ts: OffsetDateTime::now_utc(),
        }
    }

    struct Harness {
        exchange: MockExchange,
        engine: StrategyEngine,
    }

    fn harness(fair: Decimal, trusted: bool) -> Harness {
        let mut config = test_config();
        config.dry_run = false;
        config.min_request_interval_ms = 0;
        let exchange = MockExchange::new();
        exchange.set_balance(dec!(1000));

        let exec = Arc::new(ExecutionClient::new(
            Arc::new(exchange.clone()),
            config.clone(),
        ));
        let kill_switch = Arc::new(Mutex::new(KillSwitch::new(&config)));
        let engine = StrategyEngine::new(
            config,
            exec,
            Arc::new(FixedModel { fair, trusted }),
            kill_switch,
            AuditHandle::disabled(),
        );

        Harness { exchange, engine }
    }

    fn seed_books(h: &Harness, market: &Market, tick: &MarketTick) {
        let levels = |book: &OutcomeBook| {
            (
                book.bids.iter().map(|l| (l.price, l.size)).collect(),
                book.asks.iter().map(|l| (l.price, l.size)).collect(),
            )
        };
        let (bids, asks) = levels(&tick.up_book);
        h.exchange.set_book(&market.up_token_id, bids, asks);
        let (bids, asks) = levels(&tick.down_book);
        h.exchange.set_book(&market.down_token_id, bids, asks);
    }

    #[tokio::test]
    async fn entry_placed_when_all_gates_pass() {
        let mut h = harness(dec!(0.55), true);
        let market = test_market("m1");
        // fair 0.55 vs ask 0.44 -> edge 0.11
        let tick = tick_for(&market, dec!(0.42), dec!(0.44));
        seed_books(&h, &market, &tick);

        h.engine.handle_event(FeedEvent::Tick(tick)).await;

        assert_eq!(h.exchange.submit_calls(), 1);
        let state = h.engine.market_state("m1").unwrap();
        assert_eq!(state.phase(), Phase::HasEntry);
        assert_eq!(state.entry_outcome, Some(Outcome::Up));
        assert!(state.live_order.is_some());

        // reservation promoted to open
        let key = LedgerKey::new("m1", crate::market::types::Asset::Btc);
        assert_eq!(
            h.engine.ledger().effective_exposure(&key, Outcome::Up),
            dec!(20)
        );
    }

    #[tokio::test]
    async fn untrusted_cell_blocks_entry() {
        let mut h = harness(dec!(0.55), false);
        let market = test_market("m1");
        let tick = tick_for(&market, dec!(0.42), dec!(0.44));
        seed_books(&h, &market, &tick);

        h.engine.handle_event(FeedEvent::Tick(tick)).await;

        assert_eq!(h.exchange.submit_calls(), 0);
        assert_eq!(h.engine.market_state("m1").unwrap().phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn thin_edge_blocks_entry() {
        let mut h = harness(dec!(0.46), true);
        let market = test_market("m1");
        // fair 0.46 vs ask 0.44 -> edge 0.02 < 0.05
        let tick = tick_for(&market, dec!(0.42), dec!(0.44));
        seed_books(&h, &market, &tick);

        h.engine.handle_event(FeedEvent::Tick(tick)).await;
        assert_eq!(h.exchange.submit_calls(), 0);
    }

    #[tokio::test]
    async fn entry_window_is_enforced() {
        let mut h = harness(dec!(0.55), true);
        let mut market = test_market("m1");
        // 30s into the window, before entries open at 60s
        let now = OffsetDateTime::now_utc().unix_timestamp();
        market.start_timestamp = now - 30;
        market.end_timestamp = market.start_timestamp + Market::WINDOW_SECONDS;
        let tick = tick_for(&market, dec!(0.42), dec!(0.44));
        seed_books(&h, &market, &tick);

        h.engine.handle_event(FeedEvent::Tick(tick)).await;
        assert_eq!(h.exchange.submit_calls(), 0);
    }

    #[tokio::test]
    async fn stale_books_are_counted_on_the_kill_switch() {
        let mut h = harness(dec!(0.55), true);
        let market = test_market("m1");
        let mut tick = tick_for(&market, dec!(0.42), dec!(0.44));
        let old = OffsetDateTime::now_utc() - time::Duration::seconds(60);
        tick.up_book.updated_at = old;
        tick.down_book.updated_at = old;
        seed_books(&h, &market, &tick);

        h.engine.handle_event(FeedEvent::Tick(tick)).await;

        assert_eq!(h.exchange.submit_calls(), 0);
        let status = lock_kill_switch(&h.engine.kill_switch).status();
        assert_eq!(status.evaluations, 1);
        assert_eq!(status.stale_book_skips, 1);
    }

    #[tokio::test]
    async fn tripped_kill_switch_blocks_entries() {
        let mut h = harness(dec!(0.55), true);
        let market = test_market("m1");
        let tick = tick_for(&market, dec!(0.42), dec!(0.44));
        seed_books(&h, &market, &tick);

        lock_kill_switch(&h.engine.kill_switch).record_fill(Some(true), None);

        h.engine.handle_event(FeedEvent::Tick(tick)).await;
        assert_eq!(h.exchange.submit_calls(), 0);
    }

    #[tokio::test]
    async fn unfilled_dead_entry_releases_market() {
        let mut h = harness(dec!(0.55), true);
        let market = test_market("m1");
        let tick = tick_for(&market, dec!(0.42), dec!(0.44));
        seed_books(&h, &market, &tick);

        h.engine.handle_event(FeedEvent::Tick(tick.clone())).await;
        let order_id = h
            .engine
            .market_state("m1")
            .unwrap()
            .live_order
            .as_ref()
            .unwrap()
            .order_id
            .clone();

        // entry dies on the book without a single fill
        h.exchange.script_status(
            &order_id,
            OrderView {
                order_id: order_id.clone(),
                status: Some(OrderStatus::Canceled),
                matched: dec!(0),
                original: dec!(20),
                avg_price: None,
                fee_rate_bps: Some(dec!(0)),
                maker: Some(true),
            },
        );

        h.engine.handle_event(FeedEvent::Tick(tick)).await;

        let state = h.engine.market_state("m1").unwrap();
        // released back to Idle; this tick's entry evaluation may have
        // re-entered, but exposure never exceeds a single entry
        let key = LedgerKey::new("m1", crate::market::types::Asset::Btc);
        assert!(h.engine.ledger().effective_exposure(&key, Outcome::Up) <= dec!(20));
        assert!(state.entry_filled == dec!(0));
    }

    #[tokio::test]
    async fn filled_entry_then_hedge_flow() {
        let mut h = harness(dec!(0.55), true);
        // no dwell, always corrected, tiny profit trigger
        h.engine.config.hedge_dwell_secs = 0;
        h.engine.config.hedge_retry_secs = 0;
        h.engine.config.corrected_edge_threshold = dec!(1);
        h.engine.config.hedge_profit_trigger = dec!(0.01);

        let market = test_market("m1");
        let tick = tick_for(&market, dec!(0.42), dec!(0.44));
        seed_books(&h, &market, &tick);

        h.engine.handle_event(FeedEvent::Tick(tick)).await;
        let order_id = h
            .engine
            .market_state("m1")
            .unwrap()
            .live_order
            .as_ref()
            .unwrap()
            .order_id
            .clone();

        // entry fills fully at 0.44
        h.exchange.script_status(
            &order_id,
            OrderView {
                order_id: order_id.clone(),
                status: Some(OrderStatus::Filled),
                matched: dec!(20),
                original: dec!(20),
                avg_price: Some(dec!(0.44)),
                fee_rate_bps: Some(dec!(0)),
                maker: Some(true),
            },
        );

        // entry side rallied: bid 0.50 >> avg 0.44; hedge ask 0.46
        let mut next = tick_for(&market, dec!(0.50), dec!(0.52));
        next.down_book = book(&market.down_token_id, Outcome::Down, dec!(0.44), dec!(0.46));
        seed_books(&h, &market, &next);

        h.engine.handle_event(FeedEvent::Tick(next)).await;

        let state = h.engine.market_state("m1").unwrap();
        assert_eq!(state.entry_filled, dec!(20));
        assert_eq!(state.phase(), Phase::HedgeInProgress);
        let hedge = state.live_order.as_ref().unwrap();
        assert_eq!(hedge.intent, OrderIntent::Hedge);
        assert_eq!(hedge.token_id, market.down_token_id);
        // hedge size = entry_filled * ratio 1, clamped [5, 100]
        assert_eq!(hedge.requested, dec!(20));
        assert_eq!(h.exchange.submit_calls(), 2);
    }

    #[tokio::test]
    async fn hedge_respects_ask_ceiling() {
        let mut h = harness(dec!(0.55), true);
        h.engine.config.hedge_dwell_secs = 0;
        h.engine.config.hedge_retry_secs = 0;
        h.engine.config.corrected_edge_threshold = dec!(1);
        h.engine.config.hedge_profit_trigger = dec!(0.01);

        let market = test_market("m1");
        let tick = tick_for(&market, dec!(0.42), dec!(0.44));
        seed_books(&h, &market, &tick);
        h.engine.handle_event(FeedEvent::Tick(tick)).await;

        let order_id = h
            .engine
            .market_state("m1")
            .unwrap()
            .live_order
            .as_ref()
            .unwrap()
            .order_id
            .clone();
        h.exchange.script_status(
            &order_id,
            OrderView {
                order_id: order_id.clone(),
                status: Some(OrderStatus::Filled),
                matched: dec!(20),
                original: dec!(20),
                avg_price: Some(dec!(0.44)),
                fee_rate_bps: Some(dec!(0)),
                maker: Some(true),
            },
        );

        // hedge ask 0.90 above the 0.85 ceiling
        let mut next = tick_for(&market, dec!(0.50), dec!(0.52));
        next.down_book = book(&market.down_token_id, Outcome::Down, dec!(0.86), dec!(0.90));
        seed_books(&h, &market, &next);
        h.engine.handle_event(FeedEvent::Tick(next)).await;

        let state = h.engine.market_state("m1").unwrap();
        assert_eq!(state.phase(), Phase::HasEntry);
        assert_eq!(h.exchange.submit_calls(), 1);
    }

    #[tokio::test]
    async fn retirement_clears_ledger_and_state() {
        let mut h = harness(dec!(0.55), true);
        let market = test_market("m1");
        let tick = tick_for(&market, dec!(0.42), dec!(0.44));
        seed_books(&h, &market, &tick);
        h.engine.handle_event(FeedEvent::Tick(tick)).await;

        let key = LedgerKey::new("m1", crate::market::types::Asset::Btc);
        assert!(h.engine.ledger().effective_exposure(&key, Outcome::Up) > dec!(0));

        h.engine
            .handle_event(FeedEvent::Retired {
                market_id: "m1".into(),
            })
            .await;

        assert!(h.engine.market_state("m1").is_none());
        assert_eq!(h.engine.ledger().effective_exposure(&key, Outcome::Up), dec!(0));
        assert_eq!(h.exchange.cancel_calls(), 1);
    }

    #[tokio::test]
    async fn dry_run_entry_fills_inline() {
        let mut config = test_config();
        config.min_request_interval_ms = 0;
        let exchange = MockExchange::new();
        let exec = Arc::new(ExecutionClient::new(
            Arc::new(exchange.clone()),
            config.clone(),
        ));
        let kill_switch = Arc::new(Mutex::new(KillSwitch::new(&config)));
        let engine = StrategyEngine::new(
            config,
            exec,
            Arc::new(FixedModel {
                fair: dec!(0.55),
                trusted: true,
            }),
            kill_switch,
            AuditHandle::disabled(),
        );

        let market = test_market("m1");
        let tick = tick_for(&market, dec!(0.42), dec!(0.44));
        let h = Harness {
            exchange: exchange.clone(),
            engine,
        };
        seed_books(&h, &market, &tick);
        let mut engine = h.engine;

        engine.handle_event(FeedEvent::Tick(tick)).await;

        let state = engine.market_state("m1").unwrap();
        assert_eq!(state.phase(), Phase::HasEntry);
        assert_eq!(state.entry_filled, dec!(20));
        assert!(state.live_order.is_none());
        assert_eq!(exchange.submit_calls(), 0);
    }
}
