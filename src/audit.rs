//! Structured audit trail of every trading decision.
//!
//! Events flow over an unbounded channel to a writer task that appends
//! JSONL to a file when one is configured, and mirrors everything into
//! the log. Emission never blocks the hot path; a send that fails
//! because the writer is gone is counted and dropped.

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::metrics;

/// One audit record.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// An order is about to be submitted.
    OrderAttempt {
        /// Market the order belongs to.
        market_id: String,
        /// Token being traded.
        token_id: String,
        /// Order side.
        side: String,
        /// Entry or hedge leg.
        intent: String,
        /// Requested limit price.
        price: Decimal,
        /// Requested size.
        size: Decimal,
    },
    /// The outcome of a submission.
    OrderResult {
        /// Market the order belongs to.
        market_id: String,
        /// Exchange order id when accepted.
        order_id: Option<String>,
        /// Whether the order was accepted.
        success: bool,
        /// Fill classification when accepted.
        fill_status: Option<String>,
        /// Failure reason when rejected.
        failure: Option<String>,
    },
    /// An entry evaluation declined to trade.
    EntrySkip {
        /// Market evaluated.
        market_id: String,
        /// Why it was skipped.
        reason: String,
    },
    /// A phase transition.
    PhaseTransition {
        /// Market transitioning.
        market_id: String,
        /// Previous phase.
        from: String,
        /// New phase.
        to: String,
    },
    /// Observed fill progress on a tracked order.
    Fill {
        /// Market the order belongs to.
        market_id: String,
        /// Order that filled.
        order_id: String,
        /// Newly filled shares since the last observation.
        delta: Decimal,
        /// Total filled shares.
        total: Decimal,
        /// Whether the fill rested as maker, if reported.
        maker: Option<bool>,
        /// Fee rate in basis points, if reported.
        fee_rate_bps: Option<Decimal>,
    },
    /// The kill switch tripped.
    KillSwitchTripped {
        /// Why it tripped.
        reason: String,
    },
    /// A claim is about to be submitted on chain.
    ClaimAttempt {
        /// Condition being redeemed.
        condition_id: String,
        /// Position value in dollars.
        value: Decimal,
    },
    /// The outcome of a claim.
    ClaimResult {
        /// Condition redeemed.
        condition_id: String,
        /// Whether the redemption confirmed.
        success: bool,
        /// Transaction hash on success.
        tx_hash: Option<String>,
        /// Error text on failure.
        error: Option<String>,
    },
    /// The exposure ledger exceeded its cap.
    LedgerBreach {
        /// Market in breach.
        market_id: String,
        /// Asset of the market.
        asset: String,
        /// Side in breach.
        side: String,
        /// Effective exposure observed.
        effective: Decimal,
        /// Configured cap.
        cap: Decimal,
    },
}

/// Cheap cloneable handle for emitting audit events.
#[derive(Debug, Clone)]
pub struct AuditHandle {
    tx: Option<mpsc::UnboundedSender<AuditEvent>>,
}

impl AuditHandle {
    /// A handle that discards everything (tests, check commands).
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Emit an event. Never blocks.
    pub fn emit(&self, event: AuditEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                metrics::inc_audit_drops();
            }
        }
    }
}

/// Spawn the audit writer task.
///
/// With a path, events append as JSONL; without one they only hit the
/// log stream.
pub fn spawn_audit_writer(path: Option<String>) -> (AuditHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<AuditEvent>();

    let handle = tokio::spawn(async move {
        let mut file = match &path {
            Some(p) => match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .await
            {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!(path = %p, error = %e, "audit file unavailable, logging only");
                    None
                }
            },
            None => None,
        };

        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => {
                    info!(target: "audit", "{}", line);
                    if let Some(f) = file.as_mut() {
                        let mut bytes = line.into_bytes();
                        bytes.push(b'\n');
                        if let Err(e) = f.write_all(&bytes).await {
                            warn!(error = %e, "audit write failed");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "audit serialization failed"),
            }
        }

        if let Some(f) = file.as_mut() {
            let _ = f.flush().await;
        }
    });

    (AuditHandle { tx: Some(tx) }, handle)
}
