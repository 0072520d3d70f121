//! Broadcast and ledger reconciliation
//!
//! One signed transaction moves through these steps:
//!
//! ```text
//! Prepared --mark_pending--> Pending --broadcast--> Accepted ---------> settled
//!    |                          |                       ^
//!    | store error              | rejected              | spent by our txid
//!    v                          v                       |
//!  aborted                   Failed <--unspent---- Ambiguous --spent by other--> SpentElsewhere
//!                               |                       |
//!                               v                       | oracle unavailable
//!                          rolled back                  v
//!                                                  Unresolved (left pending for the sweep)
//! ```
//!
//! Once the network holds the transaction, a failing ledger update is
//! logged and the caller still gets success; the pending sweep repairs the
//! rows from the chain.

use crate::core::model::{AccountId, OutPoint, TransactionRecord};
use crate::core::transaction::SignedTransaction;
use crate::engine::collaborators::{BroadcastError, Broadcaster, ChainOracle};
use crate::engine::error::{EngineError, EngineResult};
use crate::ledger::{LedgerOp, LedgerStore};
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::time::timeout;

/// Everything the saga writes for one transaction
#[derive(Debug, Clone)]
pub struct SpendPlan {
    pub txid: String,
    pub raw_hex: String,
    /// Outpoints claimed before broadcast
    pub spent: Vec<OutPoint>,
    pub record: TransactionRecord,
    /// Rows created by the transaction (change, lock, unlock marker)
    pub creates: Vec<LedgerOp>,
}

impl SpendPlan {
    pub fn new(signed: &SignedTransaction, record: TransactionRecord) -> Self {
        Self {
            txid: signed.txid.clone(),
            raw_hex: signed.raw_hex.clone(),
            spent: signed.spent.clone(),
            record,
            creates: Vec::new(),
        }
    }

    pub fn creating(mut self, op: LedgerOp) -> Self {
        self.creates.push(op);
        self
    }

    /// Bookkeeping applied once the network holds the transaction
    fn settle_ops(&self) -> Vec<LedgerOp> {
        let mut ops = Vec::with_capacity(self.creates.len() + 2);
        ops.push(LedgerOp::RecordTransaction(self.record.clone()));
        ops.push(LedgerOp::ConfirmSpent {
            outpoints: self.spent.clone(),
            txid: self.txid.clone(),
        });
        ops.extend(self.creates.iter().cloned());
        ops
    }
}

/// Result of a transaction that reached the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaOutcome {
    pub txid: String,
    /// False when the post-broadcast ledger update failed
    pub ledger_synced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SagaStep {
    Prepared,
    Pending,
    Ambiguous(BroadcastError),
    Accepted,
    SpentElsewhere { outpoint: OutPoint, spender: String },
    Failed(String),
    Unresolved(String),
}

/// Drives one transaction from claimed inputs to a settled ledger
pub struct BroadcastSaga<'a> {
    pub ledger: &'a dyn LedgerStore,
    pub broadcaster: &'a dyn Broadcaster,
    pub chain: &'a dyn ChainOracle,
    pub account_id: AccountId,
    pub network_timeout: Duration,
    pub oracle_timeout: Duration,
}

impl<'a> BroadcastSaga<'a> {
    pub async fn run(&self, plan: &SpendPlan) -> EngineResult<SagaOutcome> {
        if plan.spent.is_empty() {
            return Err(EngineError::InvalidParams(
                "transaction spends no outputs".to_string(),
            ));
        }

        let mut step = SagaStep::Prepared;
        loop {
            debug!("Saga {}: {:?}", plan.txid, step);
            step = match step {
                SagaStep::Prepared => {
                    if let Err(e) = self
                        .ledger
                        .mark_pending(&plan.spent, &plan.txid, self.account_id)
                        .await
                    {
                        warn!("Could not claim inputs for {}: {}", plan.txid, e);
                        return Err(e.into());
                    }
                    SagaStep::Pending
                }
                SagaStep::Pending => match self.broadcast(plan).await {
                    Ok(network_txid) => {
                        if network_txid != plan.txid {
                            warn!(
                                "Broadcaster reported txid {} for {}",
                                network_txid, plan.txid
                            );
                        }
                        SagaStep::Accepted
                    }
                    Err(e) if e.is_ambiguous() => SagaStep::Ambiguous(e),
                    Err(e) => SagaStep::Failed(e.to_string()),
                },
                SagaStep::Ambiguous(cause) => self.resolve_ambiguous(plan, cause).await,
                SagaStep::Accepted => return Ok(self.settle(plan).await),
                SagaStep::SpentElsewhere { outpoint, spender } => {
                    return Err(self.record_foreign_spend(plan, &outpoint, &spender).await)
                }
                SagaStep::Failed(cause) => {
                    self.rollback(plan).await;
                    return Err(EngineError::BroadcastFailed { cause });
                }
                SagaStep::Unresolved(cause) => {
                    warn!(
                        "Outcome of {} unknown, inputs left pending for the sweep: {}",
                        plan.txid, cause
                    );
                    return Err(EngineError::BroadcastFailed { cause });
                }
            };
        }
    }

    async fn broadcast(&self, plan: &SpendPlan) -> Result<String, BroadcastError> {
        match timeout(
            self.network_timeout,
            self.broadcaster.broadcast(&plan.raw_hex, &plan.txid),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BroadcastError::Transport(format!(
                "no response after {}s",
                self.network_timeout.as_secs()
            ))),
        }
    }

    /// Ask the chain who spent our first input
    async fn resolve_ambiguous(&self, plan: &SpendPlan, cause: BroadcastError) -> SagaStep {
        let Some(first_input) = plan.spent.first() else {
            return SagaStep::Failed(cause.to_string());
        };

        match timeout(
            self.oracle_timeout,
            self.chain.output_spent_by(&first_input.txid, first_input.vout),
        )
        .await
        {
            Ok(Ok(Some(spender))) if spender == plan.txid => {
                info!("Transaction {} already known to the network", plan.txid);
                SagaStep::Accepted
            }
            Ok(Ok(Some(spender))) => SagaStep::SpentElsewhere {
                outpoint: first_input.clone(),
                spender,
            },
            Ok(Ok(None)) => SagaStep::Failed(cause.to_string()),
            Ok(Err(e)) => SagaStep::Unresolved(format!("{}; spent check failed: {}", cause, e)),
            Err(_) => SagaStep::Unresolved(format!("{}; spent check timed out", cause)),
        }
    }

    async fn settle(&self, plan: &SpendPlan) -> SagaOutcome {
        let ledger_synced = match self
            .ledger
            .run_atomic(plan.settle_ops(), self.account_id)
            .await
        {
            Ok(()) => {
                info!("Transaction {} broadcast and recorded", plan.txid);
                true
            }
            Err(e) => {
                error!(
                    "CRITICAL: transaction {} is on the network but the ledger update failed: {}",
                    plan.txid, e
                );
                false
            }
        };
        SagaOutcome {
            txid: plan.txid.clone(),
            ledger_synced,
        }
    }

    async fn record_foreign_spend(
        &self,
        plan: &SpendPlan,
        outpoint: &OutPoint,
        spender: &str,
    ) -> EngineError {
        warn!(
            "Input {} of {} was already spent by foreign transaction {}",
            outpoint, plan.txid, spender
        );
        if let Err(e) = self
            .ledger
            .confirm_spent(std::slice::from_ref(outpoint), spender, self.account_id)
            .await
        {
            error!("Failed to record foreign spend of {}: {}", outpoint, e);
        }

        let rest: Vec<OutPoint> = plan
            .spent
            .iter()
            .filter(|o| *o != outpoint)
            .cloned()
            .collect();
        if let Err(e) = self.ledger.rollback_pending(&rest, self.account_id).await {
            error!("Rollback for {} failed, left for the sweep: {}", plan.txid, e);
        }

        EngineError::BroadcastFailed {
            cause: format!("{} already spent by {}", outpoint, spender),
        }
    }

    async fn rollback(&self, plan: &SpendPlan) {
        match self
            .ledger
            .rollback_pending(&plan.spent, self.account_id)
            .await
        {
            Ok(()) => info!("Rolled back {} inputs of {}", plan.spent.len(), plan.txid),
            Err(e) => error!("Rollback for {} failed, left for the sweep: {}", plan.txid, e),
        }
    }
}
