//! Operator-driven compensation
//!
//! Compensation is never auto-executed: DLQ promotion records a pending
//! [`CompensationAction`], and an operator advances it through this
//! executor. The reversal submits the matching ledger operation (refund or
//! financing unwind) and walks the saga `dlq → compensating → compensated`.

use std::sync::Arc;

use torc_common::address::Principal;
use torc_common::database::{DbTransactionFinalizer, DynStore, Store, StoreTransaction};
use torc_common::error::Error;
use torc_common::ledger::{payloads, DynLedgerClient, LedgerClient, LedgerOperation, TxHash};
use torc_common::recovery::{CompensationAction, CompensationActionType, CompensationStatus};
use torc_common::saga::{OperationType, SagaState};
use torc_common::util::unix_time;
use tracing::instrument;
use uuid::Uuid;

use crate::escrow::release::ReleaseContext;
use crate::recovery::handlers::FinancingContext;
use crate::saga::{SagaManager, SagaUpdate};

/// Compensation kind for a terminally failed operation, when one applies
pub fn action_type_for(operation_type: OperationType) -> Option<CompensationActionType> {
    match operation_type {
        OperationType::EscrowRelease | OperationType::EscrowDispute => {
            Some(CompensationActionType::EscrowRefund)
        }
        OperationType::FinancingPipeline => Some(CompensationActionType::FinancingUnwind),
        OperationType::EventProcessing | OperationType::Tokenization => None,
    }
}

/// Executes pending compensation actions on operator request
#[derive(Clone)]
pub struct CompensationExecutor {
    store: DynStore,
    ledger: DynLedgerClient,
    sagas: Arc<SagaManager>,
}

impl std::fmt::Debug for CompensationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompensationExecutor").finish_non_exhaustive()
    }
}

impl CompensationExecutor {
    /// Create an executor
    pub fn new(store: DynStore, ledger: DynLedgerClient, sagas: Arc<SagaManager>) -> Self {
        CompensationExecutor {
            store,
            ledger,
            sagas,
        }
    }

    /// Run the pending compensation action for `correlation_id`
    ///
    /// Admin-only. On success the saga ends `compensated` and the DLQ entry
    /// is stamped resolved; a failed reversal leaves the action `failed` for
    /// escalation.
    #[instrument(skip_all, fields(%correlation_id))]
    pub async fn execute(
        &self,
        correlation_id: &Uuid,
        operator: &Principal,
    ) -> Result<CompensationAction, Error> {
        if !operator.admin {
            return Err(Error::AdminRequired);
        }

        // Claim the action before touching the ledger; the external call
        // must not run under an open store transaction.
        let mut action = {
            let mut tx = self.store.begin_transaction().await?;
            let mut action = match tx.get_compensation_action(correlation_id).await? {
                Some(action) => action,
                None => {
                    tx.rollback().await?;
                    return Err(Error::UnknownCompensationEntry);
                }
            };
            if action.status != CompensationStatus::Pending {
                tx.rollback().await?;
                return Err(Error::CompensationNotPending);
            }
            action.status = CompensationStatus::InProgress;
            tx.update_compensation_action(&action).await?;
            tx.commit().await?;
            action
        };

        self.sagas
            .advance(correlation_id, SagaState::Compensating, SagaUpdate::default())
            .await?;

        match self.submit_reversal(&action).await {
            Ok(tx_hash) => {
                let now = unix_time();
                action.status = CompensationStatus::Completed;
                action.result = Some(tx_hash.to_string());
                action.executed_at = Some(now);

                let mut tx = self.store.begin_transaction().await?;
                tx.update_compensation_action(&action).await?;
                if let Some(mut entry) = tx.get_dlq_entry(correlation_id).await? {
                    entry.compensation_status = CompensationStatus::Completed;
                    entry.resolved_at = Some(now);
                    entry.resolved_by = Some(operator.address.to_string());
                    entry.resolution_notes =
                        Some(format!("compensated via {}", action.action_type));
                    tx.update_dlq_entry(&entry).await?;
                }
                tx.commit().await?;

                self.sagas
                    .advance(correlation_id, SagaState::Compensated, SagaUpdate::default())
                    .await?;

                tracing::info!(
                    "saga {} compensated with {} ({})",
                    correlation_id,
                    action.action_type,
                    tx_hash
                );
                Ok(action)
            }
            Err(err) => {
                action.status = CompensationStatus::Failed;
                action.result = Some(err.to_string());

                let mut tx = self.store.begin_transaction().await?;
                tx.update_compensation_action(&action).await?;
                if let Some(mut entry) = tx.get_dlq_entry(correlation_id).await? {
                    entry.compensation_status = CompensationStatus::Failed;
                    tx.update_dlq_entry(&entry).await?;
                }
                tx.commit().await?;

                self.sagas
                    .advance(correlation_id, SagaState::Failed, SagaUpdate::default())
                    .await?;

                tracing::error!("compensation of saga {} failed: {}", correlation_id, err);
                Err(err)
            }
        }
    }

    async fn submit_reversal(&self, action: &CompensationAction) -> Result<TxHash, Error> {
        match action.action_type {
            CompensationActionType::EscrowRefund => {
                let context: ReleaseContext =
                    serde_json::from_value(action.action_data.clone())?;
                let payload = serde_json::to_value(payloads::Refund {
                    key: context.invoice_id.to_ledger_key(),
                    buyer: context.buyer.clone(),
                    amount: context.refund_amount.clone(),
                })?;
                Ok(self
                    .ledger
                    .submit(LedgerOperation::Refund, payload)
                    .await?)
            }
            CompensationActionType::FinancingUnwind => {
                let context: FinancingContext =
                    serde_json::from_value(action.action_data.clone())?;
                let payload = serde_json::to_value(payloads::Fund {
                    key: context.invoice_id.to_ledger_key(),
                    amount: context.amount.clone(),
                    recipient: context.recipient.clone(),
                })?;
                Ok(self
                    .ledger
                    .submit(LedgerOperation::UnwindFinancing, payload)
                    .await?)
            }
        }
    }
}
