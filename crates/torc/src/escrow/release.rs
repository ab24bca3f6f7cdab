//! Release saga steps
//!
//! One release saga runs `BLOCKCHAIN_TX → DB_UPDATE → AUDIT_LOG`. Each step
//! is durably recorded before the next one starts; re-execution (from the
//! recovery pipeline) skips steps already in the log. Payout ordering on the
//! ledger is fee first, then the winner, then the collateral NFT.

use serde::{Deserialize, Serialize};
use torc_common::address::Address;
use torc_common::amount::Amount;
use torc_common::audit::AuditRecord;
use torc_common::database::{DbTransactionFinalizer, DynStore, Store, StoreTransaction};
use torc_common::error::Error;
use torc_common::escrow::{EscrowStatus, Token};
use torc_common::invoice::InvoiceId;
use torc_common::ledger::{payloads, DynLedgerClient, LedgerClient, LedgerOperation};
use torc_common::publish::{DomainEvent, DynPublishSink, PublishSink};
use torc_common::saga::{Saga, SagaStep};
use torc_common::util::unix_time;

use crate::saga::SagaManager;

/// Context payload of a release saga (normal or dispute-resolved)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseContext {
    /// Invoice being settled
    pub invoice_id: InvoiceId,
    /// Payout recipient
    pub winner: Address,
    /// Collateral recipient, when an NFT is held
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nft_recipient: Option<Address>,
    /// Fee transferred to the treasury before the payout
    pub fee_amount: Amount,
    /// Amount transferred to the winner
    pub payout_amount: Amount,
    /// Settlement token
    pub token: Token,
    /// Fee recipient
    pub treasury: Address,
    /// Buyer, the refund target should compensation become necessary
    pub buyer: Address,
    /// Escrowed amount returned on the refund path
    pub refund_amount: Amount,
    /// Hash of the release transaction once submitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

/// Execute the remaining steps of a release saga
pub(crate) async fn execute_release(
    store: &DynStore,
    ledger: &DynLedgerClient,
    sagas: &SagaManager,
    publisher: &DynPublishSink,
    saga: &Saga,
    mut context: ReleaseContext,
) -> Result<(), Error> {
    let mut saga = saga.clone();

    if !saga.has_completed(SagaStep::BlockchainTx) {
        let payload = serde_json::to_value(payloads::Release {
            key: context.invoice_id.to_ledger_key(),
            token: context.token.clone(),
            fee_amount: context.fee_amount.clone(),
            treasury: context.treasury.clone(),
            payout_amount: context.payout_amount.clone(),
            winner: context.winner.clone(),
            nft_recipient: context.nft_recipient.clone(),
        })?;
        let tx_hash = ledger.submit(LedgerOperation::Release, payload).await?;
        tracing::info!(
            "escrow {} released on ledger in {}",
            context.invoice_id,
            tx_hash
        );

        // The hash rides in the context so a post-crash retry knows the
        // ledger side is done.
        context.tx_hash = Some(tx_hash.to_string());
        saga = sagas
            .record_step(
                &saga.correlation_id,
                SagaStep::BlockchainTx,
                Some(serde_json::to_value(&context)?),
            )
            .await?;
    } else if context.tx_hash.is_none() {
        // Context from before the crash may predate the recorded step.
        let fresh: ReleaseContext = serde_json::from_value(saga.context_data.clone())?;
        context.tx_hash = fresh.tx_hash;
    }

    if !saga.has_completed(SagaStep::DbUpdate) {
        let mut tx = store.begin_transaction().await?;
        let mut escrow = match tx.get_escrow(&context.invoice_id).await? {
            Some(escrow) => escrow,
            None => {
                tx.rollback().await?;
                return Err(Error::UnknownEscrow);
            }
        };

        if escrow.status != EscrowStatus::Released {
            if !escrow.status.can_transition_to(EscrowStatus::Released) {
                tx.rollback().await?;
                return Err(Error::IllegalEscrowTransition {
                    from: escrow.status,
                    to: EscrowStatus::Released,
                });
            }
            escrow.status = EscrowStatus::Released;
            escrow.release_tx_hash = context.tx_hash.clone();
            tx.upsert_escrow(&escrow).await?;
        }
        tx.commit().await?;

        saga = sagas
            .record_step(&saga.correlation_id, SagaStep::DbUpdate, None)
            .await?;
    }

    if !saga.has_completed(SagaStep::AuditLog) {
        let mut tx = store.begin_transaction().await?;
        tx.add_audit_record(&AuditRecord {
            correlation_id: saga.correlation_id,
            actor: saga.initiated_by.clone(),
            action: "escrow_released".to_string(),
            details: serde_json::to_value(&context)?,
            recorded_at: unix_time(),
        })
        .await?;
        tx.commit().await?;

        publisher.publish(DomainEvent::EscrowReleased {
            invoice_id: context.invoice_id,
            winner: context.winner.clone(),
            amount: context.payout_amount.clone(),
            tx_hash: context.tx_hash.clone().unwrap_or_default(),
        });

        sagas
            .record_step(&saga.correlation_id, SagaStep::AuditLog, None)
            .await?;
    }

    Ok(())
}
