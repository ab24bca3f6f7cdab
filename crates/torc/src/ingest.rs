//! Ledger event ingestor
//!
//! Streams events from the ledger and applies them to the mirror, one store
//! transaction per event. The `(event_name, tx_hash, log_index)` identity is
//! recorded in the same transaction, so duplicates are no-ops and replaying
//! an `event_processing` saga converges to the same mirror state. A failed
//! mirror update spawns a recovery saga carrying the event payload.

use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use torc_common::address::Address;
use torc_common::amount::Amount;
use torc_common::database::{
    self, DbTransactionFinalizer, DynStore, Store, StoreTransaction,
};
use torc_common::error::Error;
use torc_common::escrow::{Escrow, EscrowStatus, RwaCollateral, Token};
use torc_common::invoice::LedgerKey;
use torc_common::ledger::{DynLedgerClient, LedgerClient, LedgerEvent};
use torc_common::saga::{OperationType, SagaState, SagaStep};
use torc_common::util::unix_time;
use tracing::instrument;

use crate::recovery::RecoveryQueue;
use crate::saga::{SagaManager, SagaUpdate};

/// What happened to one consumed event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Mirror updated
    Applied,
    /// Identity already seen, nothing to do
    Duplicate,
    /// Recognized but nothing to apply (or unknown event name)
    Ignored,
    /// Mirror update failed; a recovery saga now owns the event
    RecoveryQueued,
}

/// System address recorded as the initiator of event-driven sagas
fn ingestor_principal() -> Address {
    Address::new("system:ingestor")
}

#[derive(Debug, Deserialize, Serialize)]
struct EscrowCreatedArgs {
    key: LedgerKey,
    seller: Address,
    buyer: Address,
    amount: Amount,
    token: Token,
    expires_at: u64,
    #[serde(default)]
    fee_amount: Amount,
}

#[derive(Debug, Deserialize, Serialize)]
struct EscrowFundedArgs {
    key: LedgerKey,
    amount: Amount,
}

#[derive(Debug, Deserialize, Serialize)]
struct ReleaseConfirmedArgs {
    key: LedgerKey,
    party: Address,
}

#[derive(Debug, Deserialize, Serialize)]
struct EscrowReleasedArgs {
    key: LedgerKey,
}

#[derive(Debug, Deserialize, Serialize)]
struct DisputeRaisedArgs {
    key: LedgerKey,
}

#[derive(Debug, Deserialize, Serialize)]
struct DisputeResolvedArgs {
    key: LedgerKey,
    seller_wins: bool,
}

#[derive(Debug, Deserialize, Serialize)]
struct EscrowExpiredArgs {
    key: LedgerKey,
}

#[derive(Debug, Deserialize, Serialize)]
struct InvoiceTokenizedArgs {
    key: LedgerKey,
    nft_contract: Address,
    token_id: u64,
    #[serde(default)]
    supply: u64,
    #[serde(default)]
    face_value: Amount,
}

/// Apply one ledger event to the mirror inside a single transaction
///
/// The ledger is authoritative: recognized events are applied even when the
/// mirror did not expect the transition, with a warning; reconciliation
/// catches anything that still drifts.
pub(crate) async fn apply_mirror_update(
    store: &DynStore,
    event: &LedgerEvent,
) -> Result<EventOutcome, Error> {
    let mut tx = store.begin_transaction().await?;

    match tx.insert_processed_event(&event.identity()).await {
        Ok(()) => {}
        Err(database::Error::Duplicate) => {
            tx.rollback().await?;
            return Ok(EventOutcome::Duplicate);
        }
        Err(err) => {
            tx.rollback().await?;
            return Err(err.into());
        }
    }

    let outcome = match event.name.as_str() {
        "EscrowCreated" => {
            let args: EscrowCreatedArgs = serde_json::from_value(event.args.clone())?;
            let invoice_id = args.key.invoice_id()?;
            if tx.get_escrow(&invoice_id).await?.is_none() {
                tx.upsert_escrow(&Escrow {
                    invoice_id,
                    seller: args.seller,
                    buyer: args.buyer,
                    amount: args.amount,
                    token: args.token,
                    status: EscrowStatus::Created,
                    seller_confirmed: false,
                    buyer_confirmed: false,
                    dispute_raised: false,
                    created_at: unix_time(),
                    expires_at: args.expires_at,
                    rwa: None,
                    fee_amount: args.fee_amount,
                    discount_rate_bps: 0,
                    discount_deadline: None,
                    release_tx_hash: None,
                })
                .await?;
            }
            EventOutcome::Applied
        }
        "EscrowFunded" => {
            let args: EscrowFundedArgs = serde_json::from_value(event.args.clone())?;
            let invoice_id = args.key.invoice_id()?;
            match tx.get_escrow(&invoice_id).await? {
                Some(mut escrow) => {
                    if escrow.status != EscrowStatus::Funded
                        && !escrow.status.can_transition_to(EscrowStatus::Funded)
                    {
                        tracing::warn!(
                            "mirror for {} was {} on EscrowFunded",
                            invoice_id,
                            escrow.status
                        );
                    }
                    escrow.status = EscrowStatus::Funded;
                    escrow.amount = args.amount;
                    tx.upsert_escrow(&escrow).await?;
                    EventOutcome::Applied
                }
                None => EventOutcome::Ignored,
            }
        }
        "ReleaseConfirmed" => {
            let args: ReleaseConfirmedArgs = serde_json::from_value(event.args.clone())?;
            let invoice_id = args.key.invoice_id()?;
            match tx.get_escrow(&invoice_id).await? {
                Some(mut escrow) => {
                    if args.party == escrow.seller {
                        escrow.seller_confirmed = true;
                    } else if args.party == escrow.buyer {
                        escrow.buyer_confirmed = true;
                    }
                    tx.upsert_escrow(&escrow).await?;
                    EventOutcome::Applied
                }
                None => EventOutcome::Ignored,
            }
        }
        "EscrowReleased" | "DisputeResolved" => {
            let key: LedgerKey = if event.name == "EscrowReleased" {
                serde_json::from_value::<EscrowReleasedArgs>(event.args.clone())?.key
            } else {
                serde_json::from_value::<DisputeResolvedArgs>(event.args.clone())?.key
            };
            let invoice_id = key.invoice_id()?;
            match tx.get_escrow(&invoice_id).await? {
                Some(mut escrow) => {
                    escrow.status = EscrowStatus::Released;
                    escrow.release_tx_hash = Some(event.tx_hash.to_string());
                    tx.upsert_escrow(&escrow).await?;
                    if let Some(mut vote) = tx.get_dispute_vote(&invoice_id).await? {
                        if !vote.resolved {
                            vote.resolved = true;
                            tx.upsert_dispute_vote(&vote).await?;
                        }
                    }
                    EventOutcome::Applied
                }
                None => EventOutcome::Ignored,
            }
        }
        "DisputeRaised" => {
            let args: DisputeRaisedArgs = serde_json::from_value(event.args.clone())?;
            let invoice_id = args.key.invoice_id()?;
            match tx.get_escrow(&invoice_id).await? {
                Some(mut escrow) => {
                    escrow.status = EscrowStatus::Disputed;
                    escrow.dispute_raised = true;
                    tx.upsert_escrow(&escrow).await?;
                    EventOutcome::Applied
                }
                None => EventOutcome::Ignored,
            }
        }
        "EscrowExpired" => {
            let args: EscrowExpiredArgs = serde_json::from_value(event.args.clone())?;
            let invoice_id = args.key.invoice_id()?;
            match tx.get_escrow(&invoice_id).await? {
                Some(mut escrow) => {
                    escrow.status = EscrowStatus::Expired;
                    tx.upsert_escrow(&escrow).await?;
                    EventOutcome::Applied
                }
                None => EventOutcome::Ignored,
            }
        }
        "InvoiceTokenized" => {
            let args: InvoiceTokenizedArgs = serde_json::from_value(event.args.clone())?;
            let invoice_id = args.key.invoice_id()?;
            match tx.get_escrow(&invoice_id).await? {
                Some(mut escrow) => {
                    escrow.rwa = Some(RwaCollateral {
                        contract: args.nft_contract,
                        token_id: args.token_id,
                    });
                    tx.upsert_escrow(&escrow).await?;
                    EventOutcome::Applied
                }
                None => {
                    tracing::warn!(
                        "InvoiceTokenized for unknown invoice {}, skipping",
                        invoice_id
                    );
                    EventOutcome::Ignored
                }
            }
        }
        other => {
            tracing::debug!("ignoring unrecognized ledger event `{}`", other);
            EventOutcome::Ignored
        }
    };

    tx.commit().await?;
    Ok(outcome)
}

/// Consumes the ledger event stream and keeps the mirror fresh
#[derive(Clone)]
pub struct EventIngestor {
    store: DynStore,
    ledger: DynLedgerClient,
    sagas: Arc<SagaManager>,
    queue: Arc<RecoveryQueue>,
}

impl std::fmt::Debug for EventIngestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventIngestor").finish_non_exhaustive()
    }
}

impl EventIngestor {
    /// Create an ingestor
    pub fn new(
        store: DynStore,
        ledger: DynLedgerClient,
        sagas: Arc<SagaManager>,
        queue: Arc<RecoveryQueue>,
    ) -> Self {
        EventIngestor {
            store,
            ledger,
            sagas,
            queue,
        }
    }

    /// Consume the event stream until shutdown
    pub async fn run(&self, shutdown: Arc<Notify>) -> Result<(), Error> {
        let mut stream = self.ledger.events().await?;
        tracing::info!("event ingestion started");

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    tracing::info!("event ingestion stopping");
                    return Ok(());
                }
                event = stream.next() => {
                    match event {
                        Some(event) => {
                            if let Err(err) = self.handle_event(&event).await {
                                tracing::error!(
                                    "event {} ({}#{}) could not be handled: {}",
                                    event.name,
                                    event.tx_hash,
                                    event.log_index,
                                    err
                                );
                            }
                        }
                        None => {
                            tracing::warn!("ledger event stream closed");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Apply one event; failures hand the payload to a recovery saga
    #[instrument(skip_all, fields(event = %event.name, tx_hash = %event.tx_hash))]
    pub async fn handle_event(&self, event: &LedgerEvent) -> Result<EventOutcome, Error> {
        match apply_mirror_update(&self.store, event).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                tracing::warn!(
                    "mirror update for event {} failed, queueing recovery: {}",
                    event.name,
                    err
                );
                let correlation_id = self
                    .sagas
                    .begin(
                        OperationType::EventProcessing,
                        "event",
                        &format!("{}#{}", event.tx_hash, event.log_index),
                        vec![SagaStep::DbUpdate],
                        serde_json::to_value(event)?,
                        ingestor_principal(),
                        None,
                    )
                    .await?;
                self.sagas
                    .advance(&correlation_id, SagaState::Processing, SagaUpdate::default())
                    .await?;
                self.sagas
                    .advance(&correlation_id, SagaState::Failed, SagaUpdate::default())
                    .await?;
                self.queue
                    .enqueue(
                        &correlation_id,
                        OperationType::EventProcessing,
                        serde_json::to_value(event)?,
                        1,
                        &err.to_string(),
                    )
                    .await?;
                Ok(EventOutcome::RecoveryQueued)
            }
        }
    }
}
