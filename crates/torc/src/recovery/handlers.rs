//! Operation handlers and the dispatch registry
//!
//! The registry is the sole coupling point between the recovery pipeline and
//! the domain services: components depend on the [`OperationHandler`]
//! interface, never on each other. Each handler is a small state-aware
//! function that consults `steps_completed` before acting, so re-execution
//! is idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use torc_common::address::Address;
use torc_common::amount::Amount;
use torc_common::database::{DbTransactionFinalizer, DynStore, Store, StoreTransaction};
use torc_common::error::Error;
use torc_common::invoice::InvoiceId;
use torc_common::ledger::{payloads, DynLedgerClient, LedgerClient, LedgerEvent, LedgerOperation};
use torc_common::publish::DynPublishSink;
use torc_common::saga::{OperationType, Saga, SagaState, SagaStep};
use torc_common::util::unix_time;
use tracing::instrument;
use uuid::Uuid;

use crate::escrow::release;
use crate::ingest;
use crate::recovery::RecoveryQueue;
use crate::saga::{SagaManager, SagaUpdate};

/// Re-execution handler for one operation type
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Execute the operation's remaining steps
    ///
    /// Must consult `saga.steps_completed` and skip effects that already
    /// committed; every completed step is recorded through the saga manager
    /// before the next one starts.
    async fn execute(&self, saga: &Saga, operation_data: &Value) -> Result<(), Error>;

    /// True when the completed steps left externally visible side effects
    /// that an idempotent retry of the remaining steps cannot undo
    fn requires_compensation(&self, steps_completed: &[SagaStep]) -> bool;
}

/// `operation_type → handler` dispatch table
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<OperationType, Arc<dyn OperationHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registered", &self.handlers.len())
            .finish()
    }
}

impl HandlerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    /// Register `handler` for `operation_type`, replacing any previous one
    pub fn register(&mut self, operation_type: OperationType, handler: Arc<dyn OperationHandler>) {
        self.handlers.insert(operation_type, handler);
    }

    /// Look up the handler for `operation_type`
    pub fn get(&self, operation_type: OperationType) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(&operation_type).cloned()
    }
}

/// Final state of a saga driven by [`OperationRunner::run`]
#[derive(Debug, Clone, PartialEq)]
pub struct SagaOutcome {
    /// Saga that was driven
    pub correlation_id: Uuid,
    /// State the saga ended the attempt in
    pub state: SagaState,
    /// Failure description when the attempt did not complete
    pub error: Option<String>,
}

/// Drives a begun saga through its registered handler
///
/// This is the forward path: the escrow service begins a saga and hands it
/// here. Transient failures advance the saga to `failed` and enqueue a
/// recovery entry; permanent failures with visible side effects promote
/// straight to the DLQ.
#[derive(Clone)]
pub struct OperationRunner {
    sagas: Arc<SagaManager>,
    queue: Arc<RecoveryQueue>,
    registry: Arc<HandlerRegistry>,
}

impl std::fmt::Debug for OperationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRunner").finish_non_exhaustive()
    }
}

impl OperationRunner {
    /// Create a runner over the shared registry
    pub fn new(
        sagas: Arc<SagaManager>,
        queue: Arc<RecoveryQueue>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        OperationRunner {
            sagas,
            queue,
            registry,
        }
    }

    /// Execute a pending saga and settle its first-attempt outcome
    #[instrument(skip_all, fields(%correlation_id))]
    pub async fn run(&self, correlation_id: &Uuid) -> Result<SagaOutcome, Error> {
        let saga = self.sagas.read(correlation_id).await?;
        let handler = self
            .registry
            .get(saga.operation_type)
            .ok_or_else(|| Error::NoHandler(saga.operation_type.to_string()))?;

        let saga = self
            .sagas
            .advance(correlation_id, SagaState::Processing, SagaUpdate::default())
            .await?;

        match handler.execute(&saga, &saga.context_data).await {
            Ok(()) => {
                self.sagas
                    .advance(correlation_id, SagaState::Completed, SagaUpdate::default())
                    .await?;
                Ok(SagaOutcome {
                    correlation_id: *correlation_id,
                    state: SagaState::Completed,
                    error: None,
                })
            }
            Err(err) => {
                self.sagas
                    .advance(correlation_id, SagaState::Failed, SagaUpdate::default())
                    .await?;
                let fresh = self.sagas.read(correlation_id).await?;
                let requires_compensation =
                    handler.requires_compensation(&fresh.steps_completed);

                if err.is_retryable() {
                    self.queue
                        .enqueue(
                            correlation_id,
                            fresh.operation_type,
                            fresh.context_data,
                            1,
                            &err.to_string(),
                        )
                        .await?;
                    return Ok(SagaOutcome {
                        correlation_id: *correlation_id,
                        state: SagaState::Failed,
                        error: Some(err.to_string()),
                    });
                }

                if requires_compensation {
                    self.queue
                        .promote_to_dlq(
                            correlation_id,
                            fresh.operation_type,
                            fresh.context_data,
                            &err.to_string(),
                            1,
                            true,
                        )
                        .await?;
                    return Ok(SagaOutcome {
                        correlation_id: *correlation_id,
                        state: SagaState::Dlq,
                        error: Some(err.to_string()),
                    });
                }

                // Permanent failure with nothing to undo: the saga stays
                // failed and the caller sees the error synchronously.
                Err(err)
            }
        }
    }
}

/// Handler for `escrow_release` and `escrow_dispute` sagas
///
/// The ledger transaction is assumed already committed when `BLOCKCHAIN_TX`
/// is in `steps_completed`; otherwise it is re-submitted.
pub struct EscrowReleaseHandler {
    store: DynStore,
    ledger: DynLedgerClient,
    sagas: Arc<SagaManager>,
    publisher: DynPublishSink,
}

impl EscrowReleaseHandler {
    /// Create the release handler
    pub fn new(
        store: DynStore,
        ledger: DynLedgerClient,
        sagas: Arc<SagaManager>,
        publisher: DynPublishSink,
    ) -> Self {
        EscrowReleaseHandler {
            store,
            ledger,
            sagas,
            publisher,
        }
    }
}

#[async_trait]
impl OperationHandler for EscrowReleaseHandler {
    #[instrument(skip_all, fields(correlation_id = %saga.correlation_id))]
    async fn execute(&self, saga: &Saga, operation_data: &Value) -> Result<(), Error> {
        let context: release::ReleaseContext = serde_json::from_value(operation_data.clone())?;
        release::execute_release(
            &self.store,
            &self.ledger,
            &self.sagas,
            &self.publisher,
            saga,
            context,
        )
        .await
    }

    fn requires_compensation(&self, steps_completed: &[SagaStep]) -> bool {
        // Funds moved on the ledger; the unfinished store update cannot undo
        // that by retrying.
        steps_completed.contains(&SagaStep::BlockchainTx)
    }
}

/// Context payload of a `financing_pipeline` saga
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancingContext {
    /// Invoice being financed
    pub invoice_id: InvoiceId,
    /// Liquidity drawn
    pub amount: Amount,
    /// Funding recipient
    pub recipient: Address,
}

/// Handler for `financing_pipeline` sagas
///
/// Re-submits the funding call with the original parameters; safe because
/// the ledger contract is idempotent on the invoice key.
pub struct FinancingHandler {
    store: DynStore,
    ledger: DynLedgerClient,
    sagas: Arc<SagaManager>,
}

impl FinancingHandler {
    /// Create the financing handler
    pub fn new(store: DynStore, ledger: DynLedgerClient, sagas: Arc<SagaManager>) -> Self {
        FinancingHandler {
            store,
            ledger,
            sagas,
        }
    }
}

#[async_trait]
impl OperationHandler for FinancingHandler {
    #[instrument(skip_all, fields(correlation_id = %saga.correlation_id))]
    async fn execute(&self, saga: &Saga, operation_data: &Value) -> Result<(), Error> {
        let context: FinancingContext = serde_json::from_value(operation_data.clone())?;
        let mut saga = saga.clone();

        if !saga.has_completed(SagaStep::ExternalLiquidity) {
            let payload = serde_json::to_value(payloads::Fund {
                key: context.invoice_id.to_ledger_key(),
                amount: context.amount.clone(),
                recipient: context.recipient.clone(),
            })?;
            self.ledger.submit(LedgerOperation::Fund, payload).await?;
            saga = self
                .sagas
                .record_step(&saga.correlation_id, SagaStep::ExternalLiquidity, None)
                .await?;
        }

        if !saga.has_completed(SagaStep::DbUpdate) {
            let mut tx = self.store.begin_transaction().await?;
            tx.add_audit_record(&torc_common::audit::AuditRecord {
                correlation_id: saga.correlation_id,
                actor: saga.initiated_by.clone(),
                action: "invoice_funded".to_string(),
                details: serde_json::to_value(&context)?,
                recorded_at: unix_time(),
            })
            .await?;
            tx.commit().await?;
            self.sagas
                .record_step(&saga.correlation_id, SagaStep::DbUpdate, None)
                .await?;
        }

        Ok(())
    }

    fn requires_compensation(&self, steps_completed: &[SagaStep]) -> bool {
        steps_completed.contains(&SagaStep::ExternalLiquidity)
    }
}

/// Handler for `event_processing` sagas
///
/// Re-runs the event mirror update; replays are no-ops thanks to the
/// `(event_name, tx_hash, log_index)` identity.
pub struct EventProcessingHandler {
    store: DynStore,
    sagas: Arc<SagaManager>,
}

impl EventProcessingHandler {
    /// Create the event replay handler
    pub fn new(store: DynStore, sagas: Arc<SagaManager>) -> Self {
        EventProcessingHandler { store, sagas }
    }
}

#[async_trait]
impl OperationHandler for EventProcessingHandler {
    #[instrument(skip_all, fields(correlation_id = %saga.correlation_id))]
    async fn execute(&self, saga: &Saga, operation_data: &Value) -> Result<(), Error> {
        let event: LedgerEvent = serde_json::from_value(operation_data.clone())?;

        if !saga.has_completed(SagaStep::DbUpdate) {
            ingest::apply_mirror_update(&self.store, &event).await?;
            self.sagas
                .record_step(&saga.correlation_id, SagaStep::DbUpdate, None)
                .await?;
        }
        Ok(())
    }

    fn requires_compensation(&self, _steps_completed: &[SagaStep]) -> bool {
        // Mirror updates are idempotent under the event identity.
        false
    }
}
