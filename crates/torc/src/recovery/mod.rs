//! Recovery pipeline
//!
//! Failed sagas land in a durable retry queue with exponential backoff.
//! The tick worker claims due entries pessimistically, re-executes them
//! through the handler registry, and promotes terminal failures to the
//! dead-letter queue, creating a pending compensation action when the
//! completed steps left visible external side effects.

use std::sync::Arc;

use serde_json::Value;
use torc_common::address::Principal;
use torc_common::database::{DbTransactionFinalizer, DynStore, Store, StoreTransaction};
use torc_common::error::Error;
use torc_common::recovery::{
    CompensationAction, CompensationStatus, DlqEntry, RecoveryEntry, RecoveryStatus,
};
use torc_common::saga::{OperationType, SagaState};
use torc_common::util::unix_time;
use tracing::instrument;
use uuid::Uuid;

use crate::saga::{SagaManager, SagaUpdate};

pub mod compensation;
pub mod handlers;

#[cfg(test)]
mod tests;

pub use compensation::CompensationExecutor;
pub use handlers::{HandlerRegistry, OperationHandler, OperationRunner, SagaOutcome};

/// Entries claimed per tick
pub const TICK_BATCH_SIZE: usize = 10;

/// Durable retry queue and DLQ writer
///
/// Kept separate from [`RecoveryPipeline`] so forward-path components
/// (escrow service, event ingestor) can enqueue failures without depending
/// on the handler registry.
#[derive(Clone)]
pub struct RecoveryQueue {
    store: DynStore,
    sagas: Arc<SagaManager>,
    max_retries: u32,
    backoff_cap_minutes: u64,
}

impl std::fmt::Debug for RecoveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryQueue")
            .field("max_retries", &self.max_retries)
            .field("backoff_cap_minutes", &self.backoff_cap_minutes)
            .finish_non_exhaustive()
    }
}

impl RecoveryQueue {
    /// Create a queue writer
    pub fn new(
        store: DynStore,
        sagas: Arc<SagaManager>,
        max_retries: u32,
        backoff_cap_minutes: u64,
    ) -> Self {
        RecoveryQueue {
            store,
            sagas,
            max_retries,
            backoff_cap_minutes,
        }
    }

    /// Attempts before promotion
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Upsert the retry entry for a saga
    ///
    /// Repeated failures replace the row, so there is never more than one
    /// entry per correlation id.
    #[instrument(skip_all, fields(%correlation_id, retry_count))]
    pub async fn enqueue(
        &self,
        correlation_id: &Uuid,
        operation_type: OperationType,
        operation_data: Value,
        retry_count: u32,
        last_error: &str,
    ) -> Result<RecoveryEntry, Error> {
        let entry = RecoveryEntry::new(
            *correlation_id,
            operation_type,
            operation_data,
            retry_count,
            self.max_retries,
            self.backoff_cap_minutes,
            last_error,
            unix_time(),
        );

        let mut tx = self.store.begin_transaction().await?;
        tx.upsert_recovery_entry(&entry).await?;
        tx.commit().await?;

        tracing::info!(
            "saga {} queued for retry {} of {} in {}s: {}",
            correlation_id,
            entry.retry_count,
            entry.max_retries,
            entry.next_retry_at.saturating_sub(entry.updated_at),
            last_error
        );
        Ok(entry)
    }

    /// Atomically promote a saga to the dead-letter queue
    ///
    /// Inserts the DLQ row, advances the saga to `dlq`, deletes any retry
    /// entry, and creates a pending [`CompensationAction`] when the failure
    /// left visible external side effects.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(%correlation_id, requires_compensation))]
    pub async fn promote_to_dlq(
        &self,
        correlation_id: &Uuid,
        operation_type: OperationType,
        operation_data: Value,
        failure_reason: &str,
        retry_count: u32,
        requires_compensation: bool,
    ) -> Result<DlqEntry, Error> {
        let now = unix_time();
        let mut tx = self.store.begin_transaction().await?;

        let mut saga = match tx.get_saga(correlation_id).await? {
            Some(saga) => saga,
            None => {
                tx.rollback().await?;
                return Err(Error::UnknownSaga);
            }
        };

        // `processing → failed → dlq`; the first hop is skipped when the
        // saga already failed.
        if saga.current_state == SagaState::Processing {
            saga.current_state = SagaState::Failed;
        }
        if !saga.current_state.can_transition_to(SagaState::Dlq) {
            tx.rollback().await?;
            return Err(Error::IllegalSagaTransition {
                from: saga.current_state,
                to: SagaState::Dlq,
            });
        }
        saga.current_state = SagaState::Dlq;
        saga.updated_at = now;
        saga.completed_at = Some(now);
        tx.update_saga(&saga).await?;

        let entry = DlqEntry {
            correlation_id: *correlation_id,
            operation_type,
            operation_data: operation_data.clone(),
            failure_reason: failure_reason.to_string(),
            retry_count,
            requires_compensation,
            compensation_status: if requires_compensation {
                CompensationStatus::Pending
            } else {
                CompensationStatus::Completed
            },
            created_at: now,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
        };
        tx.add_dlq_entry(&entry).await?;

        if requires_compensation {
            if let Some(action_type) = compensation::action_type_for(operation_type) {
                tx.add_compensation_action(&CompensationAction {
                    correlation_id: *correlation_id,
                    action_type,
                    action_data: operation_data,
                    status: CompensationStatus::Pending,
                    result: None,
                    executed_at: None,
                    created_at: now,
                })
                .await?;
            }
        }

        tx.delete_recovery_entry(correlation_id).await?;
        tx.commit().await?;

        tracing::warn!(
            "saga {} promoted to DLQ after {} attempts: {}",
            correlation_id,
            retry_count,
            failure_reason
        );
        Ok(entry)
    }
}

/// Outcome counts of one recovery tick
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Entries claimed this tick
    pub claimed: usize,
    /// Retries that completed their saga
    pub completed: usize,
    /// Retries re-queued with increased backoff
    pub requeued: usize,
    /// Entries promoted to the DLQ
    pub promoted: usize,
    /// Entries marked permanently failed without DLQ promotion
    pub failed: usize,
}

/// Recovery tick worker
#[derive(Clone)]
pub struct RecoveryPipeline {
    store: DynStore,
    sagas: Arc<SagaManager>,
    queue: Arc<RecoveryQueue>,
    registry: Arc<HandlerRegistry>,
}

impl std::fmt::Debug for RecoveryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryPipeline").finish_non_exhaustive()
    }
}

impl RecoveryPipeline {
    /// Create a pipeline over the shared queue and registry
    pub fn new(
        store: DynStore,
        sagas: Arc<SagaManager>,
        queue: Arc<RecoveryQueue>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        RecoveryPipeline {
            store,
            sagas,
            queue,
            registry,
        }
    }

    /// Claim due entries and re-execute them
    ///
    /// Claims mark entries `processing` inside one transaction, so
    /// concurrent ticks never pick up the same entry.
    #[instrument(skip_all)]
    pub async fn tick(&self) -> Result<TickReport, Error> {
        let now = unix_time();

        let mut tx = self.store.begin_transaction().await?;
        let entries = tx.claim_due_recovery_entries(now, TICK_BATCH_SIZE).await?;
        for entry in &entries {
            if let Some(mut saga) = tx.get_saga(&entry.correlation_id).await? {
                if saga.current_state.can_transition_to(SagaState::Processing) {
                    saga.current_state = SagaState::Processing;
                    saga.updated_at = now;
                    tx.update_saga(&saga).await?;
                }
            }
        }
        tx.commit().await?;

        let mut report = TickReport {
            claimed: entries.len(),
            ..TickReport::default()
        };

        for entry in entries {
            let correlation_id = entry.correlation_id;
            if let Err(err) = self.process_entry(entry, &mut report).await {
                // Bookkeeping failures stay in the log; the entry will be
                // picked up again once its row leaves `processing`.
                tracing::error!("recovery of saga {} errored: {}", correlation_id, err);
            }
        }

        if report.claimed > 0 {
            tracing::info!(
                "recovery tick: {} claimed, {} completed, {} requeued, {} promoted, {} failed",
                report.claimed,
                report.completed,
                report.requeued,
                report.promoted,
                report.failed
            );
        }
        Ok(report)
    }

    async fn process_entry(
        &self,
        entry: RecoveryEntry,
        report: &mut TickReport,
    ) -> Result<(), Error> {
        let correlation_id = entry.correlation_id;
        let Some(handler) = self.registry.get(entry.operation_type) else {
            tracing::error!(
                "no handler registered for operation type `{}` (saga {})",
                entry.operation_type,
                correlation_id
            );
            self.mark_entry_failed(entry, "no handler registered").await?;
            if let Err(err) = self
                .sagas
                .advance(&correlation_id, SagaState::Failed, SagaUpdate::default())
                .await
            {
                tracing::debug!("saga {} not failed after claim: {}", correlation_id, err);
            }
            report.failed += 1;
            return Ok(());
        };

        let saga = self.sagas.read(&entry.correlation_id).await?;

        match handler.execute(&saga, &entry.operation_data).await {
            Ok(()) => {
                let mut tx = self.store.begin_transaction().await?;
                tx.delete_recovery_entry(&entry.correlation_id).await?;
                tx.commit().await?;
                self.sagas
                    .advance(&entry.correlation_id, SagaState::Completed, SagaUpdate::default())
                    .await?;
                report.completed += 1;
                Ok(())
            }
            Err(err) => {
                // Steps may have committed before the failure; consult the
                // fresh log for the compensation decision.
                let fresh = self.sagas.read(&entry.correlation_id).await?;
                let requires_compensation =
                    handler.requires_compensation(&fresh.steps_completed);
                let next_count = entry.retry_count + 1;

                self.sagas
                    .advance(&entry.correlation_id, SagaState::Failed, SagaUpdate::default())
                    .await?;

                if !err.is_retryable() {
                    if requires_compensation {
                        self.queue
                            .promote_to_dlq(
                                &entry.correlation_id,
                                entry.operation_type,
                                entry.operation_data,
                                &err.to_string(),
                                entry.retry_count,
                                true,
                            )
                            .await?;
                        report.promoted += 1;
                    } else {
                        self.mark_entry_failed(entry, &err.to_string()).await?;
                        report.failed += 1;
                    }
                } else if next_count >= self.queue.max_retries() {
                    self.queue
                        .promote_to_dlq(
                            &entry.correlation_id,
                            entry.operation_type,
                            entry.operation_data,
                            &err.to_string(),
                            next_count,
                            requires_compensation,
                        )
                        .await?;
                    report.promoted += 1;
                } else {
                    self.queue
                        .enqueue(
                            &entry.correlation_id,
                            entry.operation_type,
                            entry.operation_data,
                            next_count,
                            &err.to_string(),
                        )
                        .await?;
                    report.requeued += 1;
                }
                Ok(())
            }
        }
    }

    async fn mark_entry_failed(
        &self,
        mut entry: RecoveryEntry,
        reason: &str,
    ) -> Result<(), Error> {
        entry.status = RecoveryStatus::Failed;
        entry.last_error = reason.to_string();
        entry.updated_at = unix_time();

        let mut tx = self.store.begin_transaction().await?;
        tx.upsert_recovery_entry(&entry).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Page through DLQ entries, newest first
    pub async fn list_dlq(&self, limit: usize, offset: usize) -> Result<Vec<DlqEntry>, Error> {
        Ok(self.store.list_dlq_entries(limit, offset).await?)
    }

    /// Operator sign-off on a DLQ entry without running compensation
    #[instrument(skip_all, fields(%correlation_id))]
    pub async fn resolve_dlq(
        &self,
        correlation_id: &Uuid,
        operator: &Principal,
        notes: &str,
    ) -> Result<DlqEntry, Error> {
        if !operator.admin {
            return Err(Error::AdminRequired);
        }

        let mut tx = self.store.begin_transaction().await?;
        let mut entry = match tx.get_dlq_entry(correlation_id).await? {
            Some(entry) => entry,
            None => {
                tx.rollback().await?;
                return Err(Error::UnknownDlqEntry);
            }
        };
        entry.resolved_at = Some(unix_time());
        entry.resolved_by = Some(operator.address.to_string());
        entry.resolution_notes = Some(notes.to_string());
        tx.update_dlq_entry(&entry).await?;
        tx.commit().await?;
        Ok(entry)
    }
}
