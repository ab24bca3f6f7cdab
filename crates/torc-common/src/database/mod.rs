//! TORC Database
//!
//! The store is the serialization point for every state change the core
//! makes. Implementations provide ACID transactions with row-lock semantics:
//! reads through a transaction behave like `SELECT … FOR UPDATE`, and the
//! recovery queue is claimed with a pending→processing mark inside one
//! transaction.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::audit::AuditRecord;
use crate::escrow::{DisputeVote, Escrow};
use crate::health::{HealthMetric, MetricType};
use crate::invoice::InvoiceId;
use crate::ledger::EventIdentity;
use crate::reconciliation::{DiscrepancyType, ReconciliationLog, ReconciliationSummary};
use crate::recovery::{CompensationAction, DlqEntry, RecoveryEntry};
use crate::saga::{Saga, SagaState};

/// Database Error
#[derive(Debug, Error)]
pub enum Error {
    /// Unique constraint hit
    #[error("Duplicate row")]
    Duplicate,
    /// Row does not exist
    #[error("Row not found")]
    NotFound,
    /// Serialization failure or deadlock; retry the unit of work
    #[error("Serialization conflict")]
    Serialization,
    /// Serde Error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    /// Backend-specific failure
    #[error("Database error: {0}")]
    Internal(String),
}

/// Commits or rolls back a transaction
#[async_trait]
pub trait DbTransactionFinalizer {
    /// Commit all writes made through this transaction
    async fn commit(self: Box<Self>) -> Result<(), Error>;

    /// Discard all writes made through this transaction
    async fn rollback(self: Box<Self>) -> Result<(), Error>;
}

/// Writes and locked reads within one store transaction
#[async_trait]
pub trait StoreTransaction<'a>: DbTransactionFinalizer {
    /// Insert a new saga; `Duplicate` when the correlation id exists
    async fn add_saga(&mut self, saga: &Saga) -> Result<(), Error>;

    /// Read a saga with the row locked for update
    async fn get_saga(&mut self, correlation_id: &Uuid) -> Result<Option<Saga>, Error>;

    /// Replace a saga row
    async fn update_saga(&mut self, saga: &Saga) -> Result<(), Error>;

    /// Insert or replace the recovery entry keyed on `correlation_id`
    async fn upsert_recovery_entry(&mut self, entry: &RecoveryEntry) -> Result<(), Error>;

    /// Read a recovery entry with the row locked
    async fn get_recovery_entry(
        &mut self,
        correlation_id: &Uuid,
    ) -> Result<Option<RecoveryEntry>, Error>;

    /// Delete a recovery entry; missing rows are not an error
    async fn delete_recovery_entry(&mut self, correlation_id: &Uuid) -> Result<(), Error>;

    /// Claim up to `limit` due pending entries, marking each `processing`
    ///
    /// Entries are returned in ascending `next_retry_at` order.
    async fn claim_due_recovery_entries(
        &mut self,
        now: u64,
        limit: usize,
    ) -> Result<Vec<RecoveryEntry>, Error>;

    /// Insert a DLQ entry; `Duplicate` when one exists for the saga
    async fn add_dlq_entry(&mut self, entry: &DlqEntry) -> Result<(), Error>;

    /// Read a DLQ entry with the row locked
    async fn get_dlq_entry(&mut self, correlation_id: &Uuid) -> Result<Option<DlqEntry>, Error>;

    /// Replace a DLQ entry (admin resolution updates)
    async fn update_dlq_entry(&mut self, entry: &DlqEntry) -> Result<(), Error>;

    /// Insert a compensation action
    async fn add_compensation_action(&mut self, action: &CompensationAction) -> Result<(), Error>;

    /// Read a compensation action with the row locked
    async fn get_compensation_action(
        &mut self,
        correlation_id: &Uuid,
    ) -> Result<Option<CompensationAction>, Error>;

    /// Replace a compensation action
    async fn update_compensation_action(
        &mut self,
        action: &CompensationAction,
    ) -> Result<(), Error>;

    /// Insert or replace the mirror row for an escrow
    async fn upsert_escrow(&mut self, escrow: &Escrow) -> Result<(), Error>;

    /// Read a mirror row with the row locked
    async fn get_escrow(&mut self, invoice_id: &InvoiceId) -> Result<Option<Escrow>, Error>;

    /// Insert or replace a dispute vote record
    async fn upsert_dispute_vote(&mut self, vote: &DisputeVote) -> Result<(), Error>;

    /// Read a dispute vote record with the row locked
    async fn get_dispute_vote(
        &mut self,
        invoice_id: &InvoiceId,
    ) -> Result<Option<DisputeVote>, Error>;

    /// Record a processed event identity; `Duplicate` when already seen
    async fn insert_processed_event(&mut self, identity: &EventIdentity) -> Result<(), Error>;

    /// Append an audit record
    async fn add_audit_record(&mut self, record: &AuditRecord) -> Result<(), Error>;

    /// Insert a run summary
    async fn add_reconciliation_summary(
        &mut self,
        summary: &ReconciliationSummary,
    ) -> Result<(), Error>;

    /// Replace a run summary (running-count updates, completion)
    async fn update_reconciliation_summary(
        &mut self,
        summary: &ReconciliationSummary,
    ) -> Result<(), Error>;

    /// Append a per-invoice log row
    async fn add_reconciliation_log(&mut self, log: &ReconciliationLog) -> Result<(), Error>;

    /// Append a metric sample
    async fn add_health_metric(&mut self, metric: &HealthMetric) -> Result<(), Error>;
}

/// Read side of the store plus transaction entry point
#[async_trait]
pub trait Store {
    /// Begin a transaction
    async fn begin_transaction<'a>(
        &'a self,
    ) -> Result<Box<dyn StoreTransaction<'a> + Send + Sync + 'a>, Error>;

    /// Read a saga snapshot
    async fn get_saga(&self, correlation_id: &Uuid) -> Result<Option<Saga>, Error>;

    /// Look a saga up by its caller-supplied idempotency key
    async fn get_saga_by_idempotency_key(&self, key: &str) -> Result<Option<Saga>, Error>;

    /// Count sagas currently in `state`
    async fn count_sagas_by_state(&self, state: SagaState) -> Result<u64, Error>;

    /// Sagas in processing/compensating whose `updated_at` is before the cutoff
    async fn get_stuck_sagas(&self, updated_before: u64) -> Result<Vec<Saga>, Error>;

    /// Most recently completed sagas, newest first
    async fn list_completed_sagas(&self, limit: usize) -> Result<Vec<Saga>, Error>;

    /// Read a recovery entry
    async fn get_recovery_entry(
        &self,
        correlation_id: &Uuid,
    ) -> Result<Option<RecoveryEntry>, Error>;

    /// Number of entries waiting for retry
    async fn pending_recovery_count(&self) -> Result<u64, Error>;

    /// Read a DLQ entry
    async fn get_dlq_entry(&self, correlation_id: &Uuid) -> Result<Option<DlqEntry>, Error>;

    /// Page through DLQ entries, newest first
    async fn list_dlq_entries(&self, limit: usize, offset: usize)
        -> Result<Vec<DlqEntry>, Error>;

    /// Dead-letter queue depth
    async fn dlq_size(&self) -> Result<u64, Error>;

    /// Read a compensation action
    async fn get_compensation_action(
        &self,
        correlation_id: &Uuid,
    ) -> Result<Option<CompensationAction>, Error>;

    /// Read a mirror row
    async fn get_escrow(&self, invoice_id: &InvoiceId) -> Result<Option<Escrow>, Error>;

    /// Page through known invoice ids in insertion order
    ///
    /// `open_only` restricts the page to invoices whose mirror status is not
    /// terminal (partial reconciliation runs).
    async fn list_invoice_ids(
        &self,
        offset: usize,
        limit: usize,
        open_only: bool,
    ) -> Result<Vec<InvoiceId>, Error>;

    /// Read a dispute vote record
    async fn get_dispute_vote(&self, invoice_id: &InvoiceId)
        -> Result<Option<DisputeVote>, Error>;

    /// Read a run summary
    async fn get_reconciliation_summary(
        &self,
        run_id: &Uuid,
    ) -> Result<Option<ReconciliationSummary>, Error>;

    /// The most recently started run summary
    async fn latest_reconciliation_summary(
        &self,
    ) -> Result<Option<ReconciliationSummary>, Error>;

    /// Page through run summaries, newest first
    async fn list_reconciliation_summaries(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ReconciliationSummary>, Error>;

    /// Page through log rows with a non-`none` classification, newest first
    async fn list_discrepancies(
        &self,
        filter: Option<DiscrepancyType>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ReconciliationLog>, Error>;

    /// All log rows for one run, in diff order
    async fn list_run_logs(&self, run_id: &Uuid) -> Result<Vec<ReconciliationLog>, Error>;

    /// Recent samples of one metric, newest first
    async fn list_health_metrics(
        &self,
        metric_type: MetricType,
        limit: usize,
    ) -> Result<Vec<HealthMetric>, Error>;

    /// Audit trail for one saga, oldest first
    async fn list_audit_records(&self, correlation_id: &Uuid)
        -> Result<Vec<AuditRecord>, Error>;
}

/// Type alias for an object-safe store
pub type DynStore = std::sync::Arc<dyn Store + Send + Sync>;
