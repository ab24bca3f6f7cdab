//! TORC in-memory store
//!
//! Store backend for tests and local development. A transaction clones the
//! whole state under a single writer gate and swaps it back on commit, which
//! gives the same observable semantics as a serializable SQL transaction:
//! writers are serialized, rollback discards everything, and reads through a
//! transaction see their own writes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use torc_common::audit::AuditRecord;
use torc_common::database::{DbTransactionFinalizer, Error, Store, StoreTransaction};
use torc_common::escrow::{DisputeVote, Escrow};
use torc_common::health::{HealthMetric, MetricType};
use torc_common::invoice::InvoiceId;
use torc_common::ledger::EventIdentity;
use torc_common::reconciliation::{DiscrepancyType, ReconciliationLog, ReconciliationSummary};
use torc_common::recovery::{CompensationAction, DlqEntry, RecoveryEntry, RecoveryStatus};
use torc_common::saga::{Saga, SagaState};
use uuid::Uuid;

/// Everything the store holds
#[derive(Debug, Default, Clone)]
struct State {
    sagas: HashMap<Uuid, Saga>,
    recovery: HashMap<Uuid, RecoveryEntry>,
    dlq: HashMap<Uuid, DlqEntry>,
    compensations: HashMap<Uuid, CompensationAction>,
    escrows: HashMap<InvoiceId, Escrow>,
    invoice_order: Vec<InvoiceId>,
    disputes: HashMap<InvoiceId, DisputeVote>,
    processed_events: HashSet<EventIdentity>,
    audit: Vec<AuditRecord>,
    summaries: HashMap<Uuid, ReconciliationSummary>,
    run_order: Vec<Uuid>,
    logs: Vec<ReconciliationLog>,
    metrics: Vec<HealthMetric>,
}

#[derive(Debug, Default)]
struct Inner {
    state: RwLock<State>,
    // Serializes writers; readers go straight to `state`.
    write_gate: Mutex<()>,
    // Scripted failures for tests: method name -> remaining failure count.
    failpoints: Mutex<HashMap<String, u32>>,
}

/// In-memory store
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Script the next `times` calls of `method` to fail
    ///
    /// Recognized methods are the transaction write operations, e.g.
    /// `upsert_escrow`. Used by tests to simulate store outages.
    pub async fn fail_next(&self, method: &str, times: u32) {
        self.inner
            .failpoints
            .lock()
            .await
            .insert(method.to_string(), times);
    }

    async fn hit_failpoint(&self, method: &str) -> Result<(), Error> {
        let mut failpoints = self.inner.failpoints.lock().await;
        if let Some(remaining) = failpoints.get_mut(method) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Internal(format!("injected failure in {method}")));
            }
        }
        Ok(())
    }
}

/// Transaction over a cloned working state
pub struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    working: State,
    _gate: MutexGuard<'a, ()>,
}

impl std::fmt::Debug for MemoryTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransaction").finish_non_exhaustive()
    }
}

#[async_trait]
impl DbTransactionFinalizer for MemoryTransaction<'_> {
    async fn commit(self: Box<Self>) -> Result<(), Error> {
        *self.store.inner.state.write().await = self.working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), Error> {
        Ok(())
    }
}

#[async_trait]
impl<'a> StoreTransaction<'a> for MemoryTransaction<'a> {
    async fn add_saga(&mut self, saga: &Saga) -> Result<(), Error> {
        self.store.hit_failpoint("add_saga").await?;
        if self.working.sagas.contains_key(&saga.correlation_id) {
            return Err(Error::Duplicate);
        }
        self.working.sagas.insert(saga.correlation_id, saga.clone());
        Ok(())
    }

    async fn get_saga(&mut self, correlation_id: &Uuid) -> Result<Option<Saga>, Error> {
        Ok(self.working.sagas.get(correlation_id).cloned())
    }

    async fn update_saga(&mut self, saga: &Saga) -> Result<(), Error> {
        self.store.hit_failpoint("update_saga").await?;
        if !self.working.sagas.contains_key(&saga.correlation_id) {
            return Err(Error::NotFound);
        }
        self.working.sagas.insert(saga.correlation_id, saga.clone());
        Ok(())
    }

    async fn upsert_recovery_entry(&mut self, entry: &RecoveryEntry) -> Result<(), Error> {
        self.store.hit_failpoint("upsert_recovery_entry").await?;
        self.working
            .recovery
            .insert(entry.correlation_id, entry.clone());
        Ok(())
    }

    async fn get_recovery_entry(
        &mut self,
        correlation_id: &Uuid,
    ) -> Result<Option<RecoveryEntry>, Error> {
        Ok(self.working.recovery.get(correlation_id).cloned())
    }

    async fn delete_recovery_entry(&mut self, correlation_id: &Uuid) -> Result<(), Error> {
        self.working.recovery.remove(correlation_id);
        Ok(())
    }

    async fn claim_due_recovery_entries(
        &mut self,
        now: u64,
        limit: usize,
    ) -> Result<Vec<RecoveryEntry>, Error> {
        let mut due: Vec<RecoveryEntry> = self
            .working
            .recovery
            .values()
            .filter(|e| e.status == RecoveryStatus::Pending && e.next_retry_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|e| e.next_retry_at);
        due.truncate(limit);

        for entry in due.iter_mut() {
            entry.status = RecoveryStatus::Processing;
            entry.updated_at = now;
            self.working
                .recovery
                .insert(entry.correlation_id, entry.clone());
        }
        Ok(due)
    }

    async fn add_dlq_entry(&mut self, entry: &DlqEntry) -> Result<(), Error> {
        self.store.hit_failpoint("add_dlq_entry").await?;
        if self.working.dlq.contains_key(&entry.correlation_id) {
            return Err(Error::Duplicate);
        }
        self.working.dlq.insert(entry.correlation_id, entry.clone());
        Ok(())
    }

    async fn get_dlq_entry(&mut self, correlation_id: &Uuid) -> Result<Option<DlqEntry>, Error> {
        Ok(self.working.dlq.get(correlation_id).cloned())
    }

    async fn update_dlq_entry(&mut self, entry: &DlqEntry) -> Result<(), Error> {
        if !self.working.dlq.contains_key(&entry.correlation_id) {
            return Err(Error::NotFound);
        }
        self.working.dlq.insert(entry.correlation_id, entry.clone());
        Ok(())
    }

    async fn add_compensation_action(&mut self, action: &CompensationAction) -> Result<(), Error> {
        if self.working.compensations.contains_key(&action.correlation_id) {
            return Err(Error::Duplicate);
        }
        self.working
            .compensations
            .insert(action.correlation_id, action.clone());
        Ok(())
    }

    async fn get_compensation_action(
        &mut self,
        correlation_id: &Uuid,
    ) -> Result<Option<CompensationAction>, Error> {
        Ok(self.working.compensations.get(correlation_id).cloned())
    }

    async fn update_compensation_action(
        &mut self,
        action: &CompensationAction,
    ) -> Result<(), Error> {
        if !self.working.compensations.contains_key(&action.correlation_id) {
            return Err(Error::NotFound);
        }
        self.working
            .compensations
            .insert(action.correlation_id, action.clone());
        Ok(())
    }

    async fn upsert_escrow(&mut self, escrow: &Escrow) -> Result<(), Error> {
        self.store.hit_failpoint("upsert_escrow").await?;
        if !self.working.escrows.contains_key(&escrow.invoice_id) {
            self.working.invoice_order.push(escrow.invoice_id);
        }
        self.working
            .escrows
            .insert(escrow.invoice_id, escrow.clone());
        Ok(())
    }

    async fn get_escrow(&mut self, invoice_id: &InvoiceId) -> Result<Option<Escrow>, Error> {
        Ok(self.working.escrows.get(invoice_id).cloned())
    }

    async fn upsert_dispute_vote(&mut self, vote: &DisputeVote) -> Result<(), Error> {
        self.working.disputes.insert(vote.invoice_id, vote.clone());
        Ok(())
    }

    async fn get_dispute_vote(
        &mut self,
        invoice_id: &InvoiceId,
    ) -> Result<Option<DisputeVote>, Error> {
        Ok(self.working.disputes.get(invoice_id).cloned())
    }

    async fn insert_processed_event(&mut self, identity: &EventIdentity) -> Result<(), Error> {
        if !self.working.processed_events.insert(identity.clone()) {
            return Err(Error::Duplicate);
        }
        Ok(())
    }

    async fn add_audit_record(&mut self, record: &AuditRecord) -> Result<(), Error> {
        self.working.audit.push(record.clone());
        Ok(())
    }

    async fn add_reconciliation_summary(
        &mut self,
        summary: &ReconciliationSummary,
    ) -> Result<(), Error> {
        if self.working.summaries.contains_key(&summary.run_id) {
            return Err(Error::Duplicate);
        }
        self.working.run_order.push(summary.run_id);
        self.working.summaries.insert(summary.run_id, summary.clone());
        Ok(())
    }

    async fn update_reconciliation_summary(
        &mut self,
        summary: &ReconciliationSummary,
    ) -> Result<(), Error> {
        if !self.working.summaries.contains_key(&summary.run_id) {
            return Err(Error::NotFound);
        }
        self.working.summaries.insert(summary.run_id, summary.clone());
        Ok(())
    }

    async fn add_reconciliation_log(&mut self, log: &ReconciliationLog) -> Result<(), Error> {
        self.store.hit_failpoint("add_reconciliation_log").await?;
        self.working.logs.push(log.clone());
        Ok(())
    }

    async fn add_health_metric(&mut self, metric: &HealthMetric) -> Result<(), Error> {
        self.working.metrics.push(metric.clone());
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin_transaction<'a>(
        &'a self,
    ) -> Result<Box<dyn StoreTransaction<'a> + Send + Sync + 'a>, Error> {
        let gate = self.inner.write_gate.lock().await;
        let working = self.inner.state.read().await.clone();
        Ok(Box::new(MemoryTransaction {
            store: self,
            working,
            _gate: gate,
        }))
    }

    async fn get_saga(&self, correlation_id: &Uuid) -> Result<Option<Saga>, Error> {
        Ok(self
            .inner
            .state
            .read()
            .await
            .sagas
            .get(correlation_id)
            .cloned())
    }

    async fn get_saga_by_idempotency_key(&self, key: &str) -> Result<Option<Saga>, Error> {
        Ok(self
            .inner
            .state
            .read()
            .await
            .sagas
            .values()
            .find(|s| s.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn count_sagas_by_state(&self, state: SagaState) -> Result<u64, Error> {
        Ok(self
            .inner
            .state
            .read()
            .await
            .sagas
            .values()
            .filter(|s| s.current_state == state)
            .count() as u64)
    }

    async fn get_stuck_sagas(&self, updated_before: u64) -> Result<Vec<Saga>, Error> {
        Ok(self
            .inner
            .state
            .read()
            .await
            .sagas
            .values()
            .filter(|s| {
                matches!(
                    s.current_state,
                    SagaState::Processing | SagaState::Compensating
                ) && s.updated_at < updated_before
            })
            .cloned()
            .collect())
    }

    async fn list_completed_sagas(&self, limit: usize) -> Result<Vec<Saga>, Error> {
        let mut completed: Vec<Saga> = self
            .inner
            .state
            .read()
            .await
            .sagas
            .values()
            .filter(|s| s.current_state == SagaState::Completed)
            .cloned()
            .collect();
        completed.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        completed.truncate(limit);
        Ok(completed)
    }

    async fn get_recovery_entry(
        &self,
        correlation_id: &Uuid,
    ) -> Result<Option<RecoveryEntry>, Error> {
        Ok(self
            .inner
            .state
            .read()
            .await
            .recovery
            .get(correlation_id)
            .cloned())
    }

    async fn pending_recovery_count(&self) -> Result<u64, Error> {
        Ok(self
            .inner
            .state
            .read()
            .await
            .recovery
            .values()
            .filter(|e| e.status == RecoveryStatus::Pending)
            .count() as u64)
    }

    async fn get_dlq_entry(&self, correlation_id: &Uuid) -> Result<Option<DlqEntry>, Error> {
        Ok(self
            .inner
            .state
            .read()
            .await
            .dlq
            .get(correlation_id)
            .cloned())
    }

    async fn list_dlq_entries(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DlqEntry>, Error> {
        let mut entries: Vec<DlqEntry> =
            self.inner.state.read().await.dlq.values().cloned().collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries.into_iter().skip(offset).take(limit).collect())
    }

    async fn dlq_size(&self) -> Result<u64, Error> {
        Ok(self.inner.state.read().await.dlq.len() as u64)
    }

    async fn get_compensation_action(
        &self,
        correlation_id: &Uuid,
    ) -> Result<Option<CompensationAction>, Error> {
        Ok(self
            .inner
            .state
            .read()
            .await
            .compensations
            .get(correlation_id)
            .cloned())
    }

    async fn get_escrow(&self, invoice_id: &InvoiceId) -> Result<Option<Escrow>, Error> {
        Ok(self
            .inner
            .state
            .read()
            .await
            .escrows
            .get(invoice_id)
            .cloned())
    }

    async fn list_invoice_ids(
        &self,
        offset: usize,
        limit: usize,
        open_only: bool,
    ) -> Result<Vec<InvoiceId>, Error> {
        let state = self.inner.state.read().await;
        Ok(state
            .invoice_order
            .iter()
            .filter(|id| {
                if !open_only {
                    return true;
                }
                state
                    .escrows
                    .get(id)
                    .map(|e| !e.status.is_terminal())
                    .unwrap_or(true)
            })
            .skip(offset)
            .take(limit)
            .copied()
            .collect())
    }

    async fn get_dispute_vote(
        &self,
        invoice_id: &InvoiceId,
    ) -> Result<Option<DisputeVote>, Error> {
        Ok(self
            .inner
            .state
            .read()
            .await
            .disputes
            .get(invoice_id)
            .cloned())
    }

    async fn get_reconciliation_summary(
        &self,
        run_id: &Uuid,
    ) -> Result<Option<ReconciliationSummary>, Error> {
        Ok(self
            .inner
            .state
            .read()
            .await
            .summaries
            .get(run_id)
            .cloned())
    }

    async fn latest_reconciliation_summary(
        &self,
    ) -> Result<Option<ReconciliationSummary>, Error> {
        let state = self.inner.state.read().await;
        Ok(state
            .run_order
            .last()
            .and_then(|id| state.summaries.get(id))
            .cloned())
    }

    async fn list_reconciliation_summaries(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ReconciliationSummary>, Error> {
        let state = self.inner.state.read().await;
        Ok(state
            .run_order
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .filter_map(|id| state.summaries.get(id))
            .cloned()
            .collect())
    }

    async fn list_discrepancies(
        &self,
        filter: Option<DiscrepancyType>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ReconciliationLog>, Error> {
        Ok(self
            .inner
            .state
            .read()
            .await
            .logs
            .iter()
            .rev()
            .filter(|log| match filter {
                Some(kind) => log.discrepancy_type == kind,
                None => log.discrepancy_type != DiscrepancyType::None,
            })
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_run_logs(&self, run_id: &Uuid) -> Result<Vec<ReconciliationLog>, Error> {
        Ok(self
            .inner
            .state
            .read()
            .await
            .logs
            .iter()
            .filter(|log| &log.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn list_health_metrics(
        &self,
        metric_type: MetricType,
        limit: usize,
    ) -> Result<Vec<HealthMetric>, Error> {
        Ok(self
            .inner
            .state
            .read()
            .await
            .metrics
            .iter()
            .rev()
            .filter(|m| m.metric_type == metric_type)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_audit_records(
        &self,
        correlation_id: &Uuid,
    ) -> Result<Vec<AuditRecord>, Error> {
        Ok(self
            .inner
            .state
            .read()
            .await
            .audit
            .iter()
            .filter(|r| &r.correlation_id == correlation_id)
            .cloned()
            .collect())
    }
}
