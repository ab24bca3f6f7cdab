//! Reconciliation engine
//!
//! Compares external-ledger state against the mirror for every
//! escrow-bearing invoice, classifies discrepancies, and persists an
//! auditable per-run summary. Individual-invoice failures produce an
//! `error` log row and the run continues; only engine-level faults mark the
//! summary failed.

use torc_common::config::SchedulerConfig;
use torc_common::database::{DbTransactionFinalizer, DynStore, Store, StoreTransaction};
use torc_common::error::Error;
use torc_common::escrow::CanonicalStatus;
use torc_common::invoice::InvoiceId;
use torc_common::ledger::{DynLedgerClient, LedgerClient};
use torc_common::reconciliation::{
    DiscrepancyType, ReconciliationLog, ReconciliationSummary, RunStatus, RunType,
};
use torc_common::util::unix_time;
use tracing::instrument;
use uuid::Uuid;


/// Reconciliation engine
#[derive(Clone)]
pub struct ReconciliationEngine {
    store: DynStore,
    ledger: DynLedgerClient,
    config: SchedulerConfig,
}

impl std::fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationEngine").finish_non_exhaustive()
    }
}

impl ReconciliationEngine {
    /// Create an engine
    pub fn new(store: DynStore, ledger: DynLedgerClient, config: SchedulerConfig) -> Self {
        ReconciliationEngine {
            store,
            ledger,
            config,
        }
    }

    /// Run a reconciliation pass to completion and return the summary
    ///
    /// `partial` runs only cover invoices with a non-terminal mirror status;
    /// all other run types scan every known invoice. The page size defaults
    /// to the configured batch size and is capped at 200.
    #[instrument(skip_all, fields(%run_type))]
    pub async fn run(
        &self,
        run_type: RunType,
        batch_size: Option<usize>,
    ) -> Result<ReconciliationSummary, Error> {
        let batch_size = self.config.clamped_batch_size(batch_size);
        let mut summary = ReconciliationSummary::start(run_type, unix_time());

        let mut tx = self.store.begin_transaction().await?;
        tx.add_reconciliation_summary(&summary).await?;
        tx.commit().await?;

        tracing::info!(
            "reconciliation run {} started ({}, batch {})",
            summary.run_id,
            run_type,
            batch_size
        );

        match self.run_batches(&mut summary, run_type, batch_size).await {
            Ok(()) => {
                summary.status = RunStatus::Completed;
                summary.completed_at = Some(unix_time());
                let mut tx = self.store.begin_transaction().await?;
                tx.update_reconciliation_summary(&summary).await?;
                tx.commit().await?;

                tracing::info!(
                    "reconciliation run {} completed: {} total, {} matched, {} discrepancies",
                    summary.run_id,
                    summary.total_count,
                    summary.matched_count,
                    summary.discrepancy_count
                );
                Ok(summary)
            }
            Err(err) => {
                summary.status = RunStatus::Failed;
                summary.completed_at = Some(unix_time());
                summary.error_message = Some(err.to_string());
                // Best effort: the engine fault itself may be a store fault.
                if let Ok(mut tx) = self.store.begin_transaction().await {
                    let _ = tx.update_reconciliation_summary(&summary).await;
                    let _ = tx.commit().await;
                }
                tracing::error!("reconciliation run {} failed: {}", summary.run_id, err);
                Err(err)
            }
        }
    }

    async fn run_batches(
        &self,
        summary: &mut ReconciliationSummary,
        run_type: RunType,
        batch_size: usize,
    ) -> Result<(), Error> {
        let open_only = run_type == RunType::Partial;
        let mut offset = 0;

        loop {
            let ids = self
                .store
                .list_invoice_ids(offset, batch_size, open_only)
                .await?;
            if ids.is_empty() {
                return Ok(());
            }
            offset += ids.len();

            for invoice_id in ids {
                let log = self.reconcile_invoice(summary.run_id, &invoice_id).await;
                summary.record(&log);

                let mut tx = self.store.begin_transaction().await?;
                tx.add_reconciliation_log(&log).await?;
                tx.update_reconciliation_summary(summary).await?;
                tx.commit().await?;
            }
        }
    }

    /// Diff one invoice; errors collapse into an `error` log row
    #[instrument(skip_all, fields(%invoice_id))]
    pub async fn reconcile_invoice(
        &self,
        run_id: Uuid,
        invoice_id: &InvoiceId,
    ) -> ReconciliationLog {
        match self.diff_invoice(run_id, invoice_id).await {
            Ok(log) => log,
            Err(err) => {
                tracing::warn!("reconciliation of {} errored: {}", invoice_id, err);
                let mut log = empty_log(run_id, *invoice_id);
                log.discrepancy_type = DiscrepancyType::Error;
                log.notes = Some(format!("Reconciliation error: {err}"));
                log
            }
        }
    }

    async fn diff_invoice(
        &self,
        run_id: Uuid,
        invoice_id: &InvoiceId,
    ) -> Result<ReconciliationLog, Error> {
        let mirror = self.store.get_escrow(invoice_id).await?;
        let key = invoice_id.to_ledger_key();
        let chain = self
            .ledger
            .read_escrow(&key)
            .await?
            .filter(|record| !record.is_absent());

        let mut log = empty_log(run_id, *invoice_id);
        let mut notes: Vec<String> = Vec::new();

        let chain_status = match &chain {
            Some(record) => CanonicalStatus::from_ledger_code(record.status_code)?,
            None => CanonicalStatus::NotFound,
        };
        let db_status = match &mirror {
            Some(escrow) => CanonicalStatus::from(escrow.status),
            None => CanonicalStatus::NotFound,
        };

        log.chain_status = chain_status;
        log.db_status = db_status;
        if let Some(record) = &chain {
            log.chain_amount = Some(record.amount.clone());
            log.chain_seller = Some(record.seller.clone());
            log.chain_buyer = Some(record.buyer.clone());
        }
        if let Some(escrow) = &mirror {
            log.db_amount = Some(escrow.amount.clone());
            log.db_seller = Some(escrow.seller.clone());
            log.db_buyer = Some(escrow.buyer.clone());
        }

        log.discrepancy_type = match (&chain, &mirror) {
            (None, None) => DiscrepancyType::None,
            (None, Some(_)) if db_status == CanonicalStatus::Released => {
                // The ledger deletes released escrows; a released mirror row
                // with no chain record is the expected terminal picture.
                notes.push("Escrow released and pruned from ledger".to_string());
                DiscrepancyType::None
            }
            (None, Some(_)) => {
                notes.push("No ledger record for mirrored escrow".to_string());
                DiscrepancyType::MissingChain
            }
            (Some(_), None) => {
                notes.push("Ledger record with no mirror row".to_string());
                DiscrepancyType::MissingDb
            }
            (Some(record), Some(escrow)) => {
                let mut kind = DiscrepancyType::None;
                if chain_status != db_status {
                    notes.push(format!(
                        "Status mismatch: chain={chain_status} db={db_status}"
                    ));
                    kind = DiscrepancyType::StatusMismatch;
                } else if record.amount != escrow.amount {
                    notes.push(format!(
                        "Amount mismatch: chain={} db={}",
                        record.amount, escrow.amount
                    ));
                    log.discrepancy_amount = record.amount.signed_diff(&escrow.amount);
                    kind = DiscrepancyType::AmountMismatch;
                }
                if record.seller != escrow.seller || record.buyer != escrow.buyer {
                    notes.push("Counterparty mismatch".to_string());
                    if kind == DiscrepancyType::None {
                        kind = DiscrepancyType::StatusMismatch;
                    }
                }
                kind
            }
        };

        if !notes.is_empty() {
            log.notes = Some(notes.join("; "));
        }
        Ok(log)
    }

    /// Latest run summary
    pub async fn status(&self) -> Result<Option<ReconciliationSummary>, Error> {
        Ok(self.store.latest_reconciliation_summary().await?)
    }

    /// Page through discrepancy rows, optionally filtered by type
    pub async fn discrepancies(
        &self,
        filter: Option<DiscrepancyType>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ReconciliationLog>, Error> {
        Ok(self.store.list_discrepancies(filter, limit, offset).await?)
    }

    /// Page through run summaries, newest first
    pub async fn history(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ReconciliationSummary>, Error> {
        Ok(self
            .store
            .list_reconciliation_summaries(limit, offset)
            .await?)
    }
}

fn empty_log(run_id: Uuid, invoice_id: InvoiceId) -> ReconciliationLog {
    ReconciliationLog {
        run_id,
        invoice_id,
        chain_status: CanonicalStatus::NotFound,
        db_status: CanonicalStatus::NotFound,
        chain_amount: None,
        db_amount: None,
        discrepancy_amount: Default::default(),
        discrepancy_type: DiscrepancyType::None,
        chain_seller: None,
        chain_buyer: None,
        db_seller: None,
        db_buyer: None,
        notes: None,
        created_at: unix_time(),
    }
}
