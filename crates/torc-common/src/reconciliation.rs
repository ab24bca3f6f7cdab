//! Reconciliation records
//!
//! One [`ReconciliationLog`] row per (invoice, run), one
//! [`ReconciliationSummary`] per run. Both are append-only; the engine only
//! updates the summary's running counts while a run is in flight.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;
use crate::amount::{Amount, SignedAmount};
use crate::escrow::CanonicalStatus;
use crate::invoice::InvoiceId;

/// What triggered a reconciliation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    /// Every known invoice
    Full,
    /// Only invoices with a non-terminal mirror status
    Partial,
    /// Operator-triggered
    Manual,
    /// Periodic trigger
    Scheduled,
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunType::Full => "full",
            RunType::Partial => "partial",
            RunType::Manual => "manual",
            RunType::Scheduled => "scheduled",
        };
        write!(f, "{s}")
    }
}

/// Run lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Batch loop in progress
    Running,
    /// All batches processed
    Completed,
    /// Engine-level fault aborted the run
    Failed,
}

/// Classification of a single invoice diff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyType {
    /// Ledger and mirror agree
    None,
    /// Amounts differ
    AmountMismatch,
    /// Canonical statuses (or counterparties) differ
    StatusMismatch,
    /// Mirror row exists, ledger record absent
    MissingChain,
    /// Ledger record exists, mirror row absent
    MissingDb,
    /// The diff itself failed for this invoice
    Error,
}

impl fmt::Display for DiscrepancyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiscrepancyType::None => "none",
            DiscrepancyType::AmountMismatch => "amount_mismatch",
            DiscrepancyType::StatusMismatch => "status_mismatch",
            DiscrepancyType::MissingChain => "missing_chain",
            DiscrepancyType::MissingDb => "missing_db",
            DiscrepancyType::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Per-invoice diff result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationLog {
    /// Run this row belongs to
    pub run_id: Uuid,
    /// Invoice diffed
    pub invoice_id: InvoiceId,
    /// Canonical ledger-side status
    pub chain_status: CanonicalStatus,
    /// Canonical mirror-side status
    pub db_status: CanonicalStatus,
    /// Ledger-side amount, when a record exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_amount: Option<Amount>,
    /// Mirror-side amount, when a row exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_amount: Option<Amount>,
    /// Signed `chain − db` difference
    pub discrepancy_amount: SignedAmount,
    /// Classification
    pub discrepancy_type: DiscrepancyType,
    /// Ledger-side seller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_seller: Option<Address>,
    /// Ledger-side buyer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_buyer: Option<Address>,
    /// Mirror-side seller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_seller: Option<Address>,
    /// Mirror-side buyer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_buyer: Option<Address>,
    /// Free-form annotations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Row creation time (unix seconds)
    pub created_at: u64,
}

/// Per-run summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationSummary {
    /// Run identifier
    pub run_id: Uuid,
    /// What triggered the run
    pub run_type: RunType,
    /// Invoices examined
    pub total_count: u64,
    /// Invoices with no discrepancy
    pub matched_count: u64,
    /// Invoices with any non-`none` classification
    pub discrepancy_count: u64,
    /// Rows classified `missing_chain`
    pub missing_chain_count: u64,
    /// Rows classified `missing_db`
    pub missing_db_count: u64,
    /// Sum of absolute per-row differences
    pub total_discrepancy_amount: Amount,
    /// Run start (unix seconds)
    pub started_at: u64,
    /// Run end (unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    /// Lifecycle
    pub status: RunStatus,
    /// Engine-level fault, when `status = failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ReconciliationSummary {
    /// Start a new running summary
    pub fn start(run_type: RunType, now: u64) -> Self {
        ReconciliationSummary {
            run_id: Uuid::new_v4(),
            run_type,
            total_count: 0,
            matched_count: 0,
            discrepancy_count: 0,
            missing_chain_count: 0,
            missing_db_count: 0,
            total_discrepancy_amount: Amount::zero(),
            started_at: now,
            completed_at: None,
            status: RunStatus::Running,
            error_message: None,
        }
    }

    /// Fold one log row into the running counts
    ///
    /// The per-row difference is signed; the aggregate sums absolute values
    /// so opposite-signed rows cannot cancel out.
    pub fn record(&mut self, log: &ReconciliationLog) {
        self.total_count += 1;
        match log.discrepancy_type {
            DiscrepancyType::None => self.matched_count += 1,
            DiscrepancyType::MissingChain => {
                self.discrepancy_count += 1;
                self.missing_chain_count += 1;
            }
            DiscrepancyType::MissingDb => {
                self.discrepancy_count += 1;
                self.missing_db_count += 1;
            }
            DiscrepancyType::AmountMismatch
            | DiscrepancyType::StatusMismatch
            | DiscrepancyType::Error => self.discrepancy_count += 1,
        }
        self.total_discrepancy_amount = self
            .total_discrepancy_amount
            .checked_add(&log.discrepancy_amount.abs());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;

    fn log(run_id: Uuid, kind: DiscrepancyType, diff: SignedAmount) -> ReconciliationLog {
        ReconciliationLog {
            run_id,
            invoice_id: InvoiceId::new(),
            chain_status: CanonicalStatus::Funded,
            db_status: CanonicalStatus::Funded,
            chain_amount: None,
            db_amount: None,
            discrepancy_amount: diff,
            discrepancy_type: kind,
            chain_seller: None,
            chain_buyer: None,
            db_seller: None,
            db_buyer: None,
            notes: None,
            created_at: 0,
        }
    }

    #[test]
    fn summary_aggregates_absolute_differences() {
        let mut summary = ReconciliationSummary::start(RunType::Manual, 0);
        let run_id = summary.run_id;

        summary.record(&log(run_id, DiscrepancyType::None, SignedAmount::zero()));
        summary.record(&log(
            run_id,
            DiscrepancyType::AmountMismatch,
            Amount::from(100).signed_diff(&Amount::from(300)),
        ));
        summary.record(&log(
            run_id,
            DiscrepancyType::AmountMismatch,
            Amount::from(300).signed_diff(&Amount::from(100)),
        ));
        summary.record(&log(run_id, DiscrepancyType::MissingChain, SignedAmount::zero()));

        assert_eq!(summary.total_count, 4);
        assert_eq!(summary.matched_count, 1);
        assert_eq!(summary.discrepancy_count, 3);
        assert_eq!(summary.missing_chain_count, 1);
        // Opposite signs must not cancel: |−200| + |200| = 400.
        assert_eq!(summary.total_discrepancy_amount, Amount::from(400));
    }
}
