//! Recovery queue, dead-letter queue and compensation records

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::saga::OperationType;

/// Default number of retry attempts before DLQ promotion
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default cap on the exponential backoff, in minutes
pub const DEFAULT_BACKOFF_CAP_MINUTES: u64 = 60;

/// Retry delay in seconds: `min(2^retry_count, cap) minutes`
pub fn backoff_delay_secs(retry_count: u32, cap_minutes: u64) -> u64 {
    let exp = 1u64 << retry_count.min(32);
    60 * exp.min(cap_minutes)
}

/// Recovery entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    /// Waiting for `next_retry_at`
    Pending,
    /// Claimed by a recovery tick
    Processing,
    /// Retry succeeded (row is normally deleted instead)
    Completed,
    /// Permanently failed, no further retries
    Failed,
}

impl fmt::Display for RecoveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryStatus::Pending => "pending",
            RecoveryStatus::Processing => "processing",
            RecoveryStatus::Completed => "completed",
            RecoveryStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Durable retry-queue entry, one per failed saga
///
/// Upserted on `correlation_id` so repeated failures replace the row rather
/// than queueing duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryEntry {
    /// Saga this entry retries
    pub correlation_id: Uuid,
    /// Operation kind, used to look up the re-execution handler
    pub operation_type: OperationType,
    /// Opaque payload handed back to the handler
    pub operation_data: serde_json::Value,
    /// Attempts so far
    pub retry_count: u32,
    /// Attempts before DLQ promotion
    pub max_retries: u32,
    /// Earliest time the next attempt may run (unix seconds)
    pub next_retry_at: u64,
    /// Most recent failure
    pub last_error: String,
    /// Queue status
    pub status: RecoveryStatus,
    /// Insertion time (unix seconds)
    pub created_at: u64,
    /// Last update (unix seconds)
    pub updated_at: u64,
}

impl RecoveryEntry {
    /// Build an entry with the backoff computed from `retry_count`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        correlation_id: Uuid,
        operation_type: OperationType,
        operation_data: serde_json::Value,
        retry_count: u32,
        max_retries: u32,
        backoff_cap_minutes: u64,
        last_error: impl Into<String>,
        now: u64,
    ) -> Self {
        RecoveryEntry {
            correlation_id,
            operation_type,
            operation_data,
            retry_count,
            max_retries,
            next_retry_at: now + backoff_delay_secs(retry_count, backoff_cap_minutes),
            last_error: last_error.into(),
            status: RecoveryStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// True once the retry budget is exhausted
    pub fn exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Compensation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStatus {
    /// Awaiting an operator
    Pending,
    /// Operator execution started
    InProgress,
    /// Reversal applied
    Completed,
    /// Reversal failed, needs escalation
    Failed,
}

impl fmt::Display for CompensationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompensationStatus::Pending => "pending",
            CompensationStatus::InProgress => "in_progress",
            CompensationStatus::Completed => "completed",
            CompensationStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Dead-letter queue entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    /// Saga that terminally failed
    pub correlation_id: Uuid,
    /// Operation kind
    pub operation_type: OperationType,
    /// Payload as of the final attempt
    pub operation_data: serde_json::Value,
    /// Why the saga ended here
    pub failure_reason: String,
    /// Attempts made before promotion
    pub retry_count: u32,
    /// Visible external side effects need reversal
    pub requires_compensation: bool,
    /// Compensation progress
    pub compensation_status: CompensationStatus,
    /// Promotion time (unix seconds)
    pub created_at: u64,
    /// Operator resolution time (unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<u64>,
    /// Operator that resolved the entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    /// Operator notes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_notes: Option<String>,
}

impl DlqEntry {
    /// True once an operator has signed the entry off
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Compensation action kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationActionType {
    /// Return escrowed funds to the buyer
    EscrowRefund,
    /// Unwind a drawn liquidity position
    FinancingUnwind,
}

impl fmt::Display for CompensationActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompensationActionType::EscrowRefund => "escrow_refund",
            CompensationActionType::FinancingUnwind => "financing_unwind",
        };
        write!(f, "{s}")
    }
}

impl FromStr for CompensationActionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "escrow_refund" => Ok(CompensationActionType::EscrowRefund),
            "financing_unwind" => Ok(CompensationActionType::FinancingUnwind),
            _ => Err(Error::UnknownCompensationAction(s.to_string())),
        }
    }
}

/// Operator-executed reversal of visible external side effects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationAction {
    /// Saga the action compensates
    pub correlation_id: Uuid,
    /// Reversal kind
    pub action_type: CompensationActionType,
    /// Parameters for the reversal
    pub action_data: serde_json::Value,
    /// Lifecycle
    pub status: CompensationStatus,
    /// Execution outcome description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Execution time (unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<u64>,
    /// Creation time (unix seconds)
    pub created_at: u64,
}
