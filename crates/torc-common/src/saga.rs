//! Saga records
//!
//! A saga is the durable, step-logged record of one multi-step operation
//! spanning the external ledger and the store. The step list is the saga's
//! program counter: each completed step is committed before the next one
//! starts, so a retry can consult `steps_completed` and skip effects that
//! already happened.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;
use crate::error::Error;

/// Operation kinds a saga can track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Escrow release to the seller (or dispute winner)
    EscrowRelease,
    /// Dispute resolution flow
    EscrowDispute,
    /// Ledger event applied to the mirror
    EventProcessing,
    /// Invoice tokenization
    Tokenization,
    /// Invoice financing pipeline
    FinancingPipeline,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationType::EscrowRelease => "escrow_release",
            OperationType::EscrowDispute => "escrow_dispute",
            OperationType::EventProcessing => "event_processing",
            OperationType::Tokenization => "tokenization",
            OperationType::FinancingPipeline => "financing_pipeline",
        };
        write!(f, "{s}")
    }
}

impl FromStr for OperationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "escrow_release" => Ok(OperationType::EscrowRelease),
            "escrow_dispute" => Ok(OperationType::EscrowDispute),
            "event_processing" => Ok(OperationType::EventProcessing),
            "tokenization" => Ok(OperationType::Tokenization),
            "financing_pipeline" => Ok(OperationType::FinancingPipeline),
            _ => Err(Error::UnknownOperationType(s.to_string())),
        }
    }
}

/// Saga lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaState {
    /// Created, not yet picked up
    Pending,
    /// A worker is executing steps
    Processing,
    /// All steps committed
    Completed,
    /// Last attempt failed, awaiting retry
    Failed,
    /// Promoted to the dead-letter queue
    Dlq,
    /// Operator-driven compensation in progress
    Compensating,
    /// Compensation finished
    Compensated,
}

impl SagaState {
    /// Transition table
    ///
    /// `failed → processing` is the retry path; `dlq → compensating` is the
    /// operator compensation path.
    pub fn can_transition_to(self, next: SagaState) -> bool {
        use SagaState::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Compensating)
                | (Failed, Processing)
                | (Failed, Dlq)
                | (Failed, Compensating)
                | (Dlq, Compensating)
                | (Compensating, Compensated)
                | (Compensating, Failed)
        )
    }

    /// Terminal states stamp `completed_at` and never advance again except
    /// through the compensation path
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SagaState::Completed | SagaState::Dlq | SagaState::Compensated
        )
    }
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SagaState::Pending => "pending",
            SagaState::Processing => "processing",
            SagaState::Completed => "completed",
            SagaState::Failed => "failed",
            SagaState::Dlq => "dlq",
            SagaState::Compensating => "compensating",
            SagaState::Compensated => "compensated",
        };
        write!(f, "{s}")
    }
}

/// A durable step within a saga
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStep {
    /// Ledger transaction submitted and accepted
    BlockchainTx,
    /// Store/mirror state transition committed
    DbUpdate,
    /// Audit record written and domain event published
    AuditLog,
    /// External liquidity drawn for financing
    ExternalLiquidity,
}

impl fmt::Display for SagaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SagaStep::BlockchainTx => "BLOCKCHAIN_TX",
            SagaStep::DbUpdate => "DB_UPDATE",
            SagaStep::AuditLog => "AUDIT_LOG",
            SagaStep::ExternalLiquidity => "EXTERNAL_LIQUIDITY",
        };
        write!(f, "{s}")
    }
}

impl FromStr for SagaStep {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BLOCKCHAIN_TX" => Ok(SagaStep::BlockchainTx),
            "DB_UPDATE" => Ok(SagaStep::DbUpdate),
            "AUDIT_LOG" => Ok(SagaStep::AuditLog),
            "EXTERNAL_LIQUIDITY" => Ok(SagaStep::ExternalLiquidity),
            _ => Err(Error::UnknownSagaStep(s.to_string())),
        }
    }
}

/// Durable saga record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Saga {
    /// Correlation id shared by every record the operation touches
    pub correlation_id: Uuid,
    /// Operation kind
    pub operation_type: OperationType,
    /// Kind of entity the saga operates on (e.g. `escrow`)
    pub entity_type: String,
    /// Entity identifier
    pub entity_id: String,
    /// Lifecycle state
    pub current_state: SagaState,
    /// Steps already committed, in execution order
    pub steps_completed: Vec<SagaStep>,
    /// Steps still to run, in execution order
    pub steps_remaining: Vec<SagaStep>,
    /// Opaque operation payload
    pub context_data: serde_json::Value,
    /// Actor that initiated the operation
    pub initiated_by: Address,
    /// Caller-supplied idempotency key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Creation time (unix seconds)
    pub created_at: u64,
    /// Last state change (unix seconds)
    pub updated_at: u64,
    /// Stamped when a terminal state is reached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

impl Saga {
    /// Create a new pending saga
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        operation_type: OperationType,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        steps_remaining: Vec<SagaStep>,
        context_data: serde_json::Value,
        initiated_by: Address,
        idempotency_key: Option<String>,
        now: u64,
    ) -> Self {
        Saga {
            correlation_id: Uuid::new_v4(),
            operation_type,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            current_state: SagaState::Pending,
            steps_completed: Vec::new(),
            steps_remaining,
            context_data,
            initiated_by,
            idempotency_key,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// True when `step` has already been committed
    pub fn has_completed(&self, step: SagaStep) -> bool {
        self.steps_completed.contains(&step)
    }

    /// Move `step` from remaining to completed
    pub fn complete_step(&mut self, step: SagaStep) {
        self.steps_remaining.retain(|s| *s != step);
        if !self.steps_completed.contains(&step) {
            self.steps_completed.push(step);
        }
    }
}
