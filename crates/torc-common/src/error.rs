//! Errors

use thiserror::Error;

use crate::escrow::EscrowStatus;
use crate::saga::SagaState;
use crate::{amount, database, invoice, ledger};

/// TORC Error
#[derive(Debug, Error)]
pub enum Error {
    /// Escrow amount below the fee-derived minimum
    #[error("Amount below minimum escrow amount")]
    AmountBelowMinimum,
    /// Fee would round down to zero
    #[error("Fee amount must be greater than zero")]
    ZeroFee,
    /// Fee rate of zero is not configurable
    #[error("Fee basis points must be greater than zero")]
    ZeroFeeBasisPoints,
    /// Discount would reduce the payable below the locked-in fee
    #[error("Discount would reduce the payable below the escrow fee")]
    DiscountExceedsFee,
    /// Escrow already exists for the invoice
    #[error("Escrow already exists for invoice")]
    EscrowExists,
    /// No escrow for the invoice
    #[error("Unknown escrow")]
    UnknownEscrow,
    /// No saga for the correlation id
    #[error("Unknown saga")]
    UnknownSaga,
    /// No recovery entry for the correlation id
    #[error("Unknown recovery entry")]
    UnknownRecoveryEntry,
    /// No DLQ entry for the correlation id
    #[error("Unknown DLQ entry")]
    UnknownDlqEntry,
    /// No compensation action for the correlation id
    #[error("Unknown compensation action")]
    UnknownCompensationEntry,
    /// No reconciliation run with that id
    #[error("Unknown reconciliation run")]
    UnknownRun,
    /// Caller is not the recorded buyer
    #[error("Only the recorded buyer may do this")]
    NotBuyer,
    /// Caller is neither buyer nor seller
    #[error("Caller is not a party to the escrow")]
    NotParty,
    /// Admin role required
    #[error("Admin role required")]
    AdminRequired,
    /// Caller is not a registered arbitrator
    #[error("Not a registered arbitrator")]
    NotArbitrator,
    /// Arbitrator already voted on this dispute
    #[error("Arbitrator has already voted")]
    AlreadyVoted,
    /// No arbitrators registered
    #[error("No arbitrators registered")]
    NoArbitrators,
    /// Dispute already raised
    #[error("Already disputed")]
    AlreadyDisputed,
    /// Dispute already resolved
    #[error("Dispute already resolved")]
    DisputeResolved,
    /// No open dispute for the invoice
    #[error("No open dispute")]
    NoOpenDispute,
    /// Quorum is still reachable, safe escape refused
    #[error("Quorum still reachable")]
    QuorumReachable,
    /// Operation requires a funded escrow
    #[error("Escrow not funded")]
    NotFunded,
    /// Deposit window has closed
    #[error("Escrow expired")]
    EscrowExpired,
    /// Reclaim attempted before expiry
    #[error("Escrow not expired")]
    NotExpired,
    /// Illegal saga state transition
    #[error("Illegal saga transition {from} -> {to}")]
    IllegalSagaTransition {
        /// Current state
        from: SagaState,
        /// Requested state
        to: SagaState,
    },
    /// Completion requested with steps outstanding
    #[error("Saga cannot complete with steps remaining")]
    StepsRemaining,
    /// Illegal escrow status transition
    #[error("Illegal escrow transition {from} -> {to}")]
    IllegalEscrowTransition {
        /// Current status
        from: EscrowStatus,
        /// Requested status
        to: EscrowStatus,
    },
    /// No handler registered for the operation type
    #[error("No handler registered for operation type `{0}`")]
    NoHandler(String),
    /// Unknown operation type label
    #[error("Unknown operation type: `{0}`")]
    UnknownOperationType(String),
    /// Unknown saga step label
    #[error("Unknown saga step: `{0}`")]
    UnknownSagaStep(String),
    /// Unknown compensation action label
    #[error("Unknown compensation action: `{0}`")]
    UnknownCompensationAction(String),
    /// Unknown status label
    #[error("Unknown status label: `{0}`")]
    InvalidStatusLabel(String),
    /// Ledger status code outside `0..=4`
    #[error("Unknown ledger status code: {0}")]
    UnknownLedgerStatusCode(u8),
    /// Compensation action not in a runnable state
    #[error("Compensation is not pending")]
    CompensationNotPending,
    /// Saga terminally failed after visible external side effects
    #[error("Compensation required")]
    CompensationRequired,
    /// Amount Error
    #[error(transparent)]
    Amount(#[from] amount::Error),
    /// Invoice id Error
    #[error(transparent)]
    Invoice(#[from] invoice::Error),
    /// Ledger Error
    #[error(transparent)]
    Ledger(#[from] ledger::Error),
    /// Database Error
    #[error(transparent)]
    Database(#[from] database::Error),
    /// Serde Error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    /// Internal Error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error classification used for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry through the recovery pipeline with backoff
    TransientLedger,
    /// Revert with a known reason; never retried
    PermanentLedger,
    /// Serialization or deadlock; retry the unit of work in place
    StoreContention,
    /// Caller-supplied data rejected synchronously
    Validation,
    /// Illegal state transition; fail fast, never retry
    StateMachineViolation,
    /// Terminal failure after visible external side effects
    CompensationRequired,
    /// Everything else
    Internal,
}

impl Error {
    /// Classify the error for the recovery pipeline
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Ledger(err) if err.is_transient() => ErrorKind::TransientLedger,
            Error::Ledger(_) => ErrorKind::PermanentLedger,
            Error::Database(database::Error::Serialization) => ErrorKind::StoreContention,
            Error::AmountBelowMinimum
            | Error::ZeroFee
            | Error::ZeroFeeBasisPoints
            | Error::DiscountExceedsFee
            | Error::EscrowExists
            | Error::UnknownEscrow
            | Error::UnknownSaga
            | Error::UnknownRecoveryEntry
            | Error::UnknownDlqEntry
            | Error::UnknownCompensationEntry
            | Error::UnknownRun
            | Error::NotBuyer
            | Error::NotParty
            | Error::AdminRequired
            | Error::NotArbitrator
            | Error::AlreadyVoted
            | Error::NoArbitrators
            | Error::NoHandler(_)
            | Error::UnknownOperationType(_)
            | Error::UnknownSagaStep(_)
            | Error::UnknownCompensationAction(_)
            | Error::InvalidStatusLabel(_)
            | Error::UnknownLedgerStatusCode(_)
            | Error::CompensationNotPending
            | Error::Amount(_)
            | Error::Invoice(_) => ErrorKind::Validation,
            Error::AlreadyDisputed
            | Error::DisputeResolved
            | Error::NoOpenDispute
            | Error::QuorumReachable
            | Error::NotFunded
            | Error::EscrowExpired
            | Error::NotExpired
            | Error::IllegalSagaTransition { .. }
            | Error::StepsRemaining
            | Error::IllegalEscrowTransition { .. } => ErrorKind::StateMachineViolation,
            Error::CompensationRequired => ErrorKind::CompensationRequired,
            Error::Database(_) | Error::Serde(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True when the recovery pipeline should retry with backoff
    ///
    /// Internal store faults are retried as well: a database that errored on
    /// one attempt frequently recovers, and the idempotent handlers make the
    /// repeat attempt safe.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientLedger | ErrorKind::StoreContention | ErrorKind::Internal
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(
            Error::Ledger(ledger::Error::Timeout).kind(),
            ErrorKind::TransientLedger
        );
        assert_eq!(
            Error::Ledger(ledger::Error::Reverted("Not funded".into())).kind(),
            ErrorKind::PermanentLedger
        );
        assert_eq!(
            Error::Database(database::Error::Serialization).kind(),
            ErrorKind::StoreContention
        );
        assert_eq!(Error::AmountBelowMinimum.kind(), ErrorKind::Validation);
        assert_eq!(
            Error::IllegalSagaTransition {
                from: SagaState::Completed,
                to: SagaState::Processing,
            }
            .kind(),
            ErrorKind::StateMachineViolation
        );
        assert_eq!(
            Error::CompensationRequired.kind(),
            ErrorKind::CompensationRequired
        );
    }

    #[test]
    fn retry_policy() {
        assert!(Error::Ledger(ledger::Error::Timeout).is_retryable());
        assert!(Error::Database(database::Error::Serialization).is_retryable());
        assert!(!Error::Ledger(ledger::Error::Reverted("Already disputed".into())).is_retryable());
        assert!(!Error::NotFunded.is_retryable());
        assert!(!Error::AmountBelowMinimum.is_retryable());
    }
}
