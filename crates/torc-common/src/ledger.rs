//! External ledger capability
//!
//! The core never speaks to the chain directly; it sees one [`LedgerClient`]
//! capability that can submit typed operations, read per-escrow state, and
//! stream events. Contract binding, signing and transport live behind the
//! trait, out of scope.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::address::Address;
use crate::amount::Amount;
use crate::escrow::{MultiSigApproval, RwaCollateral, Token};
use crate::invoice::LedgerKey;

/// Ledger Error
#[derive(Debug, Error)]
pub enum Error {
    /// RPC timed out
    #[error("Ledger rpc timed out")]
    Timeout,
    /// Nonce already used, submission raced another signer
    #[error("Nonce collision")]
    NonceCollision,
    /// Transport-level failure
    #[error("Ledger connection failure: {0}")]
    Connection(String),
    /// Execution reverted with a known reason
    #[error("Execution reverted: {0}")]
    Reverted(String),
    /// Serde Error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// True for failures the recovery pipeline should retry with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::NonceCollision | Error::Connection(_)
        )
    }
}

/// Hash of an accepted ledger transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(pub String);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-escrow state as read from the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEscrow {
    /// Seller address; the zero address marks an absent record
    pub seller: Address,
    /// Buyer address
    pub buyer: Address,
    /// Escrowed amount
    pub amount: Amount,
    /// Settlement token
    pub token: Token,
    /// Status code in `0..=4`
    pub status_code: u8,
    /// Seller confirmed release
    pub seller_confirmed: bool,
    /// Buyer confirmed release
    pub buyer_confirmed: bool,
    /// Dispute raised
    pub dispute_raised: bool,
    /// Creation time (unix seconds)
    pub created_at: u64,
    /// Deadline (unix seconds)
    pub expires_at: u64,
}

impl LedgerEscrow {
    /// Absent records come back with a zero seller address
    pub fn is_absent(&self) -> bool {
        self.seller.is_zero()
    }
}

/// Typed operations the core submits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOperation {
    /// Create an escrow for an invoice
    CreateEscrow,
    /// Buyer deposit
    Deposit,
    /// Party confirmation of release
    ConfirmRelease,
    /// Multi-sig approval of release
    ApproveRelease,
    /// Payout: fee to treasury, remainder to the winner, NFT to its recipient
    Release,
    /// Return expired funds to the buyer
    ReclaimExpired,
    /// Open a dispute
    RaiseDispute,
    /// Draw financing liquidity against an invoice
    Fund,
    /// Refund path used by operator compensation
    Refund,
    /// Unwind a drawn liquidity position
    UnwindFinancing,
}

impl fmt::Display for LedgerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LedgerOperation::CreateEscrow => "create_escrow",
            LedgerOperation::Deposit => "deposit",
            LedgerOperation::ConfirmRelease => "confirm_release",
            LedgerOperation::ApproveRelease => "approve_release",
            LedgerOperation::Release => "release",
            LedgerOperation::ReclaimExpired => "reclaim_expired",
            LedgerOperation::RaiseDispute => "raise_dispute",
            LedgerOperation::Fund => "fund",
            LedgerOperation::Refund => "refund",
            LedgerOperation::UnwindFinancing => "unwind_financing",
        };
        write!(f, "{s}")
    }
}

/// Event emitted by the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Event name (e.g. `EscrowFunded`)
    pub name: String,
    /// Decoded event arguments
    pub args: Value,
    /// Transaction the event was emitted in
    pub tx_hash: TxHash,
    /// Log position within the transaction
    pub log_index: u32,
    /// Block the transaction landed in
    pub block_number: u64,
}

impl LedgerEvent {
    /// Stable identity used for duplicate suppression
    pub fn identity(&self) -> EventIdentity {
        EventIdentity {
            name: self.name.clone(),
            tx_hash: self.tx_hash.clone(),
            log_index: self.log_index,
        }
    }
}

/// `(event_name, tx_hash, log_index)` identity of a processed event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventIdentity {
    /// Event name
    pub name: String,
    /// Transaction hash
    pub tx_hash: TxHash,
    /// Log position
    pub log_index: u32,
}

/// Boxed ledger event stream
pub type EventStream = Pin<Box<dyn Stream<Item = LedgerEvent> + Send>>;

/// External ledger capability
#[async_trait]
pub trait LedgerClient {
    /// Read the escrow stored under `key`, `None` when absent
    async fn read_escrow(&self, key: &LedgerKey) -> Result<Option<LedgerEscrow>, Error>;

    /// Submit a transaction and return its hash once accepted
    async fn submit(&self, operation: LedgerOperation, payload: Value) -> Result<TxHash, Error>;

    /// Stream events in ledger order
    async fn events(&self) -> Result<EventStream, Error>;

    /// Read accumulated multi-sig release approvals for `key`
    async fn read_multisig_approvals(&self, key: &LedgerKey) -> Result<MultiSigApproval, Error>;
}

/// Type alias for an object-safe ledger client
pub type DynLedgerClient = Arc<dyn LedgerClient + Send + Sync>;

/// Typed submission payloads
///
/// `LedgerClient::submit` takes an opaque [`Value`]; these structs fix the
/// shape both sides agree on.
pub mod payloads {
    use super::*;

    /// `create_escrow` payload
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct CreateEscrow {
        /// Escrow key
        pub key: LedgerKey,
        /// Seller address
        pub seller: Address,
        /// Buyer address
        pub buyer: Address,
        /// Invoice amount
        pub amount: Amount,
        /// Settlement token
        pub token: Token,
        /// Deadline (unix seconds)
        pub expires_at: u64,
        /// Collateral NFT to take into custody
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub rwa: Option<RwaCollateral>,
    }

    /// `deposit` payload
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Deposit {
        /// Escrow key
        pub key: LedgerKey,
        /// Depositing buyer
        pub buyer: Address,
        /// Amount payable net of any active discount
        pub payable: Amount,
    }

    /// `confirm_release` payload
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ConfirmRelease {
        /// Escrow key
        pub key: LedgerKey,
        /// Confirming party
        pub party: Address,
    }

    /// `approve_release` payload
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ApproveRelease {
        /// Escrow key
        pub key: LedgerKey,
        /// Approving signer
        pub approver: Address,
    }

    /// `release` payload; transfers are applied in field order
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Release {
        /// Escrow key
        pub key: LedgerKey,
        /// Settlement token
        pub token: Token,
        /// Fee transferred first
        pub fee_amount: Amount,
        /// Fee recipient
        pub treasury: Address,
        /// Remainder transferred second
        pub payout_amount: Amount,
        /// Payout recipient
        pub winner: Address,
        /// NFT transferred last, when collateral is held
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub nft_recipient: Option<Address>,
    }

    /// `reclaim_expired` payload
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ReclaimExpired {
        /// Escrow key
        pub key: LedgerKey,
        /// Buyer the funds return to
        pub buyer: Address,
        /// Seller the NFT (if held) returns to
        pub seller: Address,
    }

    /// `raise_dispute` payload
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct RaiseDispute {
        /// Escrow key
        pub key: LedgerKey,
        /// Disputing party
        pub raised_by: Address,
    }

    /// `fund` payload, idempotent on the invoice key
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Fund {
        /// Invoice key
        pub key: LedgerKey,
        /// Liquidity drawn
        pub amount: Amount,
        /// Funding recipient
        pub recipient: Address,
    }

    /// `refund` payload used by operator compensation
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Refund {
        /// Escrow key
        pub key: LedgerKey,
        /// Buyer the funds return to
        pub buyer: Address,
        /// Amount to return
        pub amount: Amount,
    }
}
