//! TORC common types and traits
//!
//! Shared data model and capabilities for the Transaction Orchestration and
//! Reconciliation Core: unbounded ledger amounts, invoice ids and their
//! 32-byte ledger keys, the escrow mirror, saga and recovery records,
//! reconciliation records, health metrics, the transactional [`database`]
//! capability, the external [`ledger`] capability, and the fire-and-forget
//! [`publish`] sink.

pub mod address;
pub mod amount;
pub mod audit;
pub mod config;
pub mod database;
pub mod error;
pub mod escrow;
pub mod health;
pub mod invoice;
pub mod ledger;
pub mod publish;
pub mod reconciliation;
pub mod recovery;
pub mod saga;
pub mod task;
pub mod util;

pub use address::Address;
pub use amount::{Amount, SignedAmount};
pub use error::{Error, ErrorKind};
pub use invoice::{InvoiceId, LedgerKey};
