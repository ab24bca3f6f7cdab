//! Transaction Orchestration and Reconciliation Core
//!
//! TORC coordinates multi-step settlement operations that span an external
//! append-only ledger and an internal store of record. Every initiated
//! operation either converges to a consistent final state on both sides or
//! surfaces in the dead-letter queue for manual intervention; nothing is
//! left silently half-applied.
//!
//! The crate is organized around four subsystems:
//!
//! - [`saga`]: durable, step-logged records of multi-step operations
//! - [`recovery`]: retry queue with exponential backoff, DLQ promotion and
//!   operator-driven compensation
//! - [`escrow`]: the domain protocol each saga drives (funding,
//!   confirmation, multi-sig approval, dispute voting, expiry, release)
//! - [`reconcile`]: periodic and on-demand diffing of ledger state against
//!   the mirror
//!
//! [`Orchestrator`] wires them together and supervises the long-running
//! workers.

pub mod escrow;
pub mod health;
pub mod ingest;
pub mod orchestrator;
pub mod reconcile;
pub mod recovery;
pub mod saga;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use saga::SagaManager;
pub use torc_common as common;
