//! Append-only audit trail

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;

/// One audit row per settlement action, written by the `AUDIT_LOG` saga step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Saga the action belongs to
    pub correlation_id: Uuid,
    /// Acting principal
    pub actor: Address,
    /// Action label (e.g. `escrow_released`)
    pub action: String,
    /// Structured action details
    pub details: serde_json::Value,
    /// Record time (unix seconds)
    pub recorded_at: u64,
}
