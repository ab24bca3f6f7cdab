//! Fire-and-forget publish sink
//!
//! Domain events feed realtime UI updates through an opaque sink. Publishing
//! never blocks and is never awaited as part of saga completion; a slow or
//! absent consumer cannot stall settlement.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::address::Address;
use crate::amount::Amount;
use crate::invoice::InvoiceId;

/// Domain events published to the sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum DomainEvent {
    /// Escrow paid out
    EscrowReleased {
        /// Invoice settled
        invoice_id: InvoiceId,
        /// Payout recipient
        winner: Address,
        /// Amount paid to the winner
        amount: Amount,
        /// Releasing ledger transaction
        tx_hash: String,
    },
    /// Dispute raised
    EscrowDispute {
        /// Disputed invoice
        invoice_id: InvoiceId,
        /// Disputing party
        raised_by: Address,
    },
    /// Multi-sig approval accepted
    EscrowApprovalAdded {
        /// Invoice awaiting release
        invoice_id: InvoiceId,
        /// Approving signer
        approver: Address,
        /// Approvals so far
        count: u32,
        /// Approvals required
        required: u32,
    },
    /// Insurance policy purchased
    InsurancePurchased {
        /// Policy id
        policy_id: Uuid,
        /// Covered invoice
        invoice_id: InvoiceId,
        /// Coverage amount
        amount: Amount,
    },
    /// Insurance claim filed
    InsuranceClaimFiled {
        /// Policy id
        policy_id: Uuid,
        /// Covered invoice
        invoice_id: InvoiceId,
    },
    /// Insurance claim approved
    InsuranceClaimApproved {
        /// Policy id
        policy_id: Uuid,
        /// Covered invoice
        invoice_id: InvoiceId,
        /// Approved payout
        amount: Amount,
    },
}

impl DomainEvent {
    /// Topic string consumers subscribe on
    pub fn topic(&self) -> &'static str {
        match self {
            DomainEvent::EscrowReleased { .. } => "escrow:released",
            DomainEvent::EscrowDispute { .. } => "escrow:dispute",
            DomainEvent::EscrowApprovalAdded { .. } => "escrow:approval-added",
            DomainEvent::InsurancePurchased { .. } => "insurance:purchased",
            DomainEvent::InsuranceClaimFiled { .. } => "insurance:claim-filed",
            DomainEvent::InsuranceClaimApproved { .. } => "insurance:claim-approved",
        }
    }
}

impl fmt::Display for DomainEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.topic())
    }
}

/// Opaque publish sink
pub trait PublishSink: Send + Sync {
    /// Publish without waiting for delivery
    fn publish(&self, event: DomainEvent);
}

/// Type alias for a shared sink
pub type DynPublishSink = Arc<dyn PublishSink>;

/// Sink that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl PublishSink for NoopSink {
    fn publish(&self, _event: DomainEvent) {}
}

/// Broadcast-channel sink for in-process consumers
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<DomainEvent>,
}

impl BroadcastSink {
    /// Create a sink buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        BroadcastSink { sender }
    }

    /// Subscribe to published events
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}

impl PublishSink for BroadcastSink {
    fn publish(&self, event: DomainEvent) {
        // Send fails only when no subscriber exists, which is fine.
        if self.sender.send(event).is_err() {
            tracing::trace!("domain event dropped, no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();

        let event = DomainEvent::EscrowDispute {
            invoice_id: InvoiceId::new(),
            raised_by: Address::new("0xbuyer"),
        };
        sink.publish(event.clone());

        assert_eq!(rx.recv().await.ok(), Some(event.clone()));
        assert_eq!(event.topic(), "escrow:dispute");
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        let sink = BroadcastSink::new(1);
        sink.publish(DomainEvent::InsuranceClaimFiled {
            policy_id: Uuid::new_v4(),
            invoice_id: InvoiceId::new(),
        });
    }
}
