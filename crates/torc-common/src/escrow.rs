//! Escrow mirror model
//!
//! The authoritative escrow state machine lives on the external ledger; the
//! records here mirror it inside the store. The mirror is written by the
//! event ingestor and by API-driven sagas, and any divergence is caught by
//! the reconciliation engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::amount::Amount;
use crate::error::Error;
use crate::invoice::InvoiceId;

/// Mirror escrow status
///
/// Transitions form a DAG: `created → funded → {released, disputed,
/// expired}` and `disputed → released`. Once released the record is
/// terminal; the ledger deletes its copy, the mirror keeps the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    /// Created, awaiting buyer deposit
    Created,
    /// Deposit received
    Funded,
    /// Dispute raised, arbitration in progress
    Disputed,
    /// Funds paid out
    Released,
    /// Deadline passed without completion
    Expired,
}

impl EscrowStatus {
    /// Valid next statuses
    pub fn can_transition_to(self, next: EscrowStatus) -> bool {
        use EscrowStatus::*;
        matches!(
            (self, next),
            (Created, Funded)
                | (Created, Expired)
                | (Funded, Released)
                | (Funded, Disputed)
                | (Funded, Expired)
                | (Disputed, Released)
                // Confirmation-driven release is still allowed after expiry.
                | (Expired, Released)
        )
    }

    /// Terminal statuses never transition again
    pub fn is_terminal(self) -> bool {
        matches!(self, EscrowStatus::Released)
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EscrowStatus::Created => "created",
            EscrowStatus::Funded => "funded",
            EscrowStatus::Disputed => "disputed",
            EscrowStatus::Released => "released",
            EscrowStatus::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

impl FromStr for EscrowStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(EscrowStatus::Created),
            "funded" => Ok(EscrowStatus::Funded),
            "disputed" => Ok(EscrowStatus::Disputed),
            "released" => Ok(EscrowStatus::Released),
            "expired" => Ok(EscrowStatus::Expired),
            _ => Err(Error::InvalidStatusLabel(s.to_string())),
        }
    }
}

/// Canonical status used when diffing ledger state against the mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalStatus {
    /// Awaiting deposit
    Created,
    /// Deposit received
    Funded,
    /// Under dispute
    Disputed,
    /// Paid out
    Released,
    /// Expired or cancelled
    Expired,
    /// No record on that side
    NotFound,
}

impl CanonicalStatus {
    /// Map the ledger's status code
    pub fn from_ledger_code(code: u8) -> Result<Self, Error> {
        match code {
            0 => Ok(CanonicalStatus::Created),
            1 => Ok(CanonicalStatus::Funded),
            2 => Ok(CanonicalStatus::Disputed),
            3 => Ok(CanonicalStatus::Released),
            4 => Ok(CanonicalStatus::Expired),
            other => Err(Error::UnknownLedgerStatusCode(other)),
        }
    }

    /// Map a store-side status label
    ///
    /// The wider invoice store uses a handful of legacy labels; unknown
    /// labels map to `NotFound` so they surface as discrepancies.
    pub fn from_db_label(label: &str) -> Self {
        match label {
            "created" | "pending" | "payment_pending" => CanonicalStatus::Created,
            "escrow_locked" | "funded" => CanonicalStatus::Funded,
            "released" | "settled" => CanonicalStatus::Released,
            "disputed" => CanonicalStatus::Disputed,
            "cancelled" | "failed" | "expired" => CanonicalStatus::Expired,
            _ => CanonicalStatus::NotFound,
        }
    }
}

impl From<EscrowStatus> for CanonicalStatus {
    fn from(status: EscrowStatus) -> Self {
        CanonicalStatus::from_db_label(&status.to_string())
    }
}

impl fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CanonicalStatus::Created => "created",
            CanonicalStatus::Funded => "funded",
            CanonicalStatus::Disputed => "disputed",
            CanonicalStatus::Released => "released",
            CanonicalStatus::Expired => "expired",
            CanonicalStatus::NotFound => "not_found",
        };
        write!(f, "{s}")
    }
}

/// Settlement token
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Token {
    /// Native ledger currency, paid out with a call-style transfer
    Native,
    /// Token contract address
    Contract(Address),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Native => write!(f, "native"),
            Token::Contract(addr) => write!(f, "{addr}"),
        }
    }
}

/// Tokenized-invoice collateral held in custody for the escrow duration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RwaCollateral {
    /// NFT contract address
    pub contract: Address,
    /// Token id within the contract
    pub token_id: u64,
}

/// Escrow mirror record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escrow {
    /// Invoice this escrow settles
    pub invoice_id: InvoiceId,
    /// Seller address
    pub seller: Address,
    /// Buyer address
    pub buyer: Address,
    /// Authoritative amount; replaced by the discounted payable on deposit
    pub amount: Amount,
    /// Settlement token
    pub token: Token,
    /// Mirror status
    pub status: EscrowStatus,
    /// Seller confirmed release
    pub seller_confirmed: bool,
    /// Buyer confirmed release
    pub buyer_confirmed: bool,
    /// A dispute has been raised at some point
    pub dispute_raised: bool,
    /// Creation time (unix seconds)
    pub created_at: u64,
    /// Deposit/settlement deadline (unix seconds)
    pub expires_at: u64,
    /// Collateral NFT, when the invoice is tokenized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rwa: Option<RwaCollateral>,
    /// Platform fee locked in at creation
    pub fee_amount: Amount,
    /// Early-payment discount in basis points
    pub discount_rate_bps: u32,
    /// Deadline for the discount to apply (unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount_deadline: Option<u64>,
    /// Hash of the ledger transaction that released the escrow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_tx_hash: Option<String>,
}

impl Escrow {
    /// True when `address` is the recorded buyer or seller
    pub fn is_party(&self, address: &Address) -> bool {
        &self.buyer == address || &self.seller == address
    }

    /// True while the early-payment discount applies
    pub fn discount_active(&self, now: u64) -> bool {
        self.discount_rate_bps > 0
            && self.discount_deadline.map(|d| now <= d).unwrap_or(false)
    }

    /// Amount the buyer owes at `now`, net of any active discount
    pub fn payable_amount(&self, now: u64) -> Result<Amount, Error> {
        if self.discount_active(now) {
            Ok(self.amount.discounted(self.discount_rate_bps)?)
        } else {
            Ok(self.amount.clone())
        }
    }

    /// True once the settlement deadline has passed
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }
}

/// Multi-signature release approvals for a funded escrow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiSigApproval {
    /// Addresses that have approved so far
    pub approvers: Vec<Address>,
    /// Approvals needed before release fires automatically
    pub required: u32,
}

impl MultiSigApproval {
    /// Current approval count
    pub fn count(&self) -> u32 {
        self.approvers.len() as u32
    }

    /// True once enough approvals have accumulated
    pub fn is_satisfied(&self) -> bool {
        self.count() >= self.required
    }
}

/// Per-dispute arbitration record
///
/// `snapshot_arbitrator_count` is taken when the dispute opens and may only
/// shrink afterwards: every vote clamps it to the live roster size, so
/// arbitrator departures tighten the quorum instead of stranding the vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeVote {
    /// Disputed invoice
    pub invoice_id: InvoiceId,
    /// Arbitrator count the quorum is computed against
    pub snapshot_arbitrator_count: u32,
    /// Votes in favor of the buyer
    pub votes_for_buyer: u32,
    /// Votes in favor of the seller
    pub votes_for_seller: u32,
    /// Arbitrators that have voted
    pub voters: Vec<Address>,
    /// Resolution reached
    pub resolved: bool,
    /// Dispute open time (unix seconds)
    pub opened_at: u64,
}

impl DisputeVote {
    /// Open a new dispute record
    pub fn open(invoice_id: InvoiceId, arbitrator_count: u32, now: u64) -> Self {
        DisputeVote {
            invoice_id,
            snapshot_arbitrator_count: arbitrator_count,
            votes_for_buyer: 0,
            votes_for_seller: 0,
            voters: Vec::new(),
            resolved: false,
            opened_at: now,
        }
    }

    /// Clamp the snapshot to the live roster size; the snapshot never grows
    pub fn shrink_snapshot(&mut self, live_count: u32) {
        self.snapshot_arbitrator_count = self.snapshot_arbitrator_count.min(live_count);
    }

    /// Votes cast so far
    pub fn total_votes(&self) -> u32 {
        self.votes_for_buyer + self.votes_for_seller
    }

    /// Quorum threshold: `⌈snapshot × quorum_pct / 100⌉`, at least 1
    pub fn quorum(&self, quorum_pct: u32) -> u32 {
        let threshold =
            (self.snapshot_arbitrator_count as u64 * quorum_pct as u64).div_ceil(100) as u32;
        threshold.max(1)
    }

    /// True once the cast votes meet the quorum
    pub fn quorum_reached(&self, quorum_pct: u32) -> bool {
        self.total_votes() >= self.quorum(quorum_pct)
    }

    /// True when `address` has already voted
    pub fn has_voted(&self, address: &Address) -> bool {
        self.voters.contains(address)
    }

    /// Resolution outcome: the seller wins only on a strict majority
    pub fn seller_wins(&self) -> bool {
        self.votes_for_seller > self.votes_for_buyer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_form_a_dag() {
        use EscrowStatus::*;
        assert!(Created.can_transition_to(Funded));
        assert!(Funded.can_transition_to(Disputed));
        assert!(Disputed.can_transition_to(Released));
        assert!(Expired.can_transition_to(Released));
        assert!(!Released.can_transition_to(Funded));
        assert!(!Funded.can_transition_to(Created));
        assert!(!Disputed.can_transition_to(Expired));
    }

    #[test]
    fn canonical_maps() {
        assert_eq!(
            CanonicalStatus::from_ledger_code(3).unwrap(),
            CanonicalStatus::Released
        );
        assert!(CanonicalStatus::from_ledger_code(9).is_err());
        assert_eq!(
            CanonicalStatus::from_db_label("escrow_locked"),
            CanonicalStatus::Funded
        );
        assert_eq!(
            CanonicalStatus::from_db_label("settled"),
            CanonicalStatus::Released
        );
        assert_eq!(
            CanonicalStatus::from_db_label("cancelled"),
            CanonicalStatus::Expired
        );
        assert_eq!(
            CanonicalStatus::from_db_label("???"),
            CanonicalStatus::NotFound
        );
        assert_eq!(
            CanonicalStatus::from(EscrowStatus::Funded),
            CanonicalStatus::Funded
        );
    }

    #[test]
    fn quorum_shrinks_with_departures() {
        let mut vote = DisputeVote::open(InvoiceId::new(), 10, 0);
        assert_eq!(vote.quorum(51), 6);

        vote.shrink_snapshot(5);
        assert_eq!(vote.snapshot_arbitrator_count, 5);
        assert_eq!(vote.quorum(51), 3);

        // The snapshot never grows back.
        vote.shrink_snapshot(50);
        assert_eq!(vote.snapshot_arbitrator_count, 5);
    }

    #[test]
    fn quorum_has_a_floor_of_one() {
        let vote = DisputeVote::open(InvoiceId::new(), 0, 0);
        assert_eq!(vote.quorum(51), 1);
    }

    #[test]
    fn tie_goes_to_the_buyer() {
        let mut vote = DisputeVote::open(InvoiceId::new(), 4, 0);
        vote.votes_for_buyer = 2;
        vote.votes_for_seller = 2;
        assert!(!vote.seller_wins());
        vote.votes_for_seller = 3;
        assert!(vote.seller_wins());
    }

    #[test]
    fn discount_windows() {
        let escrow = Escrow {
            invoice_id: InvoiceId::new(),
            seller: Address::new("0xseller"),
            buyer: Address::new("0xbuyer"),
            amount: Amount::from(1000),
            token: Token::Native,
            status: EscrowStatus::Created,
            seller_confirmed: false,
            buyer_confirmed: false,
            dispute_raised: false,
            created_at: 100,
            expires_at: 1_000,
            rwa: None,
            fee_amount: Amount::from(5),
            discount_rate_bps: 250,
            discount_deadline: Some(500),
            release_tx_hash: None,
        };

        assert!(escrow.discount_active(500));
        assert!(!escrow.discount_active(501));
        assert_eq!(escrow.payable_amount(400).unwrap(), Amount::from(975));
        assert_eq!(escrow.payable_amount(600).unwrap(), Amount::from(1000));
    }
}
