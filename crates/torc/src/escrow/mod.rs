//! Escrow protocol service
//!
//! Drives the per-escrow state machine that lives on the external ledger:
//! creation, funding, release confirmation, multi-sig approval, dispute
//! voting with quorum shrink, expiry reclaim, and the release payout. The
//! service validates against the mirror, submits the typed ledger operation,
//! and applies the mirror transition; anything with external side effects
//! runs as a saga so a mid-flight crash converges through recovery.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use torc_common::address::{Address, Principal};
use torc_common::amount::Amount;
use torc_common::config::SharedParams;
use torc_common::database::{DbTransactionFinalizer, DynStore, Store, StoreTransaction};
use torc_common::error::Error;
use torc_common::escrow::{
    DisputeVote, Escrow, EscrowStatus, MultiSigApproval, RwaCollateral, Token,
};
use torc_common::invoice::InvoiceId;
use torc_common::ledger::{payloads, DynLedgerClient, LedgerClient, LedgerOperation};
use torc_common::publish::{DomainEvent, DynPublishSink, PublishSink};
use torc_common::saga::{OperationType, SagaStep};
use torc_common::util::unix_time;
use tracing::instrument;

use crate::recovery::handlers::{FinancingContext, OperationRunner, SagaOutcome};
use crate::saga::SagaManager;

pub mod release;

#[cfg(test)]
mod tests;

pub use release::ReleaseContext;

/// Parameters for creating an escrow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateEscrowRequest {
    /// Invoice to settle
    pub invoice_id: InvoiceId,
    /// Seller address
    pub seller: Address,
    /// Buyer address
    pub buyer: Address,
    /// Invoice amount
    pub amount: Amount,
    /// Settlement token
    pub token: Token,
    /// Seconds until the escrow expires
    pub duration_secs: u64,
    /// Collateral NFT; the seller must have pre-approved custody transfer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rwa: Option<RwaCollateral>,
    /// Early-payment discount in basis points
    #[serde(default)]
    pub discount_rate_bps: u32,
    /// Deadline for the discount (unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount_deadline: Option<u64>,
}

/// Result of a release confirmation
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmOutcome {
    /// Mirror row after the confirmation
    pub escrow: Escrow,
    /// Release saga outcome, present once both parties confirmed
    pub release: Option<SagaOutcome>,
}

/// Result of a multi-sig approval
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalOutcome {
    /// Ledger-reported approval state
    pub approval: MultiSigApproval,
    /// Release saga outcome, present once the threshold was reached
    pub release: Option<SagaOutcome>,
}

/// Result of a dispute vote
#[derive(Debug, Clone, PartialEq)]
pub struct VoteOutcome {
    /// Vote record after this ballot
    pub vote: DisputeVote,
    /// Resolution saga outcome, present once quorum was reached
    pub resolution: Option<SagaOutcome>,
}

/// Escrow protocol service
#[derive(Clone)]
pub struct EscrowService {
    store: DynStore,
    ledger: DynLedgerClient,
    sagas: Arc<SagaManager>,
    publisher: DynPublishSink,
    params: SharedParams,
    runner: Arc<OperationRunner>,
}

impl std::fmt::Debug for EscrowService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscrowService").finish_non_exhaustive()
    }
}

impl EscrowService {
    /// Create the service
    pub fn new(
        store: DynStore,
        ledger: DynLedgerClient,
        sagas: Arc<SagaManager>,
        publisher: DynPublishSink,
        params: SharedParams,
        runner: Arc<OperationRunner>,
    ) -> Self {
        EscrowService {
            store,
            ledger,
            sagas,
            publisher,
            params,
            runner,
        }
    }

    /// Create an escrow for an invoice (admin-only)
    ///
    /// Rejects duplicate invoices, amounts below the fee-derived minimum,
    /// and amounts whose fee would round to zero. Collateral custody is
    /// taken by the ledger as part of the create transaction.
    #[instrument(skip_all, fields(invoice_id = %request.invoice_id))]
    pub async fn create(
        &self,
        actor: &Principal,
        request: CreateEscrowRequest,
    ) -> Result<Escrow, Error> {
        if !actor.admin {
            return Err(Error::AdminRequired);
        }

        let params = self.params.load();
        if request.amount < params.minimum_escrow_amount {
            return Err(Error::AmountBelowMinimum);
        }
        let fee_amount = request.amount.bps_share(params.fee_basis_points)?;
        if fee_amount.is_zero() {
            return Err(Error::ZeroFee);
        }
        // The fee is locked in now but collected from the (possibly
        // discounted) payable at release; a discount deep enough to eat the
        // fee would leave nothing to release. Reject it up front.
        if request.discount_rate_bps > 0
            && request.amount.discounted(request.discount_rate_bps)? < fee_amount
        {
            return Err(Error::DiscountExceedsFee);
        }
        if self.store.get_escrow(&request.invoice_id).await?.is_some() {
            return Err(Error::EscrowExists);
        }

        let now = unix_time();
        let expires_at = now + request.duration_secs;

        let payload = serde_json::to_value(payloads::CreateEscrow {
            key: request.invoice_id.to_ledger_key(),
            seller: request.seller.clone(),
            buyer: request.buyer.clone(),
            amount: request.amount.clone(),
            token: request.token.clone(),
            expires_at,
            rwa: request.rwa.clone(),
        })?;
        self.ledger
            .submit(LedgerOperation::CreateEscrow, payload)
            .await?;

        let escrow = Escrow {
            invoice_id: request.invoice_id,
            seller: request.seller,
            buyer: request.buyer,
            amount: request.amount,
            token: request.token,
            status: EscrowStatus::Created,
            seller_confirmed: false,
            buyer_confirmed: false,
            dispute_raised: false,
            created_at: now,
            expires_at,
            rwa: request.rwa,
            fee_amount,
            discount_rate_bps: request.discount_rate_bps,
            discount_deadline: request.discount_deadline,
            release_tx_hash: None,
        };

        let mut tx = self.store.begin_transaction().await?;
        if tx.get_escrow(&escrow.invoice_id).await?.is_some() {
            tx.rollback().await?;
            return Err(Error::EscrowExists);
        }
        tx.upsert_escrow(&escrow).await?;
        tx.commit().await?;

        tracing::info!(
            "escrow created for invoice {}: {} {} from {} to {}",
            escrow.invoice_id,
            escrow.amount,
            escrow.token,
            escrow.buyer,
            escrow.seller
        );
        Ok(escrow)
    }

    /// Buyer deposit into a created escrow
    ///
    /// An active early-payment discount reduces the payable; the discounted
    /// payable becomes the authoritative escrow amount.
    #[instrument(skip_all, fields(%invoice_id))]
    pub async fn deposit(
        &self,
        actor: &Principal,
        invoice_id: &InvoiceId,
    ) -> Result<Escrow, Error> {
        let escrow = self.read_escrow(invoice_id).await?;
        if actor.address != escrow.buyer {
            return Err(Error::NotBuyer);
        }
        if escrow.status != EscrowStatus::Created {
            return Err(Error::IllegalEscrowTransition {
                from: escrow.status,
                to: EscrowStatus::Funded,
            });
        }
        let now = unix_time();
        if escrow.is_expired(now) {
            return Err(Error::EscrowExpired);
        }
        let payable = escrow.payable_amount(now)?;
        // The payable becomes the authoritative amount and the fee comes out
        // of it at release; mirror rows that arrived through ingestion may
        // carry discounts the create path never vetted.
        if payable < escrow.fee_amount {
            return Err(Error::DiscountExceedsFee);
        }

        let payload = serde_json::to_value(payloads::Deposit {
            key: invoice_id.to_ledger_key(),
            buyer: escrow.buyer.clone(),
            payable: payable.clone(),
        })?;
        self.ledger.submit(LedgerOperation::Deposit, payload).await?;

        let mut tx = self.store.begin_transaction().await?;
        let mut escrow = match tx.get_escrow(invoice_id).await? {
            Some(escrow) => escrow,
            None => {
                tx.rollback().await?;
                return Err(Error::UnknownEscrow);
            }
        };
        if !escrow.status.can_transition_to(EscrowStatus::Funded) {
            tx.rollback().await?;
            return Err(Error::IllegalEscrowTransition {
                from: escrow.status,
                to: EscrowStatus::Funded,
            });
        }
        escrow.status = EscrowStatus::Funded;
        escrow.amount = payable;
        tx.upsert_escrow(&escrow).await?;
        tx.commit().await?;

        tracing::info!("escrow {} funded with {}", invoice_id, escrow.amount);
        Ok(escrow)
    }

    /// Party confirmation of release; both confirmations trigger the payout
    ///
    /// Confirming after the deadline marks the escrow expired but still
    /// allows the parties to complete the release.
    #[instrument(skip_all, fields(%invoice_id))]
    pub async fn confirm_release(
        &self,
        actor: &Principal,
        invoice_id: &InvoiceId,
    ) -> Result<ConfirmOutcome, Error> {
        let escrow = self.read_escrow(invoice_id).await?;
        if !escrow.is_party(&actor.address) {
            return Err(Error::NotParty);
        }
        if !matches!(escrow.status, EscrowStatus::Funded | EscrowStatus::Expired) {
            return Err(Error::NotFunded);
        }

        let payload = serde_json::to_value(payloads::ConfirmRelease {
            key: invoice_id.to_ledger_key(),
            party: actor.address.clone(),
        })?;
        self.ledger
            .submit(LedgerOperation::ConfirmRelease, payload)
            .await?;

        let now = unix_time();
        let mut tx = self.store.begin_transaction().await?;
        let mut escrow = match tx.get_escrow(invoice_id).await? {
            Some(escrow) => escrow,
            None => {
                tx.rollback().await?;
                return Err(Error::UnknownEscrow);
            }
        };
        if actor.address == escrow.seller {
            escrow.seller_confirmed = true;
        } else {
            escrow.buyer_confirmed = true;
        }
        if escrow.status == EscrowStatus::Funded && escrow.is_expired(now) {
            escrow.status = EscrowStatus::Expired;
        }
        tx.upsert_escrow(&escrow).await?;
        tx.commit().await?;

        let release = if escrow.seller_confirmed && escrow.buyer_confirmed {
            Some(
                self.start_release(
                    &escrow,
                    escrow.seller.clone(),
                    OperationType::EscrowRelease,
                    actor,
                )
                .await?,
            )
        } else {
            None
        };

        Ok(ConfirmOutcome { escrow, release })
    }

    /// Multi-sig approval; release fires once the threshold is reached
    #[instrument(skip_all, fields(%invoice_id))]
    pub async fn approve_release(
        &self,
        actor: &Principal,
        invoice_id: &InvoiceId,
    ) -> Result<ApprovalOutcome, Error> {
        let escrow = self.read_escrow(invoice_id).await?;
        if !actor.admin && !escrow.is_party(&actor.address) {
            return Err(Error::NotParty);
        }
        if escrow.status != EscrowStatus::Funded {
            return Err(Error::NotFunded);
        }

        let key = invoice_id.to_ledger_key();
        let payload = serde_json::to_value(payloads::ApproveRelease {
            key,
            approver: actor.address.clone(),
        })?;
        self.ledger
            .submit(LedgerOperation::ApproveRelease, payload)
            .await?;

        let approval = self.ledger.read_multisig_approvals(&key).await?;
        self.publisher.publish(DomainEvent::EscrowApprovalAdded {
            invoice_id: *invoice_id,
            approver: actor.address.clone(),
            count: approval.count(),
            required: approval.required,
        });

        let release = if approval.is_satisfied() {
            Some(
                self.start_release(
                    &escrow,
                    escrow.seller.clone(),
                    OperationType::EscrowRelease,
                    actor,
                )
                .await?,
            )
        } else {
            None
        };

        Ok(ApprovalOutcome { approval, release })
    }

    /// Buyer reclaims funds from an expired escrow
    ///
    /// Funds return to the buyer; the collateral NFT, when held, returns to
    /// the seller.
    #[instrument(skip_all, fields(%invoice_id))]
    pub async fn reclaim_expired(
        &self,
        actor: &Principal,
        invoice_id: &InvoiceId,
    ) -> Result<Escrow, Error> {
        let escrow = self.read_escrow(invoice_id).await?;
        if actor.address != escrow.buyer {
            return Err(Error::NotBuyer);
        }
        if !matches!(escrow.status, EscrowStatus::Funded | EscrowStatus::Expired) {
            return Err(Error::NotFunded);
        }
        if !escrow.is_expired(unix_time()) {
            return Err(Error::NotExpired);
        }

        let payload = serde_json::to_value(payloads::ReclaimExpired {
            key: invoice_id.to_ledger_key(),
            buyer: escrow.buyer.clone(),
            seller: escrow.seller.clone(),
        })?;
        self.ledger
            .submit(LedgerOperation::ReclaimExpired, payload)
            .await?;

        let mut tx = self.store.begin_transaction().await?;
        let mut escrow = match tx.get_escrow(invoice_id).await? {
            Some(escrow) => escrow,
            None => {
                tx.rollback().await?;
                return Err(Error::UnknownEscrow);
            }
        };
        if escrow.status != EscrowStatus::Expired {
            escrow.status = EscrowStatus::Expired;
        }
        tx.upsert_escrow(&escrow).await?;
        tx.commit().await?;

        tracing::info!("escrow {} reclaimed by buyer after expiry", invoice_id);
        Ok(escrow)
    }

    /// Raise a dispute on a funded escrow
    ///
    /// Opens the vote record with a snapshot of the current arbitrator
    /// roster size.
    #[instrument(skip_all, fields(%invoice_id))]
    pub async fn raise_dispute(
        &self,
        actor: &Principal,
        invoice_id: &InvoiceId,
    ) -> Result<DisputeVote, Error> {
        let escrow = self.read_escrow(invoice_id).await?;
        if !escrow.is_party(&actor.address) {
            return Err(Error::NotParty);
        }
        if escrow.dispute_raised || escrow.status == EscrowStatus::Disputed {
            return Err(Error::AlreadyDisputed);
        }
        if escrow.status != EscrowStatus::Funded {
            return Err(Error::NotFunded);
        }
        let params = self.params.load();
        if params.arbitrator_count() == 0 {
            return Err(Error::NoArbitrators);
        }

        let payload = serde_json::to_value(payloads::RaiseDispute {
            key: invoice_id.to_ledger_key(),
            raised_by: actor.address.clone(),
        })?;
        self.ledger
            .submit(LedgerOperation::RaiseDispute, payload)
            .await?;

        let now = unix_time();
        let vote = DisputeVote::open(*invoice_id, params.arbitrator_count(), now);

        let mut tx = self.store.begin_transaction().await?;
        let mut escrow = match tx.get_escrow(invoice_id).await? {
            Some(escrow) => escrow,
            None => {
                tx.rollback().await?;
                return Err(Error::UnknownEscrow);
            }
        };
        if !escrow.status.can_transition_to(EscrowStatus::Disputed) {
            tx.rollback().await?;
            return Err(Error::IllegalEscrowTransition {
                from: escrow.status,
                to: EscrowStatus::Disputed,
            });
        }
        escrow.status = EscrowStatus::Disputed;
        escrow.dispute_raised = true;
        tx.upsert_escrow(&escrow).await?;
        tx.upsert_dispute_vote(&vote).await?;
        tx.commit().await?;

        self.publisher.publish(DomainEvent::EscrowDispute {
            invoice_id: *invoice_id,
            raised_by: actor.address.clone(),
        });

        tracing::info!(
            "dispute raised on escrow {} with {} arbitrators snapshotted",
            invoice_id,
            vote.snapshot_arbitrator_count
        );
        Ok(vote)
    }

    /// Arbitrator ballot on an open dispute
    ///
    /// Every vote clamps the snapshot to the live roster size, so departures
    /// tighten the quorum. On quorum the dispute resolves: ties go to the
    /// buyer, the seller needs a strict majority.
    #[instrument(skip_all, fields(%invoice_id, vote_for_buyer))]
    pub async fn vote_on_dispute(
        &self,
        actor: &Principal,
        invoice_id: &InvoiceId,
        vote_for_buyer: bool,
    ) -> Result<VoteOutcome, Error> {
        let params = self.params.load();
        if !params.is_arbitrator(&actor.address) {
            return Err(Error::NotArbitrator);
        }

        let mut tx = self.store.begin_transaction().await?;
        let mut vote = match tx.get_dispute_vote(invoice_id).await? {
            Some(vote) => vote,
            None => {
                tx.rollback().await?;
                return Err(Error::NoOpenDispute);
            }
        };
        if vote.resolved {
            tx.rollback().await?;
            return Err(Error::DisputeResolved);
        }
        if vote.has_voted(&actor.address) {
            tx.rollback().await?;
            return Err(Error::AlreadyVoted);
        }

        vote.shrink_snapshot(params.arbitrator_count());
        if vote_for_buyer {
            vote.votes_for_buyer += 1;
        } else {
            vote.votes_for_seller += 1;
        }
        vote.voters.push(actor.address.clone());
        tx.upsert_dispute_vote(&vote).await?;
        tx.commit().await?;

        let resolution = if vote.quorum_reached(params.quorum_percentage) {
            Some(
                self.resolve_dispute(invoice_id, vote.seller_wins(), actor)
                    .await?,
            )
        } else {
            None
        };

        let vote = self
            .store
            .get_dispute_vote(invoice_id)
            .await?
            .unwrap_or(vote);
        Ok(VoteOutcome { vote, resolution })
    }

    /// Admin resolution when quorum is provably unreachable
    ///
    /// Allowed only while the live roster is smaller than the quorum derived
    /// from the dispute's stored snapshot (which only ever shrinks).
    #[instrument(skip_all, fields(%invoice_id, seller_wins))]
    pub async fn safe_escape(
        &self,
        actor: &Principal,
        invoice_id: &InvoiceId,
        seller_wins: bool,
    ) -> Result<SagaOutcome, Error> {
        if !actor.admin {
            return Err(Error::AdminRequired);
        }
        let vote = self
            .store
            .get_dispute_vote(invoice_id)
            .await?
            .ok_or(Error::NoOpenDispute)?;
        if vote.resolved {
            return Err(Error::DisputeResolved);
        }

        let params = self.params.load();
        let quorum = vote.quorum(params.quorum_percentage);
        if params.arbitrator_count() >= quorum {
            return Err(Error::QuorumReachable);
        }

        tracing::warn!(
            "safe escape on escrow {}: live {} < quorum {}, seller_wins={}",
            invoice_id,
            params.arbitrator_count(),
            quorum,
            seller_wins
        );
        self.resolve_dispute(invoice_id, seller_wins, actor).await
    }

    /// Start the financing pipeline for an invoice (admin-only)
    #[instrument(skip_all, fields(%invoice_id))]
    pub async fn fund_invoice(
        &self,
        actor: &Principal,
        invoice_id: &InvoiceId,
        amount: Amount,
        recipient: Address,
    ) -> Result<SagaOutcome, Error> {
        if !actor.admin {
            return Err(Error::AdminRequired);
        }
        self.read_escrow(invoice_id).await?;

        let context = FinancingContext {
            invoice_id: *invoice_id,
            amount,
            recipient,
        };
        let correlation_id = self
            .sagas
            .begin(
                OperationType::FinancingPipeline,
                "escrow",
                &invoice_id.to_string(),
                vec![SagaStep::ExternalLiquidity, SagaStep::DbUpdate],
                serde_json::to_value(&context)?,
                actor.address.clone(),
                None,
            )
            .await?;
        self.runner.run(&correlation_id).await
    }

    async fn resolve_dispute(
        &self,
        invoice_id: &InvoiceId,
        seller_wins: bool,
        actor: &Principal,
    ) -> Result<SagaOutcome, Error> {
        let escrow = self.read_escrow(invoice_id).await?;

        let mut tx = self.store.begin_transaction().await?;
        let mut vote = match tx.get_dispute_vote(invoice_id).await? {
            Some(vote) => vote,
            None => {
                tx.rollback().await?;
                return Err(Error::NoOpenDispute);
            }
        };
        vote.resolved = true;
        tx.upsert_dispute_vote(&vote).await?;
        tx.commit().await?;

        let winner = if seller_wins {
            escrow.seller.clone()
        } else {
            escrow.buyer.clone()
        };
        tracing::info!(
            "dispute on escrow {} resolved for the {}",
            invoice_id,
            if seller_wins { "seller" } else { "buyer" }
        );

        self.start_release(&escrow, winner, OperationType::EscrowDispute, actor)
            .await
    }

    /// Begin and drive a release saga
    ///
    /// The NFT recipient is determined by the counterparty rule: the buyer
    /// on a normal or seller-won release, the seller when the buyer wins the
    /// dispute.
    async fn start_release(
        &self,
        escrow: &Escrow,
        winner: Address,
        operation_type: OperationType,
        actor: &Principal,
    ) -> Result<SagaOutcome, Error> {
        let params = self.params.load();
        let payout_amount = escrow.amount.checked_sub(&escrow.fee_amount)?;
        let nft_recipient = escrow.rwa.as_ref().map(|_| {
            if winner == escrow.seller {
                escrow.buyer.clone()
            } else {
                escrow.seller.clone()
            }
        });

        let context = ReleaseContext {
            invoice_id: escrow.invoice_id,
            winner,
            nft_recipient,
            fee_amount: escrow.fee_amount.clone(),
            payout_amount,
            token: escrow.token.clone(),
            treasury: params.treasury.clone(),
            buyer: escrow.buyer.clone(),
            refund_amount: escrow.amount.clone(),
            tx_hash: None,
        };

        let correlation_id = self
            .sagas
            .begin(
                operation_type,
                "escrow",
                &escrow.invoice_id.to_string(),
                vec![SagaStep::BlockchainTx, SagaStep::DbUpdate, SagaStep::AuditLog],
                serde_json::to_value(&context)?,
                actor.address.clone(),
                None,
            )
            .await?;
        self.runner.run(&correlation_id).await
    }

    async fn read_escrow(&self, invoice_id: &InvoiceId) -> Result<Escrow, Error> {
        self.store
            .get_escrow(invoice_id)
            .await?
            .ok_or(Error::UnknownEscrow)
    }
}
