//! Tests for the escrow protocol service
//!
//! Covers creation preconditions, deposit and discount arithmetic,
//! confirmation-driven release, multi-sig approval, dispute voting with
//! quorum shrink, safe escape and expiry reclaim.

#![cfg(test)]

use torc_common::amount::Amount;
use torc_common::database::{DbTransactionFinalizer, Store, StoreTransaction};
use torc_common::error::Error;
use torc_common::escrow::EscrowStatus;
use torc_common::publish::DomainEvent;
use torc_common::saga::{SagaState, SagaStep};
use torc_common::util::unix_time;

use crate::test_helpers::{
    admin, arbitrator, buyer, create_test_core, escrow_request, funded_escrow, seller, treasury,
};

#[tokio::test]
async fn create_requires_admin_and_minimum_amount() {
    let test = create_test_core(0);

    assert!(matches!(
        test.core.escrow.create(&seller(), escrow_request(1_000)).await,
        Err(Error::AdminRequired)
    ));

    // fee_bps = 50 ⇒ minimum = ⌈10000 / 50⌉ = 200.
    assert!(matches!(
        test.core.escrow.create(&admin(), escrow_request(199)).await,
        Err(Error::AmountBelowMinimum)
    ));

    let escrow = test
        .core
        .escrow
        .create(&admin(), escrow_request(200))
        .await
        .expect("create at the minimum");
    assert_eq!(escrow.fee_amount, Amount::from(1));
    assert_eq!(escrow.status, EscrowStatus::Created);
}

#[tokio::test]
async fn duplicate_invoices_are_rejected() {
    let test = create_test_core(0);
    let request = escrow_request(1_000);

    test.core
        .escrow
        .create(&admin(), request.clone())
        .await
        .expect("create");
    assert!(matches!(
        test.core.escrow.create(&admin(), request).await,
        Err(Error::EscrowExists)
    ));
}

#[tokio::test]
async fn deposit_is_buyer_only_and_applies_the_discount() {
    let test = create_test_core(0);
    let mut request = escrow_request(1_000);
    request.discount_rate_bps = 250;
    request.discount_deadline = Some(unix_time() + 600);
    let invoice_id = request.invoice_id;

    test.core
        .escrow
        .create(&admin(), request)
        .await
        .expect("create");

    assert!(matches!(
        test.core.escrow.deposit(&seller(), &invoice_id).await,
        Err(Error::NotBuyer)
    ));

    let escrow = test
        .core
        .escrow
        .deposit(&buyer(), &invoice_id)
        .await
        .expect("deposit");
    assert_eq!(escrow.status, EscrowStatus::Funded);
    // 1000 − ⌊1000 × 250 / 10000⌋ = 975 becomes the authoritative amount.
    assert_eq!(escrow.amount, Amount::from(975));

    let record = test
        .ledger
        .escrow_record(&invoice_id.to_ledger_key())
        .await
        .expect("ledger record");
    assert_eq!(record.amount, Amount::from(975));
    assert_eq!(record.status_code, 1);

    // A second deposit hits the state machine.
    assert!(matches!(
        test.core.escrow.deposit(&buyer(), &invoice_id).await,
        Err(Error::IllegalEscrowTransition { .. })
    ));
}

#[tokio::test]
async fn discounts_cannot_undercut_the_fee() {
    let test = create_test_core(0);

    // amount 1000, fee 5; a 9999 bps discount leaves a payable of 1.
    let mut request = escrow_request(1_000);
    request.discount_rate_bps = 9_999;
    request.discount_deadline = Some(unix_time() + 600);
    assert!(matches!(
        test.core.escrow.create(&admin(), request).await,
        Err(Error::DiscountExceedsFee)
    ));

    // A mirror row that arrived through ingestion never went through the
    // create-time check; deposit refuses it the same way.
    let hostile = {
        let mut escrow = test
            .core
            .escrow
            .create(&admin(), escrow_request(1_000))
            .await
            .expect("create");
        escrow.discount_rate_bps = 9_999;
        escrow.discount_deadline = Some(unix_time() + 600);
        escrow
    };
    let mut tx = test.store.begin_transaction().await.expect("begin");
    tx.upsert_escrow(&hostile).await.expect("upsert");
    tx.commit().await.expect("commit");
    assert!(matches!(
        test.core.escrow.deposit(&buyer(), &hostile.invoice_id).await,
        Err(Error::DiscountExceedsFee)
    ));
}

#[tokio::test]
async fn a_discount_down_to_the_fee_still_settles() {
    let test = create_test_core(0);

    // 9950 bps discounts the payable to exactly the 5-unit fee.
    let mut request = escrow_request(1_000);
    request.discount_rate_bps = 9_950;
    request.discount_deadline = Some(unix_time() + 600);
    let invoice_id = request.invoice_id;

    test.core
        .escrow
        .create(&admin(), request)
        .await
        .expect("create at the boundary");
    let escrow = test
        .core
        .escrow
        .deposit(&buyer(), &invoice_id)
        .await
        .expect("deposit");
    assert_eq!(escrow.amount, Amount::from(5));

    test.core
        .escrow
        .confirm_release(&seller(), &invoice_id)
        .await
        .expect("seller confirm");
    let outcome = test
        .core
        .escrow
        .confirm_release(&buyer(), &invoice_id)
        .await
        .expect("buyer confirm");

    // The whole payable goes to the treasury; the seller payout is zero but
    // the escrow still converges to released.
    let release = outcome.release.expect("release fired");
    assert_eq!(release.state, SagaState::Completed);
    assert_eq!(test.ledger.balance_of(&treasury()).await, Amount::from(5));
    assert_eq!(
        test.ledger.balance_of(&seller().address).await,
        Amount::zero()
    );
    let mirror = test
        .store
        .get_escrow(&invoice_id)
        .await
        .expect("get")
        .expect("mirror");
    assert_eq!(mirror.status, EscrowStatus::Released);
}

#[tokio::test]
async fn one_confirmation_does_not_release() {
    let test = create_test_core(0);
    let escrow = funded_escrow(&test, 1_000).await;

    let outcome = test
        .core
        .escrow
        .confirm_release(&seller(), &escrow.invoice_id)
        .await
        .expect("confirm");
    assert!(outcome.release.is_none());
    assert!(outcome.escrow.seller_confirmed);
    assert!(!outcome.escrow.buyer_confirmed);
    assert_eq!(outcome.escrow.status, EscrowStatus::Funded);
}

#[tokio::test]
async fn both_confirmations_release_with_fee_before_payout() {
    let test = create_test_core(0);
    let mut events = test.sink.subscribe();
    let escrow = funded_escrow(&test, 1_000).await;

    test.core
        .escrow
        .confirm_release(&seller(), &escrow.invoice_id)
        .await
        .expect("seller confirm");
    let outcome = test
        .core
        .escrow
        .confirm_release(&buyer(), &escrow.invoice_id)
        .await
        .expect("buyer confirm");

    let release = outcome.release.expect("release fired");
    assert_eq!(release.state, SagaState::Completed);

    let saga = test.core.sagas.read(&release.correlation_id).await.expect("saga");
    assert_eq!(
        saga.steps_completed,
        vec![SagaStep::BlockchainTx, SagaStep::DbUpdate, SagaStep::AuditLog]
    );
    assert!(saga.steps_remaining.is_empty());

    // Fee to the treasury, remainder to the seller; together they equal the
    // original amount.
    assert_eq!(test.ledger.balance_of(&treasury()).await, Amount::from(5));
    assert_eq!(
        test.ledger.balance_of(&seller().address).await,
        Amount::from(995)
    );

    let mirror = test
        .store
        .get_escrow(&escrow.invoice_id)
        .await
        .expect("get")
        .expect("mirror");
    assert_eq!(mirror.status, EscrowStatus::Released);
    assert!(mirror.release_tx_hash.is_some());

    // Audit row written by the AUDIT_LOG step.
    let audit = test
        .store
        .list_audit_records(&release.correlation_id)
        .await
        .expect("audit");
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, "escrow_released");

    // Domain event published fire-and-forget.
    let mut saw_release = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, DomainEvent::EscrowReleased { .. }) {
            saw_release = true;
        }
    }
    assert!(saw_release);
}

#[tokio::test]
async fn confirm_requires_funding_and_a_party() {
    let test = create_test_core(0);
    let request = escrow_request(1_000);
    let invoice_id = request.invoice_id;
    test.core
        .escrow
        .create(&admin(), request)
        .await
        .expect("create");

    assert!(matches!(
        test.core.escrow.confirm_release(&seller(), &invoice_id).await,
        Err(Error::NotFunded)
    ));

    test.core
        .escrow
        .deposit(&buyer(), &invoice_id)
        .await
        .expect("deposit");
    assert!(matches!(
        test.core
            .escrow
            .confirm_release(&arbitrator(0), &invoice_id)
            .await,
        Err(Error::NotParty)
    ));
}

#[tokio::test]
async fn multisig_threshold_triggers_release() {
    let test = create_test_core(0);
    let escrow = funded_escrow(&test, 1_000).await;
    let key = escrow.invoice_id.to_ledger_key();
    test.ledger.set_required_approvals(key, 2).await;

    let mut events = test.sink.subscribe();

    let first = test
        .core
        .escrow
        .approve_release(&seller(), &escrow.invoice_id)
        .await
        .expect("first approval");
    assert_eq!(first.approval.count(), 1);
    assert!(first.release.is_none());

    match events.recv().await.expect("approval event") {
        DomainEvent::EscrowApprovalAdded { count, required, .. } => {
            assert_eq!(count, 1);
            assert_eq!(required, 2);
        }
        other => panic!("unexpected event {other}"),
    }

    let second = test
        .core
        .escrow
        .approve_release(&buyer(), &escrow.invoice_id)
        .await
        .expect("second approval");
    assert_eq!(second.approval.count(), 2);
    let release = second.release.expect("threshold reached");
    assert_eq!(release.state, SagaState::Completed);
    assert_eq!(test.ledger.balance_of(&treasury()).await, Amount::from(5));
}

#[tokio::test]
async fn dispute_needs_arbitrators_and_a_funded_escrow() {
    let test = create_test_core(0);
    let escrow = funded_escrow(&test, 1_000).await;

    assert!(matches!(
        test.core.escrow.raise_dispute(&buyer(), &escrow.invoice_id).await,
        Err(Error::NoArbitrators)
    ));

    let test = create_test_core(3);
    let escrow = funded_escrow(&test, 1_000).await;
    let vote = test
        .core
        .escrow
        .raise_dispute(&buyer(), &escrow.invoice_id)
        .await
        .expect("raise");
    assert_eq!(vote.snapshot_arbitrator_count, 3);

    assert!(matches!(
        test.core.escrow.raise_dispute(&seller(), &escrow.invoice_id).await,
        Err(Error::AlreadyDisputed)
    ));
}

#[tokio::test]
async fn votes_resolve_on_quorum_with_ties_to_the_buyer() {
    let test = create_test_core(2);
    let escrow = funded_escrow(&test, 1_000).await;
    test.core
        .escrow
        .raise_dispute(&buyer(), &escrow.invoice_id)
        .await
        .expect("raise");

    // Quorum: ⌈2 × 51 / 100⌉ = 2.
    let first = test
        .core
        .escrow
        .vote_on_dispute(&arbitrator(0), &escrow.invoice_id, true)
        .await
        .expect("first vote");
    assert!(first.resolution.is_none());

    assert!(matches!(
        test.core
            .escrow
            .vote_on_dispute(&arbitrator(0), &escrow.invoice_id, false)
            .await,
        Err(Error::AlreadyVoted)
    ));

    let second = test
        .core
        .escrow
        .vote_on_dispute(&arbitrator(1), &escrow.invoice_id, false)
        .await
        .expect("second vote");
    let resolution = second.resolution.expect("quorum reached");
    assert_eq!(resolution.state, SagaState::Completed);
    assert!(second.vote.resolved);

    // 1–1 tie goes to the buyer.
    assert_eq!(
        test.ledger.balance_of(&buyer().address).await,
        Amount::from(995)
    );
    assert_eq!(test.ledger.balance_of(&seller().address).await, Amount::zero());
}

#[tokio::test]
async fn non_arbitrators_cannot_vote() {
    let test = create_test_core(1);
    let escrow = funded_escrow(&test, 1_000).await;
    test.core
        .escrow
        .raise_dispute(&buyer(), &escrow.invoice_id)
        .await
        .expect("raise");

    assert!(matches!(
        test.core
            .escrow
            .vote_on_dispute(&seller(), &escrow.invoice_id, false)
            .await,
        Err(Error::NotArbitrator)
    ));
}

#[tokio::test]
async fn safe_escape_requires_unreachable_quorum() {
    let test = create_test_core(3);
    let escrow = funded_escrow(&test, 1_000).await;
    test.core
        .escrow
        .raise_dispute(&buyer(), &escrow.invoice_id)
        .await
        .expect("raise");

    // Live roster (3) still meets the quorum (⌈3 × 51/100⌉ = 2).
    assert!(matches!(
        test.core
            .escrow
            .safe_escape(&admin(), &escrow.invoice_id, true)
            .await,
        Err(Error::QuorumReachable)
    ));

    for index in 0..3 {
        test.core.params().remove_arbitrator(&arbitrator(index).address);
    }
    let outcome = test
        .core
        .escrow
        .safe_escape(&admin(), &escrow.invoice_id, true)
        .await
        .expect("escape");
    assert_eq!(outcome.state, SagaState::Completed);
    assert_eq!(
        test.ledger.balance_of(&seller().address).await,
        Amount::from(995)
    );
}

#[tokio::test]
async fn financing_pipeline_draws_liquidity_and_logs_the_audit_trail() {
    use torc_common::ledger::LedgerOperation;

    let test = create_test_core(0);
    let escrow = funded_escrow(&test, 1_000).await;

    assert!(matches!(
        test.core
            .escrow
            .fund_invoice(
                &seller(),
                &escrow.invoice_id,
                Amount::from(900),
                seller().address
            )
            .await,
        Err(Error::AdminRequired)
    ));

    let outcome = test
        .core
        .escrow
        .fund_invoice(
            &admin(),
            &escrow.invoice_id,
            Amount::from(900),
            seller().address,
        )
        .await
        .expect("fund");
    assert_eq!(outcome.state, SagaState::Completed);

    let saga = test
        .core
        .sagas
        .read(&outcome.correlation_id)
        .await
        .expect("saga");
    assert_eq!(
        saga.steps_completed,
        vec![SagaStep::ExternalLiquidity, SagaStep::DbUpdate]
    );

    let submissions = test.ledger.submissions().await;
    assert!(submissions
        .iter()
        .any(|(op, _)| *op == LedgerOperation::Fund));

    let audit = test
        .store
        .list_audit_records(&outcome.correlation_id)
        .await
        .expect("audit");
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, "invoice_funded");
}

#[tokio::test]
async fn collateral_follows_the_release_winner_rule() {
    use torc_common::address::Address;
    use torc_common::escrow::RwaCollateral;

    let test = create_test_core(0);
    let mut request = escrow_request(1_000);
    request.rwa = Some(RwaCollateral {
        contract: Address::new("0xrwa"),
        token_id: 42,
    });
    let invoice_id = request.invoice_id;
    let key = invoice_id.to_ledger_key();

    test.core
        .escrow
        .create(&admin(), request)
        .await
        .expect("create");
    // Custody taken at creation.
    assert_eq!(
        test.ledger.nft_holder(&key).await,
        Some(Address::new("0xescrow"))
    );

    test.core
        .escrow
        .deposit(&buyer(), &invoice_id)
        .await
        .expect("deposit");
    test.core
        .escrow
        .confirm_release(&seller(), &invoice_id)
        .await
        .expect("seller confirm");
    test.core
        .escrow
        .confirm_release(&buyer(), &invoice_id)
        .await
        .expect("buyer confirm");

    // Normal release: seller wins the funds, the buyer receives the NFT.
    assert_eq!(test.ledger.nft_holder(&key).await, Some(buyer().address));
}

#[tokio::test]
async fn reclaim_returns_funds_after_expiry() {
    let test = create_test_core(0);
    let escrow = funded_escrow(&test, 1_000).await;

    assert!(matches!(
        test.core.escrow.reclaim_expired(&buyer(), &escrow.invoice_id).await,
        Err(Error::NotExpired)
    ));

    // Age the deadline past now.
    let mut aged = test
        .store
        .get_escrow(&escrow.invoice_id)
        .await
        .expect("get")
        .expect("mirror");
    aged.expires_at = unix_time() - 10;
    let mut tx = test.store.begin_transaction().await.expect("begin");
    tx.upsert_escrow(&aged).await.expect("upsert");
    tx.commit().await.expect("commit");

    assert!(matches!(
        test.core.escrow.reclaim_expired(&seller(), &escrow.invoice_id).await,
        Err(Error::NotBuyer)
    ));

    let reclaimed = test
        .core
        .escrow
        .reclaim_expired(&buyer(), &escrow.invoice_id)
        .await
        .expect("reclaim");
    assert_eq!(reclaimed.status, EscrowStatus::Expired);
    assert_eq!(
        test.ledger.balance_of(&buyer().address).await,
        Amount::from(1_000)
    );
}
