//! End-to-end settlement flows over the memory store and the fake ledger

use std::sync::Arc;

use torc_common::address::{Address, Principal};
use torc_common::amount::Amount;
use torc_common::config::SchedulerConfig;
use torc_common::database::{DbTransactionFinalizer, Store, StoreTransaction};
use torc_common::escrow::{EscrowStatus, Token};
use torc_common::invoice::InvoiceId;
use torc_common::publish::{BroadcastSink, DomainEvent};
use torc_common::recovery::CompensationStatus;
use torc_common::saga::{SagaState, SagaStep};
use torc_common::util::unix_time;
use torc_fake_ledger::{FakeLedger, ScriptedFailure};
use torc_memory::MemoryStore;
use torc::escrow::CreateEscrowRequest;
use torc::Orchestrator;
use uuid::Uuid;

struct Harness {
    core: Orchestrator,
    ledger: Arc<FakeLedger>,
    store: MemoryStore,
    sink: BroadcastSink,
}

fn admin() -> Principal {
    Principal::admin("0xadmin")
}

fn seller() -> Principal {
    Principal::user("0xseller")
}

fn buyer() -> Principal {
    Principal::user("0xbuyer")
}

fn treasury() -> Address {
    Address::new("0xtreasury")
}

fn arbitrator(index: usize) -> Principal {
    Principal::user(format!("0xarb{index:02}"))
}

fn harness(arbitrator_count: usize) -> Harness {
    // Only the first test to run installs the subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let store = MemoryStore::new();
    let ledger = Arc::new(FakeLedger::new());
    let sink = BroadcastSink::new(64);

    let core = Orchestrator::builder()
        .with_store(Arc::new(store.clone()))
        .with_ledger(ledger.clone())
        .with_publisher(Arc::new(sink.clone()))
        .with_config(SchedulerConfig::default())
        .with_treasury(treasury())
        .with_arbitrators(
            (0..arbitrator_count)
                .map(|i| arbitrator(i).address)
                .collect(),
        )
        .build()
        .expect("orchestrator wiring");

    Harness {
        core,
        ledger,
        store,
        sink,
    }
}

fn request(amount: u64) -> CreateEscrowRequest {
    CreateEscrowRequest {
        invoice_id: InvoiceId::new(),
        seller: seller().address,
        buyer: buyer().address,
        amount: Amount::from(amount),
        token: Token::Native,
        duration_secs: 3_600,
        rwa: None,
        discount_rate_bps: 0,
        discount_deadline: None,
    }
}

async fn funded(harness: &Harness, amount: u64) -> InvoiceId {
    let escrow = harness
        .core
        .escrow
        .create(&admin(), request(amount))
        .await
        .expect("create");
    harness
        .core
        .escrow
        .deposit(&buyer(), &escrow.invoice_id)
        .await
        .expect("deposit");
    escrow.invoice_id
}

/// Rewind a retry entry so the next tick claims it immediately.
async fn make_due(harness: &Harness, correlation_id: &Uuid) {
    let mut entry = harness
        .store
        .get_recovery_entry(correlation_id)
        .await
        .expect("get")
        .expect("entry");
    entry.next_retry_at = unix_time().saturating_sub(1);
    let mut tx = harness.store.begin_transaction().await.expect("begin");
    tx.upsert_recovery_entry(&entry).await.expect("upsert");
    tx.commit().await.expect("commit");
}

#[tokio::test]
async fn happy_path_release_pays_fee_then_seller() {
    let harness = harness(0);
    let mut events = harness.sink.subscribe();
    let invoice_id = funded(&harness, 1_000).await;

    harness
        .core
        .escrow
        .confirm_release(&seller(), &invoice_id)
        .await
        .expect("seller confirm");
    let outcome = harness
        .core
        .escrow
        .confirm_release(&buyer(), &invoice_id)
        .await
        .expect("buyer confirm");

    let release = outcome.release.expect("release fired");
    assert_eq!(release.state, SagaState::Completed);

    // Fee 1000 × 50bps = 5 to the treasury, 995 to the seller; together the
    // original amount.
    assert_eq!(
        harness.ledger.balance_of(&treasury()).await,
        Amount::from(5)
    );
    assert_eq!(
        harness.ledger.balance_of(&seller().address).await,
        Amount::from(995)
    );

    let mirror = harness
        .store
        .get_escrow(&invoice_id)
        .await
        .expect("get")
        .expect("mirror");
    assert_eq!(mirror.status, EscrowStatus::Released);

    let saga = harness
        .core
        .sagas
        .read(&release.correlation_id)
        .await
        .expect("saga");
    assert_eq!(saga.current_state, SagaState::Completed);
    assert!(saga.steps_remaining.is_empty());
    assert_eq!(
        saga.steps_completed,
        vec![SagaStep::BlockchainTx, SagaStep::DbUpdate, SagaStep::AuditLog]
    );

    let mut saw_release = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, DomainEvent::EscrowReleased { .. }) {
            saw_release = true;
        }
    }
    assert!(saw_release);
}

#[tokio::test]
async fn transient_ledger_failures_converge_through_retries() {
    let harness = harness(0);
    let invoice_id = funded(&harness, 1_000).await;

    harness
        .core
        .escrow
        .confirm_release(&seller(), &invoice_id)
        .await
        .expect("seller confirm");
    harness
        .ledger
        .script_submit_failures(
            torc_common::ledger::LedgerOperation::Release,
            vec![ScriptedFailure::Transient, ScriptedFailure::Transient],
        )
        .await;

    let outcome = harness
        .core
        .escrow
        .confirm_release(&buyer(), &invoice_id)
        .await
        .expect("buyer confirm");
    let release = outcome.release.expect("release attempted");
    assert_eq!(release.state, SagaState::Failed);
    let correlation_id = release.correlation_id;

    // First failure: retry_count 1, backoff 2 minutes.
    let entry = harness
        .store
        .get_recovery_entry(&correlation_id)
        .await
        .expect("get")
        .expect("entry");
    assert_eq!(entry.retry_count, 1);
    assert_eq!(entry.next_retry_at - entry.updated_at, 120);

    // Second failure: the row is replaced, retry_count 2, backoff 4 minutes.
    make_due(&harness, &correlation_id).await;
    let report = harness.core.recovery.tick().await.expect("tick");
    assert_eq!(report.requeued, 1);
    let entry = harness
        .store
        .get_recovery_entry(&correlation_id)
        .await
        .expect("get")
        .expect("entry");
    assert_eq!(entry.retry_count, 2);
    assert_eq!(entry.next_retry_at - entry.updated_at, 240);

    // Third attempt succeeds.
    make_due(&harness, &correlation_id).await;
    let report = harness.core.recovery.tick().await.expect("tick");
    assert_eq!(report.completed, 1);

    let saga = harness
        .core
        .sagas
        .read(&correlation_id)
        .await
        .expect("saga");
    assert_eq!(saga.current_state, SagaState::Completed);
    assert_eq!(harness.store.dlq_size().await.expect("dlq"), 0);
    assert!(harness
        .store
        .get_recovery_entry(&correlation_id)
        .await
        .expect("get")
        .is_none());

    // Paid exactly once.
    assert_eq!(
        harness.ledger.balance_of(&seller().address).await,
        Amount::from(995)
    );
}

#[tokio::test]
async fn persistent_store_failure_promotes_with_compensation() {
    let harness = harness(0);
    let invoice_id = funded(&harness, 1_000).await;
    let key = invoice_id.to_ledger_key();
    harness.ledger.set_required_approvals(key, 1).await;

    // Ledger succeeds, then five consecutive store failures on the mirror
    // update exhaust the retry budget.
    harness.store.fail_next("upsert_escrow", 5).await;
    let outcome = harness
        .core
        .escrow
        .approve_release(&seller(), &invoice_id)
        .await
        .expect("approve");
    let release = outcome.release.expect("release attempted");
    assert_eq!(release.state, SagaState::Failed);
    let correlation_id = release.correlation_id;

    // The ledger side committed before the store failed.
    let after_first = harness
        .core
        .sagas
        .read(&correlation_id)
        .await
        .expect("saga");
    assert!(after_first.steps_completed.contains(&SagaStep::BlockchainTx));

    for _ in 0..4 {
        make_due(&harness, &correlation_id).await;
        harness.core.recovery.tick().await.expect("tick");
    }

    let saga = harness
        .core
        .sagas
        .read(&correlation_id)
        .await
        .expect("saga");
    assert_eq!(saga.current_state, SagaState::Dlq);

    let dlq = harness
        .store
        .get_dlq_entry(&correlation_id)
        .await
        .expect("get")
        .expect("dlq entry");
    assert!(dlq.requires_compensation);
    assert_eq!(dlq.compensation_status, CompensationStatus::Pending);

    let action = harness
        .store
        .get_compensation_action(&correlation_id)
        .await
        .expect("get")
        .expect("action");
    assert_eq!(action.status, CompensationStatus::Pending);

    // No further retries are scheduled.
    assert!(harness
        .store
        .get_recovery_entry(&correlation_id)
        .await
        .expect("get")
        .is_none());
    assert_eq!(harness.core.recovery.tick().await.expect("tick").claimed, 0);

    // Operator runs the refund path: the buyer gets the escrowed amount
    // back and the saga ends compensated.
    assert!(matches!(
        harness
            .core
            .compensation
            .execute(&correlation_id, &seller())
            .await,
        Err(torc_common::error::Error::AdminRequired)
    ));
    let action = harness
        .core
        .compensation
        .execute(&correlation_id, &admin())
        .await
        .expect("compensate");
    assert_eq!(action.status, CompensationStatus::Completed);

    assert_eq!(
        harness.ledger.balance_of(&buyer().address).await,
        Amount::from(1_000)
    );
    let saga = harness
        .core
        .sagas
        .read(&correlation_id)
        .await
        .expect("saga");
    assert_eq!(saga.current_state, SagaState::Compensated);

    let dlq = harness
        .store
        .get_dlq_entry(&correlation_id)
        .await
        .expect("get")
        .expect("dlq entry");
    assert!(dlq.is_resolved());
    assert_eq!(dlq.compensation_status, CompensationStatus::Completed);
}

#[tokio::test]
async fn quorum_shrinks_as_arbitrators_leave() {
    let harness = harness(10);
    let invoice_id = funded(&harness, 1_000).await;
    let vote = harness
        .core
        .escrow
        .raise_dispute(&buyer(), &invoice_id)
        .await
        .expect("raise");
    assert_eq!(vote.snapshot_arbitrator_count, 10);

    // Threshold ⌈10 × 51/100⌉ = 6: three votes resolve nothing.
    for (index, for_buyer) in [(0, false), (1, false), (2, true)] {
        let outcome = harness
            .core
            .escrow
            .vote_on_dispute(&arbitrator(index), &invoice_id, for_buyer)
            .await
            .expect("vote");
        assert!(outcome.resolution.is_none());
    }

    // Five arbitrators leave; the live roster is down to 5.
    for index in 5..10 {
        harness
            .core
            .params()
            .remove_arbitrator(&arbitrator(index).address);
    }

    // The fourth vote clamps the snapshot to 5, the threshold becomes
    // ⌈5 × 51/100⌉ = 3, and 4 votes resolve the dispute 3–1 for the seller.
    let outcome = harness
        .core
        .escrow
        .vote_on_dispute(&arbitrator(3), &invoice_id, false)
        .await
        .expect("vote");
    let resolution = outcome.resolution.expect("resolution fired");
    assert_eq!(resolution.state, SagaState::Completed);
    assert_eq!(outcome.vote.snapshot_arbitrator_count, 5);
    assert_eq!(outcome.vote.votes_for_seller, 3);
    assert_eq!(outcome.vote.votes_for_buyer, 1);
    assert!(outcome.vote.resolved);

    assert_eq!(
        harness.ledger.balance_of(&seller().address).await,
        Amount::from(995)
    );
    let mirror = harness
        .store
        .get_escrow(&invoice_id)
        .await
        .expect("get")
        .expect("mirror");
    assert_eq!(mirror.status, EscrowStatus::Released);
}

#[tokio::test]
async fn safe_escape_unblocks_an_unreachable_quorum() {
    let harness = harness(10);
    let invoice_id = funded(&harness, 1_000).await;
    harness
        .core
        .escrow
        .raise_dispute(&buyer(), &invoice_id)
        .await
        .expect("raise");

    // 2–2 with a threshold of 6: frozen.
    for (index, for_buyer) in [(0, true), (1, true), (2, false), (3, false)] {
        let outcome = harness
            .core
            .escrow
            .vote_on_dispute(&arbitrator(index), &invoice_id, for_buyer)
            .await
            .expect("vote");
        assert!(outcome.resolution.is_none());
    }

    // While the roster could still reach quorum, escape is refused.
    assert!(matches!(
        harness
            .core
            .escrow
            .safe_escape(&admin(), &invoice_id, true)
            .await,
        Err(torc_common::error::Error::QuorumReachable)
    ));

    for index in 0..10 {
        harness
            .core
            .params()
            .remove_arbitrator(&arbitrator(index).address);
    }

    let outcome = harness
        .core
        .escrow
        .safe_escape(&admin(), &invoice_id, true)
        .await
        .expect("escape");
    assert_eq!(outcome.state, SagaState::Completed);
    assert_eq!(
        harness.ledger.balance_of(&seller().address).await,
        Amount::from(995)
    );
}

#[tokio::test]
async fn reconciliation_flags_a_drifted_status() {
    let harness = harness(0);
    let invoice_id = funded(&harness, 500).await;
    let key = invoice_id.to_ledger_key();

    // Ledger says released, the mirror still says funded.
    let mut record = harness.ledger.escrow_record(&key).await.expect("record");
    record.status_code = 3;
    harness.ledger.set_escrow(key, record).await;

    let summary = harness
        .core
        .reconciliation
        .run(torc_common::reconciliation::RunType::Manual, None)
        .await
        .expect("run");

    assert_eq!(summary.discrepancy_count, 1);
    assert_eq!(summary.matched_count, summary.total_count - 1);

    let rows = harness
        .core
        .reconciliation
        .discrepancies(None, 10, 0)
        .await
        .expect("rows");
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.invoice_id, invoice_id);
    assert_eq!(
        row.discrepancy_type,
        torc_common::reconciliation::DiscrepancyType::StatusMismatch
    );
    assert_eq!(row.chain_status.to_string(), "released");
    assert_eq!(row.db_status.to_string(), "funded");
    assert!(row
        .notes
        .as_deref()
        .unwrap_or_default()
        .contains("Status mismatch"));
}
