//! Tests for the recovery pipeline
//!
//! Covers queue upserts and backoff, DLQ promotion atomicity, and tick
//! re-execution through the handler registry.

#![cfg(test)]

use std::sync::Arc;

use serde_json::{json, Value};
use torc_common::database::{DbTransactionFinalizer, Store, StoreTransaction};
use torc_common::ledger::{LedgerEvent, TxHash};
use torc_common::recovery::{CompensationStatus, RecoveryStatus};
use torc_common::saga::{OperationType, SagaState, SagaStep};
use torc_common::util::unix_time;
use uuid::Uuid;

use crate::recovery::RecoveryQueue;
use crate::saga::SagaUpdate;
use crate::test_helpers::{admin, create_test_core, escrow_request, TestCore};

async fn begin_failed_saga(test: &TestCore, operation_type: OperationType) -> Uuid {
    let correlation_id = test
        .core
        .sagas
        .begin(
            operation_type,
            "escrow",
            "inv-test",
            vec![SagaStep::DbUpdate],
            Value::Null,
            admin().address,
            None,
        )
        .await
        .expect("begin");
    test.core
        .sagas
        .advance(&correlation_id, SagaState::Processing, SagaUpdate::default())
        .await
        .expect("processing");
    test.core
        .sagas
        .advance(&correlation_id, SagaState::Failed, SagaUpdate::default())
        .await
        .expect("failed");
    correlation_id
}

fn local_queue(test: &TestCore) -> RecoveryQueue {
    RecoveryQueue::new(
        Arc::new(test.store.clone()),
        Arc::clone(&test.core.sagas),
        5,
        60,
    )
}

/// Rewind an entry's `next_retry_at` so the next tick claims it.
async fn make_due(test: &TestCore, correlation_id: &Uuid) {
    let mut entry = test
        .store
        .get_recovery_entry(correlation_id)
        .await
        .expect("get")
        .expect("entry");
    entry.next_retry_at = unix_time().saturating_sub(1);
    let mut tx = test.store.begin_transaction().await.expect("begin");
    tx.upsert_recovery_entry(&entry).await.expect("upsert");
    tx.commit().await.expect("commit");
}

#[tokio::test]
async fn enqueue_replaces_the_row_and_doubles_backoff() {
    let test = create_test_core(0);
    let queue = local_queue(&test);
    let correlation_id = begin_failed_saga(&test, OperationType::EscrowRelease).await;

    let first = queue
        .enqueue(
            &correlation_id,
            OperationType::EscrowRelease,
            Value::Null,
            1,
            "rpc timeout",
        )
        .await
        .expect("enqueue");
    assert_eq!(first.retry_count, 1);
    assert_eq!(first.next_retry_at - first.updated_at, 120);

    let second = queue
        .enqueue(
            &correlation_id,
            OperationType::EscrowRelease,
            Value::Null,
            2,
            "rpc timeout",
        )
        .await
        .expect("enqueue");
    assert_eq!(second.retry_count, 2);
    assert_eq!(second.next_retry_at - second.updated_at, 240);

    // Upsert, not insert: still exactly one pending entry.
    assert_eq!(
        test.store.pending_recovery_count().await.expect("count"),
        1
    );
}

#[tokio::test]
async fn promotion_is_atomic_and_creates_the_compensation_action() {
    let test = create_test_core(0);
    let queue = local_queue(&test);
    let correlation_id = begin_failed_saga(&test, OperationType::EscrowRelease).await;
    queue
        .enqueue(
            &correlation_id,
            OperationType::EscrowRelease,
            json!({"ctx": "opaque"}),
            5,
            "store down",
        )
        .await
        .expect("enqueue");

    let entry = queue
        .promote_to_dlq(
            &correlation_id,
            OperationType::EscrowRelease,
            json!({"ctx": "opaque"}),
            "store down",
            5,
            true,
        )
        .await
        .expect("promote");
    assert!(entry.requires_compensation);
    assert_eq!(entry.compensation_status, CompensationStatus::Pending);

    // Every DLQ entry has exactly one saga in `dlq`.
    let saga = test.core.sagas.read(&correlation_id).await.expect("saga");
    assert_eq!(saga.current_state, SagaState::Dlq);
    assert!(saga.completed_at.is_some());
    assert_eq!(
        test.store
            .count_sagas_by_state(SagaState::Dlq)
            .await
            .expect("count"),
        1
    );
    assert_eq!(test.store.dlq_size().await.expect("size"), 1);

    let action = test
        .store
        .get_compensation_action(&correlation_id)
        .await
        .expect("get")
        .expect("action");
    assert_eq!(action.status, CompensationStatus::Pending);

    // The retry row is gone.
    assert!(test
        .store
        .get_recovery_entry(&correlation_id)
        .await
        .expect("get")
        .is_none());
}

#[tokio::test]
async fn tick_with_nothing_due_is_a_no_op() {
    let test = create_test_core(0);
    let report = test.core.recovery.tick().await.expect("tick");
    assert_eq!(report.claimed, 0);
    assert_eq!(report.completed, 0);
}

#[tokio::test]
async fn tick_retries_event_processing_until_the_store_recovers() {
    let test = create_test_core(0);
    let queue = local_queue(&test);

    let escrow = test
        .core
        .escrow
        .create(&admin(), escrow_request(1_000))
        .await
        .expect("create");

    let event = LedgerEvent {
        name: "EscrowFunded".to_string(),
        args: json!({
            "key": escrow.invoice_id.to_ledger_key(),
            "amount": "1000",
        }),
        tx_hash: TxHash("0xevent1".to_string()),
        log_index: 0,
        block_number: 7,
    };
    let event_json = serde_json::to_value(&event).expect("serialize");

    let correlation_id = begin_failed_saga(&test, OperationType::EventProcessing).await;
    queue
        .enqueue(
            &correlation_id,
            OperationType::EventProcessing,
            event_json,
            1,
            "injected",
        )
        .await
        .expect("enqueue");

    // First tick fails on the scripted store outage and re-queues.
    make_due(&test, &correlation_id).await;
    test.store.fail_next("upsert_escrow", 1).await;
    let report = test.core.recovery.tick().await.expect("tick");
    assert_eq!(report.claimed, 1);
    assert_eq!(report.requeued, 1);
    let entry = test
        .store
        .get_recovery_entry(&correlation_id)
        .await
        .expect("get")
        .expect("entry");
    assert_eq!(entry.retry_count, 2);
    assert_eq!(entry.status, RecoveryStatus::Pending);

    // Second tick succeeds and completes the saga.
    make_due(&test, &correlation_id).await;
    let report = test.core.recovery.tick().await.expect("tick");
    assert_eq!(report.completed, 1);

    let saga = test.core.sagas.read(&correlation_id).await.expect("saga");
    assert_eq!(saga.current_state, SagaState::Completed);
    assert_eq!(saga.steps_completed, vec![SagaStep::DbUpdate]);
    assert!(test
        .store
        .get_recovery_entry(&correlation_id)
        .await
        .expect("get")
        .is_none());

    let mirror = test
        .store
        .get_escrow(&escrow.invoice_id)
        .await
        .expect("get")
        .expect("mirror");
    assert_eq!(mirror.status, torc_common::escrow::EscrowStatus::Funded);
}

#[tokio::test]
async fn dlq_resolution_is_admin_only_and_stamps_the_entry() {
    let test = create_test_core(0);
    let queue = local_queue(&test);
    let correlation_id = begin_failed_saga(&test, OperationType::EscrowRelease).await;
    queue
        .promote_to_dlq(
            &correlation_id,
            OperationType::EscrowRelease,
            Value::Null,
            "gave up",
            5,
            false,
        )
        .await
        .expect("promote");

    assert!(matches!(
        test.core
            .recovery
            .resolve_dlq(
                &correlation_id,
                &torc_common::address::Principal::user("0xnobody"),
                "nope"
            )
            .await,
        Err(torc_common::error::Error::AdminRequired)
    ));

    let entry = test
        .core
        .recovery
        .resolve_dlq(&correlation_id, &admin(), "confirmed manually")
        .await
        .expect("resolve");
    assert!(entry.is_resolved());
    assert_eq!(entry.resolution_notes.as_deref(), Some("confirmed manually"));

    let listed = test.core.recovery.list_dlq(10, 0).await.expect("list");
    assert_eq!(listed.len(), 1);
    assert!(listed[0].is_resolved());
}

#[tokio::test]
async fn unregistered_operation_types_fail_without_retry() {
    let test = create_test_core(0);
    let queue = local_queue(&test);
    let correlation_id = begin_failed_saga(&test, OperationType::Tokenization).await;
    queue
        .enqueue(
            &correlation_id,
            OperationType::Tokenization,
            Value::Null,
            1,
            "boom",
        )
        .await
        .expect("enqueue");

    make_due(&test, &correlation_id).await;
    let report = test.core.recovery.tick().await.expect("tick");
    assert_eq!(report.failed, 1);

    let entry = test
        .store
        .get_recovery_entry(&correlation_id)
        .await
        .expect("get")
        .expect("entry");
    assert_eq!(entry.status, RecoveryStatus::Failed);
    assert_eq!(
        test.core.sagas.read(&correlation_id).await.expect("saga").current_state,
        SagaState::Failed
    );

    // A further tick does not pick the failed entry back up.
    let report = test.core.recovery.tick().await.expect("tick");
    assert_eq!(report.claimed, 0);
}
