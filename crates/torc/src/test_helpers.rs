//! Shared fixtures for module tests

use std::sync::Arc;

use torc_common::address::{Address, Principal};
use torc_common::amount::Amount;
use torc_common::config::SchedulerConfig;
use torc_common::escrow::{Escrow, Token};
use torc_common::invoice::InvoiceId;
use torc_common::publish::BroadcastSink;
use torc_fake_ledger::FakeLedger;
use torc_memory::MemoryStore;

use crate::escrow::CreateEscrowRequest;
use crate::orchestrator::Orchestrator;

pub(crate) struct TestCore {
    pub core: Orchestrator,
    pub ledger: Arc<FakeLedger>,
    pub store: MemoryStore,
    pub sink: BroadcastSink,
}

pub(crate) fn admin() -> Principal {
    Principal::admin("0xadmin")
}

pub(crate) fn seller() -> Principal {
    Principal::user("0xseller")
}

pub(crate) fn buyer() -> Principal {
    Principal::user("0xbuyer")
}

pub(crate) fn treasury() -> Address {
    Address::new("0xtreasury")
}

pub(crate) fn arbitrator(index: usize) -> Principal {
    Principal::user(format!("0xarb{index:02}"))
}

/// Install the test tracing subscriber; only the first caller wins.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Build an orchestrator over a memory store, a fake ledger and a broadcast
/// sink, with `arbitrator_count` arbitrators seeded on the roster.
pub(crate) fn create_test_core(arbitrator_count: usize) -> TestCore {
    init_tracing();
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

    TestCore {
        core,
        ledger,
        store,
        sink,
    }
}

pub(crate) fn escrow_request(amount: u64) -> CreateEscrowRequest {
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

/// Create and fund an escrow of `amount`, returning the funded mirror row
pub(crate) async fn funded_escrow(test: &TestCore, amount: u64) -> Escrow {
    let escrow = test
        .core
        .escrow
        .create(&admin(), escrow_request(amount))
        .await
        .expect("create");
    test.core
        .escrow
        .deposit(&buyer(), &escrow.invoice_id)
        .await
        .expect("deposit")
}
