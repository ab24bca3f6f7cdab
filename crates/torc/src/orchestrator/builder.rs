//! Orchestrator builder

use std::sync::Arc;

use torc_common::address::Address;
use torc_common::config::{ProtocolParams, SchedulerConfig, SharedParams};
use torc_common::database::DynStore;
use torc_common::error::Error;
use torc_common::ledger::DynLedgerClient;
use torc_common::publish::{DynPublishSink, NoopSink};
use torc_common::saga::OperationType;

use super::Orchestrator;
use crate::escrow::EscrowService;
use crate::health::HealthMonitor;
use crate::ingest::EventIngestor;
use crate::reconcile::ReconciliationEngine;
use crate::recovery::handlers::{
    EscrowReleaseHandler, EventProcessingHandler, FinancingHandler, HandlerRegistry,
    OperationRunner,
};
use crate::recovery::{CompensationExecutor, RecoveryPipeline, RecoveryQueue};
use crate::saga::SagaManager;

/// Builds an [`Orchestrator`] from its capabilities
#[derive(Default)]
pub struct OrchestratorBuilder {
    store: Option<DynStore>,
    ledger: Option<DynLedgerClient>,
    publisher: Option<DynPublishSink>,
    config: SchedulerConfig,
    treasury: Option<Address>,
    arbitrators: Vec<Address>,
}

impl std::fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorBuilder").finish_non_exhaustive()
    }
}

impl OrchestratorBuilder {
    /// Empty builder with default configuration
    pub fn new() -> Self {
        OrchestratorBuilder::default()
    }

    /// Set the store backend
    pub fn with_store(mut self, store: DynStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the ledger client
    pub fn with_ledger(mut self, ledger: DynLedgerClient) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Set the publish sink; defaults to a no-op sink
    pub fn with_publisher(mut self, publisher: DynPublishSink) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Override the scheduler configuration
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the fee treasury address
    pub fn with_treasury(mut self, treasury: Address) -> Self {
        self.treasury = Some(treasury);
        self
    }

    /// Seed the arbitrator roster
    pub fn with_arbitrators(mut self, arbitrators: Vec<Address>) -> Self {
        self.arbitrators = arbitrators;
        self
    }

    /// Wire everything together
    pub fn build(self) -> Result<Orchestrator, Error> {
        let store = self
            .store
            .ok_or_else(|| Error::Internal("orchestrator requires a store".to_string()))?;
        let ledger = self
            .ledger
            .ok_or_else(|| Error::Internal("orchestrator requires a ledger client".to_string()))?;
        let treasury = self
            .treasury
            .ok_or_else(|| Error::Internal("orchestrator requires a treasury".to_string()))?;
        let publisher: DynPublishSink = self.publisher.unwrap_or_else(|| Arc::new(NoopSink));
        let config = self.config;

        let params = SharedParams::new(ProtocolParams::new(
            config.fee_basis_points,
            config.quorum_percentage,
            treasury,
            self.arbitrators,
        )?);

        let sagas = Arc::new(SagaManager::new(Arc::clone(&store), config.stuck_saga_age));
        let queue = Arc::new(RecoveryQueue::new(
            Arc::clone(&store),
            Arc::clone(&sagas),
            config.recovery_max_retries,
            config.recovery_backoff_cap_minutes,
        ));

        let mut registry = HandlerRegistry::new();
        let release_handler = Arc::new(EscrowReleaseHandler::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::clone(&sagas),
            Arc::clone(&publisher),
        ));
        registry.register(OperationType::EscrowRelease, release_handler.clone());
        registry.register(OperationType::EscrowDispute, release_handler);
        registry.register(
            OperationType::FinancingPipeline,
            Arc::new(FinancingHandler::new(
                Arc::clone(&store),
                Arc::clone(&ledger),
                Arc::clone(&sagas),
            )),
        );
        registry.register(
            OperationType::EventProcessing,
            Arc::new(EventProcessingHandler::new(
                Arc::clone(&store),
                Arc::clone(&sagas),
            )),
        );
        let registry = Arc::new(registry);

        let runner = Arc::new(OperationRunner::new(
            Arc::clone(&sagas),
            Arc::clone(&queue),
            Arc::clone(&registry),
        ));

        let escrow = Arc::new(EscrowService::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::clone(&sagas),
            Arc::clone(&publisher),
            params.clone(),
            Arc::clone(&runner),
        ));

        let recovery = Arc::new(RecoveryPipeline::new(
            Arc::clone(&store),
            Arc::clone(&sagas),
            Arc::clone(&queue),
            Arc::clone(&registry),
        ));

        let ingestor = Arc::new(EventIngestor::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::clone(&sagas),
            Arc::clone(&queue),
        ));

        let reconciliation = Arc::new(ReconciliationEngine::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            config.clone(),
        ));

        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&store),
            config.stuck_saga_age,
        ));

        let compensation = Arc::new(CompensationExecutor::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::clone(&sagas),
        ));

        Ok(Orchestrator {
            store,
            config,
            params,
            sagas,
            recovery,
            escrow,
            ingestor,
            reconciliation,
            health,
            compensation,
        })
    }
}
