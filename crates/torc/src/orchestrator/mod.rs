//! Orchestrator
//!
//! Wires the subsystems together over one store, one ledger client and one
//! publish sink, and supervises the long-running workers: recovery tick,
//! stuck-saga scan, DLQ sampler, reconciliation scheduler and the event
//! ingestion loop. Shutdown is cooperative; every worker finishes its
//! current unit of work before stopping, which keeps the saga log consistent
//! because each unit of work ends at a saga state boundary.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinSet;
use torc_common::config::{SchedulerConfig, SharedParams};
use torc_common::database::DynStore;
use torc_common::error::Error;
use torc_common::reconciliation::RunType;

use crate::escrow::EscrowService;
use crate::health::HealthMonitor;
use crate::ingest::EventIngestor;
use crate::reconcile::ReconciliationEngine;
use crate::recovery::{CompensationExecutor, RecoveryPipeline};
use crate::saga::SagaManager;

mod builder;

pub use builder::OrchestratorBuilder;

/// The assembled core
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) store: DynStore,
    pub(crate) config: SchedulerConfig,
    pub(crate) params: SharedParams,
    /// Saga manager
    pub sagas: Arc<SagaManager>,
    /// Recovery tick worker and DLQ surface
    pub recovery: Arc<RecoveryPipeline>,
    /// Escrow protocol service
    pub escrow: Arc<EscrowService>,
    /// Ledger event ingestor
    pub ingestor: Arc<EventIngestor>,
    /// Reconciliation engine
    pub reconciliation: Arc<ReconciliationEngine>,
    /// Health monitor
    pub health: Arc<HealthMonitor>,
    /// Operator compensation executor
    pub compensation: Arc<CompensationExecutor>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Start building an orchestrator
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Runtime-updatable protocol parameters
    pub fn params(&self) -> &SharedParams {
        &self.params
    }

    /// Scheduler configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Store handle
    pub fn store(&self) -> DynStore {
        Arc::clone(&self.store)
    }

    /// Spawn the long-running workers and block until shutdown
    ///
    /// Workers: recovery tick, stuck-saga scan, DLQ sampler, reconciliation
    /// scheduler, event ingestion. Each stops at its next suspension point
    /// after `shutdown` is notified.
    pub async fn start_workers(&self, shutdown: Arc<Notify>) -> Result<(), Error> {
        let mut join_set = JoinSet::new();

        {
            let recovery = Arc::clone(&self.recovery);
            let shutdown = Arc::clone(&shutdown);
            let interval = self.config.recovery_tick_interval;
            join_set.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.notified() => break,
                        _ = ticker.tick() => {
                            if let Err(err) = recovery.tick().await {
                                tracing::error!("recovery tick failed: {}", err);
                            }
                        }
                    }
                }
                tracing::info!("recovery worker stopped");
            });
        }

        {
            let health = Arc::clone(&self.health);
            let shutdown = Arc::clone(&shutdown);
            let interval = self.config.stuck_scan_interval;
            join_set.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.notified() => break,
                        _ = ticker.tick() => {
                            if let Err(err) = health.sample_stuck().await {
                                tracing::error!("stuck-saga scan failed: {}", err);
                            }
                        }
                    }
                }
                tracing::info!("stuck-saga worker stopped");
            });
        }

        {
            let health = Arc::clone(&self.health);
            let shutdown = Arc::clone(&shutdown);
            let interval = self.config.dlq_sample_interval;
            join_set.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.notified() => break,
                        _ = ticker.tick() => {
                            if let Err(err) = health.sample_dlq().await {
                                tracing::error!("dlq sampler failed: {}", err);
                            }
                        }
                    }
                }
                tracing::info!("dlq sampler stopped");
            });
        }

        {
            let reconciliation = Arc::clone(&self.reconciliation);
            let shutdown = Arc::clone(&shutdown);
            let interval = self.config.reconciliation_interval;
            join_set.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick of a tokio interval fires immediately; skip
                // it so the scheduler waits a full period after startup.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.notified() => break,
                        _ = ticker.tick() => {
                            if let Err(err) =
                                reconciliation.run(RunType::Scheduled, None).await
                            {
                                tracing::error!("scheduled reconciliation failed: {}", err);
                            }
                        }
                    }
                }
                tracing::info!("reconciliation scheduler stopped");
            });
        }

        {
            let ingestor = Arc::clone(&self.ingestor);
            let shutdown = Arc::clone(&shutdown);
            join_set.spawn(async move {
                if let Err(err) = ingestor.run(shutdown).await {
                    tracing::error!("event ingestion stopped with error: {}", err);
                }
            });
        }

        while let Some(result) = join_set.join_next().await {
            if let Err(err) = result {
                tracing::warn!("worker task panicked: {}", err);
            }
        }

        tracing::info!("all workers stopped");
        Ok(())
    }
}
