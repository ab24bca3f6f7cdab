//! Pipeline health monitor
//!
//! Computes the aggregate pipeline view on demand and persists periodic
//! samples (DLQ depth, stuck saga count) as append-only metric rows.

use std::time::Duration;

use serde_json::json;
use torc_common::database::{DbTransactionFinalizer, DynStore, Store, StoreTransaction};
use torc_common::error::Error;
use torc_common::health::{HealthMetric, MetricType, PipelineHealth};
use torc_common::saga::SagaState;
use torc_common::util::unix_time;
use tracing::instrument;

/// Completed sagas inspected for the processing-time average
const PROCESSING_TIME_SAMPLE: usize = 100;

/// Health monitor
#[derive(Clone)]
pub struct HealthMonitor {
    store: DynStore,
    stuck_age: Duration,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor").finish_non_exhaustive()
    }
}

impl HealthMonitor {
    /// Create a monitor
    pub fn new(store: DynStore, stuck_age: Duration) -> Self {
        HealthMonitor { store, stuck_age }
    }

    /// Aggregate view of the pipeline, computed from the store
    #[instrument(skip_all)]
    pub async fn snapshot(&self) -> Result<PipelineHealth, Error> {
        let now = unix_time();
        let completed = self.store.count_sagas_by_state(SagaState::Completed).await?;
        let failed = self.store.count_sagas_by_state(SagaState::Failed).await?;
        let dlq = self.store.count_sagas_by_state(SagaState::Dlq).await?;
        let compensated = self
            .store
            .count_sagas_by_state(SagaState::Compensated)
            .await?;

        let terminal = completed + failed + dlq + compensated;
        let denominator = terminal.max(1) as f64;

        let recent = self.store.list_completed_sagas(PROCESSING_TIME_SAMPLE).await?;
        let avg_processing_time_secs = if recent.is_empty() {
            0.0
        } else {
            let total: u64 = recent
                .iter()
                .map(|s| s.completed_at.unwrap_or(s.updated_at) - s.created_at)
                .sum();
            total as f64 / recent.len() as f64
        };

        let stuck = self
            .store
            .get_stuck_sagas(now.saturating_sub(self.stuck_age.as_secs()))
            .await?;

        Ok(PipelineHealth {
            success_rate: completed as f64 / denominator,
            error_rate: (failed + dlq) as f64 / denominator,
            compensation_rate: compensated as f64 / denominator,
            pending_retries: self.store.pending_recovery_count().await?,
            dlq_size: self.store.dlq_size().await?,
            stuck_sagas: stuck.len() as u64,
            avg_processing_time_secs,
            recorded_at: now,
        })
    }

    /// Persist a DLQ depth sample
    #[instrument(skip_all)]
    pub async fn sample_dlq(&self) -> Result<HealthMetric, Error> {
        let metric = HealthMetric {
            metric_type: MetricType::DlqSize,
            metric_name: "dlq_sampler".to_string(),
            metric_value: self.store.dlq_size().await? as f64,
            recorded_at: unix_time(),
            metadata: json!({}),
        };

        let mut tx = self.store.begin_transaction().await?;
        tx.add_health_metric(&metric).await?;
        tx.commit().await?;
        Ok(metric)
    }

    /// Persist a stuck-saga count sample and return the stuck sagas
    #[instrument(skip_all)]
    pub async fn sample_stuck(&self) -> Result<HealthMetric, Error> {
        let now = unix_time();
        let stuck = self
            .store
            .get_stuck_sagas(now.saturating_sub(self.stuck_age.as_secs()))
            .await?;

        for saga in &stuck {
            tracing::warn!(
                "saga {} stuck in {} since {}",
                saga.correlation_id,
                saga.current_state,
                saga.updated_at
            );
        }

        let metric = HealthMetric {
            metric_type: MetricType::StuckTransactions,
            metric_name: "stuck_scan".to_string(),
            metric_value: stuck.len() as f64,
            recorded_at: now,
            metadata: json!({
                "correlation_ids": stuck
                    .iter()
                    .map(|s| s.correlation_id.to_string())
                    .collect::<Vec<_>>(),
            }),
        };

        let mut tx = self.store.begin_transaction().await?;
        tx.add_health_metric(&metric).await?;
        tx.commit().await?;
        Ok(metric)
    }
}

#[cfg(test)]
mod tests {
    use torc_common::database::Store;
    use torc_common::health::MetricType;

    use crate::test_helpers::{buyer, create_test_core, funded_escrow, seller};

    #[tokio::test]
    async fn snapshot_reflects_completed_sagas() {
        let test = create_test_core(0);
        let escrow = funded_escrow(&test, 1_000).await;
        test.core
            .escrow
            .confirm_release(&seller(), &escrow.invoice_id)
            .await
            .expect("seller confirm");
        test.core
            .escrow
            .confirm_release(&buyer(), &escrow.invoice_id)
            .await
            .expect("buyer confirm");

        let health = test.core.health.snapshot().await.expect("snapshot");
        assert_eq!(health.success_rate, 1.0);
        assert_eq!(health.error_rate, 0.0);
        assert_eq!(health.dlq_size, 0);
        assert_eq!(health.pending_retries, 0);
        assert_eq!(health.stuck_sagas, 0);
    }

    #[tokio::test]
    async fn dlq_sampler_persists_a_metric_row() {
        let test = create_test_core(0);
        let metric = test.core.health.sample_dlq().await.expect("sample");
        assert_eq!(metric.metric_value, 0.0);

        let samples = test
            .store
            .list_health_metrics(MetricType::DlqSize, 10)
            .await
            .expect("list");
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].metric_name, "dlq_sampler");
    }
}
