//! Saga manager
//!
//! One write per step gives a durable, replayable log: the step list is the
//! saga's program counter, and a retry consults `steps_completed` to skip
//! effects that already committed. All transitions are validated against the
//! saga state table under the store's row lock.

use std::time::Duration;

use serde_json::Value;
use torc_common::address::Address;
use torc_common::database::{DbTransactionFinalizer, DynStore, Store, StoreTransaction};
use torc_common::error::{Error, ErrorKind};
use torc_common::saga::{OperationType, Saga, SagaState, SagaStep};
use torc_common::util::unix_time;
use tracing::instrument;
use uuid::Uuid;

/// In-place retries for store serialization conflicts
pub(crate) const STORE_CONTENTION_ATTEMPTS: u32 = 3;

/// Optional fields applied by [`SagaManager::advance`]
#[derive(Debug, Clone, Default)]
pub struct SagaUpdate {
    /// Replace the completed-step list
    pub steps_completed: Option<Vec<SagaStep>>,
    /// Replace the remaining-step list
    pub steps_remaining: Option<Vec<SagaStep>>,
    /// Replace the context payload
    pub context_data: Option<Value>,
}

/// Create, advance and inspect sagas
#[derive(Clone)]
pub struct SagaManager {
    store: DynStore,
    stuck_age: Duration,
}

impl std::fmt::Debug for SagaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaManager")
            .field("stuck_age", &self.stuck_age)
            .finish_non_exhaustive()
    }
}

impl SagaManager {
    /// Create a manager over `store`
    pub fn new(store: DynStore, stuck_age: Duration) -> Self {
        SagaManager { store, stuck_age }
    }

    /// Insert a new saga in `pending` and return its correlation id
    ///
    /// When `idempotency_key` is supplied and a saga already carries it, the
    /// existing correlation id is returned instead of inserting a duplicate.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(%operation_type))]
    pub async fn begin(
        &self,
        operation_type: OperationType,
        entity_type: &str,
        entity_id: &str,
        steps_remaining: Vec<SagaStep>,
        context_data: Value,
        initiated_by: Address,
        idempotency_key: Option<String>,
    ) -> Result<Uuid, Error> {
        if let Some(key) = idempotency_key.as_deref() {
            if let Some(existing) = self.store.get_saga_by_idempotency_key(key).await? {
                tracing::debug!(
                    "saga begin deduplicated on key `{}` -> {}",
                    key,
                    existing.correlation_id
                );
                return Ok(existing.correlation_id);
            }
        }

        let saga = Saga::new(
            operation_type,
            entity_type,
            entity_id,
            steps_remaining,
            context_data,
            initiated_by,
            idempotency_key,
            unix_time(),
        );

        let mut tx = self.store.begin_transaction().await?;
        if let Err(err) = tx.add_saga(&saga).await {
            tx.rollback().await?;
            return Err(err.into());
        }
        tx.commit().await?;

        tracing::info!(
            "saga {} started: {} on {} {}",
            saga.correlation_id,
            saga.operation_type,
            saga.entity_type,
            saga.entity_id
        );
        Ok(saga.correlation_id)
    }

    /// Atomically transition a saga, applying `update` under the row lock
    ///
    /// Illegal transitions are rejected and leave the row untouched.
    /// Terminal states stamp `completed_at`; completing with steps still
    /// remaining is refused.
    #[instrument(skip_all, fields(%correlation_id, %new_state))]
    pub async fn advance(
        &self,
        correlation_id: &Uuid,
        new_state: SagaState,
        update: SagaUpdate,
    ) -> Result<Saga, Error> {
        let mut attempt = 0;
        loop {
            match self.try_advance(correlation_id, new_state, &update).await {
                Err(err)
                    if err.kind() == ErrorKind::StoreContention
                        && attempt + 1 < STORE_CONTENTION_ATTEMPTS =>
                {
                    attempt += 1;
                    tracing::debug!("saga advance contention, attempt {}", attempt + 1);
                }
                other => return other,
            }
        }
    }

    async fn try_advance(
        &self,
        correlation_id: &Uuid,
        new_state: SagaState,
        update: &SagaUpdate,
    ) -> Result<Saga, Error> {
        let now = unix_time();
        let mut tx = self.store.begin_transaction().await?;
        let mut saga = match tx.get_saga(correlation_id).await? {
            Some(saga) => saga,
            None => {
                tx.rollback().await?;
                return Err(Error::UnknownSaga);
            }
        };

        if !saga.current_state.can_transition_to(new_state) {
            tx.rollback().await?;
            return Err(Error::IllegalSagaTransition {
                from: saga.current_state,
                to: new_state,
            });
        }

        if let Some(steps_completed) = &update.steps_completed {
            saga.steps_completed = steps_completed.clone();
        }
        if let Some(steps_remaining) = &update.steps_remaining {
            saga.steps_remaining = steps_remaining.clone();
        }
        if let Some(context) = &update.context_data {
            saga.context_data = context.clone();
        }

        if new_state == SagaState::Completed && !saga.steps_remaining.is_empty() {
            tx.rollback().await?;
            return Err(Error::StepsRemaining);
        }

        saga.current_state = new_state;
        saga.updated_at = now;
        if new_state.is_terminal() {
            saga.completed_at = Some(now);
        }

        tx.update_saga(&saga).await?;
        tx.commit().await?;
        Ok(saga)
    }

    /// Durably record one completed step, optionally refreshing the context
    ///
    /// This is the per-step write of the saga log; it does not change the
    /// lifecycle state.
    #[instrument(skip_all, fields(%correlation_id, %step))]
    pub async fn record_step(
        &self,
        correlation_id: &Uuid,
        step: SagaStep,
        context_data: Option<Value>,
    ) -> Result<Saga, Error> {
        let mut tx = self.store.begin_transaction().await?;
        let mut saga = match tx.get_saga(correlation_id).await? {
            Some(saga) => saga,
            None => {
                tx.rollback().await?;
                return Err(Error::UnknownSaga);
            }
        };

        saga.complete_step(step);
        if let Some(context) = context_data {
            saga.context_data = context;
        }
        saga.updated_at = unix_time();

        tx.update_saga(&saga).await?;
        tx.commit().await?;
        Ok(saga)
    }

    /// Read a saga snapshot
    pub async fn read(&self, correlation_id: &Uuid) -> Result<Saga, Error> {
        self.store
            .get_saga(correlation_id)
            .await?
            .ok_or(Error::UnknownSaga)
    }

    /// Sagas in processing/compensating that have not moved recently
    pub async fn stuck(&self) -> Result<Vec<Saga>, Error> {
        let cutoff = unix_time().saturating_sub(self.stuck_age.as_secs());
        Ok(self.store.get_stuck_sagas(cutoff).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use torc_memory::MemoryStore;

    use super::*;

    fn manager(store: MemoryStore) -> SagaManager {
        SagaManager::new(Arc::new(store), Duration::from_secs(300))
    }

    async fn begin(sagas: &SagaManager, key: Option<String>) -> Uuid {
        sagas
            .begin(
                OperationType::EscrowRelease,
                "escrow",
                "inv-1",
                vec![SagaStep::BlockchainTx, SagaStep::DbUpdate],
                Value::Null,
                Address::new("0xadmin"),
                key,
            )
            .await
            .expect("begin")
    }

    #[tokio::test]
    async fn lifecycle_happy_path() {
        let sagas = manager(MemoryStore::new());
        let id = begin(&sagas, None).await;

        assert_eq!(sagas.read(&id).await.expect("read").current_state, SagaState::Pending);

        sagas
            .advance(&id, SagaState::Processing, SagaUpdate::default())
            .await
            .expect("to processing");
        sagas
            .record_step(&id, SagaStep::BlockchainTx, None)
            .await
            .expect("step one");
        sagas
            .record_step(&id, SagaStep::DbUpdate, None)
            .await
            .expect("step two");
        let saga = sagas
            .advance(&id, SagaState::Completed, SagaUpdate::default())
            .await
            .expect("complete");

        assert!(saga.steps_remaining.is_empty());
        assert_eq!(
            saga.steps_completed,
            vec![SagaStep::BlockchainTx, SagaStep::DbUpdate]
        );
        assert!(saga.completed_at.is_some());
    }

    #[tokio::test]
    async fn illegal_transitions_are_rejected() {
        let sagas = manager(MemoryStore::new());
        let id = begin(&sagas, None).await;

        assert!(matches!(
            sagas
                .advance(&id, SagaState::Completed, SagaUpdate::default())
                .await,
            Err(Error::IllegalSagaTransition { .. })
        ));

        // The failed attempt left the row untouched.
        assert_eq!(
            sagas.read(&id).await.expect("read").current_state,
            SagaState::Pending
        );
    }

    #[tokio::test]
    async fn completion_requires_empty_step_list() {
        let sagas = manager(MemoryStore::new());
        let id = begin(&sagas, None).await;
        sagas
            .advance(&id, SagaState::Processing, SagaUpdate::default())
            .await
            .expect("to processing");

        assert!(matches!(
            sagas
                .advance(&id, SagaState::Completed, SagaUpdate::default())
                .await,
            Err(Error::StepsRemaining)
        ));
    }

    #[tokio::test]
    async fn idempotency_key_deduplicates() {
        let sagas = manager(MemoryStore::new());
        let first = begin(&sagas, Some("release:inv-1".into())).await;
        let second = begin(&sagas, Some("release:inv-1".into())).await;
        assert_eq!(first, second);

        let third = begin(&sagas, Some("release:inv-2".into())).await;
        assert_ne!(first, third);
    }

    #[tokio::test]
    async fn stuck_detection_uses_the_age_cutoff() {
        let store = MemoryStore::new();
        let sagas = manager(store.clone());
        let id = begin(&sagas, None).await;
        sagas
            .advance(&id, SagaState::Processing, SagaUpdate::default())
            .await
            .expect("to processing");

        // Fresh processing sagas are not stuck.
        assert!(sagas.stuck().await.expect("stuck").is_empty());

        // Age the row past the cutoff.
        let mut saga = sagas.read(&id).await.expect("read");
        saga.updated_at = unix_time() - 600;
        let mut tx = store.begin_transaction().await.expect("begin");
        tx.update_saga(&saga).await.expect("update");
        tx.commit().await.expect("commit");

        let stuck = sagas.stuck().await.expect("stuck");
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].correlation_id, id);
    }
}
