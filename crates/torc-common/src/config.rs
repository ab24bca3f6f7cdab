//! Core configuration
//!
//! [`SchedulerConfig`] is the single construction-time struct with every
//! recognized option. The fee/quorum subset is runtime-updatable and lives
//! behind an `ArcSwap` as [`SharedParams`], so workers read it without
//! locking and an admin can retune fees without a restart.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::address::Address;
use crate::amount::Amount;
use crate::error::Error;
use crate::recovery::{DEFAULT_BACKOFF_CAP_MINUTES, DEFAULT_MAX_RETRIES};

/// Upper bound for reconciliation page sizes
pub const MAX_RECONCILIATION_BATCH_SIZE: usize = 200;

/// Recognized scheduler and protocol options
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Recovery worker cadence
    pub recovery_tick_interval: Duration,
    /// Stuck-saga scan cadence
    pub stuck_scan_interval: Duration,
    /// DLQ depth sampler cadence
    pub dlq_sample_interval: Duration,
    /// Periodic reconciliation cadence
    pub reconciliation_interval: Duration,
    /// Retry attempts before DLQ promotion
    pub recovery_max_retries: u32,
    /// Exponential backoff cap, in minutes
    pub recovery_backoff_cap_minutes: u64,
    /// Reconciliation page size, clamped to [`MAX_RECONCILIATION_BATCH_SIZE`]
    pub reconciliation_batch_size: usize,
    /// Age after which a processing/compensating saga counts as stuck
    pub stuck_saga_age: Duration,
    /// Dispute quorum percentage
    pub quorum_percentage: u32,
    /// Platform fee in basis points
    pub fee_basis_points: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            recovery_tick_interval: Duration::from_secs(30),
            stuck_scan_interval: Duration::from_secs(5 * 60),
            dlq_sample_interval: Duration::from_secs(10 * 60),
            reconciliation_interval: Duration::from_secs(6 * 60 * 60),
            recovery_max_retries: DEFAULT_MAX_RETRIES,
            recovery_backoff_cap_minutes: DEFAULT_BACKOFF_CAP_MINUTES,
            reconciliation_batch_size: 50,
            stuck_saga_age: Duration::from_secs(5 * 60),
            quorum_percentage: 51,
            fee_basis_points: 50,
        }
    }
}

impl SchedulerConfig {
    /// Page size with the hard cap applied
    pub fn clamped_batch_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.reconciliation_batch_size)
            .clamp(1, MAX_RECONCILIATION_BATCH_SIZE)
    }
}

/// Runtime-updatable protocol parameters
#[derive(Debug, Clone)]
pub struct ProtocolParams {
    /// Platform fee in basis points
    pub fee_basis_points: u32,
    /// Derived: smallest accepted escrow amount, `⌈10000 / fee_bps⌉`
    pub minimum_escrow_amount: Amount,
    /// Dispute quorum percentage
    pub quorum_percentage: u32,
    /// Fee recipient
    pub treasury: Address,
    /// Registered arbitrators
    pub arbitrators: Vec<Address>,
}

impl ProtocolParams {
    /// Build params, deriving the minimum escrow amount from the fee rate
    pub fn new(
        fee_basis_points: u32,
        quorum_percentage: u32,
        treasury: Address,
        arbitrators: Vec<Address>,
    ) -> Result<Self, Error> {
        if fee_basis_points == 0 {
            return Err(Error::ZeroFeeBasisPoints);
        }
        Ok(ProtocolParams {
            fee_basis_points,
            minimum_escrow_amount: Amount::minimum_for_fee_bps(fee_basis_points)?,
            quorum_percentage,
            treasury,
            arbitrators,
        })
    }

    /// Live arbitrator count
    pub fn arbitrator_count(&self) -> u32 {
        self.arbitrators.len() as u32
    }

    /// True when `address` is on the roster
    pub fn is_arbitrator(&self, address: &Address) -> bool {
        self.arbitrators.contains(address)
    }
}

/// Shared, swap-on-write view of [`ProtocolParams`]
#[derive(Clone)]
pub struct SharedParams {
    inner: Arc<ArcSwap<ProtocolParams>>,
}

impl std::fmt::Debug for SharedParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedParams")
            .field("params", &self.load())
            .finish()
    }
}

impl SharedParams {
    /// Wrap initial parameters
    pub fn new(params: ProtocolParams) -> Self {
        SharedParams {
            inner: Arc::new(ArcSwap::from_pointee(params)),
        }
    }

    /// Current parameters
    pub fn load(&self) -> Arc<ProtocolParams> {
        self.inner.load_full()
    }

    /// Update the fee rate, recomputing the minimum escrow amount
    pub fn set_fee_basis_points(&self, fee_basis_points: u32) -> Result<(), Error> {
        let current = self.load();
        let next = ProtocolParams::new(
            fee_basis_points,
            current.quorum_percentage,
            current.treasury.clone(),
            current.arbitrators.clone(),
        )?;
        self.inner.store(Arc::new(next));
        Ok(())
    }

    /// Update the quorum percentage
    pub fn set_quorum_percentage(&self, quorum_percentage: u32) {
        let current = self.load();
        let mut next = (*current).clone();
        next.quorum_percentage = quorum_percentage;
        self.inner.store(Arc::new(next));
    }

    /// Add an arbitrator to the roster; duplicates are ignored
    pub fn add_arbitrator(&self, address: Address) {
        let current = self.load();
        if current.is_arbitrator(&address) {
            return;
        }
        let mut next = (*current).clone();
        next.arbitrators.push(address);
        self.inner.store(Arc::new(next));
    }

    /// Remove an arbitrator from the roster
    pub fn remove_arbitrator(&self, address: &Address) {
        let current = self.load();
        if !current.is_arbitrator(address) {
            return;
        }
        let mut next = (*current).clone();
        next.arbitrators.retain(|a| a != address);
        self.inner.store(Arc::new(next));
    }
}
