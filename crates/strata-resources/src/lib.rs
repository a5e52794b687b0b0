//! Tier-3 execution for the Strata engine.
//!
//! This crate owns everything that happens once a single step is ready to
//! run:
//!
//! - [`ResourceManager`]: reserves, tracks and finalizes budgets per step
//! - [`SimpleRecoveryProvider`]: maps error classifications to recovery
//!   strategies and records outcomes
//! - [`TierThreeExecutor`]: runs a step's tool through the registry under a
//!   reservation, retrying according to the recovery strategy

pub mod error;
pub mod executor;
pub mod manager;
pub mod recovery;

pub use error::{ResourceError, Result};
pub use executor::TierThreeExecutor;
pub use manager::{
    AllocationStatus, BudgetReservation, QuotaCheck, RateLimit, ResourceAllocation,
    ResourceManager, ResourceManagerConfig, ResourceMetrics,
};
pub use recovery::{
    OutcomeStats, RecoveryConfig, RecoveryStrategyProvider, SharedRecoveryProvider,
    SimpleRecoveryProvider,
};
