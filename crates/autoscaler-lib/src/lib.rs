//! Scaling-decision engine for the fleet autoscaler
//!
//! This crate provides the core functionality for:
//! - Capturing consistent cluster snapshots
//! - Capacity and pending-demand calculation
//! - Scale-up and scale-down planning
//! - Drain coordination with disruption budgets
//! - The reconciliation loop, health checks and observability

pub mod capacity;
pub mod config;
pub mod drain;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod planner;
pub mod provider;
pub mod reconcile;
pub mod retry;
pub mod snapshot;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

pub use capacity::{CapacityReport, CapacityTotals, NodeCapacity, PendingDemand};
pub use config::{PolicyKind, ScalerConfig};
pub use drain::{DrainCoordinator, DrainRecord, DrainSettings, DrainState};
pub use error::{ConfigError, OrchestratorError, ProvisionError, StateFetchError};
pub use health::{
    Collaborator, ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse,
    ReadinessResponse,
};
pub use models::*;
pub use observability::{ScalerMetrics, StructuredLogger};
pub use planner::{LaunchBackoff, ScalingAction, ScalingPlan, ScalingPolicy};
pub use provider::{EvictOutcome, Orchestrator, Provisioner};
pub use reconcile::{Reconciler, ReconcilerBuilder, TickReport};
pub use retry::{bounded, retry_with_backoff, RetryPolicy};
pub use snapshot::ClusterStateSnapshot;
pub use status::{NodeDrainStatus, ScalerStatus, StatusError, StatusHandle};
