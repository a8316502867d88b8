//! Collaborator interfaces consumed by the scaling engine
//!
//! The engine never talks to the orchestrator or the cloud directly; it
//! reads and writes through these two traits so the daemon can plug in real
//! adapters and tests can plug in fakes.

use crate::error::{OrchestratorError, ProvisionError, StateFetchError};
use crate::models::{InstanceTypeProfile, Node, Pod};
use crate::status::ScalerStatus;

pub use async_trait::async_trait;

/// Result of a single eviction request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    /// Eviction accepted
    Evicted,
    /// The pod's disruption budget does not currently allow eviction
    BudgetViolation,
    /// The pod no longer exists
    NotFound,
}

/// Orchestrator read/write surface
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// List all nodes known to the orchestrator
    async fn list_nodes(&self) -> Result<Vec<Node>, StateFetchError>;

    /// List all non-terminal pods
    async fn list_pods(&self) -> Result<Vec<Pod>, StateFetchError>;

    /// Mark a node unschedulable
    async fn cordon(&self, node_id: &str) -> Result<(), OrchestratorError>;

    /// Request eviction of a pod, honoring its disruption budget
    async fn evict(&self, pod: &Pod) -> Result<EvictOutcome, OrchestratorError>;

    /// Persist the externally visible status summary
    async fn patch_status(&self, status: &ScalerStatus) -> Result<(), OrchestratorError>;
}

/// Cloud provisioning surface
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Launch `count` instances of a type, returning their instance ids
    async fn launch(&self, instance_type: &str, count: u32) -> Result<Vec<String>, ProvisionError>;

    /// Terminate an instance
    async fn terminate(&self, instance_id: &str) -> Result<(), ProvisionError>;

    /// Describe the instance types available to the fleet
    async fn describe_instance_types(&self) -> Result<Vec<InstanceTypeProfile>, ProvisionError>;
}
