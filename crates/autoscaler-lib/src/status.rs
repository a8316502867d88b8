//! Externally visible status summary
//!
//! Written by the reconciliation loop after every tick and persisted through
//! the orchestrator. Never read back into scaling decisions.

use crate::drain::{DrainRecord, DrainState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared, read-mostly status published by the loop
pub type StatusHandle = Arc<RwLock<ScalerStatus>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusError {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Drain progress of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDrainStatus {
    pub state: DrainState,
    pub instance_id: String,
    pub instance_type: String,
    pub reason: String,
    pub started_at: DateTime<Utc>,
    pub since: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_pods: Vec<String>,
    #[serde(default)]
    pub forced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<&DrainRecord> for NodeDrainStatus {
    fn from(record: &DrainRecord) -> Self {
        Self {
            state: record.state,
            instance_id: record.instance_id.clone(),
            instance_type: record.instance_type.clone(),
            reason: record.reason.clone(),
            started_at: record.started_at,
            since: record.state_since,
            blocked_pods: record.blocked_pods.clone(),
            forced: record.forced,
            last_error: record.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalerStatus {
    pub cluster_id: String,
    pub policy: String,
    /// Last tick that captured a snapshot and ran to completion
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_error: Option<StatusError>,
    /// Nodes with a drain record, keyed by node id
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeDrainStatus>,
    /// Counters since process start
    #[serde(default)]
    pub launched_total: u64,
    #[serde(default)]
    pub drained_total: u64,
    #[serde(default)]
    pub terminated_total: u64,
    /// Actions taken by the last tick
    #[serde(default)]
    pub last_actions: Vec<String>,
    #[serde(default)]
    pub fleet_size: usize,
    #[serde(default)]
    pub in_flight: usize,
    #[serde(default)]
    pub pending_cpu_millis: u64,
    #[serde(default)]
    pub pending_memory_bytes: u64,
    /// Hourly run rate of the fleet and in-flight launches
    #[serde(default)]
    pub hourly_cost: f64,
    /// Instance types skipped for launches, with the time each resumes
    #[serde(default)]
    pub launch_backoff: BTreeMap<String, DateTime<Utc>>,
}

impl ScalerStatus {
    pub fn new(cluster_id: impl Into<String>, policy: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            policy: policy.into(),
            ..Self::default()
        }
    }

    pub fn handle(self) -> StatusHandle {
        Arc::new(RwLock::new(self))
    }

    pub fn drains_in(&self, state: DrainState) -> usize {
        self.nodes.values().filter(|n| n.state == state).count()
    }
}
