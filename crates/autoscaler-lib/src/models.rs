//! Core data models for the fleet autoscaler

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::time::Duration;

/// CPU and memory quantity. All arithmetic saturates at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}

impl Resources {
    pub const ZERO: Resources = Resources {
        cpu_millis: 0,
        memory_bytes: 0,
    };

    pub fn new(cpu_millis: u64, memory_bytes: u64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cpu_millis == 0 && self.memory_bytes == 0
    }

    pub fn saturating_sub(self, other: Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
        }
    }

    /// Per-dimension minimum
    pub fn min(self, other: Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.min(other.cpu_millis),
            memory_bytes: self.memory_bytes.min(other.memory_bytes),
        }
    }

    /// Returns true if `request` fits inside `self` in every dimension
    pub fn fits(&self, request: &Resources) -> bool {
        request.cpu_millis <= self.cpu_millis && request.memory_bytes <= self.memory_bytes
    }

    /// Scale both dimensions by a non-negative factor, rounding down
    pub fn scale(&self, factor: f64) -> Resources {
        let factor = factor.max(0.0);
        Resources {
            cpu_millis: (self.cpu_millis as f64 * factor).floor() as u64,
            memory_bytes: (self.memory_bytes as f64 * factor).floor() as u64,
        }
    }

    /// Fraction of `capacity` this quantity occupies, taking the larger of
    /// the two dimensions. A dimension with zero capacity counts as fully
    /// used when anything is requested in it.
    pub fn fraction_of(&self, capacity: &Resources) -> f64 {
        fn ratio(used: u64, total: u64) -> f64 {
            match (used, total) {
                (0, _) => 0.0,
                (_, 0) => 1.0,
                (u, t) => u as f64 / t as f64,
            }
        }
        ratio(self.cpu_millis, capacity.cpu_millis).max(ratio(self.memory_bytes, capacity.memory_bytes))
    }

    /// Number of `unit`-sized instances needed to cover this quantity,
    /// rounded up and taking the larger of the two dimensions.
    ///
    /// Returns `None` when a dimension is requested but `unit` has none of it.
    pub fn units_of(&self, unit: &Resources) -> Option<u64> {
        fn div_ceil(demand: u64, unit: u64) -> Option<u64> {
            match (demand, unit) {
                (0, _) => Some(0),
                (_, 0) => None,
                (d, u) => Some(d.div_ceil(u)),
            }
        }
        let cpu = div_ceil(self.cpu_millis, unit.cpu_millis)?;
        let memory = div_ceil(self.memory_bytes, unit.memory_bytes)?;
        Some(cpu.max(memory))
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(self, other: Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
        }
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, other: Resources) {
        *self = *self + other;
    }
}

impl Sum for Resources {
    fn sum<I: Iterator<Item = Resources>>(iter: I) -> Resources {
        iter.fold(Resources::ZERO, |acc, r| acc + r)
    }
}

impl<'a> Sum<&'a Resources> for Resources {
    fn sum<I: Iterator<Item = &'a Resources>>(iter: I) -> Resources {
        iter.fold(Resources::ZERO, |acc, r| acc + *r)
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}m cpu / {}Mi memory",
            self.cpu_millis,
            self.memory_bytes / (1024 * 1024)
        )
    }
}

/// A compute node belonging to the managed fleet, as listed by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Orchestrator node name
    pub id: String,
    /// Provider instance identifier backing this node
    pub instance_id: String,
    pub instance_type: String,
    pub capacity: Resources,
    pub launched_at: DateTime<Utc>,
    /// Whether the node is currently marked unschedulable
    pub unschedulable: bool,
    /// Operator opt-out from scale-down
    pub scale_down_disabled: bool,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// A pod as listed by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    pub namespace: String,
    pub name: String,
    /// Owning node, `None` while unscheduled
    pub node: Option<String>,
    pub requests: Resources,
    /// Daemon/infrastructure pod
    pub system: bool,
    /// Evictions currently permitted by the matching disruption budget,
    /// `None` when no budget covers the pod
    pub disruptions_allowed: Option<u32>,
    /// Instance type the pod is pinned to through its node selector
    pub instance_type_selector: Option<String>,
}

impl Pod {
    /// Stable `namespace/name` key
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn is_scheduled(&self) -> bool {
        self.node.is_some()
    }
}

/// Instance type catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceTypeProfile {
    pub name: String,
    pub capacity: Resources,
    /// Time from launch request until the node registers
    pub boot_latency_secs: u64,
    /// Per-type idle threshold; `Some(0)` disables idle-based removal
    #[serde(default)]
    pub idle_threshold_secs: Option<u64>,
    /// Upper bound on fleet nodes of this type
    #[serde(default)]
    pub max_count: Option<u32>,
    /// Hourly price of one instance, when known
    #[serde(default)]
    pub cost_per_hour: Option<f64>,
}

impl InstanceTypeProfile {
    pub fn boot_latency(&self) -> Duration {
        Duration::from_secs(self.boot_latency_secs)
    }

    /// Capacity left for workload after the reserve margin
    pub fn usable_capacity(&self, reserve_fraction: f64) -> Resources {
        self.capacity.scale(1.0 - reserve_fraction)
    }
}

/// Launch requested from the provisioner whose node has not registered yet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InFlightLaunch {
    pub instance_id: String,
    pub instance_type: String,
    pub requested_at: DateTime<Utc>,
}
