//! Capacity calculation
//!
//! Derives per-node, per-type and aggregate supply/demand figures from a
//! snapshot. Pure: reads the snapshot, the node table and the in-flight
//! launches, writes nothing.

use crate::config::ScalerConfig;
use crate::models::{InFlightLaunch, InstanceTypeProfile, Pod, Resources};
use crate::reconcile::NodeTable;
use crate::snapshot::ClusterStateSnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Capacity figures for a single node
#[derive(Debug, Clone, Serialize)]
pub struct NodeCapacity {
    pub node_id: String,
    pub instance_id: String,
    pub instance_type: String,
    pub capacity: Resources,
    /// Capacity after the reserve margin
    pub usable: Resources,
    /// Requests counted as load (system pods excluded when configured)
    pub load: Resources,
    /// Usable capacity not taken by any pod, system pods included
    pub free: Resources,
    /// Number of non-system pods on the node
    pub workload_pods: usize,
    /// `load / capacity`, larger of the two dimensions
    pub utilization: f64,
    pub idle: bool,
    pub idle_since: Option<DateTime<Utc>>,
    /// Effective idle threshold, `None` when idle removal is disabled for the type
    pub idle_threshold: Option<Duration>,
    pub idle_eligible: bool,
    /// Still within the post-launch grace period
    pub in_grace: bool,
    pub draining: bool,
    pub opted_out: bool,
    /// Launched to restore the over-provision buffer
    pub holds_buffer: bool,
}

/// Summed figures for a set of nodes. Draining nodes are never included.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CapacityTotals {
    pub node_count: usize,
    /// Launched but not yet registered instances
    pub in_flight: usize,
    pub capacity: Resources,
    pub usable: Resources,
    pub load: Resources,
    /// Free usable capacity on schedulable nodes
    pub free: Resources,
}

impl CapacityTotals {
    fn add_node(&mut self, node: &NodeCapacity, schedulable: bool) {
        self.node_count += 1;
        self.capacity += node.capacity;
        self.usable += node.usable;
        self.load += node.load;
        if schedulable {
            self.free += node.free;
        }
    }
}

/// Requests of pods that fit on no existing node
#[derive(Debug, Clone, Default, Serialize)]
pub struct PendingDemand {
    pub requests: Resources,
    pub pods: usize,
    /// Largest single pod request in this bucket
    pub largest: Resources,
}

impl PendingDemand {
    fn add(&mut self, request: Resources) {
        self.requests += request;
        self.pods += 1;
        self.largest = Resources::new(
            self.largest.cpu_millis.max(request.cpu_millis),
            self.largest.memory_bytes.max(request.memory_bytes),
        );
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_zero()
    }
}

/// Result of a capacity computation
#[derive(Debug, Clone, Serialize)]
pub struct CapacityReport {
    pub computed_at: DateTime<Utc>,
    pub reserve_fraction: f64,
    /// All fleet nodes, draining ones included
    pub fleet_size: usize,
    pub nodes: BTreeMap<String, NodeCapacity>,
    pub by_type: BTreeMap<String, CapacityTotals>,
    pub aggregate: CapacityTotals,
    /// Demand from pods pinned to an instance type
    pub typed_demand: BTreeMap<String, PendingDemand>,
    /// Demand from pods that can run on any instance type
    pub untyped_demand: PendingDemand,
    pub catalog: BTreeMap<String, InstanceTypeProfile>,
    /// Most numerous non-draining type, or the fastest-booting catalog type
    pub predominant_type: Option<String>,
    pub over_provision_target: Resources,
    /// Free capacity after placing pending pods, plus unclaimed in-flight capacity
    pub spare: Resources,
    pub buffer_deficit: Resources,
    /// Hourly run rate of every fleet node and in-flight launch. Types
    /// without a known price count as free.
    pub hourly_cost: f64,
}

impl CapacityReport {
    pub fn total_pending(&self) -> Resources {
        self.typed_demand.values().map(|d| d.requests).sum::<Resources>() + self.untyped_demand.requests
    }

    pub fn has_pending_demand(&self) -> bool {
        !self.total_pending().is_zero()
    }

    /// Current load plus unschedulable demand
    pub fn total_demand(&self) -> Resources {
        self.aggregate.load + self.total_pending()
    }

    pub fn usable_per_instance(&self, instance_type: &str) -> Option<Resources> {
        self.catalog
            .get(instance_type)
            .map(|p| p.usable_capacity(self.reserve_fraction))
    }

    /// Non-draining nodes of a type
    pub fn type_count(&self, instance_type: &str) -> usize {
        self.by_type
            .get(instance_type)
            .map(|t| t.node_count)
            .unwrap_or(0)
    }
}

/// Time elapsed since `since`, zero if `since` lies in the future
pub(crate) fn elapsed(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

fn idle_threshold(profile: Option<&InstanceTypeProfile>, config: &ScalerConfig) -> Option<Duration> {
    let secs = profile
        .and_then(|p| p.idle_threshold_secs)
        .unwrap_or(config.idle_threshold_secs);
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn counts_as_load(pod: &Pod, config: &ScalerConfig) -> bool {
    !(config.ignore_system_pods && pod.system)
}

/// Compute the capacity report for a snapshot
pub fn compute(
    snapshot: &ClusterStateSnapshot,
    table: &NodeTable,
    in_flight: &[InFlightLaunch],
    config: &ScalerConfig,
    now: DateTime<Utc>,
) -> CapacityReport {
    let reserve = config.reserve_fraction;
    let init_time = config.instance_init_time();

    let mut nodes = BTreeMap::new();
    let mut by_type: BTreeMap<String, CapacityTotals> = BTreeMap::new();
    let mut aggregate = CapacityTotals::default();

    for node in snapshot.nodes.values() {
        let mut allocated = Resources::ZERO;
        let mut load = Resources::ZERO;
        let mut workload_pods = 0;
        for pod in snapshot.pods_on(&node.id) {
            allocated += pod.requests;
            if counts_as_load(pod, config) {
                load += pod.requests;
            }
            if !pod.system {
                workload_pods += 1;
            }
        }

        let usable = node.capacity.scale(1.0 - reserve);
        let draining = table.is_draining(&node.id);
        let idle = load.is_zero();
        let idle_since = if draining || !idle {
            None
        } else {
            Some(table.idle_since(&node.id).unwrap_or(now))
        };
        let threshold = idle_threshold(snapshot.instance_types.get(&node.instance_type), config);
        let idle_eligible = match (idle_since, threshold) {
            (Some(since), Some(threshold)) => elapsed(now, since) >= threshold,
            _ => false,
        };

        let capacity = NodeCapacity {
            node_id: node.id.clone(),
            instance_id: node.instance_id.clone(),
            instance_type: node.instance_type.clone(),
            capacity: node.capacity,
            usable,
            load,
            free: usable.saturating_sub(allocated),
            workload_pods,
            utilization: load.fraction_of(&node.capacity),
            idle,
            idle_since,
            idle_threshold: threshold,
            idle_eligible,
            in_grace: elapsed(now, node.launched_at) < init_time,
            draining,
            opted_out: node.scale_down_disabled,
            holds_buffer: table.is_buffer(&node.instance_id),
        };

        if !draining {
            let schedulable = !node.unschedulable;
            by_type
                .entry(node.instance_type.clone())
                .or_default()
                .add_node(&capacity, schedulable);
            aggregate.add_node(&capacity, schedulable);
        }

        nodes.insert(node.id.clone(), capacity);
    }

    // First-fit-decreasing placement of pending pods onto existing free capacity
    let mut slots: Vec<(&str, &str, Resources)> = nodes
        .values()
        .filter(|n| !n.draining && !snapshot.nodes[&n.node_id].unschedulable)
        .map(|n| (n.node_id.as_str(), n.instance_type.as_str(), n.free))
        .collect();

    let mut pending: Vec<&Pod> = snapshot.pending_pods().collect();
    pending.sort_by(|a, b| {
        b.requests
            .cpu_millis
            .cmp(&a.requests.cpu_millis)
            .then(b.requests.memory_bytes.cmp(&a.requests.memory_bytes))
            .then_with(|| a.key().cmp(&b.key()))
    });

    let mut typed_demand: BTreeMap<String, PendingDemand> = BTreeMap::new();
    let mut untyped_demand = PendingDemand::default();

    for pod in pending {
        let selector = pod.instance_type_selector.as_deref();
        let slot = slots.iter_mut().find(|(_, instance_type, free)| {
            selector.map_or(true, |s| s == *instance_type) && free.fits(&pod.requests)
        });
        match (slot, selector) {
            (Some((_, _, free)), _) => *free = free.saturating_sub(pod.requests),
            (None, Some(selector)) => typed_demand
                .entry(selector.to_string())
                .or_default()
                .add(pod.requests),
            (None, None) => untyped_demand.add(pod.requests),
        }
    }

    // In-flight launches absorb demand they were requested for
    let mut in_flight_capacity: BTreeMap<&str, Resources> = BTreeMap::new();
    for launch in in_flight {
        let Some(profile) = snapshot.instance_types.get(&launch.instance_type) else {
            continue;
        };
        *in_flight_capacity.entry(launch.instance_type.as_str()).or_default() +=
            profile.usable_capacity(reserve);
        by_type
            .entry(launch.instance_type.clone())
            .or_default()
            .in_flight += 1;
        aggregate.in_flight += 1;
    }

    let mut leftover = Resources::ZERO;
    for (instance_type, mut capacity) in in_flight_capacity {
        if let Some(demand) = typed_demand.get_mut(instance_type) {
            let absorbed = demand.requests.min(capacity);
            demand.requests = demand.requests.saturating_sub(absorbed);
            capacity = capacity.saturating_sub(absorbed);
        }
        leftover += capacity;
    }
    let absorbed = untyped_demand.requests.min(leftover);
    untyped_demand.requests = untyped_demand.requests.saturating_sub(absorbed);
    leftover = leftover.saturating_sub(absorbed);
    typed_demand.retain(|_, demand| !demand.is_empty());

    let price = |instance_type: &str| {
        snapshot
            .instance_types
            .get(instance_type)
            .and_then(|p| p.cost_per_hour)
            .unwrap_or(0.0)
    };
    let hourly_cost = snapshot
        .nodes
        .values()
        .map(|n| price(&n.instance_type))
        .chain(in_flight.iter().map(|l| price(&l.instance_type)))
        .sum::<f64>();

    let catalog = snapshot.instance_types.clone();
    let predominant_type = by_type
        .iter()
        .filter(|(name, totals)| totals.node_count > 0 && catalog.contains_key(*name))
        .max_by(|a, b| a.1.node_count.cmp(&b.1.node_count).then(b.0.cmp(a.0)))
        .map(|(name, _)| name.clone())
        .or_else(|| {
            catalog
                .values()
                .min_by(|a, b| {
                    a.boot_latency_secs
                        .cmp(&b.boot_latency_secs)
                        .then(a.name.cmp(&b.name))
                })
                .map(|p| p.name.clone())
        });

    let over_provision_target = predominant_type
        .as_ref()
        .and_then(|t| catalog.get(t))
        .map(|p| p.usable_capacity(reserve).scale(config.over_provision))
        .unwrap_or_default();

    let spare = slots.iter().map(|(_, _, free)| *free).sum::<Resources>() + leftover;
    let buffer_deficit = over_provision_target.saturating_sub(spare);

    CapacityReport {
        computed_at: now,
        reserve_fraction: reserve,
        fleet_size: snapshot.fleet_size(),
        nodes,
        by_type,
        aggregate,
        typed_demand,
        untyped_demand,
        catalog,
        predominant_type,
        over_provision_target,
        spare,
        buffer_deficit,
        hourly_cost,
    }
}
