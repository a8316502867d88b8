//! Scale-down planning

use crate::capacity::{CapacityReport, NodeCapacity};
use crate::config::ScalerConfig;
use crate::planner::policy::ScalingPolicy;
use crate::snapshot::ClusterStateSnapshot;
use serde::Serialize;
use std::cmp::{Ordering, Reverse};
use std::fmt;
use tracing::debug;

/// Why a node was selected for removal
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DrainReason {
    /// No workload for at least the idle threshold
    Idle { idle_for_secs: u64 },
    /// Load under the drain-utilization threshold while demand is steady
    Underutilized { utilization: f64 },
}

impl fmt::Display for DrainReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrainReason::Idle { idle_for_secs } => write!(f, "idle for {}s", idle_for_secs),
            DrainReason::Underutilized { utilization } => {
                write!(f, "underutilized at {:.0}%", utilization * 100.0)
            }
        }
    }
}

/// Request to cordon, evict and remove one node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrainAction {
    pub node_id: String,
    pub instance_id: String,
    pub instance_type: String,
    pub reason: DrainReason,
}

/// Maximum nodes that may start draining in one tick
pub fn velocity_cap(fleet_size: usize, max_scale_in_fraction: f64) -> usize {
    if fleet_size == 0 || max_scale_in_fraction <= 0.0 {
        return 0;
    }
    // Float noise must not round 3 x 0.1 up to 1 extra node
    let cap = ((fleet_size as f64 * max_scale_in_fraction) - 1e-9).ceil();
    (cap.max(0.0) as usize).min(fleet_size)
}

struct Candidate<'a> {
    node: &'a NodeCapacity,
    reason: DrainReason,
    type_count: usize,
}

fn removal_order(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    // Fewest workload pods, then oldest idle-since (never idle last), then
    // the most numerous type, then node id for stability.
    a.node
        .workload_pods
        .cmp(&b.node.workload_pods)
        .then_with(|| match (a.node.idle_since, b.node.idle_since) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| Reverse(a.type_count).cmp(&Reverse(b.type_count)))
        .then_with(|| a.node.node_id.cmp(&b.node.node_id))
}

/// Plan which nodes to drain this tick
pub fn plan(
    report: &CapacityReport,
    snapshot: &ClusterStateSnapshot,
    policy: &ScalingPolicy,
    config: &ScalerConfig,
) -> Vec<DrainAction> {
    let allow_underutilized = policy.allows_underutilized() && !report.has_pending_demand();
    let now = report.computed_at;

    let mut candidates: Vec<Candidate<'_>> = report
        .nodes
        .values()
        .filter(|n| !n.draining && !n.in_grace && !n.opted_out)
        .filter(|n| n.idle_threshold.is_some())
        .filter(|n| snapshot.node(&n.node_id).is_some())
        .filter(|n| n.utilization <= config.drain_utilization_threshold)
        .filter_map(|n| {
            let reason = if n.idle_eligible {
                let idle_for = n
                    .idle_since
                    .map(|since| crate::capacity::elapsed(now, since).as_secs())
                    .unwrap_or(0);
                DrainReason::Idle {
                    idle_for_secs: idle_for,
                }
            } else if allow_underutilized && !n.idle {
                DrainReason::Underutilized {
                    utilization: n.utilization,
                }
            } else {
                return None;
            };
            Some(Candidate {
                node: n,
                reason,
                type_count: report.type_count(&n.instance_type),
            })
        })
        .collect();

    candidates.sort_by(removal_order);

    let cap = velocity_cap(report.fleet_size, config.max_scale_in_fraction);
    let mut spare = report.spare;
    let mut actions = Vec::new();

    for candidate in candidates {
        if actions.len() >= cap {
            debug!(
                node = %candidate.node.node_id,
                cap = cap,
                "Scale-in velocity cap reached"
            );
            break;
        }
        // Removing the node loses its free capacity and pushes its load onto
        // the rest of the fleet. Under-utilized nodes and nodes launched for
        // the buffer may only go while the buffer survives both.
        let remaining = spare
            .saturating_sub(candidate.node.free)
            .saturating_sub(candidate.node.load);
        let guarded =
            matches!(candidate.reason, DrainReason::Underutilized { .. }) || candidate.node.holds_buffer;
        if guarded && !remaining.fits(&report.over_provision_target) {
            debug!(
                node = %candidate.node.node_id,
                reason = %candidate.reason,
                "Skipping node, removal would break the over-provision buffer"
            );
            continue;
        }
        spare = remaining;
        actions.push(DrainAction {
            node_id: candidate.node.node_id.clone(),
            instance_id: candidate.node.instance_id.clone(),
            instance_type: candidate.node.instance_type.clone(),
            reason: candidate.reason,
        });
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::compute;
    use crate::drain::DrainRecord;
    use crate::planner::policy::Trend;
    use crate::reconcile::NodeTable;
    use crate::testing::{fleet_node, pending_pod, pod_on, profile, test_config};
    use chrono::{DateTime, Duration as ChronoDuration, Utc};

    fn three_node_fleet(now: DateTime<Utc>) -> ClusterStateSnapshot {
        let launched = now - ChronoDuration::hours(6);
        ClusterStateSnapshot::from_parts(
            now,
            vec![
                fleet_node("node-a", "m5.xlarge", launched),
                fleet_node("node-b", "m5.xlarge", launched),
                fleet_node("node-c", "m5.xlarge", launched),
            ],
            vec![pod_on("default", "web", "node-c", 2000)],
            vec![profile("m5.xlarge", 4000, 120)],
        )
    }

    fn idle_table(now: DateTime<Utc>) -> NodeTable {
        let mut table = NodeTable::default();
        table.set_idle_since("node-a", now - ChronoDuration::seconds(900));
        table.set_idle_since("node-b", now - ChronoDuration::seconds(1800));
        table
    }

    #[test]
    fn test_velocity_cap() {
        assert_eq!(velocity_cap(3, 0.1), 1);
        assert_eq!(velocity_cap(10, 0.1), 1);
        assert_eq!(velocity_cap(11, 0.1), 2);
        assert_eq!(velocity_cap(3, 1.0), 3);
        assert_eq!(velocity_cap(0, 0.5), 0);
        assert_eq!(velocity_cap(5, 0.0), 0);
    }

    #[test]
    fn test_idle_nodes_drained_oldest_first() {
        let now = Utc::now();
        let snapshot = three_node_fleet(now);
        let config = ScalerConfig {
            max_scale_in_fraction: 1.0,
            ..test_config()
        };
        let report = compute(&snapshot, &idle_table(now), &[], &config, now);

        let drains = plan(&report, &snapshot, &ScalingPolicy::IdleBased, &config);
        let ids: Vec<_> = drains.iter().map(|d| d.node_id.as_str()).collect();
        assert_eq!(ids, vec!["node-b", "node-a"]);
        assert!(matches!(drains[0].reason, DrainReason::Idle { idle_for_secs: 1800 }));
    }

    #[test]
    fn test_idle_buffer_node_kept_while_buffer_needs_it() {
        let now = Utc::now();
        let snapshot = three_node_fleet(now);
        let config = ScalerConfig {
            max_scale_in_fraction: 1.0,
            ..test_config()
        };
        let mut table = idle_table(now);
        table.mark_buffer("i-node-a");
        let report = compute(&snapshot, &table, &[], &config, now);
        assert!(report.nodes["node-a"].holds_buffer);

        // node-b goes first; node-a would then leave 1600m spare of 3600m
        let drains = plan(&report, &snapshot, &ScalingPolicy::IdleBased, &config);
        let ids: Vec<_> = drains.iter().map(|d| d.node_id.as_str()).collect();
        assert_eq!(ids, vec!["node-b"]);
    }

    #[test]
    fn test_velocity_cap_limits_drains_per_tick() {
        let now = Utc::now();
        let snapshot = three_node_fleet(now);
        let config = test_config();
        let report = compute(&snapshot, &idle_table(now), &[], &config, now);

        let drains = plan(&report, &snapshot, &ScalingPolicy::IdleBased, &config);
        assert_eq!(drains.len(), 1);
        assert_eq!(drains[0].node_id, "node-b");
    }

    #[test]
    fn test_grace_period_and_opt_out_excluded() {
        let now = Utc::now();
        let mut snapshot = three_node_fleet(now);
        snapshot.nodes.get_mut("node-a").unwrap().launched_at = now - ChronoDuration::seconds(60);
        snapshot.nodes.get_mut("node-b").unwrap().scale_down_disabled = true;
        let config = ScalerConfig {
            max_scale_in_fraction: 1.0,
            ..test_config()
        };
        let report = compute(&snapshot, &idle_table(now), &[], &config, now);

        assert!(plan(&report, &snapshot, &ScalingPolicy::IdleBased, &config).is_empty());
    }

    #[test]
    fn test_draining_nodes_not_selected_again() {
        let now = Utc::now();
        let snapshot = three_node_fleet(now);
        let config = ScalerConfig {
            max_scale_in_fraction: 1.0,
            ..test_config()
        };
        let mut table = idle_table(now);
        table.start_drain(DrainRecord::new("node-b", "i-node-b", "m5.xlarge", "idle", now));
        let report = compute(&snapshot, &table, &[], &config, now);

        let drains = plan(&report, &snapshot, &ScalingPolicy::IdleBased, &config);
        let ids: Vec<_> = drains.iter().map(|d| d.node_id.as_str()).collect();
        assert_eq!(ids, vec!["node-a"]);
    }

    #[test]
    fn test_fewest_workload_pods_first() {
        let now = Utc::now();
        let launched = now - ChronoDuration::hours(6);
        let snapshot = ClusterStateSnapshot::from_parts(
            now,
            vec![
                fleet_node("node-a", "m5.xlarge", launched),
                fleet_node("node-b", "m5.xlarge", launched),
                fleet_node("node-c", "m5.xlarge", launched),
                fleet_node("node-d", "m5.xlarge", launched),
            ],
            vec![
                pod_on("default", "small-1", "node-a", 100),
                pod_on("default", "small-2", "node-a", 100),
                pod_on("default", "small-3", "node-b", 200),
            ],
            vec![profile("m5.xlarge", 4000, 120)],
        );
        let config = ScalerConfig {
            scaling_policy: crate::config::PolicyKind::GrowthBased,
            max_scale_in_fraction: 1.0,
            over_provision: 0.0,
            ..test_config()
        };
        let report = compute(&snapshot, &NodeTable::default(), &[], &config, now);
        let policy = ScalingPolicy::steady_for_test();

        let drains = plan(&report, &snapshot, &policy, &config);
        let ids: Vec<_> = drains.iter().map(|d| d.node_id.as_str()).collect();
        // node-c and node-d are idle but not yet past the threshold
        assert_eq!(ids, vec!["node-b", "node-a"]);
        assert!(matches!(drains[0].reason, DrainReason::Underutilized { .. }));
    }

    #[test]
    fn test_underutilized_requires_steady_trend() {
        let now = Utc::now();
        let snapshot = three_node_fleet(now);
        let config = ScalerConfig {
            scaling_policy: crate::config::PolicyKind::GrowthBased,
            drain_utilization_threshold: 0.6,
            max_scale_in_fraction: 1.0,
            over_provision: 0.0,
            ..test_config()
        };
        let report = compute(&snapshot, &NodeTable::default(), &[], &config, now);

        let warming = ScalingPolicy::from_config(&config);
        assert_eq!(warming.trend(), Some(Trend::Warming));
        assert!(plan(&report, &snapshot, &warming, &config).is_empty());

        let steady = ScalingPolicy::steady_for_test();
        let drains = plan(&report, &snapshot, &steady, &config);
        assert_eq!(drains.len(), 1);
        assert_eq!(drains[0].node_id, "node-c");

        let idle_only = plan(&report, &snapshot, &ScalingPolicy::IdleBased, &config);
        assert!(idle_only.is_empty());
    }

    #[test]
    fn test_underutilized_blocked_by_pending_demand_and_buffer() {
        let now = Utc::now();
        let launched = now - ChronoDuration::hours(6);
        let nodes = vec![
            fleet_node("node-a", "m5.xlarge", launched),
            fleet_node("node-b", "m5.xlarge", launched),
        ];
        let config = ScalerConfig {
            scaling_policy: crate::config::PolicyKind::GrowthBased,
            max_scale_in_fraction: 1.0,
            ..test_config()
        };
        let steady = ScalingPolicy::steady_for_test();

        // Removing either node would leave less than one spare node
        let snapshot = ClusterStateSnapshot::from_parts(
            now,
            nodes.clone(),
            vec![
                pod_on("default", "web-1", "node-a", 1000),
                pod_on("default", "web-2", "node-b", 1000),
            ],
            vec![profile("m5.xlarge", 4000, 120)],
        );
        let report = compute(&snapshot, &NodeTable::default(), &[], &config, now);
        assert!(plan(&report, &snapshot, &steady, &config).is_empty());

        let snapshot = ClusterStateSnapshot::from_parts(
            now,
            nodes,
            vec![
                pod_on("default", "web-1", "node-a", 1000),
                pending_pod("default", "huge", 9000),
            ],
            vec![profile("m5.xlarge", 4000, 120)],
        );
        let config = ScalerConfig {
            over_provision: 0.0,
            ..config
        };
        let report = compute(&snapshot, &NodeTable::default(), &[], &config, now);
        assert!(report.has_pending_demand());
        assert!(plan(&report, &snapshot, &steady, &config).is_empty());
    }
}
