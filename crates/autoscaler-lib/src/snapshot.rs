//! Point-in-time view of the fleet
//!
//! A snapshot is captured once at the start of every tick and never mutated
//! afterwards. All planning runs against it, so scale-up and scale-down in
//! the same tick always agree on what the cluster looked like.

use crate::config::ScalerConfig;
use crate::error::StateFetchError;
use crate::models::{InstanceTypeProfile, Node, Pod};
use crate::provider::{Orchestrator, Provisioner};
use crate::retry::bounded;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Immutable view of nodes, pods and the instance type catalog
#[derive(Debug, Clone)]
pub struct ClusterStateSnapshot {
    pub taken_at: DateTime<Utc>,
    pub nodes: BTreeMap<String, Node>,
    pub pods: Vec<Pod>,
    pub instance_types: BTreeMap<String, InstanceTypeProfile>,
}

impl ClusterStateSnapshot {
    /// Build a snapshot from fleet nodes, enforcing that every pod's node
    /// reference resolves. Pods bound to unknown nodes are treated as
    /// unscheduled.
    pub fn from_parts(
        taken_at: DateTime<Utc>,
        nodes: Vec<Node>,
        pods: Vec<Pod>,
        instance_types: Vec<InstanceTypeProfile>,
    ) -> Self {
        let nodes: BTreeMap<String, Node> = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();

        let pods = pods
            .into_iter()
            .map(|mut pod| {
                if let Some(node_id) = &pod.node {
                    if !nodes.contains_key(node_id) {
                        debug!(
                            pod = %pod.key(),
                            node = %node_id,
                            "Pod references a node outside the snapshot, treating as unscheduled"
                        );
                        pod.node = None;
                    }
                }
                pod
            })
            .collect();

        let instance_types = instance_types
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect();

        Self {
            taken_at,
            nodes,
            pods,
            instance_types,
        }
    }

    /// Validate raw listings, keep only this fleet's nodes and apply
    /// configured catalog overrides.
    pub fn assemble(
        taken_at: DateTime<Utc>,
        nodes: Vec<Node>,
        pods: Vec<Pod>,
        mut instance_types: Vec<InstanceTypeProfile>,
        config: &ScalerConfig,
    ) -> Result<Self, StateFetchError> {
        let mut seen = BTreeSet::new();
        let mut fleet = Vec::new();
        let mut foreign = BTreeSet::new();

        for node in nodes {
            if !seen.insert(node.id.clone()) {
                return Err(StateFetchError::Malformed {
                    kind: "node",
                    name: node.id,
                    reason: "listed more than once".to_string(),
                });
            }
            let in_fleet = node.labels.get(&config.cluster_label) == Some(&config.cluster_id);
            if !in_fleet {
                foreign.insert(node.id);
                continue;
            }
            if node.instance_type.is_empty() {
                return Err(StateFetchError::Malformed {
                    kind: "node",
                    name: node.id,
                    reason: "missing instance type".to_string(),
                });
            }
            if node.capacity.cpu_millis == 0 {
                return Err(StateFetchError::Malformed {
                    kind: "node",
                    name: node.id,
                    reason: "reports zero CPU capacity".to_string(),
                });
            }
            fleet.push(node);
        }

        let mut kept_pods = Vec::with_capacity(pods.len());
        for pod in pods {
            if pod.name.is_empty() {
                return Err(StateFetchError::Malformed {
                    kind: "pod",
                    name: pod.key(),
                    reason: "missing name".to_string(),
                });
            }
            // Workload on other fleets' nodes is not ours to account for
            if matches!(&pod.node, Some(node) if foreign.contains(node)) {
                continue;
            }
            kept_pods.push(pod);
        }

        for profile in &mut instance_types {
            if let Some(threshold) = config.type_idle_threshold_secs.get(&profile.name) {
                profile.idle_threshold_secs = Some(*threshold);
            }
            if let Some(max) = config.type_max_count.get(&profile.name) {
                profile.max_count = Some(*max);
            }
            if let Some(cost) = config.type_cost_per_hour.get(&profile.name) {
                profile.cost_per_hour = Some(*cost);
            }
        }

        for node in &fleet {
            if !instance_types.iter().any(|t| t.name == node.instance_type) {
                warn!(
                    node = %node.id,
                    instance_type = %node.instance_type,
                    "Node instance type missing from catalog"
                );
            }
        }

        Ok(Self::from_parts(taken_at, fleet, kept_pods, instance_types))
    }

    /// Pods currently bound to `node_id`
    pub fn pods_on<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Pod> + 'a {
        self.pods
            .iter()
            .filter(move |p| p.node.as_deref() == Some(node_id))
    }

    /// Pods not bound to any node
    pub fn pending_pods(&self) -> impl Iterator<Item = &Pod> {
        self.pods.iter().filter(|p| !p.is_scheduled())
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    pub fn has_instance(&self, instance_id: &str) -> bool {
        self.nodes.values().any(|n| n.instance_id == instance_id)
    }

    pub fn fleet_size(&self) -> usize {
        self.nodes.len()
    }
}

/// Capture a snapshot through the collaborators. Any failure aborts the
/// capture; no partial snapshot is ever returned.
pub async fn capture(
    orchestrator: &dyn Orchestrator,
    provisioner: &dyn Provisioner,
    config: &ScalerConfig,
    now: DateTime<Utc>,
) -> Result<ClusterStateSnapshot, StateFetchError> {
    let limit = config.call_timeout();

    let (nodes, pods, instance_types) = tokio::join!(
        bounded(limit, orchestrator.list_nodes(), |timeout| {
            StateFetchError::Timeout {
                operation: "list_nodes",
                timeout,
            }
        }),
        bounded(limit, orchestrator.list_pods(), |timeout| {
            StateFetchError::Timeout {
                operation: "list_pods",
                timeout,
            }
        }),
        bounded(
            limit,
            async {
                provisioner
                    .describe_instance_types()
                    .await
                    .map_err(StateFetchError::from)
            },
            |timeout| StateFetchError::Timeout {
                operation: "describe_instance_types",
                timeout,
            }
        ),
    );

    ClusterStateSnapshot::assemble(now, nodes?, pods?, instance_types?, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fleet_node, pending_pod, pod_on, profile};

    fn config() -> ScalerConfig {
        ScalerConfig {
            cluster_id: "prod".to_string(),
            ..ScalerConfig::default()
        }
    }

    #[test]
    fn test_pods_on_unknown_nodes_become_unscheduled() {
        let now = Utc::now();
        let snapshot = ClusterStateSnapshot::from_parts(
            now,
            vec![fleet_node("node-a", "m5.xlarge", now)],
            vec![
                pod_on("default", "web-1", "node-a", 500),
                pod_on("default", "web-2", "node-gone", 500),
            ],
            vec![profile("m5.xlarge", 4000, 120)],
        );

        // Every remaining node reference resolves within the snapshot
        for pod in &snapshot.pods {
            if let Some(node) = &pod.node {
                assert!(snapshot.nodes.contains_key(node));
            }
        }
        assert_eq!(snapshot.pending_pods().count(), 1);
        assert_eq!(snapshot.pods_on("node-a").count(), 1);
    }

    #[test]
    fn test_assemble_filters_foreign_nodes_and_their_pods() {
        let now = Utc::now();
        let mut foreign = fleet_node("other-1", "m5.xlarge", now);
        foreign
            .labels
            .insert("autoscaler.io/cluster".to_string(), "staging".to_string());

        let snapshot = ClusterStateSnapshot::assemble(
            now,
            vec![fleet_node("node-a", "m5.xlarge", now), foreign],
            vec![
                pod_on("default", "web-1", "other-1", 500),
                pending_pod("default", "web-2", 500),
            ],
            vec![profile("m5.xlarge", 4000, 120)],
            &config(),
        )
        .unwrap();

        assert_eq!(snapshot.fleet_size(), 1);
        assert_eq!(snapshot.pods.len(), 1);
        assert_eq!(snapshot.pods[0].name, "web-2");
    }

    #[test]
    fn test_assemble_rejects_duplicate_nodes() {
        let now = Utc::now();
        let result = ClusterStateSnapshot::assemble(
            now,
            vec![
                fleet_node("node-a", "m5.xlarge", now),
                fleet_node("node-a", "m5.xlarge", now),
            ],
            vec![],
            vec![],
            &config(),
        );
        assert!(matches!(result, Err(StateFetchError::Malformed { .. })));
    }

    #[test]
    fn test_assemble_applies_catalog_overrides() {
        let now = Utc::now();
        let mut config = config();
        config
            .type_idle_threshold_secs
            .insert("m5.xlarge".to_string(), 0);
        config.type_max_count.insert("m5.xlarge".to_string(), 4);
        config
            .type_cost_per_hour
            .insert("m5.xlarge".to_string(), 0.192);

        let snapshot = ClusterStateSnapshot::assemble(
            now,
            vec![],
            vec![],
            vec![profile("m5.xlarge", 4000, 120)],
            &config,
        )
        .unwrap();

        let profile = &snapshot.instance_types["m5.xlarge"];
        assert_eq!(profile.idle_threshold_secs, Some(0));
        assert_eq!(profile.max_count, Some(4));
        assert_eq!(profile.cost_per_hour, Some(0.192));
    }
}
