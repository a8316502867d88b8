//! Node state carried across ticks

use crate::capacity::CapacityReport;
use crate::drain::{DrainRecord, DrainState};
use crate::snapshot::ClusterStateSnapshot;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Per-node state that must survive between ticks
#[derive(Debug, Clone, Default)]
pub struct NodeEntry {
    /// Start of the current continuous idle period
    pub idle_since: Option<DateTime<Utc>>,
    pub drain: Option<DrainRecord>,
}

/// Node state table owned by the reconciliation loop. Planners only ever
/// see it through shared references.
#[derive(Debug, Clone, Default)]
pub struct NodeTable {
    entries: BTreeMap<String, NodeEntry>,
    /// Instances launched to restore the over-provision buffer
    buffer_instances: BTreeSet<String>,
}

impl NodeTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn idle_since(&self, node_id: &str) -> Option<DateTime<Utc>> {
        self.entries.get(node_id).and_then(|e| e.idle_since)
    }

    pub fn set_idle_since(&mut self, node_id: &str, since: DateTime<Utc>) {
        self.entries.entry(node_id.to_string()).or_default().idle_since = Some(since);
    }

    /// Carry idle-since timestamps forward from a capacity report. A
    /// timestamp only resets when workload lands on the node or it starts
    /// draining.
    pub fn record_idle(&mut self, report: &CapacityReport) {
        for node in report.nodes.values() {
            let entry = self.entries.entry(node.node_id.clone()).or_default();
            if entry.idle_since.is_some() && node.idle_since.is_none() && !node.draining {
                debug!(node = %node.node_id, "Workload landed on idle node");
            }
            entry.idle_since = node.idle_since;
        }
    }

    pub fn mark_buffer(&mut self, instance_id: impl Into<String>) {
        self.buffer_instances.insert(instance_id.into());
    }

    pub fn is_buffer(&self, instance_id: &str) -> bool {
        self.buffer_instances.contains(instance_id)
    }

    /// Forget buffer instances for which `keep` returns false
    pub fn retain_buffer(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.buffer_instances.retain(|id| keep(id));
    }

    /// True for any tracked drain, failed ones included
    pub fn is_draining(&self, node_id: &str) -> bool {
        self.drain(node_id).is_some()
    }

    pub fn drain(&self, node_id: &str) -> Option<&DrainRecord> {
        self.entries.get(node_id).and_then(|e| e.drain.as_ref())
    }

    pub fn start_drain(&mut self, record: DrainRecord) {
        let entry = self.entries.entry(record.node_id.clone()).or_default();
        entry.idle_since = None;
        entry.drain = Some(record);
    }

    pub fn drains(&self) -> impl Iterator<Item = &DrainRecord> {
        self.entries.values().filter_map(|e| e.drain.as_ref())
    }

    pub fn drains_mut(&mut self) -> impl Iterator<Item = &mut DrainRecord> {
        self.entries.values_mut().filter_map(|e| e.drain.as_mut())
    }

    /// Count of tracked drains in every state
    pub fn drain_states(&self) -> Vec<(DrainState, usize)> {
        DrainState::ALL
            .iter()
            .map(|state| (*state, self.drains().filter(|r| r.state == *state).count()))
            .collect()
    }

    /// Drop state that no longer needs tracking: terminated drains, nodes
    /// gone from the fleet, and failed drains whose node an operator has
    /// made schedulable again. Only a snapshot taken after the drain failed
    /// can show the operator's uncordon. Returns the number of drain records
    /// cleared.
    pub fn prune(&mut self, snapshot: &ClusterStateSnapshot) -> usize {
        let mut cleared = 0;
        self.entries.retain(|node_id, entry| {
            let node = snapshot.node(node_id);
            match entry.drain.as_ref().map(|r| r.state) {
                Some(DrainState::Terminated) => {
                    entry.drain = None;
                    cleared += 1;
                }
                Some(DrainState::Failed) => match node {
                    None => {
                        entry.drain = None;
                        cleared += 1;
                    }
                    Some(node)
                        if !node.unschedulable
                            && entry
                                .drain
                                .as_ref()
                                .is_some_and(|r| snapshot.taken_at > r.state_since) =>
                    {
                        info!(node = %node_id, "Failed drain cleared, node uncordoned by operator");
                        entry.drain = None;
                        cleared += 1;
                    }
                    Some(_) => {}
                },
                _ => {}
            }
            node.is_some() || entry.drain.is_some()
        });
        cleared
    }
}
