//! Builders and collaborator fakes shared by unit tests

use crate::config::ScalerConfig;
use crate::error::{OrchestratorError, ProvisionError, StateFetchError};
use crate::models::{InstanceTypeProfile, Node, Pod, Resources};
use crate::provider::{async_trait, EvictOutcome, Orchestrator, Provisioner};
use crate::status::ScalerStatus;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

pub(crate) const GIB: u64 = 1024 * 1024 * 1024;

pub(crate) fn test_config() -> ScalerConfig {
    ScalerConfig {
        cluster_id: "prod".to_string(),
        ..ScalerConfig::default()
    }
}

/// 4 CPU / 16Gi node labelled into the `prod` fleet
pub(crate) fn fleet_node(id: &str, instance_type: &str, launched_at: DateTime<Utc>) -> Node {
    let mut labels = BTreeMap::new();
    labels.insert("autoscaler.io/cluster".to_string(), "prod".to_string());
    Node {
        id: id.to_string(),
        instance_id: format!("i-{id}"),
        instance_type: instance_type.to_string(),
        capacity: Resources::new(4000, 16 * GIB),
        launched_at,
        unschedulable: false,
        scale_down_disabled: false,
        labels,
    }
}

pub(crate) fn profile(name: &str, cpu_millis: u64, boot_latency_secs: u64) -> InstanceTypeProfile {
    InstanceTypeProfile {
        name: name.to_string(),
        capacity: Resources::new(cpu_millis, 16 * GIB),
        boot_latency_secs,
        idle_threshold_secs: None,
        max_count: None,
        cost_per_hour: None,
    }
}

fn pod(namespace: &str, name: &str, node: Option<&str>, cpu_millis: u64) -> Pod {
    Pod {
        namespace: namespace.to_string(),
        name: name.to_string(),
        node: node.map(str::to_string),
        requests: Resources::new(cpu_millis, 0),
        system: false,
        disruptions_allowed: None,
        instance_type_selector: None,
    }
}

pub(crate) fn pod_on(namespace: &str, name: &str, node: &str, cpu_millis: u64) -> Pod {
    pod(namespace, name, Some(node), cpu_millis)
}

pub(crate) fn system_pod_on(namespace: &str, name: &str, node: &str, cpu_millis: u64) -> Pod {
    Pod {
        system: true,
        ..pod(namespace, name, Some(node), cpu_millis)
    }
}

pub(crate) fn pending_pod(namespace: &str, name: &str, cpu_millis: u64) -> Pod {
    pod(namespace, name, None, cpu_millis)
}

pub(crate) fn typed_pending_pod(
    namespace: &str,
    name: &str,
    instance_type: &str,
    cpu_millis: u64,
) -> Pod {
    Pod {
        instance_type_selector: Some(instance_type.to_string()),
        ..pod(namespace, name, None, cpu_millis)
    }
}

/// In-memory orchestrator. Evictions remove the pod; a pod whose budget
/// allows zero disruptions reports `BudgetViolation`.
#[derive(Default)]
pub(crate) struct MockOrchestrator {
    nodes: Mutex<Vec<Node>>,
    pods: Mutex<Vec<Pod>>,
    unreachable: AtomicBool,
    cordon_error: Mutex<Option<OrchestratorError>>,
    evict_error: Mutex<Option<OrchestratorError>>,
    cordoned: Mutex<Vec<String>>,
    evicted: Mutex<Vec<String>>,
    evict_calls: AtomicU32,
    statuses: Mutex<Vec<ScalerStatus>>,
}

impl MockOrchestrator {
    pub(crate) fn with_state(nodes: Vec<Node>, pods: Vec<Pod>) -> Self {
        let mock = Self::default();
        *mock.nodes.lock().unwrap() = nodes;
        *mock.pods.lock().unwrap() = pods;
        mock
    }

    pub(crate) fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub(crate) fn fail_cordon(&self, error: OrchestratorError) {
        *self.cordon_error.lock().unwrap() = Some(error);
    }

    pub(crate) fn fail_evict(&self, error: OrchestratorError) {
        *self.evict_error.lock().unwrap() = Some(error);
    }

    pub(crate) fn add_pod(&self, pod: Pod) {
        self.pods.lock().unwrap().push(pod);
    }

    pub(crate) fn add_node(&self, node: Node) {
        self.nodes.lock().unwrap().push(node);
    }

    /// Operator action making a cordoned node schedulable again
    pub(crate) fn uncordon(&self, node_id: &str) {
        if let Some(node) = self
            .nodes
            .lock()
            .unwrap()
            .iter_mut()
            .find(|n| n.id == node_id)
        {
            node.unschedulable = false;
        }
    }

    pub(crate) fn remove_node(&self, node_id: &str) {
        self.nodes.lock().unwrap().retain(|n| n.id != node_id);
        self.pods
            .lock()
            .unwrap()
            .retain(|p| p.node.as_deref() != Some(node_id));
    }

    pub(crate) fn cordoned(&self) -> Vec<String> {
        self.cordoned.lock().unwrap().clone()
    }

    pub(crate) fn evicted(&self) -> Vec<String> {
        self.evicted.lock().unwrap().clone()
    }

    pub(crate) fn evict_calls(&self) -> u32 {
        self.evict_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_status(&self) -> Option<ScalerStatus> {
        self.statuses.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn list_nodes(&self) -> Result<Vec<Node>, StateFetchError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StateFetchError::Unreachable("connection refused".to_string()));
        }
        Ok(self.nodes.lock().unwrap().clone())
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, StateFetchError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StateFetchError::Unreachable("connection refused".to_string()));
        }
        Ok(self.pods.lock().unwrap().clone())
    }

    async fn cordon(&self, node_id: &str) -> Result<(), OrchestratorError> {
        if let Some(error) = self.cordon_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.cordoned.lock().unwrap().push(node_id.to_string());
        if let Some(node) = self
            .nodes
            .lock()
            .unwrap()
            .iter_mut()
            .find(|n| n.id == node_id)
        {
            node.unschedulable = true;
        }
        Ok(())
    }

    async fn evict(&self, pod: &Pod) -> Result<EvictOutcome, OrchestratorError> {
        self.evict_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.evict_error.lock().unwrap().clone() {
            return Err(error);
        }
        if pod.disruptions_allowed == Some(0) {
            return Ok(EvictOutcome::BudgetViolation);
        }
        let mut pods = self.pods.lock().unwrap();
        let before = pods.len();
        pods.retain(|p| p.key() != pod.key());
        if pods.len() == before {
            return Ok(EvictOutcome::NotFound);
        }
        self.evicted.lock().unwrap().push(pod.key());
        Ok(EvictOutcome::Evicted)
    }

    async fn patch_status(&self, status: &ScalerStatus) -> Result<(), OrchestratorError> {
        self.statuses.lock().unwrap().push(status.clone());
        Ok(())
    }
}

/// In-memory provisioner handing out sequential instance ids
#[derive(Default)]
pub(crate) struct MockProvisioner {
    catalog: Mutex<Vec<InstanceTypeProfile>>,
    launch_error: Mutex<Option<ProvisionError>>,
    terminate_error: Mutex<Option<ProvisionError>>,
    launched: Mutex<Vec<(String, u32)>>,
    launch_calls: AtomicU32,
    terminated: Mutex<Vec<String>>,
    next_id: AtomicU32,
}

impl MockProvisioner {
    pub(crate) fn with_catalog(catalog: Vec<InstanceTypeProfile>) -> Self {
        let mock = Self::default();
        *mock.catalog.lock().unwrap() = catalog;
        mock
    }

    pub(crate) fn fail_launch(&self, error: ProvisionError) {
        *self.launch_error.lock().unwrap() = Some(error);
    }

    pub(crate) fn fail_terminate(&self, error: ProvisionError) {
        *self.terminate_error.lock().unwrap() = Some(error);
    }

    pub(crate) fn clear_terminate_error(&self) {
        *self.terminate_error.lock().unwrap() = None;
    }

    pub(crate) fn launched(&self) -> Vec<(String, u32)> {
        self.launched.lock().unwrap().clone()
    }

    /// Launch requests received, failed ones included
    pub(crate) fn launch_calls(&self) -> u32 {
        self.launch_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn terminated(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn launch(&self, instance_type: &str, count: u32) -> Result<Vec<String>, ProvisionError> {
        self.launch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.launch_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.launched
            .lock()
            .unwrap()
            .push((instance_type.to_string(), count));
        Ok((0..count)
            .map(|_| format!("i-new-{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
            .collect())
    }

    async fn terminate(&self, instance_id: &str) -> Result<(), ProvisionError> {
        if let Some(error) = self.terminate_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.terminated.lock().unwrap().push(instance_id.to_string());
        Ok(())
    }

    async fn describe_instance_types(&self) -> Result<Vec<InstanceTypeProfile>, ProvisionError> {
        Ok(self.catalog.lock().unwrap().clone())
    }
}
