//! Orchestrator adapter backed by the Kubernetes API

use crate::quantity;
use async_trait::async_trait;
use autoscaler_lib::{
    EvictOutcome, Node, Orchestrator, OrchestratorError, Pod, Resources, ScalerStatus,
    StateFetchError,
};
use k8s_openapi::api::core::v1::{ConfigMap, Container, Node as K8sNode, Pod as K8sPod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, EvictParams, ListParams, Patch, PatchParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::debug;

pub const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";
const LEGACY_INSTANCE_TYPE_LABEL: &str = "beta.kubernetes.io/instance-type";
pub const SCALE_DOWN_DISABLED_ANNOTATION: &str =
    "cluster-autoscaler.kubernetes.io/scale-down-disabled";
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";
const FIELD_MANAGER: &str = "fleet-autoscaler";
const STATUS_KEY: &str = "status.json";

/// Orchestrator backed by a Kubernetes cluster
pub struct KubeOrchestrator {
    client: Client,
    system_namespace: String,
    status_configmap: String,
    status_namespace: String,
}

impl KubeOrchestrator {
    pub fn new(
        client: Client,
        system_namespace: impl Into<String>,
        status_configmap: impl Into<String>,
        status_namespace: impl Into<String>,
    ) -> Self {
        Self {
            client,
            system_namespace: system_namespace.into(),
            status_configmap: status_configmap.into(),
            status_namespace: status_namespace.into(),
        }
    }
}

fn fetch_error(e: kube::Error) -> StateFetchError {
    StateFetchError::Unreachable(e.to_string())
}

/// 429 and 5xx are worth retrying; other API refusals are final
fn write_error(e: kube::Error) -> OrchestratorError {
    match e {
        kube::Error::Api(ae) if ae.code != 429 && (400..500).contains(&ae.code) => {
            OrchestratorError::Rejected(ae.message)
        }
        other => OrchestratorError::Api(other.to_string()),
    }
}

fn malformed(kind: &'static str, name: &str, reason: String) -> StateFetchError {
    StateFetchError::Malformed {
        kind,
        name: name.to_string(),
        reason,
    }
}

fn resources_of(
    kind: &'static str,
    name: &str,
    quantities: Option<&BTreeMap<String, Quantity>>,
) -> Result<Resources, StateFetchError> {
    let Some(quantities) = quantities else {
        return Ok(Resources::ZERO);
    };
    let cpu = match quantities.get("cpu") {
        Some(q) => quantity::cpu_millis(&q.0).map_err(|e| malformed(kind, name, e))?,
        None => 0,
    };
    let memory = match quantities.get("memory") {
        Some(q) => quantity::memory_bytes(&q.0).map_err(|e| malformed(kind, name, e))?,
        None => 0,
    };
    Ok(Resources::new(cpu, memory))
}

fn container_requests(pod_name: &str, container: &Container) -> Result<Resources, StateFetchError> {
    resources_of(
        "pod",
        pod_name,
        container
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref()),
    )
}

/// Convert a Kubernetes node into the engine's view
pub fn convert_node(node: &K8sNode) -> Result<Node, StateFetchError> {
    let name = node
        .metadata
        .name
        .clone()
        .ok_or_else(|| malformed("node", "<unnamed>", "missing name".to_string()))?;
    let labels = node.metadata.labels.clone().unwrap_or_default();
    let annotations = node.metadata.annotations.clone().unwrap_or_default();

    let instance_type = labels
        .get(INSTANCE_TYPE_LABEL)
        .or_else(|| labels.get(LEGACY_INSTANCE_TYPE_LABEL))
        .cloned()
        .unwrap_or_default();

    // aws:///us-east-1a/i-0abc -> i-0abc
    let instance_id = node
        .spec
        .as_ref()
        .and_then(|s| s.provider_id.as_deref())
        .and_then(|id| id.rsplit('/').find(|segment| !segment.is_empty()))
        .map(str::to_string)
        .unwrap_or_else(|| name.clone());

    let capacity = resources_of(
        "node",
        &name,
        node.status.as_ref().and_then(|s| s.capacity.as_ref()),
    )?;

    let launched_at = node
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| t.0)
        .ok_or_else(|| malformed("node", &name, "missing creation timestamp".to_string()))?;

    Ok(Node {
        instance_id,
        instance_type,
        capacity,
        launched_at,
        unschedulable: node
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false),
        scale_down_disabled: annotations
            .get(SCALE_DOWN_DISABLED_ANNOTATION)
            .is_some_and(|v| v == "true"),
        labels,
        id: name,
    })
}

/// Convert a Kubernetes pod into the engine's view. Returns `None` for pods
/// that have already terminated.
pub fn convert_pod(
    pod: &K8sPod,
    system_namespace: &str,
    budgets: &[PodDisruptionBudget],
) -> Result<Option<Pod>, StateFetchError> {
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    if matches!(phase, Some("Succeeded") | Some("Failed")) {
        return Ok(None);
    }

    let name = pod.metadata.name.clone().unwrap_or_default();
    let namespace = pod
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    let annotations = pod.metadata.annotations.clone().unwrap_or_default();

    // Effective request: the larger of the summed app containers and any
    // single init container, per dimension
    let mut requests = Resources::ZERO;
    let mut init_peak = Resources::ZERO;
    if let Some(spec) = &pod.spec {
        for container in &spec.containers {
            requests += container_requests(&name, container)?;
        }
        for container in spec.init_containers.iter().flatten() {
            let r = container_requests(&name, container)?;
            init_peak.cpu_millis = init_peak.cpu_millis.max(r.cpu_millis);
            init_peak.memory_bytes = init_peak.memory_bytes.max(r.memory_bytes);
        }
    }
    requests.cpu_millis = requests.cpu_millis.max(init_peak.cpu_millis);
    requests.memory_bytes = requests.memory_bytes.max(init_peak.memory_bytes);

    let daemon = pod
        .metadata
        .owner_references
        .iter()
        .flatten()
        .any(|owner| owner.kind == "DaemonSet");
    let system = daemon
        || annotations.contains_key(MIRROR_POD_ANNOTATION)
        || namespace == system_namespace;

    let disruptions_allowed = budgets
        .iter()
        .filter(|pdb| pdb.metadata.namespace.as_deref() == Some(namespace.as_str()))
        .filter(|pdb| {
            pdb.spec
                .as_ref()
                .and_then(|s| s.selector.as_ref())
                .is_some_and(|selector| selector_matches(selector, &labels))
        })
        .map(|pdb| {
            pdb.status
                .as_ref()
                .map(|s| s.disruptions_allowed.max(0) as u32)
                .unwrap_or(0)
        })
        .min();

    let spec = pod.spec.as_ref();
    Ok(Some(Pod {
        node: spec.and_then(|s| s.node_name.clone()),
        instance_type_selector: spec
            .and_then(|s| s.node_selector.as_ref())
            .and_then(|sel| sel.get(INSTANCE_TYPE_LABEL).cloned()),
        requests,
        system,
        disruptions_allowed,
        namespace,
        name,
    }))
}

/// Label selector evaluation. An empty selector matches every pod.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let labels_match = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(k, v)| labels.get(k) == Some(v));

    let expressions_match = selector.match_expressions.iter().flatten().all(|expr| {
        let values = expr.values.as_deref().unwrap_or_default();
        let value = labels.get(&expr.key);
        match expr.operator.as_str() {
            "In" => value.is_some_and(|v| values.contains(v)),
            "NotIn" => value.map_or(true, |v| !values.contains(v)),
            "Exists" => value.is_some(),
            "DoesNotExist" => value.is_none(),
            _ => false,
        }
    });

    labels_match && expressions_match
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn list_nodes(&self) -> Result<Vec<Node>, StateFetchError> {
        let api: Api<K8sNode> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await.map_err(fetch_error)?;
        nodes.items.iter().map(convert_node).collect()
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, StateFetchError> {
        let pods: Api<K8sPod> = Api::all(self.client.clone());
        let budgets: Api<PodDisruptionBudget> = Api::all(self.client.clone());
        let params = ListParams::default();
        let (pods, budgets) = tokio::try_join!(pods.list(&params), budgets.list(&params))
            .map_err(fetch_error)?;

        let mut converted = Vec::with_capacity(pods.items.len());
        for pod in &pods.items {
            if let Some(pod) = convert_pod(pod, &self.system_namespace, &budgets.items)? {
                converted.push(pod);
            }
        }
        Ok(converted)
    }

    async fn cordon(&self, node_id: &str) -> Result<(), OrchestratorError> {
        let api: Api<K8sNode> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "spec": { "unschedulable": true } });
        api.patch(node_id, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(write_error)?;
        debug!(node = %node_id, "Node cordoned");
        Ok(())
    }

    async fn evict(&self, pod: &Pod) -> Result<EvictOutcome, OrchestratorError> {
        let api: Api<K8sPod> = Api::namespaced(self.client.clone(), &pod.namespace);
        match api.evict(&pod.name, &EvictParams::default()).await {
            Ok(_) => Ok(EvictOutcome::Evicted),
            Err(kube::Error::Api(ae)) if ae.code == 429 => Ok(EvictOutcome::BudgetViolation),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(EvictOutcome::NotFound),
            Err(e) => Err(write_error(e)),
        }
    }

    async fn patch_status(&self, status: &ScalerStatus) -> Result<(), OrchestratorError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.status_namespace);
        let body = serde_json::to_string(status)
            .map_err(|e| OrchestratorError::Rejected(format!("status not serializable: {e}")))?;
        let mut data = BTreeMap::new();
        data.insert(STATUS_KEY, body);
        let configmap = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": self.status_configmap,
                "namespace": self.status_namespace,
            },
            "data": data,
        });
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&self.status_configmap, &params, &Patch::Apply(&configmap))
            .await
            .map_err(write_error)?;
        Ok(())
    }
}
