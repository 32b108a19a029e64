//! Control-plane payload shapes and the normalized summaries built from them.
//!
//! Raw shapes only declare the fields the dashboard reads, all defaulted, so a
//! partially populated object still decodes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::quantity::{parse_cpu_millicores, parse_memory_bytes, percent};

// ---------------------------------------------------------------------------
// raw payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub creation_timestamp: Option<String>,
    pub deletion_timestamp: Option<String>,
    pub owner_references: Vec<OwnerReference>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawPod {
    pub metadata: ObjectMeta,
    pub spec: RawPodSpec,
    pub status: RawPodStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawPodSpec {
    pub node_name: Option<String>,
    pub containers: Vec<RawContainer>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawContainer {
    pub name: String,
    pub image: String,
    pub ports: Vec<RawContainerPort>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawContainerPort {
    pub container_port: u16,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawPodStatus {
    pub phase: Option<String>,
    pub container_statuses: Vec<RawContainerStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawContainerStatus {
    pub name: String,
    pub ready: bool,
    pub restart_count: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawDeployment {
    pub metadata: ObjectMeta,
    pub spec: RawDeploymentSpec,
    pub status: RawDeploymentStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawDeploymentSpec {
    pub replicas: Option<u32>,
    pub template: RawPodTemplate,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawPodTemplate {
    pub spec: RawPodSpec,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawDeploymentStatus {
    pub replicas: u32,
    pub ready_replicas: u32,
    pub available_replicas: u32,
    pub updated_replicas: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawNode {
    pub metadata: ObjectMeta,
    pub status: RawNodeStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawNodeStatus {
    pub capacity: BTreeMap<String, String>,
    pub allocatable: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawUsage {
    pub cpu: String,
    pub memory: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawNodeMetrics {
    pub metadata: ObjectMeta,
    pub usage: RawUsage,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawPodMetrics {
    pub metadata: ObjectMeta,
    pub containers: Vec<RawContainerMetrics>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawContainerMetrics {
    pub name: String,
    pub usage: RawUsage,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawIngress {
    pub metadata: ObjectMeta,
    pub spec: RawIngressSpec,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawIngressSpec {
    pub ingress_class_name: Option<String>,
    pub rules: Vec<RawIngressRule>,
    pub tls: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawIngressRule {
    pub host: Option<String>,
    pub http: Option<RawIngressHttp>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawIngressHttp {
    pub paths: Vec<RawIngressPath>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawIngressPath {
    pub path: Option<String>,
    pub backend: RawIngressBackend,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawIngressBackend {
    pub service: Option<RawIngressService>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawIngressService {
    pub name: String,
    pub port: RawServicePort,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawServicePort {
    pub number: Option<u16>,
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawHelmChart {
    pub metadata: ObjectMeta,
    pub spec: RawHelmChartSpec,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawHelmChartSpec {
    pub chart: String,
    pub version: Option<String>,
    pub repo: Option<String>,
    pub target_namespace: Option<String>,
}

// ---------------------------------------------------------------------------
// normalized views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodState {
    Running,
    Degraded,
    Pending,
    Completed,
    Stopped,
}

impl PodState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodState::Running => "running",
            PodState::Degraded => "degraded",
            PodState::Pending => "pending",
            PodState::Completed => "completed",
            PodState::Stopped => "stopped",
        }
    }
}

/// Pod state from its phase and ready-container ratio.
pub fn classify_pod(phase: Option<&str>, ready: u32, total: u32, terminating: bool) -> PodState {
    if terminating {
        return PodState::Stopped;
    }
    match phase {
        Some("Succeeded") => PodState::Completed,
        Some("Failed") => PodState::Stopped,
        Some("Pending") => PodState::Pending,
        Some("Running") => {
            if total > 0 && ready == total {
                PodState::Running
            } else if ready > 0 {
                PodState::Degraded
            } else {
                PodState::Pending
            }
        }
        _ => PodState::Stopped,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSummary {
    pub name: String,
    pub namespace: String,
    pub state: PodState,
    pub ready: u32,
    pub total: u32,
    pub restarts: u32,
    pub images: Vec<String>,
    pub ports: Vec<u16>,
    pub node: Option<String>,
    /// Deployment owning the pod, derived from its ReplicaSet owner.
    pub owner: Option<String>,
    pub created: Option<String>,
}

impl PodSummary {
    pub fn from_raw(raw: RawPod, namespace: &str) -> Self {
        let statuses = &raw.status.container_statuses;
        let total = raw.spec.containers.len().max(statuses.len()) as u32;
        let ready = statuses.iter().filter(|s| s.ready).count() as u32;
        let restarts = statuses.iter().map(|s| s.restart_count).sum();
        let state = classify_pod(
            raw.status.phase.as_deref(),
            ready,
            total,
            raw.metadata.deletion_timestamp.is_some(),
        );
        let owner = owner_deployment(&raw.metadata);

        Self {
            namespace: raw
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| namespace.to_string()),
            images: raw.spec.containers.iter().map(|c| c.image.clone()).collect(),
            ports: raw
                .spec
                .containers
                .iter()
                .flat_map(|c| c.ports.iter().map(|p| p.container_port))
                .collect(),
            node: raw.spec.node_name,
            created: raw.metadata.creation_timestamp,
            name: raw.metadata.name,
            state,
            ready,
            total,
            restarts,
            owner,
        }
    }
}

fn owner_deployment(meta: &ObjectMeta) -> Option<String> {
    for owner in &meta.owner_references {
        match owner.kind.as_str() {
            "ReplicaSet" => {
                // ReplicaSets are named <deployment>-<pod-template-hash>
                return owner
                    .name
                    .rsplit_once('-')
                    .map(|(deployment, _)| deployment.to_string());
            }
            "Deployment" | "StatefulSet" | "DaemonSet" => return Some(owner.name.clone()),
            _ => {}
        }
    }
    meta.labels.get("app").cloned()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSummary {
    pub name: String,
    pub namespace: String,
    pub desired_replicas: u32,
    pub replicas: u32,
    pub ready_replicas: u32,
    pub available_replicas: u32,
    pub updated_replicas: u32,
    pub images: Vec<String>,
    pub running: bool,
}

impl DeploymentSummary {
    pub fn from_raw(raw: RawDeployment, namespace: &str) -> Self {
        // replicas defaults to 1 server-side when omitted
        let desired = raw.spec.replicas.unwrap_or(1);
        let ready = raw.status.ready_replicas;
        Self {
            namespace: raw
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| namespace.to_string()),
            name: raw.metadata.name,
            desired_replicas: desired,
            replicas: raw.status.replicas,
            ready_replicas: ready,
            available_replicas: raw.status.available_replicas,
            updated_replicas: raw.status.updated_replicas,
            images: raw
                .spec
                .template
                .spec
                .containers
                .iter()
                .map(|c| c.image.clone())
                .collect(),
            running: desired > 0 && ready > 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetrics {
    pub name: String,
    pub cpu_millicores: u64,
    pub memory_bytes: u64,
    pub cpu_capacity_millicores: u64,
    pub memory_capacity_bytes: u64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

impl NodeMetrics {
    pub fn from_raw(usage: RawNodeMetrics, capacity: Option<&RawNode>) -> Self {
        let cpu = parse_cpu_millicores(&usage.usage.cpu);
        let memory = parse_memory_bytes(&usage.usage.memory);
        let (cpu_capacity, memory_capacity) = capacity
            .map(|node| {
                let source = if node.status.allocatable.is_empty() {
                    &node.status.capacity
                } else {
                    &node.status.allocatable
                };
                (
                    source.get("cpu").map(|v| parse_cpu_millicores(v)).unwrap_or(0),
                    source.get("memory").map(|v| parse_memory_bytes(v)).unwrap_or(0),
                )
            })
            .unwrap_or((0, 0));

        Self {
            name: usage.metadata.name,
            cpu_millicores: cpu,
            memory_bytes: memory,
            cpu_capacity_millicores: cpu_capacity,
            memory_capacity_bytes: memory_capacity,
            cpu_percent: percent(cpu, cpu_capacity),
            memory_percent: percent(memory, memory_capacity),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodMetrics {
    pub name: String,
    pub namespace: String,
    pub cpu_millicores: u64,
    pub memory_bytes: u64,
}

impl PodMetrics {
    pub fn from_raw(raw: RawPodMetrics, namespace: &str) -> Self {
        Self {
            namespace: raw
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| namespace.to_string()),
            cpu_millicores: raw
                .containers
                .iter()
                .map(|c| parse_cpu_millicores(&c.usage.cpu))
                .sum(),
            memory_bytes: raw
                .containers
                .iter()
                .map(|c| parse_memory_bytes(&c.usage.memory))
                .sum(),
            name: raw.metadata.name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteRule {
    pub name: String,
    pub namespace: String,
    pub class: Option<String>,
    pub tls: bool,
    pub paths: Vec<RoutePath>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoutePath {
    pub host: Option<String>,
    pub path: String,
    pub service: Option<String>,
    pub port: Option<String>,
}

impl RouteRule {
    pub fn from_raw(raw: RawIngress, namespace: &str) -> Self {
        let mut paths = Vec::new();
        for rule in &raw.spec.rules {
            let Some(http) = &rule.http else { continue };
            for p in &http.paths {
                let service = p.backend.service.as_ref();
                paths.push(RoutePath {
                    host: rule.host.clone(),
                    path: p.path.clone().unwrap_or_else(|| "/".to_string()),
                    service: service.map(|s| s.name.clone()),
                    port: service.and_then(|s| {
                        s.port
                            .number
                            .map(|n| n.to_string())
                            .or_else(|| s.port.name.clone())
                    }),
                });
            }
        }
        Self {
            namespace: raw
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| namespace.to_string()),
            name: raw.metadata.name,
            class: raw.spec.ingress_class_name,
            tls: !raw.spec.tls.is_empty(),
            paths,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseManifest {
    pub name: String,
    pub namespace: String,
    pub chart: String,
    pub version: Option<String>,
    pub repo: Option<String>,
    pub target_namespace: Option<String>,
}

impl ReleaseManifest {
    pub fn from_raw(raw: RawHelmChart, namespace: &str) -> Self {
        Self {
            namespace: raw
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| namespace.to_string()),
            name: raw.metadata.name,
            chart: raw.spec.chart,
            version: raw.spec.version,
            repo: raw.spec.repo,
            target_namespace: raw.spec.target_namespace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterHealth {
    pub status: HealthState,
    pub probes: BTreeMap<String, bool>,
}

impl ClusterHealth {
    pub fn from_probes(probes: BTreeMap<String, bool>) -> Self {
        let passing = probes.values().filter(|ok| **ok).count();
        let status = if !probes.is_empty() && passing == probes.len() {
            HealthState::Healthy
        } else if passing > 0 {
            HealthState::Degraded
        } else {
            HealthState::Unhealthy
        };
        Self { status, probes }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVersion {
    pub git_version: String,
    #[serde(default)]
    pub platform: String,
}
