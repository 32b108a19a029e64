/**
 * CLUSTER PROXY CLIENT - typed access to the local control-plane endpoint
 *
 * ROLE :
 * Every call to the cluster goes through here: health probes, version, node and
 * pod metrics, pods, deployments, routing rules, release manifests, pod logs
 * and deployment patches.
 *
 * HOW IT WORKS :
 * - Each request carries an explicit timeout (health 2s, fetch 5s, logs 10s)
 * - Read results are kept in per-resource expiring caches (availability and
 *   health 5s, metrics 10s, pods/deployments 15s per namespace)
 * - Namespaced reads fan out concurrently, one request per namespace
 * - Read failures are logged and degrade to empty values; they are not cached
 * - Writes (scale/restart patches) return their error and invalidate the
 *   namespace's pod and deployment entries on success
 */

use futures::future::join_all;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, warn};

use crate::cache::ResourceCache;
use crate::clock::StrictClock;
use crate::config::{CacheTtlConf, ProxyConf};

use super::types::{
    ClusterHealth, ClusterVersion, DeploymentSummary, NodeMetrics, ObjectList, PodMetrics,
    PodSummary, RawDeployment, RawHelmChart, RawIngress, RawNode, RawNodeMetrics, RawPod,
    RawPodMetrics, ReleaseManifest, RouteRule,
};

const MERGE_PATCH: &str = "application/strategic-merge-patch+json";
const RESTARTED_AT: &str = "kubectl.kubernetes.io/restartedAt";
const HEALTH_PROBES: [&str; 3] = ["healthz", "livez", "readyz"];
const SINGLETON: &str = "cluster";

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("request to {path} timed out after {timeout:?}")]
    Timeout { path: String, timeout: Duration },
    #[error("control plane unreachable for {path}: {message}")]
    Unavailable { path: String, message: String },
    #[error("control plane answered {status} for {path}: {body}")]
    Status { path: String, status: u16, body: String },
    #[error("unexpected payload from {path}: {message}")]
    Decode { path: String, message: String },
}

impl ProxyError {
    /// Timeouts and refused connections are retried on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProxyError::Timeout { .. } | ProxyError::Unavailable { .. })
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProxyError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub method: Method,
    pub body: Option<Value>,
    pub content_type: Option<&'static str>,
    pub timeout: Option<Duration>,
}

impl FetchOptions {
    pub fn get() -> Self {
        Self {
            method: Method::GET,
            body: None,
            content_type: None,
            timeout: None,
        }
    }

    pub fn patch(body: Value, content_type: &'static str) -> Self {
        Self {
            method: Method::PATCH,
            body: Some(body),
            content_type: Some(content_type),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentAction {
    Start,
    Stop,
    Restart,
}

#[derive(Debug, Clone)]
pub struct ProxyTimeouts {
    pub fetch: Duration,
    pub health: Duration,
    pub logs: Duration,
}

impl Default for ProxyTimeouts {
    fn default() -> Self {
        Self {
            fetch: Duration::from_secs(5),
            health: Duration::from_secs(2),
            logs: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheTtls {
    pub availability: Duration,
    pub health: Duration,
    pub version: Duration,
    pub metrics: Duration,
    pub pods: Duration,
    pub deployments: Duration,
    pub routes: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self::from(&CacheTtlConf::default())
    }
}

impl From<&CacheTtlConf> for CacheTtls {
    fn from(conf: &CacheTtlConf) -> Self {
        Self {
            availability: Duration::from_secs(conf.availability),
            health: Duration::from_secs(conf.health),
            version: Duration::from_secs(conf.version),
            metrics: Duration::from_secs(conf.metrics),
            pods: Duration::from_secs(conf.pods),
            deployments: Duration::from_secs(conf.deployments),
            routes: Duration::from_secs(conf.routes),
        }
    }
}

pub struct ProxyClient {
    http: reqwest::Client,
    base_url: String,
    timeouts: ProxyTimeouts,
    ttl: CacheTtls,
    restart_clock: StrictClock,
    availability: ResourceCache<bool>,
    health: ResourceCache<ClusterHealth>,
    version: ResourceCache<Option<ClusterVersion>>,
    nodes: ResourceCache<Vec<NodeMetrics>>,
    pod_metrics: ResourceCache<Vec<PodMetrics>>,
    pods: ResourceCache<Vec<PodSummary>>,
    deployments: ResourceCache<Vec<DeploymentSummary>>,
    routes: ResourceCache<Vec<RouteRule>>,
    releases: ResourceCache<Vec<ReleaseManifest>>,
}

impl ProxyClient {
    pub fn new(base_url: impl Into<String>, ttl: CacheTtls, timeouts: ProxyTimeouts) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
            timeouts,
            ttl,
            restart_clock: StrictClock::new(),
            availability: ResourceCache::new(),
            health: ResourceCache::new(),
            version: ResourceCache::new(),
            nodes: ResourceCache::new(),
            pod_metrics: ResourceCache::new(),
            pods: ResourceCache::new(),
            deployments: ResourceCache::new(),
            routes: ResourceCache::new(),
            releases: ResourceCache::new(),
        }
    }

    pub fn from_config(proxy: &ProxyConf, ttl: &CacheTtlConf) -> Self {
        let timeouts = ProxyTimeouts {
            fetch: Duration::from_secs(proxy.timeout_secs),
            ..ProxyTimeouts::default()
        };
        Self::new(proxy.base_url.clone(), CacheTtls::from(ttl), timeouts)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // -----------------------------------------------------------------------
    // transport
    // -----------------------------------------------------------------------

    /// One HTTP call with an enforced timeout; non-2xx becomes `ProxyError::Status`.
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        path: &str,
        opts: FetchOptions,
    ) -> Result<T, ProxyError> {
        let timeout = opts.timeout.unwrap_or(self.timeouts.fetch);
        let response = self.send(path, &opts, timeout).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(path, timeout, e))?;
        serde_json::from_slice(&bytes).map_err(|e| ProxyError::Decode {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    pub async fn fetch_text(&self, path: &str, timeout: Duration) -> Result<String, ProxyError> {
        let opts = FetchOptions::get().with_timeout(timeout);
        let response = self.send(path, &opts, timeout).await?;
        response
            .text()
            .await
            .map_err(|e| transport_error(path, timeout, e))
    }

    async fn send(
        &self,
        path: &str,
        opts: &FetchOptions,
        timeout: Duration,
    ) -> Result<reqwest::Response, ProxyError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http
            .request(opts.method.clone(), &url)
            .timeout(timeout);
        if let Some(body) = &opts.body {
            request = request
                .header(CONTENT_TYPE, opts.content_type.unwrap_or("application/json"))
                .body(body.to_string());
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(path, timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProxyError::Status {
                path: path.to_string(),
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }
        Ok(response)
    }

    // -----------------------------------------------------------------------
    // health & version
    // -----------------------------------------------------------------------

    /// Lightweight liveness probe. Both outcomes are cached so an unreachable
    /// endpoint is not hammered every tick.
    pub async fn check_availability(&self) -> bool {
        if let Some(available) = self.availability.get(SINGLETON) {
            return available;
        }
        let available = match self.fetch_text("/livez", self.timeouts.health).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "cluster control plane unavailable");
                false
            }
        };
        self.availability
            .set(SINGLETON.to_string(), available, self.ttl.availability);
        available
    }

    pub async fn get_aggregated_health(&self) -> ClusterHealth {
        if let Some(health) = self.health.get(SINGLETON) {
            return health;
        }

        let results = join_all(HEALTH_PROBES.iter().map(|probe| self.probe(probe))).await;
        let probes: BTreeMap<String, bool> = HEALTH_PROBES
            .iter()
            .map(|p| p.to_string())
            .zip(results)
            .collect();

        let health = ClusterHealth::from_probes(probes);
        self.health
            .set(SINGLETON.to_string(), health.clone(), self.ttl.health);
        health
    }

    async fn probe(&self, name: &str) -> bool {
        match self.fetch_text(&format!("/{name}"), self.timeouts.health).await {
            Ok(body) => body.trim() == "ok",
            Err(e) => {
                debug!(probe = name, error = %e, "health probe failed");
                false
            }
        }
    }

    pub async fn get_version(&self) -> Option<ClusterVersion> {
        if let Some(version) = self.version.get(SINGLETON) {
            return version;
        }
        match self
            .fetch_json::<ClusterVersion>("/version", FetchOptions::get())
            .await
        {
            Ok(version) => {
                let version = Some(version);
                self.version
                    .set(SINGLETON.to_string(), version.clone(), self.ttl.version);
                version
            }
            Err(e) => {
                warn!(error = %e, "cluster version unavailable");
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // metrics
    // -----------------------------------------------------------------------

    pub async fn get_node_metrics(&self) -> Vec<NodeMetrics> {
        if let Some(nodes) = self.nodes.get(SINGLETON) {
            return nodes;
        }

        let (usage, capacity) = futures::join!(
            self.fetch_json::<ObjectList<RawNodeMetrics>>(
                "/apis/metrics.k8s.io/v1beta1/nodes",
                FetchOptions::get()
            ),
            self.fetch_json::<ObjectList<RawNode>>("/api/v1/nodes", FetchOptions::get()),
        );

        let usage = match usage {
            Ok(list) => list.items,
            Err(e) => {
                warn!(error = %e, "node metrics unavailable");
                return Vec::new();
            }
        };
        let capacity = capacity
            .map(|list| list.items)
            .unwrap_or_else(|e| {
                warn!(error = %e, "node capacity unavailable, percentages will read 0");
                Vec::new()
            });

        let nodes: Vec<NodeMetrics> = usage
            .into_iter()
            .map(|raw| {
                let node = capacity.iter().find(|n| n.metadata.name == raw.metadata.name);
                NodeMetrics::from_raw(raw, node)
            })
            .collect();

        self.nodes
            .set(SINGLETON.to_string(), nodes.clone(), self.ttl.metrics);
        nodes
    }

    pub async fn get_pod_metrics(&self, namespace: &str) -> Vec<PodMetrics> {
        self.namespaced_list::<RawPodMetrics, _>(
            &self.pod_metrics,
            self.ttl.metrics,
            namespace,
            format!("/apis/metrics.k8s.io/v1beta1/namespaces/{namespace}/pods"),
            PodMetrics::from_raw,
        )
        .await
    }

    pub async fn get_pod_metrics_in(&self, namespaces: &[String]) -> Vec<PodMetrics> {
        join_all(namespaces.iter().map(|ns| self.get_pod_metrics(ns)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    // -----------------------------------------------------------------------
    // workloads
    // -----------------------------------------------------------------------

    /// Pods of every namespace, fetched concurrently. A failing namespace
    /// contributes nothing; the others are still returned.
    pub async fn get_pods(&self, namespaces: &[String]) -> Vec<PodSummary> {
        join_all(namespaces.iter().map(|ns| self.get_pods_in(ns)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    pub async fn get_pods_in(&self, namespace: &str) -> Vec<PodSummary> {
        self.namespaced_list::<RawPod, _>(
            &self.pods,
            self.ttl.pods,
            namespace,
            format!("/api/v1/namespaces/{namespace}/pods"),
            PodSummary::from_raw,
        )
        .await
    }

    pub async fn get_deployments(&self, namespaces: &[String]) -> Vec<DeploymentSummary> {
        join_all(namespaces.iter().map(|ns| self.get_deployments_in(ns)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    pub async fn get_deployments_in(&self, namespace: &str) -> Vec<DeploymentSummary> {
        self.namespaced_list::<RawDeployment, _>(
            &self.deployments,
            self.ttl.deployments,
            namespace,
            format!("/apis/apps/v1/namespaces/{namespace}/deployments"),
            DeploymentSummary::from_raw,
        )
        .await
    }

    pub async fn get_routes(&self, namespaces: &[String]) -> Vec<RouteRule> {
        join_all(namespaces.iter().map(|ns| {
            self.namespaced_list::<RawIngress, _>(
                &self.routes,
                self.ttl.routes,
                ns,
                format!("/apis/networking.k8s.io/v1/namespaces/{ns}/ingresses"),
                RouteRule::from_raw,
            )
        }))
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    pub async fn get_releases(&self, namespaces: &[String]) -> Vec<ReleaseManifest> {
        join_all(namespaces.iter().map(|ns| {
            self.namespaced_list::<RawHelmChart, _>(
                &self.releases,
                self.ttl.routes,
                ns,
                format!("/apis/helm.cattle.io/v1/namespaces/{ns}/helmcharts"),
                ReleaseManifest::from_raw,
            )
        }))
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    async fn namespaced_list<R, T>(
        &self,
        cache: &ResourceCache<Vec<T>>,
        ttl: Duration,
        namespace: &str,
        path: String,
        convert: fn(R, &str) -> T,
    ) -> Vec<T>
    where
        R: DeserializeOwned,
        T: Clone,
    {
        if let Some(hit) = cache.get(namespace) {
            return hit;
        }
        match self.fetch_json::<ObjectList<R>>(&path, FetchOptions::get()).await {
            Ok(list) => {
                let items: Vec<T> = list
                    .items
                    .into_iter()
                    .map(|raw| convert(raw, namespace))
                    .collect();
                cache.set(namespace.to_string(), items.clone(), ttl);
                items
            }
            Err(e) => {
                warn!(namespace, path = %path, error = %e, "namespace read failed, using empty list");
                Vec::new()
            }
        }
    }

    pub async fn get_pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        tail_lines: u32,
    ) -> Result<String, ProxyError> {
        let path = format!("/api/v1/namespaces/{namespace}/pods/{pod}/log?tailLines={tail_lines}");
        self.fetch_text(&path, self.timeouts.logs).await
    }

    // -----------------------------------------------------------------------
    // writes
    // -----------------------------------------------------------------------

    /// Start and stop are replica patches (1 / 0). Restart stamps the pod
    /// template with a fresh, strictly increasing timestamp so the patch
    /// always changes the template and triggers a rollout.
    pub async fn control_deployment(
        &self,
        namespace: &str,
        name: &str,
        action: DeploymentAction,
    ) -> Result<String, ProxyError> {
        let message = match action {
            DeploymentAction::Start => {
                self.scale_deployment(namespace, name, 1).await?;
                format!("deployment {namespace}/{name} scaled to 1")
            }
            DeploymentAction::Stop => {
                self.scale_deployment(namespace, name, 0).await?;
                format!("deployment {namespace}/{name} scaled to 0")
            }
            DeploymentAction::Restart => {
                let stamp = self.restart_clock.next_datetime();
                let value = stamp
                    .format(&Rfc3339)
                    .unwrap_or_else(|_| stamp.unix_timestamp_nanos().to_string());
                let body = json!({
                    "spec": {"template": {"metadata": {"annotations": {RESTARTED_AT: value}}}}
                });
                self.patch_deployment(namespace, name, body).await?;
                format!("deployment {namespace}/{name} restarted")
            }
        };
        info!(namespace, deployment = name, ?action, "deployment control applied");
        Ok(message)
    }

    pub async fn scale_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: u32,
    ) -> Result<(), ProxyError> {
        let body = json!({"spec": {"replicas": replicas}});
        self.patch_deployment(namespace, name, body).await
    }

    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        body: Value,
    ) -> Result<(), ProxyError> {
        let path = format!("/apis/apps/v1/namespaces/{namespace}/deployments/{name}");
        self.fetch_json::<Value>(&path, FetchOptions::patch(body, MERGE_PATCH))
            .await?;
        self.invalidate_namespace(namespace);
        Ok(())
    }

    /// Drops cached workload reads of one namespace.
    pub fn invalidate_namespace(&self, namespace: &str) {
        self.deployments.delete(namespace);
        self.pods.delete(namespace);
        self.pod_metrics.delete(namespace);
    }

    /// Periodic sweep of expired entries across all resource caches.
    pub fn cleanup(&self) -> usize {
        self.availability.cleanup()
            + self.health.cleanup()
            + self.version.cleanup()
            + self.nodes.cleanup()
            + self.pod_metrics.cleanup()
            + self.pods.cleanup()
            + self.deployments.cleanup()
            + self.routes.cleanup()
            + self.releases.cleanup()
    }
}

fn transport_error(path: &str, timeout: Duration, e: reqwest::Error) -> ProxyError {
    if e.is_timeout() {
        ProxyError::Timeout {
            path: path.to_string(),
            timeout,
        }
    } else if e.is_decode() {
        ProxyError::Decode {
            path: path.to_string(),
            message: e.to_string(),
        }
    } else {
        ProxyError::Unavailable {
            path: path.to_string(),
            message: e.to_string(),
        }
    }
}
