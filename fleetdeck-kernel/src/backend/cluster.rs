use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Backend, BackendError, BackendStatus};
use crate::cluster::{
    DeploymentAction, DeploymentSummary, PodMetrics, PodState, PodSummary, ProxyClient,
};
use crate::models::{
    ClusterView, ControlAction, ControlMode, ModeDetails, RuntimeInstance, ServiceState,
    ServiceUsage,
};
use crate::registry::{BackendHandle, EnvironmentRegistry, ManagedEnvironment, ServiceDescriptor};

pub struct ClusterBackend {
    proxy: Arc<ProxyClient>,
    registry: Arc<EnvironmentRegistry>,
}

impl ClusterBackend {
    pub fn new(proxy: Arc<ProxyClient>, registry: Arc<EnvironmentRegistry>) -> Self {
        Self { proxy, registry }
    }
}

fn deployment_action(action: ControlAction) -> DeploymentAction {
    match action {
        ControlAction::Start => DeploymentAction::Start,
        ControlAction::Stop | ControlAction::Down => DeploymentAction::Stop,
        ControlAction::Restart => DeploymentAction::Restart,
    }
}

fn deployment_state(
    deployment: &DeploymentSummary,
    pods: &[PodSummary],
    metrics: &[PodMetrics],
) -> ServiceState {
    let owned: Vec<&PodSummary> = pods
        .iter()
        .filter(|p| {
            p.namespace == deployment.namespace
                && p.owner.as_deref() == Some(deployment.name.as_str())
        })
        .collect();

    let state = if deployment.running {
        if deployment.ready_replicas < deployment.desired_replicas {
            "degraded"
        } else {
            "running"
        }
    } else if deployment.desired_replicas > 0 {
        "pending"
    } else {
        "stopped"
    };

    let usage = owned
        .iter()
        .filter_map(|pod| {
            metrics
                .iter()
                .find(|m| m.namespace == pod.namespace && m.name == pod.name)
        })
        .fold(None, |acc: Option<ServiceUsage>, m| {
            let acc = acc.unwrap_or_default();
            Some(ServiceUsage {
                cpu_millicores: acc.cpu_millicores + m.cpu_millicores,
                memory_bytes: acc.memory_bytes + m.memory_bytes,
            })
        });

    ServiceState {
        running: deployment.running,
        state: state.to_string(),
        instances: owned
            .iter()
            .map(|pod| RuntimeInstance {
                name: pod.name.clone(),
                image: pod.images.first().cloned(),
                ports: pod.ports.clone(),
                restarts: pod.restarts,
                ready: pod.ready,
                total: pod.total,
                state: pod.state.as_str().to_string(),
            })
            .collect(),
        ready_replicas: Some(deployment.ready_replicas),
        desired_replicas: Some(deployment.desired_replicas),
        usage,
    }
}

#[async_trait]
impl Backend for ClusterBackend {
    fn mode(&self) -> ControlMode {
        ControlMode::Orchestrated
    }

    async fn list_status(&self) -> BackendStatus {
        if !self.proxy.check_availability().await {
            // one indicator instead of an error per service
            let services = self
                .registry
                .services()
                .iter()
                .map(|s| (s.id.clone(), ServiceState::unknown()))
                .collect();
            return BackendStatus {
                services,
                details: ModeDetails::Cluster(ClusterView::default()),
            };
        }

        let namespaces = self.registry.namespaces();
        let (health, version, nodes, pods, deployments, pod_metrics, routes, releases) = futures::join!(
            self.proxy.get_aggregated_health(),
            self.proxy.get_version(),
            self.proxy.get_node_metrics(),
            self.proxy.get_pods(namespaces),
            self.proxy.get_deployments(namespaces),
            self.proxy.get_pod_metrics_in(namespaces),
            self.proxy.get_routes(namespaces),
            self.proxy.get_releases(namespaces),
        );
        debug!(
            pods = pods.len(),
            deployments = deployments.len(),
            nodes = nodes.len(),
            "cluster status collected"
        );

        let mut services = BTreeMap::new();
        for svc in self.registry.services() {
            let BackendHandle::Deployment { namespace, name } = &svc.handle else {
                continue;
            };
            let state = deployments
                .iter()
                .find(|d| &d.namespace == namespace && &d.name == name)
                .map(|d| deployment_state(d, &pods, &pod_metrics))
                .unwrap_or_else(|| ServiceState {
                    state: "missing".into(),
                    ..ServiceState::default()
                });
            services.insert(svc.id.clone(), state);
        }

        BackendStatus {
            services,
            details: ModeDetails::Cluster(ClusterView {
                proxy_available: true,
                health: Some(health),
                version,
                nodes,
                pods,
                deployments,
                routes,
                releases,
            }),
        }
    }

    async fn control_service(
        &self,
        service: &ServiceDescriptor,
        action: ControlAction,
    ) -> Result<String, BackendError> {
        match &service.handle {
            BackendHandle::Deployment { namespace, name } => Ok(self
                .proxy
                .control_deployment(namespace, name, deployment_action(action))
                .await?),
            _ => Err(BackendError::Unsupported {
                target: service.id.clone(),
                action,
            }),
        }
    }

    async fn control_environment(
        &self,
        environment: &ManagedEnvironment,
        services: &[&ServiceDescriptor],
        action: ControlAction,
    ) -> Result<String, BackendError> {
        let results = join_all(services.iter().map(|&svc| async move {
            (svc.id.as_str(), self.control_service(svc, action).await)
        }))
        .await;

        let failures: Vec<String> = results
            .iter()
            .filter_map(|(id, r)| r.as_ref().err().map(|e| format!("{id}: {e}")))
            .collect();
        if !failures.is_empty() {
            warn!(environment = %environment.id, %action, failed = failures.len(), "environment control partially failed");
            return Err(BackendError::Rejected(failures.join("; ")));
        }
        Ok(format!(
            "{action} applied to {} deployment(s) of {}",
            results.len(),
            environment.id
        ))
    }

    async fn get_logs(&self, service: &ServiceDescriptor, tail: u32) -> Result<String, BackendError> {
        let BackendHandle::Deployment { namespace, name } = &service.handle else {
            return Err(BackendError::NotFound(format!("deployment of {}", service.id)));
        };

        let pods = self.proxy.get_pods_in(namespace).await;
        let mut owned: Vec<&PodSummary> = pods
            .iter()
            .filter(|p| p.owner.as_deref() == Some(name.as_str()))
            .collect();
        owned.sort_by_key(|p| p.state != PodState::Running);
        let pod = owned
            .first()
            .ok_or_else(|| BackendError::NotFound(format!("pods of deployment {namespace}/{name}")))?;

        Ok(self.proxy.get_pod_logs(namespace, &pod.name, tail).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::client::{CacheTtls, ProxyTimeouts};
    use crate::config::FleetConfig;
    use fleetdeck_devkit::{fixtures, ControlPlaneStub};

    const CATALOG: &str = r#"
control_mode: orchestrated
proxy: { namespaces: [infra] }
environments:
  - { id: platform, mode: orchestrated, namespace: infra }
services:
  - { id: web, environment: platform, backend: { kind: deployment } }
  - { id: worker, environment: platform, backend: { kind: deployment } }
"#;

    fn backend_for(stub: &ControlPlaneStub) -> (ClusterBackend, Arc<EnvironmentRegistry>) {
        let cfg: FleetConfig = serde_yaml::from_str(CATALOG).unwrap();
        let registry = Arc::new(EnvironmentRegistry::from_config(&cfg).unwrap());
        let proxy = Arc::new(ProxyClient::new(
            stub.base_url(),
            CacheTtls::default(),
            ProxyTimeouts::default(),
        ));
        (ClusterBackend::new(proxy, registry.clone()), registry)
    }

    #[tokio::test]
    async fn deployment_running_then_stopped() {
        let stub = ControlPlaneStub::start().await;
        stub.add_deployment("infra", fixtures::deployment("web", 2, 2));
        stub.add_pod("infra", fixtures::pod("web-7c9f8d-aaaaa", "web", true));
        stub.add_pod("infra", fixtures::pod("web-7c9f8d-bbbbb", "web", true));
        let (backend, registry) = backend_for(&stub);

        let status = backend.list_status().await;
        let web = &status.services["web"];
        assert!(web.running);
        assert_eq!(web.ready_replicas, Some(2));
        assert_eq!(web.instances.len(), 2);
        assert_eq!(status.services["worker"].state, "missing");

        let svc = registry.service("web").unwrap();
        backend.control_service(svc, ControlAction::Stop).await.unwrap();

        let status = backend.list_status().await;
        let web = &status.services["web"];
        assert_eq!(web.desired_replicas, Some(0));
        assert!(!web.running);
    }

    #[tokio::test]
    async fn usage_sums_owned_pod_metrics() {
        let stub = ControlPlaneStub::start().await;
        stub.add_deployment("infra", fixtures::deployment("web", 2, 2));
        stub.add_pod("infra", fixtures::pod("web-7c9f8d5b6-aaaaa", "web", true));
        stub.add_pod("infra", fixtures::pod("web-7c9f8d5b6-bbbbb", "web", true));
        stub.set_pod_usage("infra", fixtures::pod_usage("web-7c9f8d5b6-aaaaa", "250m", "128Mi"));
        stub.set_pod_usage("infra", fixtures::pod_usage("web-7c9f8d5b6-bbbbb", "100m", "64Mi"));
        // metrics for a pod that belongs to nobody are ignored
        stub.set_pod_usage("infra", fixtures::pod_usage("debug-shell", "900m", "1Gi"));
        let (backend, _) = backend_for(&stub);

        let status = backend.list_status().await;
        let usage = status.services["web"].usage.unwrap();
        assert_eq!(usage.cpu_millicores, 350);
        assert_eq!(usage.memory_bytes, 192 * 1024 * 1024);
        assert!(status.services["worker"].usage.is_none());
    }

    #[tokio::test]
    async fn unavailable_proxy_is_a_single_indicator() {
        let cfg: FleetConfig = serde_yaml::from_str(CATALOG).unwrap();
        let registry = Arc::new(EnvironmentRegistry::from_config(&cfg).unwrap());
        let proxy = Arc::new(ProxyClient::new(
            "http://127.0.0.1:9",
            CacheTtls::default(),
            ProxyTimeouts::default(),
        ));
        let backend = ClusterBackend::new(proxy, registry);

        let status = backend.list_status().await;
        match status.details {
            ModeDetails::Cluster(view) => {
                assert!(!view.proxy_available);
                assert!(view.pods.is_empty());
            }
            other => panic!("unexpected details {other:?}"),
        }
        assert!(status.services.values().all(|s| !s.running));
    }

    #[tokio::test]
    async fn environment_control_reports_each_failure() {
        let stub = ControlPlaneStub::start().await;
        stub.add_deployment("infra", fixtures::deployment("web", 1, 1));
        let (backend, registry) = backend_for(&stub);

        let env = registry.environment("platform").unwrap();
        let members = registry.services_in("platform");
        let err = backend
            .control_environment(env, &members, ControlAction::Restart)
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("worker"));
        assert!(!message.contains("web:"));
        assert_eq!(stub.patches("infra", "web").len(), 1);
    }

    #[tokio::test]
    async fn logs_come_from_an_owned_pod() {
        let stub = ControlPlaneStub::start().await;
        stub.add_deployment("infra", fixtures::deployment("web", 1, 1));
        stub.add_pod("infra", fixtures::pod("web-7c9f8d-aaaaa", "web", true));
        stub.set_logs("infra", "web-7c9f8d-aaaaa", &["booting", "ready"]);
        let (backend, registry) = backend_for(&stub);

        let logs = backend
            .get_logs(registry.service("web").unwrap(), 1)
            .await
            .unwrap();
        assert_eq!(logs, "ready\n");

        let err = backend
            .get_logs(registry.service("worker").unwrap(), 10)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
