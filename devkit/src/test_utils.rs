/*!
Test harness for orchestrated-mode tests

Starts a control-plane stub, seeds deployments with their pods and renders a
boot config pointing at the stub, so a test can go from YAML to a running
backend in a few lines.
*/

use crate::control_plane_stub::ControlPlaneStub;
use crate::fixtures;

pub struct TestHarness {
    pub stub: ControlPlaneStub,
    namespaces: Vec<String>,
    services: Vec<(String, String)>,
}

impl TestHarness {
    pub async fn start() -> Self {
        env_logger::builder().is_test(true).try_init().ok();

        Self {
            stub: ControlPlaneStub::start().await,
            namespaces: Vec::new(),
            services: Vec::new(),
        }
    }

    /// Adds a deployment with `ready` of `replicas` pods ready and registers
    /// it as a catalog service of the same name.
    pub fn seed_deployment(&mut self, namespace: &str, name: &str, replicas: u32, ready: u32) -> &mut Self {
        self.stub
            .add_deployment(namespace, fixtures::deployment(name, replicas, ready));
        for i in 0..replicas {
            let pod = format!("{name}-{}-{i:05}", fixtures::POD_TEMPLATE_HASH);
            self.stub.add_pod(namespace, fixtures::pod(&pod, name, i < ready));
        }
        self.declare(namespace, name)
    }

    /// Registers a catalog service without creating anything in the cluster.
    pub fn declare(&mut self, namespace: &str, name: &str) -> &mut Self {
        if !self.namespaces.iter().any(|n| n == namespace) {
            self.namespaces.push(namespace.to_string());
        }
        self.services.push((namespace.to_string(), name.to_string()));
        log::info!("declared {namespace}/{name}");
        self
    }

    /// Orchestrated boot config: one environment per namespace, one
    /// deployment-backed service per declared name.
    pub fn config_yaml(&self) -> String {
        let mut yaml = format!(
            "control_mode: orchestrated\nproxy:\n  base_url: \"{}\"\n  namespaces: [{}]\nenvironments:\n",
            self.stub.base_url(),
            self.namespaces.join(", ")
        );
        for ns in &self.namespaces {
            yaml.push_str(&format!(
                "  - {{ id: {ns}, mode: orchestrated, namespace: {ns} }}\n"
            ));
        }
        yaml.push_str("services:\n");
        for (ns, name) in &self.services {
            yaml.push_str(&format!(
                "  - {{ id: {name}, environment: {ns}, backend: {{ kind: deployment }} }}\n"
            ));
        }
        yaml
    }
}
