use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::compose::{
    compose_environment_command, compose_logs, compose_ps, compose_service_command,
    container_command, container_logs, docker_ps, environment_status, parse_compose_ps,
    parse_docker_ps, ComposeEntry,
};
use super::{Backend, BackendError, BackendStatus};
use crate::execution::{run_checked, CommandRunner, CommandSpec};
use crate::models::{
    ContainerSummary, ControlAction, ControlMode, EnvironmentStatus, LocalView, ModeDetails,
    ProcessServerStatus, RuntimeInstance, ServiceState,
};
use crate::processes::{wait_for_exit, ProcessTable, SpawnRequest};
use crate::registry::{
    BackendHandle, EnvironmentLocation, EnvironmentRegistry, ManagedEnvironment, ProcessSpec,
    ServiceDescriptor,
};

/// How long a restart waits for the old process to go away.
pub const RESTART_GRACE: Duration = Duration::from_secs(3);

pub struct LocalBackend {
    runner: Arc<dyn CommandRunner>,
    processes: Arc<dyn ProcessTable>,
    registry: Arc<EnvironmentRegistry>,
    log_dir: PathBuf,
}

impl LocalBackend {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        processes: Arc<dyn ProcessTable>,
        registry: Arc<EnvironmentRegistry>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            processes,
            registry,
            log_dir: log_dir.into(),
        }
    }

    fn log_file(&self, id: &str) -> PathBuf {
        self.log_dir.join(format!("{id}.log"))
    }

    /// Read-only listing; any failure yields no entries for that source.
    async fn list(&self, spec: CommandSpec) -> String {
        match self.runner.run(&spec).await {
            Ok(out) if out.success() => out.stdout,
            Ok(out) => {
                warn!(command = %spec.display(), error = %out.error_text(), "status listing failed");
                String::new()
            }
            Err(e) => {
                warn!(error = %e, "status listing failed");
                String::new()
            }
        }
    }

    async fn compose_entries(&self) -> HashMap<String, Vec<ComposeEntry>> {
        let listings = join_all(self.registry.environments().iter().filter_map(|env| {
            let spec = compose_ps(env)?;
            Some(async move { (env.id.clone(), parse_compose_ps(&self.list(spec).await)) })
        }))
        .await;
        listings.into_iter().collect()
    }

    async fn containers(&self) -> Vec<ContainerSummary> {
        parse_docker_ps(&self.list(docker_ps()).await)
    }

    async fn process_status(&self, spec: &ProcessSpec) -> ProcessServerStatus {
        let port_probe = async {
            match spec.port {
                Some(port) => self.processes.port_open(port).await,
                None => false,
            }
        };
        let (matches, port_open) = futures::join!(self.processes.find(&spec.pattern), port_probe);
        ProcessServerStatus {
            running: !matches.is_empty() || port_open,
            pids: matches.iter().map(|m| m.pid).collect(),
            port: spec.port,
            port_open,
        }
    }

    async fn process_servers(&self) -> BTreeMap<String, ProcessServerStatus> {
        join_all(
            self.registry
                .process_servers()
                .map(|(svc, spec)| async move { (svc.id.clone(), self.process_status(spec).await) }),
        )
        .await
        .into_iter()
        .collect()
    }

    async fn run_control(&self, spec: CommandSpec, done: String) -> Result<String, BackendError> {
        let output = run_checked(self.runner.as_ref(), &spec).await?;
        info!(command = %spec.display(), elapsed_ms = output.execution_time_ms as u64, "control command succeeded");
        Ok(done)
    }

    async fn stop_process(&self, id: &str, spec: &ProcessSpec) -> usize {
        let matches = self.processes.find(&spec.pattern).await;
        let mut stopped = 0;
        for m in &matches {
            if self.processes.terminate(m.pid).await {
                stopped += 1;
            } else {
                warn!(id, pid = m.pid, "process refused termination");
            }
        }
        stopped
    }

    async fn start_process(&self, id: &str, spec: &ProcessSpec) -> Result<String, BackendError> {
        let running = self.processes.find(&spec.pattern).await;
        if !running.is_empty() {
            return Ok(format!("{id} already running (pid {})", running[0].pid));
        }
        let pid = self
            .processes
            .spawn_detached(&SpawnRequest {
                id: id.to_string(),
                command: spec.command.clone(),
                cwd: spec.cwd.clone(),
                port: spec.port,
                log_file: self.log_file(id),
            })
            .await?;
        Ok(format!("{id} started (pid {pid})"))
    }

    async fn control_process(
        &self,
        id: &str,
        spec: &ProcessSpec,
        action: ControlAction,
    ) -> Result<String, BackendError> {
        match action {
            ControlAction::Start => self.start_process(id, spec).await,
            ControlAction::Stop | ControlAction::Down => {
                let stopped = self.stop_process(id, spec).await;
                Ok(format!("{id} stopped ({stopped} process(es))"))
            }
            ControlAction::Restart => {
                self.stop_process(id, spec).await;
                if !wait_for_exit(self.processes.as_ref(), &spec.pattern, RESTART_GRACE).await {
                    return Err(BackendError::Rejected(format!(
                        "{id} did not exit within {}s, not starting a second copy",
                        RESTART_GRACE.as_secs()
                    )));
                }
                self.start_process(id, spec).await
            }
        }
    }

    fn compose_environment(&self, id: &str) -> Result<&ManagedEnvironment, BackendError> {
        self.registry
            .environment(id)
            .ok_or_else(|| BackendError::NotFound(format!("environment {id}")))
    }
}

fn compose_state(entries: Option<&Vec<ComposeEntry>>, service: &str) -> ServiceState {
    let owned: Vec<&ComposeEntry> = entries
        .map(|list| list.iter().filter(|e| e.service == service).collect())
        .unwrap_or_default();
    let running = owned.iter().any(|e| e.running());
    let state = match owned.first() {
        Some(_) if running => "running".to_string(),
        Some(entry) => entry.state.to_lowercase(),
        None => "missing".to_string(),
    };
    ServiceState {
        running,
        state,
        instances: owned
            .iter()
            .map(|e| RuntimeInstance {
                name: e.name.clone(),
                image: Some(e.image.clone()).filter(|i| !i.is_empty()),
                ports: e.published_ports(),
                restarts: 0,
                ready: u32::from(e.running()),
                total: 1,
                state: e.state.to_lowercase(),
            })
            .collect(),
        ..ServiceState::default()
    }
}

fn container_state(containers: &[ContainerSummary], name: &str) -> ServiceState {
    match containers.iter().find(|c| c.name == name) {
        Some(c) => ServiceState {
            running: c.running,
            state: c.state.to_lowercase(),
            instances: vec![RuntimeInstance {
                name: c.name.clone(),
                image: Some(c.image.clone()),
                ready: u32::from(c.running),
                total: 1,
                state: c.status.clone(),
                ..RuntimeInstance::default()
            }],
            ..ServiceState::default()
        },
        None => ServiceState {
            state: "missing".into(),
            ..ServiceState::default()
        },
    }
}

fn process_state(status: Option<&ProcessServerStatus>) -> ServiceState {
    match status {
        Some(s) => ServiceState {
            running: s.running,
            state: if s.running { "running" } else { "stopped" }.into(),
            instances: s
                .pids
                .iter()
                .map(|pid| RuntimeInstance {
                    name: pid.to_string(),
                    ports: s.port.into_iter().collect(),
                    ready: u32::from(s.port_open),
                    total: 1,
                    state: "running".into(),
                    ..RuntimeInstance::default()
                })
                .collect(),
            ..ServiceState::default()
        },
        None => ServiceState::unknown(),
    }
}

/// Last `n` lines of `text`, each newline-terminated.
fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|l| format!("{l}\n")).collect()
}

#[async_trait]
impl Backend for LocalBackend {
    fn mode(&self) -> ControlMode {
        ControlMode::Local
    }

    async fn list_status(&self) -> BackendStatus {
        let (compose, containers, npm_servers) =
            futures::join!(self.compose_entries(), self.containers(), self.process_servers());

        let mut services = BTreeMap::new();
        for svc in self.registry.services() {
            let state = match &svc.handle {
                BackendHandle::Compose { environment, service } => {
                    compose_state(compose.get(environment), service)
                }
                BackendHandle::Container { name } => container_state(&containers, name),
                BackendHandle::Process(_) => process_state(npm_servers.get(&svc.id)),
                BackendHandle::Deployment { .. } => ServiceState::unknown(),
            };
            services.insert(svc.id.clone(), state);
        }

        let mut environments = BTreeMap::new();
        for env in self.registry.environments() {
            let status = match env.location {
                EnvironmentLocation::ComposeFile(_) => environment_status(
                    &env.services,
                    compose.get(&env.id).map(Vec::as_slice).unwrap_or_default(),
                ),
                EnvironmentLocation::Processes => {
                    let members: BTreeMap<String, bool> = env
                        .services
                        .iter()
                        .map(|id| {
                            let up = npm_servers.get(id).map(|s| s.running).unwrap_or(false);
                            (id.clone(), up)
                        })
                        .collect();
                    let running_count = members.values().filter(|up| **up).count();
                    EnvironmentStatus {
                        running: running_count > 0,
                        running_count,
                        total: members.len(),
                        services: members,
                    }
                }
                EnvironmentLocation::Namespace(_) => continue,
            };
            environments.insert(env.id.clone(), status);
        }

        BackendStatus {
            services,
            details: ModeDetails::Local(LocalView {
                environments,
                containers,
                npm_servers,
            }),
        }
    }

    async fn control_service(
        &self,
        service: &ServiceDescriptor,
        action: ControlAction,
    ) -> Result<String, BackendError> {
        match &service.handle {
            BackendHandle::Compose { environment, service: name } => {
                let env = self.compose_environment(environment)?;
                let spec = compose_service_command(env, name, action).ok_or_else(|| {
                    BackendError::Unsupported {
                        target: env.id.clone(),
                        action,
                    }
                })?;
                self.run_control(spec, format!("{action} {name} in {}", env.id))
                    .await
            }
            BackendHandle::Container { name } => {
                self.run_control(container_command(name, action), format!("{action} container {name}"))
                    .await
            }
            BackendHandle::Process(spec) => self.control_process(&service.id, spec, action).await,
            BackendHandle::Deployment { .. } => Err(BackendError::Unsupported {
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
        match environment.location {
            EnvironmentLocation::ComposeFile(_) => {
                let spec = compose_environment_command(environment, action).ok_or_else(|| {
                    BackendError::Unsupported {
                        target: environment.id.clone(),
                        action,
                    }
                })?;
                self.run_control(spec, format!("{action} environment {}", environment.id))
                    .await
            }
            EnvironmentLocation::Processes => {
                let mut failures = Vec::new();
                for svc in services {
                    if let Err(e) = self.control_service(svc, action).await {
                        failures.push(format!("{}: {e}", svc.id));
                    }
                }
                if failures.is_empty() {
                    Ok(format!(
                        "{action} applied to {} process(es) of {}",
                        services.len(),
                        environment.id
                    ))
                } else {
                    Err(BackendError::Rejected(failures.join("; ")))
                }
            }
            EnvironmentLocation::Namespace(_) => Err(BackendError::Unsupported {
                target: environment.id.clone(),
                action,
            }),
        }
    }

    async fn get_logs(&self, service: &ServiceDescriptor, tail: u32) -> Result<String, BackendError> {
        match &service.handle {
            BackendHandle::Compose { environment, service: name } => {
                let env = self.compose_environment(environment)?;
                let spec = compose_logs(env, name, tail)
                    .ok_or_else(|| BackendError::NotFound(format!("compose file of {}", env.id)))?;
                Ok(run_checked(self.runner.as_ref(), &spec).await?.stdout)
            }
            BackendHandle::Container { name } => {
                // the runtime replays the container's stderr on its own stderr
                let out = run_checked(self.runner.as_ref(), &container_logs(name, tail)).await?;
                Ok(format!("{}{}", out.stdout, out.stderr))
            }
            BackendHandle::Process(_) => {
                let path = self.log_file(&service.id);
                let text = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|_| BackendError::NotFound(format!("log file {}", path.display())))?;
                Ok(tail_lines(&text, tail as usize))
            }
            BackendHandle::Deployment { .. } => Err(BackendError::NotFound(format!(
                "logs of {}",
                service.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FleetConfig;
    use crate::execution::fake::ScriptedRunner;
    use crate::execution::ExecError;
    use crate::processes::fake::FakeProcessTable;

    const CATALOG: &str = r#"
control_mode: local
environments:
  - { id: stack, mode: compose, path: /srv/stack, services: [db, cache, api] }
  - { id: node, mode: process }
services:
  - { id: db, environment: stack, backend: { kind: compose } }
  - { id: cache, environment: stack, backend: { kind: compose } }
  - { id: api, environment: stack, backend: { kind: compose } }
  - { id: grafana, backend: { kind: container } }
  - id: docs
    environment: node
    backend: { kind: process, command: "npm run dev", cwd: /srv/docs, port: 3000 }
"#;

    const COMPOSE_PS: &str = r#"{"Service":"db","Name":"stack-db-1","Image":"postgres:16","State":"running"}
{"Service":"cache","Name":"stack-cache-1","Image":"redis:7","State":"exited"}
{"Service":"api","Name":"stack-api-1","Image":"api:latest","State":"running"}
"#;

    const DOCKER_PS: &str = r#"{"ID":"abc","Names":"grafana","Image":"grafana/grafana","State":"running","Status":"Up 5 minutes","Ports":""}"#;

    struct Fixture {
        backend: LocalBackend,
        runner: Arc<ScriptedRunner>,
        table: Arc<FakeProcessTable>,
        registry: Arc<EnvironmentRegistry>,
        _logs: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let cfg: FleetConfig = serde_yaml::from_str(CATALOG).unwrap();
        let registry = Arc::new(EnvironmentRegistry::from_config(&cfg).unwrap());
        let runner = Arc::new(ScriptedRunner::new());
        let table = Arc::new(FakeProcessTable::new());
        let logs = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(runner.clone(), table.clone(), registry.clone(), logs.path());
        Fixture {
            backend,
            runner,
            table,
            registry,
            _logs: logs,
        }
    }

    #[tokio::test]
    async fn compose_environment_counts_running_members() {
        let fx = fixture();
        fx.runner.ok("ps --all --format json", COMPOSE_PS);
        fx.runner.ok("docker ps -a", DOCKER_PS);
        fx.table.add("npm run dev");
        fx.table.open_port(3000);

        let status = fx.backend.list_status().await;
        let ModeDetails::Local(view) = &status.details else {
            panic!("expected local details");
        };
        let stack = &view.environments["stack"];
        assert!(stack.running);
        assert_eq!(stack.running_count, 2);
        assert_eq!(stack.total, 3);

        assert!(status.services["db"].running);
        assert_eq!(status.services["cache"].state, "exited");
        assert!(status.services["grafana"].running);
        assert!(status.services["docs"].running);
        assert!(view.npm_servers["docs"].port_open);
        assert_eq!(view.environments["node"].running_count, 1);
    }

    #[tokio::test]
    async fn failing_listing_degrades_to_empty() {
        let fx = fixture();
        fx.runner.fail("ps --all --format json", "compose file not found");
        // docker ps is not scripted: the runner fails to spawn it

        let status = fx.backend.list_status().await;
        let ModeDetails::Local(view) = &status.details else {
            panic!("expected local details");
        };
        assert_eq!(view.environments["stack"].running_count, 0);
        assert_eq!(view.environments["stack"].total, 3);
        assert!(view.containers.is_empty());
        assert_eq!(status.services["grafana"].state, "missing");
    }

    #[tokio::test]
    async fn compose_service_control_is_scoped() {
        let fx = fixture();
        fx.runner.ok("up -d", "");
        fx.runner.fail("stop cache", "no such service");

        let api = fx.registry.service("api").unwrap();
        fx.backend.control_service(api, ControlAction::Start).await.unwrap();
        assert_eq!(
            fx.runner.calls(),
            vec!["docker compose -f /srv/stack/docker-compose.yml up -d api"]
        );

        let cache = fx.registry.service("cache").unwrap();
        let err = fx
            .backend
            .control_service(cache, ControlAction::Stop)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Exec(ExecError::Failed { .. })));
    }

    #[tokio::test]
    async fn environment_down_uses_compose_down() {
        let fx = fixture();
        fx.runner.ok("down", "");
        let env = fx.registry.environment("stack").unwrap();
        let members = fx.registry.services_in("stack");

        fx.backend
            .control_environment(env, &members, ControlAction::Down)
            .await
            .unwrap();
        let specs = fx.runner.specs();
        assert_eq!(specs.len(), 1);
        assert!(specs[0].display().ends_with(" down"));
        assert_eq!(specs[0].timeout, crate::execution::CONTROL_TIMEOUT);
    }

    #[tokio::test]
    async fn process_restart_respawns_with_log_and_port() {
        let fx = fixture();
        let old = fx.table.add("npm run dev");
        let docs = fx.registry.service("docs").unwrap();

        let message = fx
            .backend
            .control_service(docs, ControlAction::Restart)
            .await
            .unwrap();
        assert!(message.contains("started"));

        let running = fx.table.running();
        assert_eq!(running.len(), 1);
        assert_ne!(running[0].pid, old);

        let spawned = fx.table.spawned();
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0].port, Some(3000));
        assert_eq!(spawned[0].cwd, Some(PathBuf::from("/srv/docs")));
        assert!(spawned[0].log_file.ends_with("docs.log"));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_gives_up_on_a_stuck_process() {
        let fx = fixture();
        let pid = fx.table.add("npm run dev");
        fx.table.make_stubborn(pid);
        let docs = fx.registry.service("docs").unwrap();

        let err = fx
            .backend
            .control_service(docs, ControlAction::Restart)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
        assert!(fx.table.spawned().is_empty());
    }

    #[tokio::test]
    async fn start_is_a_no_op_when_already_running() {
        let fx = fixture();
        fx.table.add("npm run dev");
        let docs = fx.registry.service("docs").unwrap();

        let message = fx
            .backend
            .control_service(docs, ControlAction::Start)
            .await
            .unwrap();
        assert!(message.contains("already running"));
        assert!(fx.table.spawned().is_empty());
    }

    #[tokio::test]
    async fn process_logs_are_tailed_from_file() {
        let fx = fixture();
        std::fs::write(fx._logs.path().join("docs.log"), "one\ntwo\nthree\n").unwrap();
        let docs = fx.registry.service("docs").unwrap();

        assert_eq!(fx.backend.get_logs(docs, 2).await.unwrap(), "two\nthree\n");

        let grafana = fx.registry.service("grafana").unwrap();
        fx.runner.ok("docker logs --tail 5 grafana", "hello\n");
        assert_eq!(fx.backend.get_logs(grafana, 5).await.unwrap(), "hello\n");
    }

    #[test]
    fn tail_handles_short_input() {
        assert_eq!(tail_lines("a\nb", 10), "a\nb\n");
        assert_eq!(tail_lines("", 3), "");
    }
}
