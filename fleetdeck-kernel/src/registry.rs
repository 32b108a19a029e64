/**
 * ENVIRONMENT REGISTRY - static catalog of managed environments and services
 *
 * Built once from the boot configuration, validated, then shared read-only
 * (Arc, no lock) by the aggregator, the dispatcher and the HTTP layer.
 * Every service resolves to exactly one backend handle, and that handle must
 * belong to the active control mode.
 */

use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::{BackendConf, EnvironmentConf, EnvironmentKind, FleetConfig, ServiceConf};
use crate::models::ControlMode;

const COMPOSE_FILE: &str = "docker-compose.yml";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{kind} with an empty id")]
    EmptyId { kind: &'static str },
    #[error("duplicate {kind} id '{id}'")]
    DuplicateId { kind: &'static str, id: String },
    #[error("service '{service}' references unknown environment '{environment}'")]
    UnknownEnvironment { service: String, environment: String },
    #[error("service '{service}' needs a {expected} environment")]
    WrongEnvironment { service: String, expected: &'static str },
    #[error("compose service '{service}' is not declared by environment '{environment}'")]
    UndeclaredService { service: String, environment: String },
    #[error("{what} '{id}' belongs to {found} mode but the active mode is {active}")]
    ModeMismatch {
        what: &'static str,
        id: String,
        found: ControlMode,
        active: ControlMode,
    },
    #[error("environment '{environment}' is missing its {field}")]
    MissingLocation { environment: String, field: &'static str },
    #[error("deployment service '{service}' has no namespace")]
    MissingNamespace { service: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentLocation {
    Namespace(String),
    ComposeFile(PathBuf),
    Processes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedEnvironment {
    pub id: String,
    pub name: String,
    pub location: EnvironmentLocation,
    pub profile: Option<String>,
    /// Constituent service names (compose service names for compose stacks).
    pub services: Vec<String>,
}

impl ManagedEnvironment {
    pub fn kind(&self) -> EnvironmentKind {
        match self.location {
            EnvironmentLocation::Namespace(_) => EnvironmentKind::Orchestrated,
            EnvironmentLocation::ComposeFile(_) => EnvironmentKind::Compose,
            EnvironmentLocation::Processes => EnvironmentKind::Process,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub command: String,
    pub cwd: Option<PathBuf>,
    pub port: Option<u16>,
    /// Substring matched against process command lines.
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendHandle {
    Deployment { namespace: String, name: String },
    Compose { environment: String, service: String },
    Container { name: String },
    Process(ProcessSpec),
}

impl BackendHandle {
    pub fn mode(&self) -> ControlMode {
        match self {
            BackendHandle::Deployment { .. } => ControlMode::Orchestrated,
            _ => ControlMode::Local,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub id: String,
    pub name: String,
    pub handle: BackendHandle,
    pub url: Option<String>,
    pub resources: Option<String>,
    pub group: Option<String>,
    pub environment: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EnvironmentRegistry {
    mode: ControlMode,
    namespaces: Vec<String>,
    environments: Vec<ManagedEnvironment>,
    services: Vec<ServiceDescriptor>,
    env_index: HashMap<String, usize>,
    service_index: HashMap<String, usize>,
}

fn kind_mode(kind: EnvironmentKind) -> ControlMode {
    match kind {
        EnvironmentKind::Orchestrated => ControlMode::Orchestrated,
        EnvironmentKind::Compose | EnvironmentKind::Process => ControlMode::Local,
    }
}

impl EnvironmentRegistry {
    pub fn from_config(cfg: &FleetConfig) -> Result<Self, RegistryError> {
        let mode = cfg.control_mode;
        let mut environments = Vec::with_capacity(cfg.environments.len());
        let mut env_index = HashMap::new();

        for conf in &cfg.environments {
            let env = build_environment(conf, mode)?;
            if env_index.insert(env.id.clone(), environments.len()).is_some() {
                return Err(RegistryError::DuplicateId {
                    kind: "environment",
                    id: env.id,
                });
            }
            environments.push(env);
        }

        let mut services = Vec::with_capacity(cfg.services.len());
        let mut service_index = HashMap::new();
        for conf in &cfg.services {
            let svc = build_service(conf, mode, &environments, &env_index)?;
            if service_index.insert(svc.id.clone(), services.len()).is_some() {
                return Err(RegistryError::DuplicateId {
                    kind: "service",
                    id: svc.id,
                });
            }
            services.push(svc);
        }

        // compose stacks without an explicit list take their members from the catalog
        for env in environments.iter_mut().filter(|e| e.services.is_empty()) {
            env.services = services
                .iter()
                .filter_map(|s| match &s.handle {
                    BackendHandle::Compose { environment, service } if *environment == env.id => {
                        Some(service.clone())
                    }
                    _ if s.environment.as_deref() == Some(env.id.as_str()) => Some(s.id.clone()),
                    _ => None,
                })
                .collect();
        }

        let mut namespaces = Vec::new();
        if mode == ControlMode::Orchestrated {
            let declared = cfg.proxy.namespaces.iter().cloned();
            let from_envs = environments.iter().filter_map(|e| match &e.location {
                EnvironmentLocation::Namespace(ns) => Some(ns.clone()),
                _ => None,
            });
            let from_services = services.iter().filter_map(|s| match &s.handle {
                BackendHandle::Deployment { namespace, .. } => Some(namespace.clone()),
                _ => None,
            });
            for ns in declared.chain(from_envs).chain(from_services) {
                if !ns.is_empty() && !namespaces.contains(&ns) {
                    namespaces.push(ns);
                }
            }
        }

        Ok(Self {
            mode,
            namespaces,
            environments,
            services,
            env_index,
            service_index,
        })
    }

    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    pub fn service(&self, id: &str) -> Option<&ServiceDescriptor> {
        self.service_index.get(id).map(|&i| &self.services[i])
    }

    pub fn environment(&self, id: &str) -> Option<&ManagedEnvironment> {
        self.env_index.get(id).map(|&i| &self.environments[i])
    }

    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    pub fn environments(&self) -> &[ManagedEnvironment] {
        &self.environments
    }

    /// Services attached to an environment, in declaration order.
    pub fn services_in(&self, env_id: &str) -> Vec<&ServiceDescriptor> {
        self.services
            .iter()
            .filter(|s| s.environment.as_deref() == Some(env_id))
            .collect()
    }

    pub fn containers(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services
            .iter()
            .filter(|s| matches!(s.handle, BackendHandle::Container { .. }))
    }

    pub fn process_servers(&self) -> impl Iterator<Item = (&ServiceDescriptor, &ProcessSpec)> {
        self.services.iter().filter_map(|s| match &s.handle {
            BackendHandle::Process(spec) => Some((s, spec)),
            _ => None,
        })
    }
}

fn build_environment(
    conf: &EnvironmentConf,
    mode: ControlMode,
) -> Result<ManagedEnvironment, RegistryError> {
    let id = conf.id.trim().to_string();
    if id.is_empty() {
        return Err(RegistryError::EmptyId { kind: "environment" });
    }
    let found = kind_mode(conf.mode);
    if found != mode {
        return Err(RegistryError::ModeMismatch {
            what: "environment",
            id,
            found,
            active: mode,
        });
    }

    let location = match conf.mode {
        EnvironmentKind::Orchestrated => match conf.namespace.as_deref().filter(|n| !n.is_empty()) {
            Some(ns) => EnvironmentLocation::Namespace(ns.to_string()),
            None => {
                return Err(RegistryError::MissingLocation {
                    environment: id,
                    field: "namespace",
                })
            }
        },
        EnvironmentKind::Compose => match &conf.path {
            Some(path) => EnvironmentLocation::ComposeFile(compose_file(path.clone())),
            None => {
                return Err(RegistryError::MissingLocation {
                    environment: id,
                    field: "path",
                })
            }
        },
        EnvironmentKind::Process => EnvironmentLocation::Processes,
    };

    Ok(ManagedEnvironment {
        name: conf.name.clone().unwrap_or_else(|| id.clone()),
        id,
        location,
        profile: conf.profile.clone(),
        services: conf.services.clone(),
    })
}

/// A directory points at its `docker-compose.yml`; an explicit file is kept.
fn compose_file(path: PathBuf) -> PathBuf {
    let is_file = path
        .extension()
        .map(|ext| ext == "yml" || ext == "yaml")
        .unwrap_or(false);
    if is_file {
        path
    } else {
        path.join(COMPOSE_FILE)
    }
}

fn build_service(
    conf: &ServiceConf,
    mode: ControlMode,
    environments: &[ManagedEnvironment],
    env_index: &HashMap<String, usize>,
) -> Result<ServiceDescriptor, RegistryError> {
    let id = conf.id.trim().to_string();
    if id.is_empty() {
        return Err(RegistryError::EmptyId { kind: "service" });
    }

    let environment = match conf.environment.as_deref() {
        Some(env_id) => match env_index.get(env_id) {
            Some(&i) => Some(&environments[i]),
            None => {
                return Err(RegistryError::UnknownEnvironment {
                    service: id,
                    environment: env_id.to_string(),
                })
            }
        },
        None => None,
    };

    let handle = match &conf.backend {
        BackendConf::Deployment { name, namespace } => {
            let env_ns = environment.and_then(|e| match &e.location {
                EnvironmentLocation::Namespace(ns) => Some(ns.clone()),
                _ => None,
            });
            let namespace = namespace
                .clone()
                .or(env_ns)
                .ok_or_else(|| RegistryError::MissingNamespace { service: id.clone() })?;
            BackendHandle::Deployment {
                namespace,
                name: name.clone().unwrap_or_else(|| id.clone()),
            }
        }
        BackendConf::Compose { service } => {
            let env = environment
                .filter(|e| e.kind() == EnvironmentKind::Compose)
                .ok_or_else(|| RegistryError::WrongEnvironment {
                    service: id.clone(),
                    expected: "compose",
                })?;
            let service = service.clone().unwrap_or_else(|| id.clone());
            if !env.services.is_empty() && !env.services.contains(&service) {
                return Err(RegistryError::UndeclaredService {
                    service,
                    environment: env.id.clone(),
                });
            }
            BackendHandle::Compose {
                environment: env.id.clone(),
                service,
            }
        }
        BackendConf::Container { name } => BackendHandle::Container {
            name: name.clone().unwrap_or_else(|| id.clone()),
        },
        BackendConf::Process {
            command,
            cwd,
            port,
            pattern,
        } => BackendHandle::Process(ProcessSpec {
            command: command.clone(),
            cwd: cwd.clone(),
            port: *port,
            pattern: pattern.clone().unwrap_or_else(|| command.clone()),
        }),
    };

    let found = handle.mode();
    if found != mode {
        return Err(RegistryError::ModeMismatch {
            what: "service",
            id,
            found,
            active: mode,
        });
    }

    Ok(ServiceDescriptor {
        name: conf.name.clone().unwrap_or_else(|| id.clone()),
        id,
        handle,
        url: conf.url.clone(),
        resources: conf.resources.clone(),
        group: conf.group.clone(),
        environment: conf.environment.clone(),
    })
}
