//! Compose and container-runtime command lines, and parsers for their
//! structured output.
//!
//! `docker compose ps --format json` prints a JSON array on older releases and
//! one object per line on newer ones; both are accepted.

use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::warn;

use crate::execution::{CommandSpec, CONTROL_TIMEOUT, LOG_TIMEOUT, STATUS_TIMEOUT};
use crate::models::{ContainerSummary, ControlAction, EnvironmentStatus};
use crate::registry::{EnvironmentLocation, ManagedEnvironment};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ComposeEntry {
    pub service: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub health: String,
    // some releases print `null` for containers without published ports
    pub publishers: Option<Vec<Publisher>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Publisher {
    #[serde(rename = "URL")]
    pub url: String,
    pub target_port: u16,
    pub published_port: u16,
    pub protocol: String,
}

impl ComposeEntry {
    pub fn running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }

    pub fn published_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .publishers
            .iter()
            .flatten()
            .map(|p| p.published_port)
            .filter(|p| *p != 0)
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct DockerPsEntry {
    #[serde(rename = "ID")]
    id: String,
    names: String,
    image: String,
    state: String,
    status: String,
    ports: String,
}

pub fn parse_compose_ps(output: &str) -> Vec<ComposeEntry> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).unwrap_or_else(|e| {
            warn!(error = %e, "unreadable compose ps output");
            Vec::new()
        });
    }
    parse_lines(trimmed)
}

pub fn parse_docker_ps(output: &str) -> Vec<ContainerSummary> {
    parse_lines::<DockerPsEntry>(output)
        .into_iter()
        .map(|e| ContainerSummary {
            running: e.state.eq_ignore_ascii_case("running"),
            id: e.id,
            name: e.names,
            image: e.image,
            state: e.state,
            status: e.status,
            ports: e.ports,
        })
        .collect()
}

fn parse_lines<T: serde::de::DeserializeOwned>(output: &str) -> Vec<T> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "skipping unreadable status line");
                None
            }
        })
        .collect()
}

/// Running/total per declared member. Without a declaration, every service
/// the tool reported counts.
pub fn environment_status(declared: &[String], entries: &[ComposeEntry]) -> EnvironmentStatus {
    let members: Vec<&str> = if declared.is_empty() {
        let mut seen: Vec<&str> = entries.iter().map(|e| e.service.as_str()).collect();
        seen.sort_unstable();
        seen.dedup();
        seen
    } else {
        declared.iter().map(String::as_str).collect()
    };

    let services: BTreeMap<String, bool> = members
        .iter()
        .map(|name| {
            let up = entries.iter().any(|e| e.service == *name && e.running());
            (name.to_string(), up)
        })
        .collect();
    let running_count = services.values().filter(|up| **up).count();

    EnvironmentStatus {
        running: running_count > 0,
        running_count,
        total: services.len(),
        services,
    }
}

// ---------------------------------------------------------------------------
// command lines
// ---------------------------------------------------------------------------

fn compose_base(env: &ManagedEnvironment) -> Option<CommandSpec> {
    let EnvironmentLocation::ComposeFile(file) = &env.location else {
        return None;
    };
    let mut spec = CommandSpec::new("docker").args(["compose", "-f"]).arg(file.to_string_lossy());
    if let Some(dir) = file.parent().filter(|d| !d.as_os_str().is_empty()) {
        spec = spec.cwd(dir);
    }
    if let Some(profile) = &env.profile {
        spec = spec.args(["--profile", profile.as_str()]);
    }
    Some(spec)
}

pub fn compose_ps(env: &ManagedEnvironment) -> Option<CommandSpec> {
    compose_base(env).map(|spec| {
        spec.args(["ps", "--all", "--format", "json"])
            .timeout(STATUS_TIMEOUT)
    })
}

pub fn compose_service_command(
    env: &ManagedEnvironment,
    service: &str,
    action: ControlAction,
) -> Option<CommandSpec> {
    let verb: &[&str] = match action {
        ControlAction::Start => &["up", "-d"],
        ControlAction::Stop => &["stop"],
        ControlAction::Restart => &["restart"],
        ControlAction::Down => &["rm", "-s", "-f"],
    };
    compose_base(env).map(|spec| {
        spec.args(verb.iter().copied())
            .arg(service)
            .timeout(CONTROL_TIMEOUT)
    })
}

pub fn compose_environment_command(
    env: &ManagedEnvironment,
    action: ControlAction,
) -> Option<CommandSpec> {
    let verb: &[&str] = match action {
        ControlAction::Start => &["up", "-d"],
        ControlAction::Stop => &["stop"],
        ControlAction::Restart => &["restart"],
        ControlAction::Down => &["down"],
    };
    compose_base(env).map(|spec| spec.args(verb.iter().copied()).timeout(CONTROL_TIMEOUT))
}

pub fn compose_logs(env: &ManagedEnvironment, service: &str, tail: u32) -> Option<CommandSpec> {
    compose_base(env).map(|spec| {
        spec.args(["logs", "--no-color", "--tail"])
            .arg(tail.to_string())
            .arg(service)
            .timeout(LOG_TIMEOUT)
    })
}

pub fn docker_ps() -> CommandSpec {
    CommandSpec::new("docker")
        .args(["ps", "-a", "--format", "{{json .}}"])
        .timeout(STATUS_TIMEOUT)
}

/// `down` on a lone container only stops it.
pub fn container_command(name: &str, action: ControlAction) -> CommandSpec {
    let verb = match action {
        ControlAction::Start => "start",
        ControlAction::Stop | ControlAction::Down => "stop",
        ControlAction::Restart => "restart",
    };
    CommandSpec::new("docker")
        .args([verb, name])
        .timeout(CONTROL_TIMEOUT)
}

pub fn container_logs(name: &str, tail: u32) -> CommandSpec {
    CommandSpec::new("docker")
        .args(["logs", "--tail"])
        .arg(tail.to_string())
        .arg(name)
        .timeout(LOG_TIMEOUT)
}
