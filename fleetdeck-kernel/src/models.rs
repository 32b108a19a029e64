use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::cluster::{
    ClusterHealth, ClusterVersion, DeploymentSummary, NodeMetrics, PodSummary, ReleaseManifest,
    RouteRule,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    Orchestrated,
    #[default]
    Local,
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMode::Orchestrated => f.write_str("orchestrated"),
            ControlMode::Local => f.write_str("local"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Start,
    Stop,
    Restart,
    Down,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Start => "start",
            ControlAction::Stop => "stop",
            ControlAction::Restart => "restart",
            ControlAction::Down => "down",
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown action '{0}' (expected start, stop, restart or down)")]
pub struct InvalidAction(pub String);

impl FromStr for ControlAction {
    type Err = InvalidAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(ControlAction::Start),
            "stop" => Ok(ControlAction::Stop),
            "restart" => Ok(ControlAction::Restart),
            "down" => Ok(ControlAction::Down),
            _ => Err(InvalidAction(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlFailure {
    pub kind: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ControlFailure>,
}

impl ControlResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>, kind: &str, detail: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(ControlFailure {
                kind: kind.to_string(),
                detail: detail.into(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInstance {
    pub name: String,
    pub image: Option<String>,
    pub ports: Vec<u16>,
    pub restarts: u32,
    pub ready: u32,
    pub total: u32,
    pub state: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceUsage {
    pub cpu_millicores: u64,
    pub memory_bytes: u64,
}

/// What a backend knows about one service on this tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceState {
    pub running: bool,
    pub state: String,
    pub instances: Vec<RuntimeInstance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_replicas: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ServiceUsage>,
}

impl ServiceState {
    pub fn unknown() -> Self {
        Self {
            state: "unknown".into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<String>,
    #[serde(flatten)]
    pub state: ServiceState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStats {
    pub cpu_percent: f64,
    pub cpu_count: usize,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub memory_used: String,
    pub memory_total: String,
    pub disk_used_bytes: u64,
    pub disk_total_bytes: u64,
    pub disk_used: String,
    pub disk_total: String,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlModeConfig {
    pub mode: ControlMode,
    pub namespaces: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterView {
    pub proxy_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<ClusterHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<ClusterVersion>,
    pub nodes: Vec<NodeMetrics>,
    pub pods: Vec<PodSummary>,
    pub deployments: Vec<DeploymentSummary>,
    pub routes: Vec<RouteRule>,
    pub releases: Vec<ReleaseManifest>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentStatus {
    pub running: bool,
    pub running_count: usize,
    pub total: usize,
    pub services: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    pub ports: String,
    pub running: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessServerStatus {
    pub running: bool,
    pub pids: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub port_open: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalView {
    pub environments: BTreeMap<String, EnvironmentStatus>,
    pub containers: Vec<ContainerSummary>,
    pub npm_servers: BTreeMap<String, ProcessServerStatus>,
}

/// Mode-specific part of a snapshot, flattened into the top-level frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ModeDetails {
    Cluster(ClusterView),
    Local(LocalView),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub sequence: u64,
    pub timestamp: i64,
    pub resource_usage: ResourceUsage,
    pub statuses: BTreeMap<String, ServiceStatus>,
    pub errors: BTreeMap<String, String>,
    pub system_stats: SystemStats,
    pub summary: Summary,
    pub control_mode_config: ControlModeConfig,
    #[serde(flatten)]
    pub details: ModeDetails,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_parse_case_insensitively() {
        assert_eq!("start".parse::<ControlAction>(), Ok(ControlAction::Start));
        assert_eq!("Stop".parse::<ControlAction>(), Ok(ControlAction::Stop));
        assert_eq!(" restart ".parse::<ControlAction>(), Ok(ControlAction::Restart));
        assert_eq!("down".parse::<ControlAction>(), Ok(ControlAction::Down));
        assert!("scale".parse::<ControlAction>().is_err());
    }

    #[test]
    fn snapshot_flattens_mode_fields() {
        let snapshot = StatusSnapshot {
            sequence: 3,
            timestamp: 1_700_000_000_000,
            resource_usage: ResourceUsage::default(),
            statuses: BTreeMap::new(),
            errors: BTreeMap::new(),
            system_stats: SystemStats::default(),
            summary: Summary::default(),
            control_mode_config: ControlModeConfig {
                mode: ControlMode::Local,
                namespaces: vec![],
                proxy_url: None,
            },
            details: ModeDetails::Local(LocalView::default()),
        };

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["sequence"], 3);
        assert_eq!(value["controlModeConfig"]["mode"], "local");
        assert!(value.get("npmServers").is_some());
        assert!(value.get("environments").is_some());
        assert!(value.get("details").is_none());
        assert!(value.get("proxyAvailable").is_none());
    }

    #[test]
    fn service_status_flattens_state() {
        let status = ServiceStatus {
            id: "web".into(),
            name: "Web".into(),
            environment: None,
            url: None,
            group: None,
            resources: None,
            state: ServiceState {
                running: true,
                state: "running".into(),
                ready_replicas: Some(2),
                desired_replicas: Some(2),
                ..ServiceState::default()
            },
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["running"], true);
        assert_eq!(value["readyReplicas"], 2);
        assert!(value.get("usage").is_none());
    }

    #[test]
    fn failed_result_carries_error() {
        let result = ControlResult::failed("stop web failed", "rejected", "409 conflict");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"]["kind"], "rejected");
        assert!(serde_json::to_value(ControlResult::ok("done")).unwrap().get("error").is_none());
    }
}
