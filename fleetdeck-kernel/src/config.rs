use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

use crate::models::ControlMode;

pub const CONFIG_ENV: &str = "FLEETDECK_CONFIG";
pub const API_KEY_ENV: &str = "FLEETDECK_API_KEY";
pub const PROXY_URL_ENV: &str = "FLEETDECK_PROXY_URL";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config {path}: {message}")]
    Invalid { path: PathBuf, message: String },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FleetConfig {
    pub control_mode: ControlMode,
    pub listen: String,
    pub api_key: Option<String>,
    pub proxy: ProxyConf,
    pub cache_ttl: CacheTtlConf,
    pub tick_secs: u64,
    pub log_dir: PathBuf,
    pub environments: Vec<EnvironmentConf>,
    pub services: Vec<ServiceConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProxyConf {
    pub base_url: String, // ex: "http://127.0.0.1:8001" (kubectl proxy)
    pub namespaces: Vec<String>,
    pub timeout_secs: u64,
}

/// Seconds each cluster read stays cached.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheTtlConf {
    pub availability: u64,
    pub health: u64,
    pub metrics: u64,
    pub pods: u64,
    pub deployments: u64,
    pub routes: u64,
    pub version: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentKind {
    Orchestrated,
    Compose,
    Process,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EnvironmentConf {
    pub id: String,
    pub name: Option<String>,
    pub mode: EnvironmentKind,
    /// compose directory or file
    pub path: Option<PathBuf>,
    pub namespace: Option<String>,
    pub profile: Option<String>,
    #[serde(default)]
    pub services: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceConf {
    pub id: String,
    pub name: Option<String>,
    pub url: Option<String>,
    pub group: Option<String>,
    pub resources: Option<String>,
    pub environment: Option<String>,
    pub backend: BackendConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConf {
    Deployment {
        name: Option<String>,
        namespace: Option<String>,
    },
    Compose {
        service: Option<String>,
    },
    Container {
        name: Option<String>,
    },
    Process {
        command: String,
        cwd: Option<PathBuf>,
        port: Option<u16>,
        pattern: Option<String>,
    },
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            control_mode: ControlMode::Local,
            listen: "0.0.0.0:8080".into(),
            api_key: None,
            proxy: ProxyConf::default(),
            cache_ttl: CacheTtlConf::default(),
            tick_secs: 2,
            log_dir: PathBuf::from("logs"),
            environments: Vec::new(),
            services: Vec::new(),
        }
    }
}

impl Default for ProxyConf {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8001".into(),
            namespaces: vec!["default".into()],
            timeout_secs: 5,
        }
    }
}

impl Default for CacheTtlConf {
    fn default() -> Self {
        Self {
            availability: 5,
            health: 5,
            metrics: 10,
            pods: 15,
            deployments: 15,
            routes: 30,
            version: 60,
        }
    }
}

impl FleetConfig {
    /// Environment variables win over the file for secrets and the proxy URL.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(API_KEY_ENV).filter(|k| !k.is_empty()) {
            self.api_key = Some(key);
        }
        if let Some(url) = lookup(PROXY_URL_ENV).filter(|u| !u.is_empty()) {
            self.proxy.base_url = url;
        }
    }

    pub fn parse(path: &Path, text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Self = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if cfg.proxy.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                path: path.to_path_buf(),
                message: "proxy.timeout_secs must be at least 1".into(),
            });
        }
        Ok(cfg)
    }
}

pub async fn load_config_from(path: &Path) -> Result<FleetConfig, ConfigError> {
    if !path.exists() {
        warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(FleetConfig::default());
    }
    let text = fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    FleetConfig::parse(path, &text)
}

pub async fn load_config() -> Result<FleetConfig, ConfigError> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "fleetdeck.yaml".into());
    let mut cfg = load_config_from(Path::new(&path)).await?;
    cfg.apply_overrides(|name| std::env::var(name).ok());
    Ok(cfg)
}
