//! One capability, two implementations: the cluster backend talks to the
//! control-plane proxy, the local backend drives compose, the container
//! runtime and the process table. Aggregator and dispatcher only see the trait.

pub mod cluster;
pub mod compose;
pub mod local;

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::cluster::ProxyError;
use crate::execution::ExecError;
use crate::models::{ControlAction, ControlMode, ModeDetails, ServiceState};
use crate::processes::ProcessError;
use crate::registry::{ManagedEnvironment, ServiceDescriptor};

pub use cluster::ClusterBackend;
pub use local::LocalBackend;

/// Everything one backend observed on a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendStatus {
    pub services: BTreeMap<String, ServiceState>,
    pub details: ModeDetails,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{target} does not support {action}")]
    Unsupported {
        target: String,
        action: ControlAction,
    },
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("{0}")]
    Rejected(String),
}

impl BackendError {
    /// Unknown deployment on the cluster side reads as a not-found.
    pub fn is_not_found(&self) -> bool {
        match self {
            BackendError::NotFound(_) => true,
            BackendError::Proxy(e) => e.status_code() == Some(404),
            _ => false,
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn mode(&self) -> ControlMode;

    /// Current state of every managed service. Never fails: unreachable
    /// sources degrade to empty values.
    async fn list_status(&self) -> BackendStatus;

    async fn control_service(
        &self,
        service: &ServiceDescriptor,
        action: ControlAction,
    ) -> Result<String, BackendError>;

    async fn control_environment(
        &self,
        environment: &ManagedEnvironment,
        services: &[&ServiceDescriptor],
        action: ControlAction,
    ) -> Result<String, BackendError>;

    async fn get_logs(&self, service: &ServiceDescriptor, tail: u32) -> Result<String, BackendError>;
}
