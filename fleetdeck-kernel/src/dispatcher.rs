use std::sync::Arc;
use tracing::{error, info};

use crate::backend::{Backend, BackendError};
use crate::models::{ControlAction, ControlResult};
use crate::registry::EnvironmentRegistry;
use crate::state::LastErrors;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{id}: {message}")]
    Rejected { id: String, message: String },
    #[error("{id} does not support {action}")]
    Unsupported { id: String, action: ControlAction },
}

impl ControlError {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::NotFound(_) => "notFound",
            ControlError::Rejected { .. } => "rejected",
            ControlError::Unsupported { .. } => "unsupported",
        }
    }

    pub fn into_result(self, action: ControlAction) -> ControlResult {
        let message = format!("{action} failed");
        let kind = self.kind();
        ControlResult::failed(message, kind, self.to_string())
    }
}

/// Executes control actions against the active backend and keeps the
/// per-target last error (set on failure, cleared by the next success).
/// Returns as soon as the backend accepted the action; convergence shows up
/// on a later tick.
pub struct ControlDispatcher {
    backend: Arc<dyn Backend>,
    registry: Arc<EnvironmentRegistry>,
    errors: LastErrors,
}

impl ControlDispatcher {
    pub fn new(
        backend: Arc<dyn Backend>,
        registry: Arc<EnvironmentRegistry>,
        errors: LastErrors,
    ) -> Self {
        Self {
            backend,
            registry,
            errors,
        }
    }

    pub async fn dispatch(&self, service_id: &str, action: ControlAction) -> Result<String, ControlError> {
        let service = self
            .registry
            .service(service_id)
            .ok_or_else(|| ControlError::NotFound(format!("service {service_id}")))?;

        let outcome = self.backend.control_service(service, action).await;
        self.settle(service_id, action, outcome)
    }

    pub async fn dispatch_environment(
        &self,
        env_id: &str,
        action: ControlAction,
    ) -> Result<String, ControlError> {
        let environment = self
            .registry
            .environment(env_id)
            .ok_or_else(|| ControlError::NotFound(format!("environment {env_id}")))?;
        let members = self.registry.services_in(env_id);

        let outcome = self
            .backend
            .control_environment(environment, &members, action)
            .await;
        self.settle(env_id, action, outcome)
    }

    pub async fn logs(&self, service_id: &str, tail: u32) -> Result<String, ControlError> {
        let service = self
            .registry
            .service(service_id)
            .ok_or_else(|| ControlError::NotFound(format!("service {service_id}")))?;
        self.backend
            .get_logs(service, tail)
            .await
            .map_err(|e| classify(service_id, e))
    }

    /// Wraps either dispatch into the wire-level result.
    pub async fn execute(&self, target: Target<'_>, action: ControlAction) -> ControlResult {
        let outcome = match target {
            Target::Service(id) => self.dispatch(id, action).await,
            Target::Environment(id) => self.dispatch_environment(id, action).await,
        };
        match outcome {
            Ok(message) => ControlResult::ok(message),
            Err(e) => e.into_result(action),
        }
    }

    fn settle(
        &self,
        id: &str,
        action: ControlAction,
        outcome: Result<String, BackendError>,
    ) -> Result<String, ControlError> {
        match outcome {
            Ok(message) => {
                self.errors.clear(id);
                info!(target_id = id, %action, "{message}");
                Ok(message)
            }
            Err(e) => {
                let err = classify(id, e);
                if !matches!(err, ControlError::Unsupported { .. }) {
                    error!(target_id = id, %action, error = %err, "control action failed");
                    self.errors.record(id, err.to_string());
                }
                Err(err)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    Service(&'a str),
    Environment(&'a str),
}

fn classify(id: &str, e: BackendError) -> ControlError {
    if e.is_not_found() {
        return ControlError::NotFound(e.to_string());
    }
    match e {
        BackendError::Unsupported { action, .. } => ControlError::Unsupported {
            id: id.to_string(),
            action,
        },
        other => ControlError::Rejected {
            id: id.to_string(),
            message: other.to_string(),
        },
    }
}
