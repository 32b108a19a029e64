/**
 * STATUS AGGREGATOR - one unified snapshot per tick
 *
 * Asks the active backend and the host sampler concurrently, then merges the
 * result with the static catalog and the dispatcher's last errors. Used by
 * every live connection on its 2s tick and by the pull-style REST routes.
 */

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::backend::Backend;
use crate::clock::StrictClock;
use crate::host::HostProbe;
use crate::models::{ControlModeConfig, ServiceState, ServiceStatus, StatusSnapshot, Summary};
use crate::registry::EnvironmentRegistry;
use crate::state::LastErrors;

pub struct StatusAggregator {
    backend: Arc<dyn Backend>,
    registry: Arc<EnvironmentRegistry>,
    host: Arc<dyn HostProbe>,
    errors: LastErrors,
    proxy_url: Option<String>,
    clock: StrictClock,
    sequence: AtomicU64,
}

impl StatusAggregator {
    pub fn new(
        backend: Arc<dyn Backend>,
        registry: Arc<EnvironmentRegistry>,
        host: Arc<dyn HostProbe>,
        errors: LastErrors,
    ) -> Self {
        Self {
            backend,
            registry,
            host,
            errors,
            proxy_url: None,
            clock: StrictClock::new(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Shown in the snapshot's control-mode block.
    pub fn with_proxy_url(mut self, url: impl Into<String>) -> Self {
        self.proxy_url = Some(url.into());
        self
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        let (mut status, (resource_usage, system_stats)) =
            futures::join!(self.backend.list_status(), self.host.sample());

        let statuses: BTreeMap<String, ServiceStatus> = self
            .registry
            .services()
            .iter()
            .map(|svc| {
                let state = status
                    .services
                    .remove(&svc.id)
                    .unwrap_or_else(ServiceState::unknown);
                let entry = ServiceStatus {
                    id: svc.id.clone(),
                    name: svc.name.clone(),
                    environment: svc.environment.clone(),
                    url: svc.url.clone(),
                    group: svc.group.clone(),
                    resources: svc.resources.clone(),
                    state,
                };
                (svc.id.clone(), entry)
            })
            .collect();

        let errors: BTreeMap<String, String> = self.errors.snapshot().into_iter().collect();
        let running = statuses.values().filter(|s| s.state.running).count();
        let summary = Summary {
            total: statuses.len(),
            running,
            stopped: statuses.len() - running,
            errors: errors.len(),
        };

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let timestamp = self.clock.next_millis();
        debug!(sequence, running, total = summary.total, "snapshot built");

        StatusSnapshot {
            sequence,
            timestamp,
            resource_usage,
            statuses,
            errors,
            system_stats,
            summary,
            control_mode_config: ControlModeConfig {
                mode: self.backend.mode(),
                namespaces: self.registry.namespaces().to_vec(),
                proxy_url: self.proxy_url.clone(),
            },
            details: status.details,
        }
    }
}
