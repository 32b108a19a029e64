//! Cluster control-plane access: HTTP client, payload types, quantity parsing.

pub mod client;
pub mod quantity;
pub mod types;

pub use client::{DeploymentAction, ProxyClient, ProxyError};
pub use types::{
    ClusterHealth, ClusterVersion, DeploymentSummary, NodeMetrics, PodMetrics, PodState,
    PodSummary, ReleaseManifest, RouteRule,
};
