/*!
JSON builders for control-plane objects

Shapes follow what the cluster API returns, trimmed to the fields the
dashboard reads. Pods are owned through a ReplicaSet named
`<deployment>-<POD_TEMPLATE_HASH>`, as the controller would name it.
*/

use serde_json::{json, Value};

pub const POD_TEMPLATE_HASH: &str = "7c9f8d5b6";

pub fn deployment(name: &str, replicas: u32, ready: u32) -> Value {
    json!({
        "metadata": {
            "name": name,
            "labels": {"app": name},
            "creationTimestamp": "2024-05-01T10:00:00Z"
        },
        "spec": {
            "replicas": replicas,
            "template": {
                "metadata": {"labels": {"app": name}},
                "spec": {
                    "containers": [{
                        "name": name,
                        "image": format!("registry.local/{name}:1.0"),
                        "ports": [{"containerPort": 8080}]
                    }]
                }
            }
        },
        "status": {
            "replicas": replicas,
            "readyReplicas": ready,
            "availableReplicas": ready,
            "updatedReplicas": replicas
        }
    })
}

pub fn pod(name: &str, deployment: &str, ready: bool) -> Value {
    json!({
        "metadata": {
            "name": name,
            "labels": {"app": deployment},
            "ownerReferences": [{
                "kind": "ReplicaSet",
                "name": format!("{deployment}-{POD_TEMPLATE_HASH}")
            }],
            "creationTimestamp": "2024-05-01T10:00:05Z"
        },
        "spec": {
            "nodeName": "node-a",
            "containers": [{
                "name": deployment,
                "image": format!("registry.local/{deployment}:1.0"),
                "ports": [{"containerPort": 8080}]
            }]
        },
        "status": {
            "phase": "Running",
            "containerStatuses": [{"name": deployment, "ready": ready, "restartCount": 0}]
        }
    })
}

/// Capacity and allocatable are equal.
pub fn node(name: &str, cpu: &str, memory: &str) -> Value {
    json!({
        "metadata": {"name": name},
        "status": {
            "capacity": {"cpu": cpu, "memory": memory},
            "allocatable": {"cpu": cpu, "memory": memory}
        }
    })
}

pub fn node_usage(name: &str, cpu: &str, memory: &str) -> Value {
    json!({
        "metadata": {"name": name},
        "usage": {"cpu": cpu, "memory": memory}
    })
}

pub fn pod_usage(pod: &str, cpu: &str, memory: &str) -> Value {
    json!({
        "metadata": {"name": pod},
        "containers": [{"name": "main", "usage": {"cpu": cpu, "memory": memory}}]
    })
}

pub fn ingress(name: &str, host: &str, service: &str, port: u16) -> Value {
    json!({
        "metadata": {"name": name},
        "spec": {
            "ingressClassName": "traefik",
            "rules": [{
                "host": host,
                "http": {"paths": [{
                    "path": "/",
                    "pathType": "Prefix",
                    "backend": {"service": {"name": service, "port": {"number": port}}}
                }]}
            }]
        }
    })
}

pub fn helm_chart(name: &str, chart: &str, version: &str) -> Value {
    json!({
        "metadata": {"name": name},
        "spec": {
            "chart": chart,
            "version": version,
            "repo": "https://charts.example.org",
            "targetNamespace": name
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_owner_names_the_replica_set() {
        let p = pod("web-7c9f8d5b6-abcde", "web", true);
        assert_eq!(
            p["metadata"]["ownerReferences"][0]["name"],
            format!("web-{POD_TEMPLATE_HASH}")
        );
        assert_eq!(p["status"]["containerStatuses"][0]["ready"], true);
    }
}
