/*!
In-process control-plane stub

Serves the subset of the cluster API the dashboard reads and patches, on an
ephemeral loopback port. Objects are plain JSON so tests can seed exactly the
shape they need; deployment patches are merged into the stored object and
recorded for later inspection.
*/

use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, MethodRouter};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Default)]
struct ClusterState {
    deployments: BTreeMap<String, BTreeMap<String, Value>>,
    pods: BTreeMap<String, Vec<Value>>,
    pod_metrics: BTreeMap<String, Vec<Value>>,
    ingresses: BTreeMap<String, Vec<Value>>,
    releases: BTreeMap<String, Vec<Value>>,
    nodes: Vec<Value>,
    node_usage: Vec<Value>,
    probes: HashMap<String, bool>,
    logs: HashMap<(String, String), Vec<String>>,
    failing: HashSet<String>,
    patches: HashMap<(String, String), Vec<Value>>,
    requests: HashMap<String, usize>,
}

type SharedCluster = Arc<Mutex<ClusterState>>;

/// Running stub; the server task stops when the handle is dropped.
pub struct ControlPlaneStub {
    addr: SocketAddr,
    state: SharedCluster,
    server: JoinHandle<()>,
}

impl ControlPlaneStub {
    pub async fn start() -> Self {
        Self::try_start()
            .await
            .expect("control-plane stub could not bind a loopback port")
    }

    pub async fn try_start() -> anyhow::Result<Self> {
        let state = SharedCluster::default();
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let app = router(state.clone());
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::warn!("control-plane stub stopped: {e}");
            }
        });
        log::debug!("control-plane stub listening on {addr}");
        Ok(Self {
            addr,
            state,
            server,
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    // -- seeding -----------------------------------------------------------

    pub fn add_deployment(&self, namespace: &str, deployment: Value) {
        let name = object_name(&deployment);
        self.state
            .lock()
            .deployments
            .entry(namespace.to_string())
            .or_default()
            .insert(name, deployment);
    }

    pub fn add_pod(&self, namespace: &str, pod: Value) {
        push(&mut self.state.lock().pods, namespace, pod);
    }

    pub fn add_ingress(&self, namespace: &str, ingress: Value) {
        push(&mut self.state.lock().ingresses, namespace, ingress);
    }

    pub fn add_release(&self, namespace: &str, chart: Value) {
        push(&mut self.state.lock().releases, namespace, chart);
    }

    pub fn set_pod_usage(&self, namespace: &str, usage: Value) {
        push(&mut self.state.lock().pod_metrics, namespace, usage);
    }

    pub fn add_node(&self, node: Value, usage: Value) {
        let mut state = self.state.lock();
        state.nodes.push(node);
        state.node_usage.push(usage);
    }

    /// Probes answer `ok` unless switched off here.
    pub fn set_probe(&self, probe: &str, healthy: bool) {
        self.state.lock().probes.insert(probe.to_string(), healthy);
    }

    pub fn set_logs(&self, namespace: &str, pod: &str, lines: &[&str]) {
        self.state.lock().logs.insert(
            (namespace.to_string(), pod.to_string()),
            lines.iter().map(|l| l.to_string()).collect(),
        );
    }

    /// Every namespaced request for `namespace` answers 500 from now on.
    pub fn fail_namespace(&self, namespace: &str) {
        self.state.lock().failing.insert(namespace.to_string());
    }

    // -- inspection --------------------------------------------------------

    /// Requests seen for a path, query string excluded.
    pub fn request_count(&self, path: &str) -> usize {
        self.state.lock().requests.get(path).copied().unwrap_or(0)
    }

    pub fn replicas(&self, namespace: &str, name: &str) -> Option<u64> {
        self.state
            .lock()
            .deployments
            .get(namespace)?
            .get(name)?
            .pointer("/spec/replicas")?
            .as_u64()
    }

    pub fn patches(&self, namespace: &str, name: &str) -> Vec<Value> {
        self.state
            .lock()
            .patches
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

impl Drop for ControlPlaneStub {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn object_name(object: &Value) -> String {
    object
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn push(map: &mut BTreeMap<String, Vec<Value>>, namespace: &str, object: Value) {
    map.entry(namespace.to_string()).or_default().push(object);
}

fn router(state: SharedCluster) -> Router {
    Router::new()
        .route("/healthz", probe("healthz"))
        .route("/livez", probe("livez"))
        .route("/readyz", probe("readyz"))
        .route("/version", get(version))
        .route("/api/v1/nodes", get(nodes))
        .route("/apis/metrics.k8s.io/v1beta1/nodes", get(node_metrics))
        .route(
            "/apis/metrics.k8s.io/v1beta1/namespaces/{ns}/pods",
            listing(Listing::PodMetrics),
        )
        .route("/api/v1/namespaces/{ns}/pods", listing(Listing::Pods))
        .route("/api/v1/namespaces/{ns}/pods/{pod}/log", get(pod_log))
        .route("/apis/apps/v1/namespaces/{ns}/deployments", get(deployments))
        .route(
            "/apis/apps/v1/namespaces/{ns}/deployments/{name}",
            get(deployment).patch(patch_deployment),
        )
        .route(
            "/apis/networking.k8s.io/v1/namespaces/{ns}/ingresses",
            listing(Listing::Ingresses),
        )
        .route(
            "/apis/helm.cattle.io/v1/namespaces/{ns}/helmcharts",
            listing(Listing::Releases),
        )
        .layer(middleware::from_fn_with_state(state.clone(), count_requests))
        .with_state(state)
}

async fn count_requests(State(state): State<SharedCluster>, req: Request, next: Next) -> Response {
    *state
        .lock()
        .requests
        .entry(req.uri().path().to_string())
        .or_default() += 1;
    next.run(req).await
}

fn status(code: StatusCode, reason: &str, message: String) -> Response {
    let body = json!({
        "kind": "Status",
        "status": "Failure",
        "reason": reason,
        "message": message,
        "code": code.as_u16(),
    });
    (code, Json(body)).into_response()
}

fn list(items: Vec<Value>) -> Response {
    Json(json!({"kind": "List", "items": items})).into_response()
}

fn probe(name: &'static str) -> MethodRouter<SharedCluster> {
    get(move |State(state): State<SharedCluster>| async move {
        let healthy = state.lock().probes.get(name).copied().unwrap_or(true);
        if healthy {
            (StatusCode::OK, "ok".to_string())
        } else {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("[-]{name} failed: reason withheld"),
            )
        }
    })
}

async fn version() -> Json<Value> {
    Json(json!({
        "major": "1",
        "minor": "30",
        "gitVersion": "v1.30.4+k3s1",
        "platform": "linux/amd64",
    }))
}

async fn nodes(State(state): State<SharedCluster>) -> Response {
    list(state.lock().nodes.clone())
}

async fn node_metrics(State(state): State<SharedCluster>) -> Response {
    list(state.lock().node_usage.clone())
}

#[derive(Debug, Clone, Copy)]
enum Listing {
    Pods,
    PodMetrics,
    Ingresses,
    Releases,
}

impl ClusterState {
    fn listing(&self, kind: Listing) -> &BTreeMap<String, Vec<Value>> {
        match kind {
            Listing::Pods => &self.pods,
            Listing::PodMetrics => &self.pod_metrics,
            Listing::Ingresses => &self.ingresses,
            Listing::Releases => &self.releases,
        }
    }
}

fn unavailable(ns: &str) -> Response {
    status(
        StatusCode::INTERNAL_SERVER_ERROR,
        "InternalError",
        format!("namespace {ns} unavailable"),
    )
}

fn listing(kind: Listing) -> MethodRouter<SharedCluster> {
    get(
        move |State(state): State<SharedCluster>, Path(ns): Path<String>| async move {
            let state = state.lock();
            if state.failing.contains(&ns) {
                return unavailable(&ns);
            }
            list(state.listing(kind).get(&ns).cloned().unwrap_or_default())
        },
    )
}

async fn deployments(State(state): State<SharedCluster>, Path(ns): Path<String>) -> Response {
    let state = state.lock();
    if state.failing.contains(&ns) {
        return unavailable(&ns);
    }
    let items = state
        .deployments
        .get(&ns)
        .map(|m| m.values().cloned().collect())
        .unwrap_or_default();
    list(items)
}

async fn deployment(
    State(state): State<SharedCluster>,
    Path((ns, name)): Path<(String, String)>,
) -> Response {
    match state.lock().deployments.get(&ns).and_then(|m| m.get(&name)) {
        Some(d) => Json(d.clone()).into_response(),
        None => status(
            StatusCode::NOT_FOUND,
            "NotFound",
            format!("deployments.apps \"{name}\" not found"),
        ),
    }
}

async fn patch_deployment(
    State(state): State<SharedCluster>,
    Path((ns, name)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.contains("merge-patch") {
        return status(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "UnsupportedMediaType",
            format!("unsupported patch type {content_type:?}"),
        );
    }
    let patch: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return status(StatusCode::BAD_REQUEST, "BadRequest", e.to_string()),
    };

    let mut state = state.lock();
    if state.failing.contains(&ns) {
        return unavailable(&ns);
    }
    let Some(stored) = state.deployments.get_mut(&ns).and_then(|m| m.get_mut(&name)) else {
        return status(
            StatusCode::NOT_FOUND,
            "NotFound",
            format!("deployments.apps \"{name}\" not found"),
        );
    };

    merge(stored, &patch);
    // the stub converges instantly
    if let Some(replicas) = patch.pointer("/spec/replicas").and_then(Value::as_u64) {
        for field in ["replicas", "readyReplicas", "availableReplicas", "updatedReplicas"] {
            stored["status"][field] = json!(replicas);
        }
    }
    let updated = stored.clone();
    state.patches.entry((ns, name)).or_default().push(patch);
    Json(updated).into_response()
}

/// JSON merge: objects merge key by key, anything else replaces.
fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = json!({});
    }
    if let Value::Object(map) = target {
        for (key, value) in patch {
            if value.is_null() {
                map.remove(key);
            } else {
                merge(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogParams {
    tail_lines: Option<usize>,
}

async fn pod_log(
    State(state): State<SharedCluster>,
    Path((ns, pod)): Path<(String, String)>,
    Query(params): Query<LogParams>,
) -> Response {
    let state = state.lock();
    let Some(lines) = state.logs.get(&(ns, pod.clone())) else {
        return status(
            StatusCode::NOT_FOUND,
            "NotFound",
            format!("pods \"{pod}\" not found"),
        );
    };
    let skip = params
        .tail_lines
        .map(|n| lines.len().saturating_sub(n))
        .unwrap_or(0);
    let body: String = lines[skip..].iter().map(|l| format!("{l}\n")).collect();
    (StatusCode::OK, body).into_response()
}
