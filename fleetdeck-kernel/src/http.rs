/**
 * DASHBOARD API - REST surface and live channel of the kernel
 *
 * Read routes render the current snapshot, write routes go through the control
 * dispatcher and answer with a ControlResult. Every route except /health needs
 * the API key, either as the x-api-key header or, for /ws, a token query
 * parameter. Unknown ids are 404, invalid actions 400, backend refusals 502.
 */

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{future, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregator::StatusAggregator;
use crate::dispatcher::{ControlDispatcher, ControlError};
use crate::live::{run_session, Inbound};
use crate::models::{
    ContainerSummary, ControlAction, ControlResult, EnvironmentStatus, ModeDetails,
    ProcessServerStatus, ServiceStatus, StatusSnapshot,
};
use crate::registry::{BackendHandle, EnvironmentLocation, EnvironmentRegistry};

const DEFAULT_TAIL: u32 = 100;
const MAX_TAIL: u32 = 5000;

#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<StatusAggregator>,
    pub dispatcher: Arc<ControlDispatcher>,
    pub registry: Arc<EnvironmentRegistry>,
    pub api_key: Option<Arc<str>>,
    pub tick: Duration,
}

async fn require_api_key(
    State(app): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    if path == "/health" {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref() else {
        warn!(path, "API key not configured, access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let header_ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    // browsers cannot set headers on a websocket upgrade
    let token_ok = path == "/ws"
        && Query::<HashMap<String, String>>::try_from_uri(req.uri())
            .ok()
            .and_then(|q| q.0.get("token").map(|t| t == expected))
            .unwrap_or(false);

    if !(header_ok || token_ok) {
        debug!(path, "rejected unauthenticated request");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/snapshot", get(get_snapshot))
        .route("/api/services", get(list_services))
        .route("/api/services/{id}/logs", get(service_logs))
        .route("/api/services/{id}/{action}", post(control_service))
        .route("/api/environments", get(list_environments))
        .route("/api/environments/{id}/{action}", post(control_environment))
        .route("/api/containers", get(list_containers))
        .route("/api/npm-servers", get(list_npm_servers))
        .route("/api/npm-servers/{id}/{action}", post(control_npm_server))
        .route("/api/k8s-style/deployments/{id}/{action}", post(control_deployment))
        .route("/ws", get(live))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

type ControlResponse = (StatusCode, Json<ControlResult>);

fn parse_action(raw: &str) -> Result<ControlAction, ControlResponse> {
    raw.parse().map_err(|e: crate::models::InvalidAction| {
        (
            StatusCode::BAD_REQUEST,
            Json(ControlResult::failed(
                format!("{raw} failed"),
                "invalidAction",
                e.to_string(),
            )),
        )
    })
}

fn respond(action: ControlAction, outcome: Result<String, ControlError>) -> ControlResponse {
    match outcome {
        Ok(message) => (StatusCode::OK, Json(ControlResult::ok(message))),
        Err(e) => {
            let status = match e {
                ControlError::NotFound(_) => StatusCode::NOT_FOUND,
                ControlError::Unsupported { .. } => StatusCode::BAD_REQUEST,
                ControlError::Rejected { .. } => StatusCode::BAD_GATEWAY,
            };
            (status, Json(e.into_result(action)))
        }
    }
}

fn not_found(action: ControlAction, what: &str, id: &str) -> ControlResponse {
    respond(action, Err(ControlError::NotFound(format!("{what} {id}"))))
}

// GET /api/snapshot
async fn get_snapshot(State(app): State<AppState>) -> Json<StatusSnapshot> {
    Json(app.aggregator.snapshot().await)
}

// GET /api/services
async fn list_services(State(app): State<AppState>) -> Json<Vec<ServiceStatus>> {
    let snapshot = app.aggregator.snapshot().await;
    Json(snapshot.statuses.into_values().collect())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvironmentView {
    id: String,
    name: String,
    mode: &'static str,
    #[serde(flatten)]
    status: EnvironmentStatus,
}

// GET /api/environments
async fn list_environments(State(app): State<AppState>) -> Json<Vec<EnvironmentView>> {
    let snapshot = app.aggregator.snapshot().await;
    let mut observed = match snapshot.details {
        ModeDetails::Local(view) => view.environments,
        ModeDetails::Cluster(_) => Default::default(),
    };

    let views = app
        .registry
        .environments()
        .iter()
        .map(|env| {
            let status = observed.remove(&env.id).unwrap_or_else(|| {
                // derived from the catalog when the backend has no own view
                let services = app
                    .registry
                    .services_in(&env.id)
                    .into_iter()
                    .map(|svc| {
                        let up = snapshot
                            .statuses
                            .get(&svc.id)
                            .map(|s| s.state.running)
                            .unwrap_or(false);
                        (svc.id.clone(), up)
                    })
                    .collect::<std::collections::BTreeMap<_, _>>();
                let running_count = services.values().filter(|up| **up).count();
                EnvironmentStatus {
                    running: running_count > 0,
                    running_count,
                    total: services.len(),
                    services,
                }
            });
            EnvironmentView {
                id: env.id.clone(),
                name: env.name.clone(),
                mode: match env.location {
                    EnvironmentLocation::Namespace(_) => "orchestrated",
                    EnvironmentLocation::ComposeFile(_) => "compose",
                    EnvironmentLocation::Processes => "process",
                },
                status,
            }
        })
        .collect();
    Json(views)
}

// GET /api/containers
async fn list_containers(State(app): State<AppState>) -> Json<Vec<ContainerSummary>> {
    match app.aggregator.snapshot().await.details {
        ModeDetails::Local(view) => Json(view.containers),
        ModeDetails::Cluster(_) => Json(Vec::new()),
    }
}

// GET /api/npm-servers
async fn list_npm_servers(
    State(app): State<AppState>,
) -> Json<std::collections::BTreeMap<String, ProcessServerStatus>> {
    match app.aggregator.snapshot().await.details {
        ModeDetails::Local(view) => Json(view.npm_servers),
        ModeDetails::Cluster(_) => Json(Default::default()),
    }
}

// POST /api/services/{id}/{action}
async fn control_service(
    State(app): State<AppState>,
    Path((id, action)): Path<(String, String)>,
) -> ControlResponse {
    let action = match parse_action(&action) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    respond(action, app.dispatcher.dispatch(&id, action).await)
}

// POST /api/environments/{id}/{action}
async fn control_environment(
    State(app): State<AppState>,
    Path((id, action)): Path<(String, String)>,
) -> ControlResponse {
    let action = match parse_action(&action) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    respond(action, app.dispatcher.dispatch_environment(&id, action).await)
}

// POST /api/npm-servers/{id}/{action}
async fn control_npm_server(
    State(app): State<AppState>,
    Path((id, action)): Path<(String, String)>,
) -> ControlResponse {
    let action = match parse_action(&action) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let is_process = app
        .registry
        .service(&id)
        .map(|s| matches!(s.handle, BackendHandle::Process(_)))
        .unwrap_or(false);
    if is_process {
        return respond(action, app.dispatcher.dispatch(&id, action).await);
    }
    let is_process_env = app
        .registry
        .environment(&id)
        .map(|e| matches!(e.location, EnvironmentLocation::Processes))
        .unwrap_or(false);
    if is_process_env {
        return respond(action, app.dispatcher.dispatch_environment(&id, action).await);
    }
    not_found(action, "process server", &id)
}

// POST /api/k8s-style/deployments/{id}/{action}
async fn control_deployment(
    State(app): State<AppState>,
    Path((id, action)): Path<(String, String)>,
) -> ControlResponse {
    let action = match parse_action(&action) {
        Ok(ControlAction::Down) => {
            return respond(
                ControlAction::Down,
                Err(ControlError::Unsupported {
                    id,
                    action: ControlAction::Down,
                }),
            )
        }
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let is_deployment = app
        .registry
        .service(&id)
        .map(|s| matches!(s.handle, BackendHandle::Deployment { .. }))
        .unwrap_or(false);
    if !is_deployment {
        return not_found(action, "deployment", &id);
    }
    respond(action, app.dispatcher.dispatch(&id, action).await)
}

#[derive(Debug, Deserialize)]
struct LogParams {
    tail: Option<u32>,
}

// GET /api/services/{id}/logs?tail=N
async fn service_logs(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LogParams>,
) -> Response {
    let tail = params.tail.unwrap_or(DEFAULT_TAIL).clamp(1, MAX_TAIL);
    match app.dispatcher.logs(&id, tail).await {
        Ok(text) => text.into_response(),
        Err(e) => {
            let status = match e {
                ControlError::NotFound(_) => StatusCode::NOT_FOUND,
                ControlError::Unsupported { .. } => StatusCode::BAD_REQUEST,
                ControlError::Rejected { .. } => StatusCode::BAD_GATEWAY,
            };
            (status, e.to_string()).into_response()
        }
    }
}

// GET /ws
async fn live(State(app): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_socket(app, socket))
}

async fn serve_socket(app: AppState, socket: WebSocket) {
    let (sender, receiver) = socket.split();
    let outbound = sender.with(|text: String| {
        future::ready(Ok::<_, axum::Error>(Message::Text(text.into())))
    });
    let inbound = receiver.map(|msg| match msg {
        Ok(Message::Text(text)) => Inbound::Text(text.as_str().to_owned()),
        Ok(Message::Close(_)) | Err(_) => Inbound::Close,
        Ok(_) => Inbound::Other,
    });

    let session = Uuid::new_v4();
    info!(%session, "live session opened");
    run_session(
        &app.aggregator,
        &app.dispatcher,
        Box::pin(inbound),
        Box::pin(outbound),
        app.tick,
    )
    .instrument(info_span!("live", %session))
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;
    use crate::config::FleetConfig;
    use crate::host::fake::FixedHost;
    use crate::models::ResourceUsage;
    use crate::state::LastErrors;
    use serde_json::Value;

    const KEY: &str = "s3cret";

    struct Running {
        base: String,
        backend: Arc<FakeBackend>,
        client: reqwest::Client,
    }

    impl Running {
        fn get(&self, path: &str) -> reqwest::RequestBuilder {
            self.client
                .get(format!("{}{path}", self.base))
                .header("x-api-key", KEY)
        }

        fn post(&self, path: &str) -> reqwest::RequestBuilder {
            self.client
                .post(format!("{}{path}", self.base))
                .header("x-api-key", KEY)
        }
    }

    async fn serve(api_key: Option<&str>) -> Running {
        let cfg: FleetConfig = serde_yaml::from_str(
            r#"
environments:
  - { id: node, mode: process }
services:
  - { id: api, backend: { kind: container } }
  - { id: docs, environment: node, backend: { kind: process, command: "npm run docs", port: 4000 } }
"#,
        )
        .unwrap();
        let registry = Arc::new(EnvironmentRegistry::from_config(&cfg).unwrap());
        let backend = Arc::new(FakeBackend::new(["api", "docs"]));
        let errors = LastErrors::new();
        let host = Arc::new(FixedHost(ResourceUsage::default()));
        let state = AppState {
            aggregator: Arc::new(StatusAggregator::new(
                backend.clone(),
                registry.clone(),
                host,
                errors.clone(),
            )),
            dispatcher: Arc::new(ControlDispatcher::new(
                backend.clone(),
                registry.clone(),
                errors,
            )),
            registry,
            api_key: api_key.map(Arc::from),
            tick: Duration::from_secs(2),
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });
        Running {
            base: format!("http://{addr}"),
            backend,
            client: reqwest::Client::new(),
        }
    }

    #[tokio::test]
    async fn health_is_public_everything_else_needs_the_key() {
        let app = serve(Some(KEY)).await;
        let health = app
            .client
            .get(format!("{}/health", app.base))
            .send()
            .await
            .unwrap();
        assert_eq!(health.status(), 200);
        assert_eq!(health.text().await.unwrap(), "ok");

        let anonymous = app
            .client
            .get(format!("{}/api/snapshot", app.base))
            .send()
            .await
            .unwrap();
        assert_eq!(anonymous.status(), 401);

        let wrong = app
            .client
            .get(format!("{}/api/snapshot", app.base))
            .header("x-api-key", "nope")
            .send()
            .await
            .unwrap();
        assert_eq!(wrong.status(), 401);

        let snapshot: Value = app.get("/api/snapshot").send().await.unwrap().json().await.unwrap();
        assert_eq!(snapshot["summary"]["total"], 2);
    }

    #[tokio::test]
    async fn only_the_exact_health_path_is_public() {
        let app = serve(Some(KEY)).await;
        for path in ["/healthz-admin", "/health/extra"] {
            let resp = app
                .client
                .get(format!("{}{path}", app.base))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 401, "{path}");
        }
    }

    #[tokio::test]
    async fn unconfigured_key_denies_access() {
        let app = serve(None).await;
        let resp = app.get("/api/services").send().await.unwrap();
        assert_eq!(resp.status(), 401);
    }

    #[tokio::test]
    async fn websocket_upgrade_without_token_is_refused() {
        let app = serve(Some(KEY)).await;
        let resp = app
            .client
            .get(format!("{}/ws", app.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
    }

    #[tokio::test]
    async fn control_routes_map_outcomes_to_status_codes() {
        let app = serve(Some(KEY)).await;

        let ok = app.post("/api/services/api/start").send().await.unwrap();
        assert_eq!(ok.status(), 200);
        let body: Value = ok.json().await.unwrap();
        assert_eq!(body["success"], true);

        let missing = app.post("/api/services/ghost/start").send().await.unwrap();
        assert_eq!(missing.status(), 404);

        let invalid = app.post("/api/services/api/explode").send().await.unwrap();
        assert_eq!(invalid.status(), 400);
        let body: Value = invalid.json().await.unwrap();
        assert_eq!(body["error"]["kind"], "invalidAction");

        app.backend.refuse("api");
        let refused = app.post("/api/services/api/restart").send().await.unwrap();
        assert_eq!(refused.status(), 502);
        let body: Value = refused.json().await.unwrap();
        assert_eq!(body["success"], false);

        let snapshot: Value = app.get("/api/snapshot").send().await.unwrap().json().await.unwrap();
        assert!(snapshot["errors"]["api"].is_string());
    }

    #[tokio::test]
    async fn scoped_routes_only_accept_matching_targets() {
        let app = serve(Some(KEY)).await;

        let docs = app.post("/api/npm-servers/docs/start").send().await.unwrap();
        assert_eq!(docs.status(), 200);
        let env = app.post("/api/npm-servers/node/stop").send().await.unwrap();
        assert_eq!(env.status(), 200);
        let container = app.post("/api/npm-servers/api/start").send().await.unwrap();
        assert_eq!(container.status(), 404);

        let not_deployment = app
            .post("/api/k8s-style/deployments/api/restart")
            .send()
            .await
            .unwrap();
        assert_eq!(not_deployment.status(), 404);
        let down = app
            .post("/api/k8s-style/deployments/api/down")
            .send()
            .await
            .unwrap();
        assert_eq!(down.status(), 400);

        assert_eq!(
            app.backend.calls(),
            vec![
                ("docs".to_string(), ControlAction::Start),
                ("node".to_string(), ControlAction::Stop),
            ]
        );
    }

    #[tokio::test]
    async fn logs_default_and_clamp_tail() {
        let app = serve(Some(KEY)).await;
        let text = app.get("/api/services/api/logs").send().await.unwrap().text().await.unwrap();
        assert_eq!(text, "last 100 lines of api\n");

        let text = app
            .get("/api/services/api/logs?tail=999999")
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(text, "last 5000 lines of api\n");

        let missing = app.get("/api/services/ghost/logs").send().await.unwrap();
        assert_eq!(missing.status(), 404);
    }

    #[tokio::test]
    async fn environments_fall_back_to_catalog_state() {
        let app = serve(Some(KEY)).await;
        app.post("/api/services/docs/start").send().await.unwrap();

        let envs: Value = app.get("/api/environments").send().await.unwrap().json().await.unwrap();
        let node = &envs[0];
        assert_eq!(node["id"], "node");
        assert_eq!(node["mode"], "process");
        assert_eq!(node["runningCount"], 1);
        assert_eq!(node["services"]["docs"], true);
    }
}
