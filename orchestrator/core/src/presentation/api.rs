// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! REST surface of the control plane.
//!
//! Handlers parse, delegate to [`Orchestrator`] and map
//! [`OrchestratorError`] onto status codes. Compile and deploy answer
//! `202 Accepted` as soon as the record exists; clients poll the
//! `GET` endpoints for the terminal state.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

use crate::application::orchestrator::{CompileRequest, DeployRequest, Orchestrator, OrchestratorError};
use crate::domain::build::BuildId;
use crate::domain::deployment::DeployId;
use crate::domain::ir::ChannelIr;
use crate::domain::policy::list_rules;
use crate::infrastructure::protocol::ProtocolError;
use crate::presentation::ws;

pub const DEFAULT_WS_PATH: &str = "/ws/agent";

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            start_time: Instant::now(),
        }
    }
}

/// Build the control-plane router. The agent websocket is mounted at
/// `ws_path`.
pub fn app(state: AppState, ws_path: &str) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/builds", post(create_build))
        .route("/api/builds/{id}", get(get_build))
        .route("/api/channels/{cid}/builds", get(list_channel_builds))
        .route("/api/deployments", post(create_deployment))
        .route("/api/deployments/{id}", get(get_deployment))
        .route("/api/runtimes", get(list_runtimes))
        .route("/api/runtimes/{rid}/status", get(runtime_status))
        .route("/api/runtimes/{rid}/channels/{cid}/start", post(start_channel))
        .route("/api/runtimes/{rid}/channels/{cid}/stop", post(stop_channel))
        .route("/api/runtimes/{rid}/channels/{cid}/restart", post(restart_channel))
        .route("/api/runtimes/{rid}/update", post(update_agent))
        .route("/api/runtimes/{rid}/overlay/enroll", post(enroll_overlay))
        .route("/api/policy/rules", get(policy_rules))
        .route("/api/policy/lint", post(policy_lint))
        .route(ws_path, get(ws::agent_socket))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Orchestrator(OrchestratorError),
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        ApiError::Orchestrator(err)
    }
}

fn status_for(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::InvalidIr(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::PolicyRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        OrchestratorError::BuildNotFound(_)
        | OrchestratorError::DeploymentNotFound(_)
        | OrchestratorError::UnknownRuntime(_)
        | OrchestratorError::UnknownChannel { .. } => StatusCode::NOT_FOUND,
        OrchestratorError::BuildNotCompiled { .. } | OrchestratorError::Transition(_) => StatusCode::CONFLICT,
        OrchestratorError::Protocol(ProtocolError::AgentOffline(_))
        | OrchestratorError::Protocol(ProtocolError::Disconnected(_))
        | OrchestratorError::Protocol(ProtocolError::QueueFull { .. }) => StatusCode::SERVICE_UNAVAILABLE,
        OrchestratorError::Protocol(ProtocolError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
        OrchestratorError::Protocol(_)
        | OrchestratorError::AgentRejected { .. }
        | OrchestratorError::UnexpectedReply { .. } => StatusCode::BAD_GATEWAY,
        OrchestratorError::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Orchestrator(err) => {
                let status = status_for(&err);
                let body = match &err {
                    OrchestratorError::PolicyRejected { build_id, violations } => json!({
                        "error": err.to_string(),
                        "buildId": build_id,
                        "violations": violations,
                    }),
                    _ => json!({ "error": err.to_string() }),
                };
                (status, Json(body)).into_response()
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_build_id(raw: &str) -> ApiResult<BuildId> {
    BuildId::parse(raw).ok_or_else(|| ApiError::BadRequest(format!("invalid build id: {raw}")))
}

fn parse_deploy_id(raw: &str) -> ApiResult<DeployId> {
    DeployId::parse(raw).ok_or_else(|| ApiError::BadRequest(format!("invalid deploy id: {raw}")))
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "agents_online": state.orchestrator.registry().online_count(),
    }))
}

async fn create_build(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CompileRequest>,
) -> ApiResult<impl IntoResponse> {
    let accepted = state.orchestrator.compile(request).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn get_build(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    let build = state.orchestrator.get_build(parse_build_id(&id)?).await?;
    Ok(Json(build))
}

async fn list_channel_builds(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.builds_for_channel(&channel_id).await?))
}

async fn create_deployment(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeployRequest>,
) -> ApiResult<impl IntoResponse> {
    let accepted = state.orchestrator.deploy(request).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn get_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let deployment = state.orchestrator.get_deployment(parse_deploy_id(&id)?).await?;
    Ok(Json(deployment))
}

async fn list_runtimes(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.runtimes())
}

async fn runtime_status(
    State(state): State<Arc<AppState>>,
    Path(runtime_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.status(&runtime_id).await?))
}

async fn start_channel(
    State(state): State<Arc<AppState>>,
    Path((runtime_id, channel_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let channel = state.orchestrator.start(&runtime_id, &channel_id).await?;
    Ok(Json(json!({ "ok": true, "channel": channel })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopBody {
    #[serde(default)]
    drain_ms: Option<u64>,
}

async fn stop_channel(
    State(state): State<Arc<AppState>>,
    Path((runtime_id, channel_id)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let body: StopBody = if body.is_empty() {
        StopBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(format!("invalid stop body: {e}")))?
    };
    let channel = state
        .orchestrator
        .stop(&runtime_id, &channel_id, body.drain_ms)
        .await?;
    Ok(Json(json!({ "ok": true, "channel": channel })))
}

async fn restart_channel(
    State(state): State<Arc<AppState>>,
    Path((runtime_id, channel_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let channel = state.orchestrator.restart(&runtime_id, &channel_id).await?;
    Ok(Json(json!({ "ok": true, "channel": channel })))
}

#[derive(Debug, Deserialize)]
struct UpdateBody {
    url: String,
    signature: String,
}

async fn update_agent(
    State(state): State<Arc<AppState>>,
    Path(runtime_id): Path<String>,
    Json(body): Json<UpdateBody>,
) -> ApiResult<impl IntoResponse> {
    state
        .orchestrator
        .update_agent(&runtime_id, &body.url, &body.signature)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnrollBody {
    enrollment_code: String,
}

async fn enroll_overlay(
    State(state): State<Arc<AppState>>,
    Path(runtime_id): Path<String>,
    Json(body): Json<EnrollBody>,
) -> ApiResult<impl IntoResponse> {
    state
        .orchestrator
        .enroll_overlay(&runtime_id, &body.enrollment_code)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

async fn policy_rules() -> impl IntoResponse {
    Json(list_rules())
}

#[derive(Debug, Deserialize)]
struct LintBody {
    ir: ChannelIr,
    #[serde(default)]
    acknowledged: HashSet<String>,
}

async fn policy_lint(State(state): State<Arc<AppState>>, Json(body): Json<LintBody>) -> impl IntoResponse {
    Json(state.orchestrator.lint(&body.ir, &body.acknowledged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::compiler::Compiler;
    use crate::application::orchestrator::OrchestratorConfig;
    use crate::application::policy_gate::PolicyGate;
    use crate::domain::ir::{NexonTemplate, TemplateNode};
    use crate::domain::policy::OrgPolicy;
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::protocol::AgentRegistry;
    use crate::infrastructure::repositories::{InMemoryBuildRepository, InMemoryDeploymentRepository};
    use crate::infrastructure::templates::{InMemoryTemplateSource, TemplateCache};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{Map, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn router() -> Router {
        let source = InMemoryTemplateSource::new();
        source.register(NexonTemplate {
            nexon_id: "core.inject".into(),
            version: "1.0.0".into(),
            nodes: vec![TemplateNode {
                id: "inject".into(),
                node_type: "inject".into(),
                name: String::new(),
                props: Map::new(),
                wires: vec![],
            }],
        });
        let bus = EventBus::new(64);
        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorConfig {
                request_timeout: Duration::from_millis(200),
                deploy_timeout: Duration::from_millis(200),
                deploy_retries: 1,
            },
            OrgPolicy::default(),
            PolicyGate::new(),
            Arc::new(Compiler::new(TemplateCache::new(Arc::new(source), 8))),
            Arc::new(InMemoryBuildRepository::new()),
            Arc::new(InMemoryDeploymentRepository::new()),
            Arc::new(AgentRegistry::new(Duration::from_secs(30), 16, bus.clone())),
            bus,
        ));
        app(AppState::new(orchestrator), DEFAULT_WS_PATH)
    }

    fn ir_json(internet: bool) -> Value {
        json!({
            "channelId": "ch-api",
            "name": "API channel",
            "runtimeTarget": "edge",
            "security": { "internetAccess": internet },
            "stages": [{ "id": "s1", "name": "Inject", "nexonId": "core.inject" }],
        })
    }

    async fn call(router: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(router(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["agents_online"], 0);
    }

    #[tokio::test]
    async fn test_policy_rules_listed() {
        let (status, body) = call(router(), "GET", "/api/policy/rules", None).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> = body.as_array().unwrap().iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert!(ids.contains(&"SEC001"));
    }

    #[tokio::test]
    async fn test_lint_reports_violation() {
        let (status, body) = call(router(), "POST", "/api/policy/lint", Some(json!({ "ir": ir_json(true) }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["passed"], false);

        let acked = json!({ "ir": ir_json(true), "acknowledged": ["SEC001"] });
        let (_, body) = call(router(), "POST", "/api/policy/lint", Some(acked)).await;
        assert_eq!(body["passed"], true);
    }

    #[tokio::test]
    async fn test_policy_rejection_is_unprocessable() {
        let request = json!({ "ir": ir_json(true), "mode": "TEST" });
        let (status, body) = call(router(), "POST", "/api/builds", Some(request)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["buildId"].is_string());
        assert_eq!(body["violations"][0]["ruleId"], "SEC001");
    }

    #[tokio::test]
    async fn test_build_accepted_then_compiled() {
        let router = router();
        let request = json!({ "ir": ir_json(false), "mode": "TEST" });
        let (status, body) = call(router.clone(), "POST", "/api/builds", Some(request)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "QUEUED");
        let build_id = body["buildId"].as_str().unwrap().to_string();

        let mut last = Value::Null;
        for _ in 0..100 {
            let (status, body) = call(router.clone(), "GET", &format!("/api/builds/{build_id}"), None).await;
            assert_eq!(status, StatusCode::OK);
            last = body;
            if last["status"] == "COMPILED" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(last["status"], "COMPILED");
        assert!(last["hashes"]["merkleRoot"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_ids() {
        let missing = format!("/api/builds/{}", BuildId::new());
        let (status, _) = call(router(), "GET", &missing, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(router(), "GET", "/api/deployments/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_channel_command_on_unknown_runtime() {
        let (status, body) = call(
            router(),
            "POST",
            "/api/runtimes/edge-9/channels/ch-1/stop",
            Some(json!({ "drainMs": 100 })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("edge-9"));
    }

    #[tokio::test]
    async fn test_runtimes_empty() {
        let (status, body) = call(router(), "GET", "/api/runtimes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }
}
