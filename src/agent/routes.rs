//! HTTP routes for the fleet agent API.
//!
//! All endpoints require the api key via the `X-API-Key` header or the `key`
//! query parameter, except for `/agent/health` which is public for probes.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::reboot::{schedule_self_reboot, RebootPlan};
use super::AppState;
use crate::autofix::{AutoFix, FixOutcome, FixRequest};
use crate::deploy::{DeployOutcome, DeployPipeline, DeployRequest};
use crate::error::FleetError;
use crate::executor::ExecutionResult;
use crate::resources::{check_resources, ResourceSnapshot};
use crate::ssh::probe_port;
use crate::supervisor::{list_services, probe_status, ServiceManager, ServiceStatus};

pub const API_KEY_HEADER: &str = "X-API-Key";

const DEFAULT_LOG_LINES: usize = 50;

/// Connect timeout for `/agent/ping`.
const PING_TIMEOUT: Duration = Duration::from_secs(3);

/// Creates the router with all agent routes.
pub fn create_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Public
        .route("/agent/health", get(health))
        // Protected (AuthenticatedState extractor)
        .route("/agent/exec", post(exec))
        .route("/agent/logs/{host}/{service}", get(logs))
        .route("/agent/diagnose/{host}", get(diagnose))
        .route("/agent/resources/{host}", get(resources))
        .route("/agent/deploy", post(deploy))
        .route("/agent/fix", post(fix))
        .route("/agent/services/{host}", get(services))
        .route("/agent/restart/{host}/{service}", post(restart))
        .route("/agent/reboot/{target}", post(reboot))
        .route("/agent/ping/{host}", get(ping))
}

/// Extractor that validates the api key before the handler runs.
///
/// The header wins over the query parameter when both are present.
pub struct AuthenticatedState(pub Arc<AppState>);

#[derive(Debug, Deserialize)]
struct KeyQuery {
    key: Option<String>,
}

impl FromRequestParts<Arc<AppState>> for AuthenticatedState {
    type Rejection = ApiRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let provided = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| {
                Query::<KeyQuery>::try_from_uri(&parts.uri)
                    .ok()
                    .and_then(|Query(q)| q.key)
            });

        match provided {
            Some(key) if key == state.api_key => Ok(AuthenticatedState(Arc::clone(state))),
            Some(_) => Err((
                StatusCode::UNAUTHORIZED,
                Json(ApiError::new("Invalid API key")),
            )),
            None => Err((
                StatusCode::UNAUTHORIZED,
                Json(ApiError::new("Missing X-API-Key header")),
            )),
        }
    }
}

/// Standard API error response.
#[derive(Debug, Serialize)]
pub struct ApiError {
    error: String,
}

impl ApiError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

type ApiRejection = (StatusCode, Json<ApiError>);

/// Request problems are 400s; anything else reaching here is a 500.
fn reject(err: FleetError) -> ApiRejection {
    let status = match err {
        FleetError::UnknownHost(_) | FleetError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiError::new(err.to_string())))
}

/// GET /agent/health - liveness and host list (public)
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let hostname = sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string());
    Json(serde_json::json!({
        "status": "ok",
        "service": "fleet-agent",
        "version": env!("CARGO_PKG_VERSION"),
        "vms": state.registry.keys(),
        "hostname": hostname,
        "uptime_seconds": state.uptime_seconds(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

#[derive(Debug, Deserialize)]
struct ExecRequest {
    #[serde(rename = "vm", alias = "host", default)]
    host: String,
    #[serde(default)]
    command: String,
    /// Overrides the configured command timeout.
    timeout_secs: Option<u64>,
}

/// POST /agent/exec - run one command
///
/// An unknown host is reported in the result body, not as a 400.
async fn exec(
    AuthenticatedState(state): AuthenticatedState,
    Json(req): Json<ExecRequest>,
) -> Result<Json<ExecutionResult>, ApiRejection> {
    if req.host.is_empty() || req.command.is_empty() {
        return Err(reject(FleetError::Validation(
            "vm and command required".to_string(),
        )));
    }

    let result = match req.timeout_secs {
        Some(secs) => {
            state
                .executor
                .execute_with_timeout(&req.host, &req.command, Duration::from_secs(secs))
                .await
        }
        None => state.executor.execute(&req.host, &req.command).await,
    };
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

/// GET /agent/logs/:host/:service - tail a service log
async fn logs(
    AuthenticatedState(state): AuthenticatedState,
    Path((host_key, service)): Path<(String, String)>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<ExecutionResult>, ApiRejection> {
    let host = state.registry.lookup(&host_key).map_err(reject)?;
    let manager = ServiceManager::for_service(&state.registry, host, &service);
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES);

    let result = state
        .executor
        .execute(&host.key, &manager.logs_command(&service, lines))
        .await;
    Ok(Json(result))
}

#[derive(Debug, Serialize)]
struct DiagnoseResponse {
    #[serde(flatten)]
    result: ExecutionResult,
    resources: ResourceSnapshot,
}

/// GET /agent/diagnose/:host - diagnostic script plus resource check
async fn diagnose(
    AuthenticatedState(state): AuthenticatedState,
    Path(host_key): Path<String>,
) -> Result<Json<DiagnoseResponse>, ApiRejection> {
    let host = state.registry.lookup(&host_key).map_err(reject)?;

    let command = format!("{} 2>&1", state.diagnose_script);
    let result = state.executor.execute(&host.key, &command).await;
    let resources = check_resources(state.executor.as_ref(), &host.key).await;

    Ok(Json(DiagnoseResponse { result, resources }))
}

/// GET /agent/resources/:host - resource verdict only
async fn resources(
    AuthenticatedState(state): AuthenticatedState,
    Path(host_key): Path<String>,
) -> Result<Json<ResourceSnapshot>, ApiRejection> {
    let host = state.registry.lookup(&host_key).map_err(reject)?;
    Ok(Json(check_resources(state.executor.as_ref(), &host.key).await))
}

/// POST /agent/deploy - resource-gated file deployment
async fn deploy(
    AuthenticatedState(state): AuthenticatedState,
    Json(req): Json<DeployRequest>,
) -> Result<Json<DeployOutcome>, ApiRejection> {
    req.validate().map_err(reject)?;

    let outcome = DeployPipeline::new(state.executor.as_ref(), &state.registry)
        .run(&req)
        .await
        .map_err(reject)?;
    Ok(Json(outcome))
}

/// POST /agent/fix - auto-fix loop
async fn fix(
    AuthenticatedState(state): AuthenticatedState,
    Json(req): Json<FixRequest>,
) -> Result<Json<FixOutcome>, ApiRejection> {
    req.validate().map_err(reject)?;

    let outcome = AutoFix::new(state.executor.as_ref(), &state.registry)
        .run(&req.host, &req.service, req.max_retries)
        .await
        .map_err(reject)?;
    Ok(Json(outcome))
}

#[derive(Debug, Serialize)]
struct ServicesResponse {
    vm: String,
    services: Vec<ServiceStatus>,
}

/// GET /agent/services/:host - status of every registered service
async fn services(
    AuthenticatedState(state): AuthenticatedState,
    Path(host_key): Path<String>,
) -> Result<Json<ServicesResponse>, ApiRejection> {
    let host = state.registry.lookup(&host_key).map_err(reject)?;
    let services = list_services(state.executor.as_ref(), &state.registry, host).await;

    Ok(Json(ServicesResponse {
        vm: host.name.clone(),
        services,
    }))
}

#[derive(Debug, Serialize)]
struct RestartResponse {
    vm: String,
    service: String,
    manager: ServiceManager,
    restarted: bool,
    status: String,
    healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// POST /agent/restart/:host/:service - restart one registered service
///
/// The status is probed straight after the restart, without a settle delay.
async fn restart(
    AuthenticatedState(state): AuthenticatedState,
    Path((host_key, service)): Path<(String, String)>,
) -> Result<Json<RestartResponse>, ApiRejection> {
    let host = state.registry.lookup(&host_key).map_err(reject)?;
    if !host.services.iter().any(|s| *s == service) {
        return Err(reject(FleetError::Validation(format!(
            "Unknown service {} on {}",
            service, host.key
        ))));
    }

    let manager = ServiceManager::for_service(&state.registry, host, &service);
    let result = state
        .executor
        .execute(&host.key, &manager.restart_command(&service))
        .await;
    tracing::info!(
        host = %host.key,
        service = %service,
        restarted = result.success,
        "service restart"
    );

    let probe = probe_status(state.executor.as_ref(), host, manager, &service).await;
    Ok(Json(RestartResponse {
        vm: host.key.clone(),
        service,
        manager,
        restarted: result.success,
        status: probe.status,
        healthy: probe.healthy,
        error: result.error,
    }))
}

#[derive(Debug, Serialize)]
struct RebootResponse {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// POST /agent/reboot/:target - reboot a host
///
/// Rebooting the agent's own host answers first; the reboot is issued after
/// a short grace period.
async fn reboot(
    AuthenticatedState(state): AuthenticatedState,
    Path(target): Path<String>,
) -> Result<Json<RebootResponse>, ApiRejection> {
    let host = state.registry.lookup(&target).map_err(|_| {
        reject(FleetError::Validation(format!(
            "Invalid target. Use one of: {}",
            state.registry.keys().join(", ")
        )))
    })?;

    let response = match RebootPlan::for_target(&state.registry, host) {
        RebootPlan::SelfReboot { host } => {
            schedule_self_reboot(Arc::clone(&state.executor), host.key.clone());
            RebootResponse {
                success: true,
                message: format!("{} reboot initiated", host.key),
                output: None,
                error: None,
            }
        }
        RebootPlan::Delegated {
            target,
            via,
            command,
        } => {
            tracing::warn!(target = %target.key, via = %via.key, "reboot requested");
            let result = state.executor.execute(&via.key, &command).await;
            RebootResponse {
                success: true,
                message: format!("{} reboot initiated", target.key),
                output: Some(result.output),
                error: result.error,
            }
        }
    };
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
struct PingResponse {
    host: String,
    reachable: bool,
    latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    checked_at: chrono::DateTime<chrono::Utc>,
}

/// GET /agent/ping/:host - TCP reachability of the host's SSH port
async fn ping(
    AuthenticatedState(state): AuthenticatedState,
    Path(host_key): Path<String>,
) -> Result<Json<PingResponse>, ApiRejection> {
    let host = state.registry.lookup(&host_key).map_err(reject)?;

    let (reachable, latency_ms, error) = if host.is_local() {
        (true, Some(0), None)
    } else {
        match probe_port(&host.address, host.port, PING_TIMEOUT).await {
            Ok(latency) => (true, Some(latency.as_millis() as u64), None),
            Err(e) => (false, None, Some(e.to_string())),
        }
    };

    Ok(Json(PingResponse {
        host: host.key.clone(),
        reachable,
        latency_ms,
        error,
        checked_at: chrono::Utc::now(),
    }))
}
