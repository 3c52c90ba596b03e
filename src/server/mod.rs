//! REST frontend: statuses, task submission, configuration.
//!
//! Binds to loopback only. All endpoints except the health probe require
//! the bearer token from the config store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::warn;
use uuid::Uuid;

use crate::config::{Config, ConfigStore};
use crate::error::{RunnerError, ServerError};
use crate::fleet::{AgentStatus, Manager};
use crate::rpc::types::{TaskEvent, TaskRequest};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Ports tried after the configured one is found busy.
const FALLBACK_PORTS: std::ops::RangeInclusive<u16> = 7601..=7609;

#[derive(Clone)]
pub struct AppState {
    /// Absent when no agents directory was found.
    pub manager: Option<Arc<Manager>>,
    pub config: Arc<ConfigStore>,
    pub started_at: Instant,
}

/// Assemble the API router.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/v1/status", get(handle_status))
        .route(
            "/api/v1/config",
            get(get_config).put(put_config).patch(patch_config),
        )
        .route("/api/v1/agents", get(list_agents))
        .route("/api/v1/agents/:name", get(get_agent))
        .route("/api/v1/agents/:name/tasks", post(submit_task))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth));

    Router::new()
        // Unauthenticated so monitoring tools can probe.
        .route("/api/v1/health", get(handle_health))
        .merge(protected)
        .with_state(state)
}

/// Bind the requested port on loopback, falling back to 7601-7609. The
/// port comes from the config store unless `port_override` (a per-run CLI
/// flag) is given. A fallback from the configured port is persisted so the
/// next run starts there directly; a fallback from an override is not.
pub async fn bind(
    config: &ConfigStore,
    port_override: Option<u16>,
) -> Result<TcpListener, ServerError> {
    let requested = port_override.unwrap_or_else(|| config.get().port);
    let mut candidates = vec![requested];
    candidates.extend(FALLBACK_PORTS.filter(|p| *p != requested));

    for port in candidates {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                if port != requested {
                    warn!(requested, actual = port, "port conflict, using fallback");
                    if port_override.is_none() {
                        if let Err(e) = config.update(|c| c.port = port) {
                            warn!(error = %e, "could not persist fallback port");
                        }
                    }
                }
                return Ok(listener);
            }
            Err(_) => continue,
        }
    }

    Err(ServerError::NoAvailablePort { requested })
}

async fn auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == state.config.get().bearer_token => next.run(request).await,
        _ => error_response(StatusCode::UNAUTHORIZED, "unauthorized"),
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Serialize)]
struct StatusBody {
    version: &'static str,
    uptime_secs: u64,
    port: u16,
    os: &'static str,
    arch: &'static str,
}

async fn handle_status(State(state): State<AppState>) -> Json<StatusBody> {
    Json(StatusBody {
        version: VERSION,
        uptime_secs: state.started_at.elapsed().as_secs(),
        port: state.config.get().port,
        os: std::env::consts::OS,
        arch: std::env::consts::ARCH,
    })
}

async fn get_config(State(state): State<AppState>) -> Json<Config> {
    Json(state.config.get())
}

async fn put_config(State(state): State<AppState>, Json(config): Json<Config>) -> Response {
    match state.config.replace(config) {
        Ok(updated) => Json(updated).into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

#[derive(Deserialize)]
struct ConfigPatch {
    port: Option<u16>,
    auto_open_browser: Option<bool>,
}

async fn patch_config(State(state): State<AppState>, Json(patch): Json<ConfigPatch>) -> Response {
    let result = state.config.update(|config| {
        if let Some(port) = patch.port {
            config.port = port;
        }
        if let Some(auto_open) = patch.auto_open_browser {
            config.auto_open_browser = auto_open;
        }
    });
    match result {
        Ok(updated) => Json(updated).into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentStatus>> {
    Json(
        state
            .manager
            .as_ref()
            .map(|manager| manager.all_statuses())
            .unwrap_or_default(),
    )
}

async fn get_agent(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let status = state
        .manager
        .as_ref()
        .and_then(|manager| manager.agent_status(&name));
    match status {
        Some(status) => Json(status).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "agent not found"),
    }
}

#[derive(Deserialize)]
struct TaskBody {
    skill: String,
    #[serde(default)]
    input: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Serialize)]
struct TaskResult {
    task_id: String,
    events: Vec<TaskEvent>,
}

async fn submit_task(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<TaskBody>,
) -> Response {
    let Some(manager) = state.manager.as_ref() else {
        return error_response(StatusCode::NOT_FOUND, "no agents configured");
    };
    if body.skill.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "skill is required");
    }

    // The frontend mints the task id; the supervisor only echoes it.
    let task_id = format!("task-{}", Uuid::new_v4().simple());
    let req = TaskRequest {
        task_id: task_id.clone(),
        skill: body.skill,
        input: body.input,
        metadata: body.metadata,
    };

    match manager.route_task(&name, req).await {
        Ok(events) => Json(TaskResult { task_id, events }).into_response(),
        Err(e @ RunnerError::UnknownAgent { .. }) => {
            error_response(StatusCode::NOT_FOUND, e.to_string())
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
