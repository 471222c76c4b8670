use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::{RuntimeConfig, enforce_prompt_limit};
use crate::pipeline::build_advisory_pipeline;
use crate::provider::resolve_model;
use crate::streaming::{emit_run_lifecycle, run_workflow};
use crate::telemetry::TelemetrySink;
use crate::workflow::{Runner, Workflow};

#[derive(Clone)]
pub struct ServerState {
    pub cfg: RuntimeConfig,
    pub workflow: Arc<Workflow>,
    pub telemetry: TelemetrySink,
    pub provider_label: String,
    pub model_name: String,
    pub auth_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ServerHealthResponse {
    pub status: &'static str,
    pub app_name: String,
    pub profile: String,
    pub stages: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ServerRunRequest {
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct ServerRunResponse {
    pub answer: String,
    pub stages: Vec<StageResult>,
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Serialize)]
pub struct StageResult {
    pub stage: String,
    pub output: String,
}

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

pub fn check_server_auth(
    state: &ServerState,
    headers: &axum::http::HeaderMap,
) -> Result<(), ApiError> {
    let Some(expected_token) = state.auth_token.as_deref() else {
        return Ok(()); // no token configured, auth disabled
    };

    let header_value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let provided_token = header_value
        .strip_prefix("Bearer ")
        .unwrap_or_default()
        .trim();

    if provided_token.is_empty() || provided_token != expected_token {
        return Err(api_error(
            StatusCode::UNAUTHORIZED,
            "missing or invalid Authorization bearer token",
        ));
    }

    Ok(())
}

pub fn validate_run_prompt(state: &ServerState, prompt: &str) -> Result<String, ApiError> {
    let prompt = prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "prompt cannot be empty for /v1/run",
        ));
    }
    enforce_prompt_limit(&prompt, state.cfg.max_prompt_chars)
        .map_err(|err| api_error(StatusCode::BAD_REQUEST, err.to_string()))?;
    Ok(prompt)
}

pub async fn handle_server_health(
    State(state): State<Arc<ServerState>>,
) -> Json<ServerHealthResponse> {
    Json(ServerHealthResponse {
        status: "ok",
        app_name: state.cfg.app_name.clone(),
        profile: state.cfg.profile.clone(),
        stages: state.workflow.traversal_order().to_vec(),
    })
}

pub async fn handle_server_run(
    State(state): State<Arc<ServerState>>,
    headers: axum::http::HeaderMap,
    Json(request): Json<ServerRunRequest>,
) -> ApiResult<ServerRunResponse> {
    check_server_auth(&state, &headers)?;
    let started_at = Instant::now();
    let prompt = validate_run_prompt(&state, &request.prompt)?;

    let runner = Runner::with_options(Arc::clone(&state.workflow), state.cfg.run_options());
    let outcome = run_workflow(&runner, &prompt, &state.telemetry)
        .await
        .map_err(|err| api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    state.telemetry.emit(
        "server.run.completed",
        json!({
            "provider": state.provider_label.clone(),
            "model": state.model_name.clone(),
            "latency_ms": started_at.elapsed().as_millis() as u64
        }),
    );

    Ok(Json(ServerRunResponse {
        answer: outcome.answer,
        stages: outcome
            .stage_outputs
            .into_iter()
            .map(|(stage, output)| StageResult { stage, output })
            .collect(),
        provider: state.provider_label.clone(),
        model: state.model_name.clone(),
    }))
}

pub async fn handle_server_run_stream(
    State(state): State<Arc<ServerState>>,
    headers: axum::http::HeaderMap,
    Json(request): Json<ServerRunRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    check_server_auth(&state, &headers)?;
    let prompt = validate_run_prompt(&state, &request.prompt)?;

    let runner = Runner::with_options(Arc::clone(&state.workflow), state.cfg.run_options());
    let telemetry = state.telemetry.clone();
    let events = runner.run(prompt).map(move |event| {
        emit_run_lifecycle(&event, &telemetry);
        Event::default().json_data(&event)
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

pub fn build_server_router(state: Arc<ServerState>) -> AxumRouter {
    AxumRouter::new()
        .route("/healthz", get(handle_server_health))
        .route("/v1/run", post(handle_server_run))
        .route("/v1/run/stream", post(handle_server_run_stream))
        .with_state(state)
}

pub async fn run_server(
    cfg: RuntimeConfig,
    host: String,
    port: u16,
    telemetry: &TelemetrySink,
) -> Result<()> {
    let addr = format!("{host}:{port}")
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid server bind address '{}:{}'", host, port))?;

    let (model, resolved_provider, model_name) = resolve_model(&cfg)?;
    let provider_label = format!("{:?}", resolved_provider).to_ascii_lowercase();
    telemetry.emit(
        "model.resolved",
        json!({
            "provider": provider_label.clone(),
            "model": model_name.clone(),
            "path": "server"
        }),
    );

    let workflow = Arc::new(build_advisory_pipeline(model)?);
    let state = Arc::new(ServerState {
        cfg: cfg.clone(),
        workflow: Arc::clone(&workflow),
        telemetry: telemetry.clone(),
        provider_label: provider_label.clone(),
        model_name: model_name.clone(),
        auth_token: std::env::var("COUNSEL_SERVER_AUTH_TOKEN")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty()),
    });

    telemetry.emit(
        "server.started",
        json!({
            "host": host,
            "port": port,
            "profile": cfg.profile,
            "provider": provider_label,
            "model": model_name,
            "stages": workflow.traversal_order()
        }),
    );

    println!(
        "Developer server listening on http://{} (health: /healthz, run: /v1/run, stream: /v1/run/stream)",
        addr
    );
    println!(
        "Pipeline: {} → final answer comes from the terminal stage.",
        workflow.traversal_order().join(" → ")
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind server listener")?;
    axum::serve(listener, build_server_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server runtime failed")
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { println!("\nReceived Ctrl+C, shutting down gracefully..."); }
        _ = terminate => { println!("\nReceived SIGTERM, shutting down gracefully..."); }
    }
}
