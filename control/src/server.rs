//! Public HTTP surface and process composition.
//!
//! `run_server` builds every service in dependency order (store, queue,
//! signaling, registry, selector inputs, engine, orchestrator, servers),
//! then runs the axum API and the tonic relayer endpoint side by side until
//! the shutdown signal fires. Teardown is the same tree in reverse: the
//! root cancellation token fans out to every loop.

use std::net::SocketAddr;

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tessera_common::{
    RequestContextExtractor, access_log, cors,
    rate_limit::{RateLimiter, RateLimiterConfig, middleware::RateLimitLayer},
    response, secrets,
    shutdown::cancel_on_shutdown,
};
use tonic::transport::Server as TonicServer;

use crate::app::{App, AppInner};
use crate::args::ServerArgs;
use crate::auth::{self, Caller};
use crate::db;
use crate::metrics;
use crate::models::{
    Agent, AgentConfig, Execution, ExecutionPriority, validate_agent_config,
};
use crate::orchestrator::{self, ExecutionRequested};
use crate::proto::relay::relay_server::RelayServer;
use crate::queue::WorkQueue;
use crate::registration;
use crate::registry::StreamRegistry;
use crate::relay::RelayService;
use crate::workflow::{WorkflowEngine, subjects};

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub accepted: bool,
    pub request_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub agent: String,
    pub input: Value,
    #[serde(default)]
    pub priority: Option<ExecutionPriority>,
    #[serde(default)]
    pub cluster: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub execution_id: Uuid,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsQuery {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsResponse {
    pub agents: Vec<AgentDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDto {
    pub id: Uuid,
    pub name: String,
    pub image: String,
    pub status: String,
    pub config_hash: String,
    pub resources: Value,
    pub retry_policy: Value,
    pub use_agent_sandbox: bool,
    pub warm_pool_size: i32,
    pub network_policy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_report: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentDto {
    fn from_agent(agent: Agent) -> Self {
        Self {
            id: agent.id,
            name: agent.name,
            image: agent.image,
            status: agent.status.as_str().to_string(),
            config_hash: agent.config_hash,
            resources: serde_json::to_value(&agent.resources).unwrap_or(Value::Null),
            retry_policy: serde_json::to_value(&agent.retry_policy).unwrap_or(Value::Null),
            use_agent_sandbox: agent.use_agent_sandbox,
            warm_pool_size: agent.warm_pool_size,
            network_policy: agent.network_policy.as_str().to_string(),
            registration_report: agent.registration_report,
            created_at: agent.created_at,
            updated_at: agent.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionErrorDto {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDto {
    pub execution_id: Uuid,
    pub status: String,
    pub priority: String,
    pub attempt: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionErrorDto>,
}

impl ExecutionDto {
    fn from_execution(execution: Execution) -> Self {
        let error = match (execution.error_code, execution.error_message) {
            (None, None) => None,
            (code, message) => Some(ExecutionErrorDto {
                code: code.unwrap_or_else(|| "execution_failed".to_string()),
                message: message.unwrap_or_default(),
            }),
        };
        Self {
            execution_id: execution.id,
            status: execution.status.as_str().to_string(),
            priority: execution.priority.as_str().to_string(),
            attempt: execution.attempt,
            cluster_id: execution.cluster_id,
            created_at: execution.created_at,
            queued_at: execution.queued_at,
            started_at: execution.started_at,
            completed_at: execution.completed_at,
            duration_ms: execution.duration_ms,
            result: execution.result,
            resource_usage: execution.resource_usage,
            error,
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

pub async fn health() -> impl IntoResponse {
    "OK"
}

/// Accept a batch-of-one agent configuration; provisioning continues
/// asynchronously and is observable through `GET /api/agents`.
pub async fn register_agent(
    State(app): State<App>,
    Caller(caller): Caller,
    RequestContextExtractor(ctx): RequestContextExtractor,
    Json(config): Json<AgentConfig>,
) -> Result<impl IntoResponse, Response> {
    validate_agent_config(&config).map_err(response::bad_request)?;

    let request_id = ctx.request_id;
    let organization_id = caller.organization_id;
    let task_app = app.clone();
    tokio::spawn(async move {
        match registration::register_agents(&task_app, organization_id, request_id, &[config])
            .await
        {
            Ok(receipt) => {
                for result in &receipt.results {
                    tracing::info!(
                        %request_id,
                        agent = %result.agent,
                        outcome = result.outcome,
                        clusters = result.clusters_targeted,
                        "agent registration processed"
                    );
                }
            }
            Err(e) => tracing::error!(%request_id, error = ?e, "agent registration failed"),
        }
    });

    metrics::agent_registration_accepted();
    Ok((
        StatusCode::ACCEPTED,
        Json(RegisterResponse {
            accepted: true,
            request_id,
        }),
    ))
}

pub async fn list_agents(
    State(app): State<App>,
    Caller(caller): Caller,
    Query(query): Query<AgentsQuery>,
) -> Result<impl IntoResponse, Response> {
    let agents = db::list_agents(&app.pg, caller.organization_id, query.name.as_deref())
        .await
        .map_err(response::internal_server_error)?;
    metrics::agents_listed(agents.len());
    Ok(Json(AgentsResponse {
        agents: agents.into_iter().map(AgentDto::from_agent).collect(),
    }))
}

/// Create the durable PENDING record and emit `execution.requested`; the
/// orchestrator takes it from there. 202 with the id the caller polls.
pub async fn execute(
    State(app): State<App>,
    Caller(caller): Caller,
    RequestContextExtractor(ctx): RequestContextExtractor,
    Json(req): Json<ExecuteRequest>,
) -> Result<impl IntoResponse, Response> {
    let agent = db::load_agent(&app.pg, caller.organization_id, &req.agent)
        .await
        .map_err(response::internal_server_error)?
        .ok_or_else(|| response::not_found(anyhow!("agent {:?} not found", req.agent)))?;

    let execution_id = Uuid::new_v4();
    let priority = req.priority.unwrap_or(ExecutionPriority::Normal);

    db::create_execution(
        &app.pg,
        execution_id,
        agent.id,
        &req.input,
        priority,
        agent.retry_policy.max_attempts,
    )
    .await
    .map_err(response::internal_server_error)?;

    db::record_audit(
        &app.pg,
        caller.organization_id,
        "api",
        "execution.submitted",
        Some(execution_id),
        Some(&json!({
            "agent": req.agent,
            "requestId": ctx.request_id,
            "apiKeyId": caller.api_key_id,
        })),
        &secrets::generate_trace_id(),
        &secrets::generate_span_id(),
    )
    .await
    .map_err(response::internal_server_error)?;

    let event = ExecutionRequested {
        execution_id,
        organization_id: caller.organization_id,
        agent: req.agent,
        input: req.input,
        priority,
        preferred_cluster: req.cluster,
        attempt: 1,
    };
    app.engine
        .publish(
            subjects::EXECUTION_REQUESTED,
            &serde_json::to_value(&event)
                .context("failed to encode execution.requested")
                .map_err(response::internal_server_error)?,
        )
        .await
        .map_err(response::internal_server_error)?;

    metrics::execution_submitted();
    Ok((
        StatusCode::ACCEPTED,
        Json(ExecuteResponse {
            execution_id,
            status: "pending".to_string(),
        }),
    ))
}

/// Push a configuration payload to a connected cluster, wherever in the
/// fleet its stream currently lives. Best-effort delivery.
pub async fn push_cluster_config(
    State(app): State<App>,
    Caller(caller): Caller,
    Path(id): Path<Uuid>,
    Json(payload): Json<Value>,
) -> Result<impl IntoResponse, Response> {
    let cluster = db::get_cluster(&app.pg, id)
        .await
        .map_err(response::internal_server_error)?
        .filter(|c| c.organization_id == caller.organization_id)
        .ok_or_else(|| response::not_found(anyhow!("cluster {} not found", id)))?;

    app.registry
        .send_config(cluster.id, &payload)
        .await
        .map_err(response::internal_server_error)?;
    Ok(StatusCode::ACCEPTED)
}

/// The authoritative durable state of one execution, scoped to the caller's
/// organization through the agent join.
pub async fn get_execution(
    State(app): State<App>,
    Caller(caller): Caller,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, Response> {
    let execution = db::get_execution_owned(&app.pg, caller.organization_id, id)
        .await
        .map_err(response::internal_server_error)?
        .ok_or_else(|| response::not_found(anyhow!("execution {} not found", id)))?;
    metrics::execution_fetched();
    Ok(Json(ExecutionDto::from_execution(execution)))
}

// =============================================================================
// Composition
// =============================================================================

fn build_router(app: App) -> Router {
    let api = Router::new()
        .route("/api/agents/register", post(register_agent))
        .route("/api/agents", get(list_agents))
        .route("/api/execute", post(execute))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/clusters/{id}/config", post(push_cluster_config))
        // Innermost, so it sees the quota key the auth middleware attaches.
        .layer(RateLimitLayer::new(app.limiter.clone()))
        .layer(middleware::from_fn_with_state(
            app.clone(),
            auth::require_api_key,
        ))
        .layer(middleware::from_fn(
            tessera_common::middleware::create_context,
        ))
        .layer(middleware::from_fn(access_log::public))
        .layer(cors::dev())
        .with_state(app.clone());

    Router::new()
        .route("/healthz", get(health))
        .with_state(app)
        .merge(api)
}

pub async fn run_server(args: ServerArgs) -> Result<()> {
    let pg = tessera_common::postgres::create_pool(args.postgres.clone()).await;
    db::init_schema(&pg).await?;

    let redis = tessera_common::redis::init_redis(&args.redis).await;
    let nats = args.nats.connect().await?;

    let cancel = CancellationToken::new();
    cancel_on_shutdown(&cancel);

    let node_id = Uuid::new_v4();
    let registry = StreamRegistry::new(
        node_id,
        redis.clone(),
        args.redis.clone(),
        cancel.child_token(),
    );
    let queue = WorkQueue::new(redis.clone());
    let engine = WorkflowEngine::new(
        pg.clone(),
        nats.clone(),
        cancel.child_token(),
        args.max_concurrent_per_org,
    );
    let limiter = RateLimiter::new(redis.clone(), RateLimiterConfig::from(args.rate_limiter.clone()));

    let app = App::new(AppInner {
        pg,
        queue,
        registry: registry.clone(),
        engine: engine.clone(),
        limiter,
        cancel: cancel.clone(),
    });

    // Background loops: cross-pod signals, scheduled event delivery, the
    // execution dispatcher, and the crash-recovery re-dispatch.
    {
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = registry.run_signal_listener().await {
                tracing::error!(error = ?e, "signal listener exited");
            }
        });
    }
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run_scheduler().await {
                tracing::error!(error = ?e, "event scheduler exited");
            }
        });
    }
    orchestrator::start_dispatcher(app.clone()).await?;
    orchestrator::resume_inflight(&app).await?;

    // Relayer-facing gRPC endpoint.
    let grpc_addr: SocketAddr = format!("0.0.0.0:{}", args.grpc_port).parse()?;
    tracing::info!(%grpc_addr, "starting relay gRPC server");
    let grpc_cancel = cancel.clone();
    let grpc_server = TonicServer::builder()
        .add_service(RelayServer::new(RelayService::new(app.clone())))
        .serve_with_shutdown(grpc_addr, async move {
            grpc_cancel.cancelled().await;
        });

    // Caller-facing HTTP API.
    let http_addr = format!("0.0.0.0:{}", args.http_port);
    let listener = TcpListener::bind(&http_addr)
        .await
        .context("failed to bind HTTP server")?;
    tracing::info!(%http_addr, "starting control HTTP server");
    let http_cancel = cancel.clone();
    let http_server = axum::serve(listener, build_router(app))
        .with_graceful_shutdown(async move {
            http_cancel.cancelled().await;
        });

    tessera_common::signal_ready();

    tokio::select! {
        result = grpc_server => {
            if let Err(e) = &result {
                tracing::error!(?e, "gRPC server exited with error");
            }
            result?;
        }
        result = http_server => {
            if let Err(e) = &result {
                tracing::error!(?e, "HTTP server exited with error");
            }
            result.context("HTTP server failed")?;
        }
    }

    tracing::info!("server stopped gracefully");
    Ok(())
}
