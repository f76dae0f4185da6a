//! Execution orchestration: the durable state machine for one execution,
//! from `execution.requested` to a terminal COMPLETED or FAILED row.
//!
//! Each attempt is its own workflow (`execution:{id}:attempt:{n}`), so a
//! retry re-runs every step while replays of the *same* attempt stay
//! memoized. Every status write is a CAS guarded on the attempt counter; a
//! stale waiter from a superseded attempt can never clobber a newer one.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_stream::StreamExt;
use uuid::Uuid;

use tessera_common::secrets;

use crate::app::App;
use crate::db::{self, ExecutionUpdate};
use crate::models::{
    AgentStatus, BackoffKind, ClusterStatus, ExecutionPriority, ExecutionStatus, NetworkPolicy,
    QueueMessage, ResourceSpec, RetryPolicy, WorkItem, parse_duration,
};
use crate::selector::{self, PlacementPrefs};
use crate::workflow::subjects;

/// Slack added to the agent's own timeout before the workflow gives up
/// waiting for a completion event.
const COMPLETION_GRACE: Duration = Duration::from_secs(60);

/// Fallback when an agent's timeout cannot be parsed (legacy rows).
const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(300);

pub mod codes {
    pub const EXECUTION_FAILED: &str = "execution_failed";
    pub const EXECUTION_TIMEOUT: &str = "execution_timeout";
    pub const AGENT_NOT_FOUND: &str = "agent_not_found";
    pub const AGENT_NOT_ACTIVE: &str = "agent_not_active";
    pub const NO_ELIGIBLE_CLUSTER: &str = "no_eligible_cluster";
}

/// Trigger payload for one execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequested {
    pub execution_id: Uuid,
    pub organization_id: Uuid,
    /// Agent name, or an agent id rendered as a string.
    pub agent: String,
    pub input: Value,
    pub priority: ExecutionPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_cluster: Option<Uuid>,
    pub attempt: i32,
}

/// Relayer-reported failure, routed here by the stream loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionFailed {
    pub execution_id: Uuid,
    pub error_code: String,
    pub error_message: String,
}

/// Relayer-reported completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionCompleted {
    pub execution_id: Uuid,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub resource_usage: Option<Value>,
}

fn workflow_id(event: &ExecutionRequested) -> String {
    format!("execution:{}:attempt:{}", event.execution_id, event.attempt)
}

/// Journaled view of the agent at step time, so replays see the exact config
/// the attempt started with even if the agent changes underneath.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentSnapshot {
    agent_id: Uuid,
    active: bool,
    name: String,
    image: String,
    resources: ResourceSpec,
    retry_policy: RetryPolicy,
    use_agent_sandbox: bool,
    network_policy: NetworkPolicy,
    warm_pool_size: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    environment_variables: Option<Value>,
}

/// Drive one execution attempt to a terminal state (or hand off to the
/// failure companion via the relayer's failure event).
pub async fn run_execution(app: &App, event: &ExecutionRequested) -> Result<()> {
    let pool = &app.pg;
    let engine = &app.engine;
    let wf = workflow_id(event);

    // Step 1: place the durable record and audit the trigger. Idempotent:
    // a replayed request never creates a second row.
    let agent_id: Option<Uuid> = engine
        .step(&wf, "create-record", || {
            let pool = pool.clone();
            let event = event.clone();
            async move {
                let Some(agent) =
                    db::load_agent(&pool, event.organization_id, &event.agent).await?
                else {
                    return Ok(None);
                };
                db::create_execution(
                    &pool,
                    event.execution_id,
                    agent.id,
                    &event.input,
                    event.priority,
                    agent.retry_policy.max_attempts,
                )
                .await?;
                db::record_audit(
                    &pool,
                    event.organization_id,
                    "execution-orchestrator",
                    "execution.requested",
                    Some(event.execution_id),
                    Some(&json!({"agent": event.agent, "attempt": event.attempt})),
                    &secrets::generate_trace_id(),
                    &secrets::generate_span_id(),
                )
                .await?;
                Ok(Some(agent.id))
            }
        })
        .await?;

    let Some(agent_id) = agent_id else {
        tracing::warn!(execution_id = %event.execution_id, agent = %event.agent, "agent not found");
        mark_failed(app, event, codes::AGENT_NOT_FOUND, "agent not found").await?;
        return Ok(());
    };

    // Step 2: resolve the agent config this attempt will run with.
    let agent: AgentSnapshot = engine
        .step(&wf, "resolve-agent", || {
            let pool = pool.clone();
            async move {
                let agent = db::get_agent(&pool, agent_id)
                    .await?
                    .context("agent disappeared after record creation")?;
                Ok(AgentSnapshot {
                    agent_id: agent.id,
                    active: agent.status == AgentStatus::Active,
                    name: agent.name,
                    image: agent.image,
                    resources: agent.resources,
                    retry_policy: agent.retry_policy,
                    use_agent_sandbox: agent.use_agent_sandbox,
                    network_policy: agent.network_policy,
                    warm_pool_size: agent.warm_pool_size,
                    environment_variables: agent.environment_variables,
                })
            }
        })
        .await?;

    if !agent.active {
        mark_failed(app, event, codes::AGENT_NOT_ACTIVE, "agent is not active").await?;
        return Ok(());
    }

    // Step 3: pick a cluster. A caller-preferred cluster wins when it is
    // usable; otherwise the selector scores the eligible fleet.
    let cluster_id: Option<Uuid> = engine
        .step(&wf, "select-cluster", || {
            let pool = pool.clone();
            let app = app.clone();
            let event = event.clone();
            let agent = agent.clone();
            async move {
                if let Some(preferred) = event.preferred_cluster
                    && let Some(cluster) = db::get_cluster(&pool, preferred).await?
                    && cluster.organization_id == event.organization_id
                    && cluster.status == ClusterStatus::Active
                    && app.registry.is_alive_anywhere(cluster.id).await?
                {
                    return Ok(Some(cluster.id));
                }
                let prefs = PlacementPrefs {
                    preferred_region: None,
                    require_gpu: gpu_required(&agent.resources),
                    require_sandbox: agent.use_agent_sandbox,
                };
                let mut rng = rand::rngs::StdRng::from_os_rng();
                let selected = selector::select_cluster(
                    &pool,
                    &app.queue,
                    &app.registry,
                    event.organization_id,
                    &prefs,
                    &mut rng,
                )
                .await?;
                Ok(selected.map(|c| c.id))
            }
        })
        .await?;

    let Some(cluster_id) = cluster_id else {
        mark_failed(
            app,
            event,
            codes::NO_ELIGIBLE_CLUSTER,
            "no eligible cluster for this workload",
        )
        .await?;
        return Ok(());
    };

    // Arm the completion waiter before any work can reach the relayer, so
    // even an instant reply cannot slip past the subscription.
    let completion_waiter = engine
        .wait_for_event(&subjects::execution_completed(event.execution_id))
        .await?;

    // Step 4: advance PENDING -> QUEUED and hand the work item to the queue.
    engine
        .step(&wf, "queue-work", || {
            let pool = pool.clone();
            let app = app.clone();
            let event = event.clone();
            let agent = agent.clone();
            async move {
                db::update_execution_status(
                    &pool,
                    event.execution_id,
                    &[ExecutionStatus::Pending],
                    Some(event.attempt),
                    ExecutionStatus::Queued,
                    &ExecutionUpdate {
                        cluster_id: Some(cluster_id),
                        queued_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;
                let message = QueueMessage::Work(WorkItem {
                    execution_id: event.execution_id,
                    agent_id: agent.agent_id,
                    agent_name: agent.name.clone(),
                    agent_image: agent.image.clone(),
                    input: event.input.clone(),
                    resources: agent.resources.clone(),
                    retry_policy: agent.retry_policy.clone(),
                    use_agent_sandbox: agent.use_agent_sandbox,
                    network_policy: agent.network_policy,
                    warm_pool_size: agent.warm_pool_size,
                    environment_variables: agent.environment_variables.clone(),
                });
                app.queue
                    .enqueue(event.organization_id, cluster_id, &message, event.priority)
                    .await?;
                metrics::counter!("executions_queued_total").increment(1);
                // Observer event; nothing downstream depends on it.
                app.engine
                    .publish(
                        &subjects::execution_queued(event.execution_id),
                        &json!({
                            "executionId": event.execution_id,
                            "clusterId": cluster_id,
                            "attempt": event.attempt,
                        }),
                    )
                    .await
                    .ok();
                Ok(())
            }
        })
        .await?;

    // Step 5: durably wait for the relayer to report completion.
    let timeout = parse_duration(&agent.resources.timeout)
        .unwrap_or(DEFAULT_EXECUTION_TIMEOUT)
        + COMPLETION_GRACE;
    let completion = completion_waiter.wait(timeout).await?;

    match completion {
        Some(payload) => {
            let completed: ExecutionCompleted = serde_json::from_value(payload)
                .context("failed to decode completion event")?;
            let advanced = db::update_execution_status(
                pool,
                event.execution_id,
                &[ExecutionStatus::Queued, ExecutionStatus::Running],
                Some(event.attempt),
                ExecutionStatus::Completed,
                &ExecutionUpdate {
                    completed_at: Some(Utc::now()),
                    duration_ms: completed.duration_ms,
                    result: completed.result,
                    resource_usage: completed.resource_usage,
                    ..Default::default()
                },
            )
            .await?;
            if advanced {
                metrics::counter!("executions_completed_total").increment(1);
            }
        }
        None => {
            let advanced = db::update_execution_status(
                pool,
                event.execution_id,
                &[ExecutionStatus::Queued, ExecutionStatus::Running],
                Some(event.attempt),
                ExecutionStatus::Failed,
                &ExecutionUpdate {
                    completed_at: Some(Utc::now()),
                    error_code: Some(codes::EXECUTION_TIMEOUT.into()),
                    error_message: Some("timed out waiting for completion".into()),
                    ..Default::default()
                },
            )
            .await?;
            if advanced {
                tracing::warn!(execution_id = %event.execution_id, "execution timed out");
                metrics::counter!("executions_timed_out_total").increment(1);
            }
        }
    }
    Ok(())
}

fn gpu_required(resources: &ResourceSpec) -> bool {
    resources.gpu.as_deref().is_some_and(|g| g != "0")
}

async fn mark_failed(
    app: &App,
    event: &ExecutionRequested,
    code: &str,
    message: &str,
) -> Result<()> {
    let advanced = db::update_execution_status(
        &app.pg,
        event.execution_id,
        &[
            ExecutionStatus::Pending,
            ExecutionStatus::Queued,
            ExecutionStatus::Running,
        ],
        Some(event.attempt),
        ExecutionStatus::Failed,
        &ExecutionUpdate {
            completed_at: Some(Utc::now()),
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            ..Default::default()
        },
    )
    .await?;
    if advanced {
        metrics::counter!("executions_failed_total", "code" => code.to_string()).increment(1);
    }
    Ok(())
}

/// Backoff before retry `attempt + 1`, computed from the attempt that just
/// failed (1-based).
pub fn compute_backoff(kind: BackoffKind, initial: Duration, attempt: i32) -> Duration {
    let attempt = attempt.clamp(0, 20) as u32;
    match kind {
        BackoffKind::Constant => initial,
        BackoffKind::Linear => initial * (attempt + 1),
        BackoffKind::Exponential => initial * 2u32.saturating_pow(attempt),
    }
}

/// Failure companion: decides between scheduling another attempt and writing
/// the terminal FAILED row.
pub async fn run_execution_failure(app: &App, event: &ExecutionFailed) -> Result<()> {
    let pool = &app.pg;

    let Some(execution) = db::get_execution(pool, event.execution_id).await? else {
        tracing::warn!(execution_id = %event.execution_id, "failure event for unknown execution");
        return Ok(());
    };
    if execution.status.is_terminal() {
        return Ok(());
    }
    let agent = db::get_agent(pool, execution.agent_id)
        .await?
        .context("agent disappeared for failed execution")?;

    if execution.attempt < execution.max_attempts {
        let initial = agent
            .retry_policy
            .initial_delay
            .as_deref()
            .and_then(|d| parse_duration(d).ok())
            .unwrap_or(Duration::from_secs(1));
        let delay = compute_backoff(agent.retry_policy.backoff, initial, execution.attempt);
        let next_retry_at = Utc::now()
            + chrono::Duration::from_std(delay).context("backoff delay out of range")?;

        let advanced = db::update_execution_status(
            pool,
            execution.id,
            &[ExecutionStatus::Queued, ExecutionStatus::Running],
            Some(execution.attempt),
            ExecutionStatus::Pending,
            &ExecutionUpdate {
                attempt: Some(execution.attempt + 1),
                next_retry_at: Some(next_retry_at),
                error_code: Some(event.error_code.clone()),
                error_message: Some(event.error_message.clone()),
                ..Default::default()
            },
        )
        .await?;
        if !advanced {
            // Another replica already moved the row; nothing to do.
            return Ok(());
        }

        tracing::info!(
            execution_id = %execution.id,
            attempt = execution.attempt + 1,
            delay_secs = delay.as_secs(),
            "scheduling retry"
        );
        metrics::counter!("executions_retried_total").increment(1);

        let retry = ExecutionRequested {
            execution_id: execution.id,
            organization_id: agent.organization_id,
            agent: agent.id.to_string(),
            input: execution.input,
            priority: execution.priority,
            preferred_cluster: None,
            attempt: execution.attempt + 1,
        };
        app.engine
            .send(
                subjects::EXECUTION_REQUESTED,
                &serde_json::to_value(&retry).context("failed to encode retry event")?,
                Some(next_retry_at),
            )
            .await?;
    } else {
        let advanced = db::update_execution_status(
            pool,
            execution.id,
            &[
                ExecutionStatus::Pending,
                ExecutionStatus::Queued,
                ExecutionStatus::Running,
            ],
            Some(execution.attempt),
            ExecutionStatus::Failed,
            &ExecutionUpdate {
                completed_at: Some(Utc::now()),
                error_code: Some(event.error_code.clone()),
                error_message: Some(event.error_message.clone()),
                ..Default::default()
            },
        )
        .await?;
        if advanced {
            metrics::counter!("executions_failed_total", "code" => event.error_code.clone())
                .increment(1);
        }
    }
    Ok(())
}

/// Subscribe to the trigger subjects and spawn the dispatch loop. The
/// subscriptions are live when this returns, so events published right
/// after startup (e.g. by `resume_inflight`) are never missed.
pub async fn start_dispatcher(app: App) -> Result<()> {
    let requested = app
        .engine
        .subscribe(subjects::EXECUTION_REQUESTED.to_string())
        .await?;
    let failed = app
        .engine
        .subscribe(subjects::execution_failed_wildcard())
        .await?;

    tokio::spawn(async move {
        if let Err(e) = dispatch_loop(app, requested, failed).await {
            tracing::error!(error = ?e, "execution dispatcher exited");
        }
    });
    Ok(())
}

/// Spawn a workflow per trigger until shutdown. The per-organization slot is
/// taken inside the spawned task so one noisy tenant cannot stall the
/// dispatcher.
async fn dispatch_loop(
    app: App,
    mut requested: async_nats::Subscriber,
    mut failed: async_nats::Subscriber,
) -> Result<()> {
    tracing::info!("execution dispatcher started");
    loop {
        tokio::select! {
            _ = app.cancel.cancelled() => return Ok(()),
            msg = requested.next() => {
                let Some(msg) = msg else { anyhow::bail!("execution.requested subscription closed") };
                let event: ExecutionRequested = match serde_json::from_slice(&msg.payload) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::error!(error = ?e, "undecodable execution.requested event");
                        continue;
                    }
                };
                let app = app.clone();
                tokio::spawn(async move {
                    let _permit = match app.engine.acquire_org_slot(event.organization_id).await {
                        Ok(permit) => permit,
                        Err(e) => {
                            tracing::error!(error = ?e, "failed to acquire organization slot");
                            return;
                        }
                    };
                    if let Err(e) = run_execution(&app, &event).await {
                        tracing::error!(
                            execution_id = %event.execution_id,
                            error = ?e,
                            "execution workflow failed"
                        );
                    }
                });
            }
            msg = failed.next() => {
                let Some(msg) = msg else { anyhow::bail!("execution.failed subscription closed") };
                let event: ExecutionFailed = match serde_json::from_slice(&msg.payload) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::error!(error = ?e, "undecodable execution.failed event");
                        continue;
                    }
                };
                let app = app.clone();
                tokio::spawn(async move {
                    if let Err(e) = run_execution_failure(&app, &event).await {
                        tracing::error!(
                            execution_id = %event.execution_id,
                            error = ?e,
                            "failure workflow errored"
                        );
                    }
                });
            }
        }
    }
}

/// Re-emit the trigger for every non-terminal execution. Journaled steps
/// make the replay idempotent, so a control-plane crash never strands an
/// execution in PENDING or QUEUED.
pub async fn resume_inflight(app: &App) -> Result<()> {
    let unfinished = db::list_unfinished_executions(&app.pg).await?;
    let count = unfinished.len();
    for execution in unfinished {
        let Some(agent) = db::get_agent(&app.pg, execution.agent_id).await? else {
            continue;
        };
        let event = ExecutionRequested {
            execution_id: execution.id,
            organization_id: agent.organization_id,
            agent: agent.id.to_string(),
            input: execution.input,
            priority: execution.priority,
            preferred_cluster: None,
            attempt: execution.attempt,
        };
        let deliver_at = execution.next_retry_at.filter(|ts| *ts > Utc::now());
        app.engine
            .send(
                subjects::EXECUTION_REQUESTED,
                &serde_json::to_value(&event).context("failed to encode resume event")?,
                deliver_at,
            )
            .await?;
    }
    if count > 0 {
        tracing::info!(count, "re-dispatched unfinished executions");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_backoff_ignores_attempt() {
        let initial = Duration::from_secs(3);
        for attempt in 1..5 {
            assert_eq!(
                compute_backoff(BackoffKind::Constant, initial, attempt),
                initial
            );
        }
    }

    #[test]
    fn linear_backoff_scales_with_attempt() {
        let initial = Duration::from_secs(2);
        assert_eq!(
            compute_backoff(BackoffKind::Linear, initial, 1),
            Duration::from_secs(4)
        );
        assert_eq!(
            compute_backoff(BackoffKind::Linear, initial, 3),
            Duration::from_secs(8)
        );
    }

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let initial = Duration::from_secs(1);
        // First failure (attempt 1) retries after 2s, then 4s, then 8s.
        assert_eq!(
            compute_backoff(BackoffKind::Exponential, initial, 1),
            Duration::from_secs(2)
        );
        assert_eq!(
            compute_backoff(BackoffKind::Exponential, initial, 2),
            Duration::from_secs(4)
        );
        assert_eq!(
            compute_backoff(BackoffKind::Exponential, initial, 3),
            Duration::from_secs(8)
        );
    }

    #[test]
    fn exponential_backoff_does_not_overflow() {
        let initial = Duration::from_secs(1);
        let huge = compute_backoff(BackoffKind::Exponential, initial, 1000);
        assert!(huge <= Duration::from_secs(1 << 20));
    }

    #[test]
    fn workflow_id_distinguishes_attempts() {
        let event = ExecutionRequested {
            execution_id: Uuid::nil(),
            organization_id: Uuid::nil(),
            agent: "analyzer".into(),
            input: json!({}),
            priority: ExecutionPriority::Normal,
            preferred_cluster: None,
            attempt: 1,
        };
        let mut second = event.clone();
        second.attempt = 2;
        assert_ne!(workflow_id(&event), workflow_id(&second));
    }

    #[test]
    fn gpu_requirement_from_resources() {
        let mut resources = ResourceSpec {
            cpu: "1".into(),
            memory: "1Gi".into(),
            gpu: None,
            timeout: "60s".into(),
        };
        assert!(!gpu_required(&resources));
        resources.gpu = Some("0".into());
        assert!(!gpu_required(&resources));
        resources.gpu = Some("2".into());
        assert!(gpu_required(&resources));
    }
}
