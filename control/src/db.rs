//! Durable store adapter. Free functions over the shared pool, raw SQL,
//! manual row mapping. Every write that advances an execution's status goes
//! through [`update_execution_status`], whose `status = ANY(...)` guard is
//! the optimistic CAS that keeps transitions monotone under concurrent
//! updaters.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use serde_json::Value;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::models::{
    Agent, AgentClusterStatus, AgentConfig, AgentStatus, ApiKeyRecord, Cluster, Execution,
    ExecutionPriority, ExecutionStatus, aggregate_agent_status,
};

/// Heartbeats older than this make a cluster ineligible for placement.
pub const HEARTBEAT_FRESHNESS_SECS: i64 = 120;

pub async fn init_schema(pool: &Pool) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS organizations (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                name TEXT NOT NULL UNIQUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            &[],
        )
        .await
        .context("failed to create organizations table")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                organization_id UUID NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
                key_hash TEXT NOT NULL,
                key_prefix TEXT NOT NULL,
                rate_limit BIGINT NOT NULL DEFAULT 250,
                expires_at TIMESTAMPTZ,
                revoked_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            &[],
        )
        .await
        .context("failed to create api_keys table")?;

    client
        .execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_api_keys_prefix ON api_keys (key_prefix)
            "#,
            &[],
        )
        .await
        .context("failed to create api key prefix index")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS clusters (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                organization_id UUID NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                last_heartbeat TIMESTAMPTZ,
                relayer_version TEXT,
                secret_hash TEXT,
                capabilities JSONB NOT NULL DEFAULT '{}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE (organization_id, name)
            )
            "#,
            &[],
        )
        .await
        .context("failed to create clusters table")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                organization_id UUID NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                image TEXT NOT NULL,
                resources JSONB NOT NULL,
                retry_policy JSONB NOT NULL,
                use_agent_sandbox BOOLEAN NOT NULL DEFAULT false,
                warm_pool_size INT NOT NULL DEFAULT 0,
                network_policy TEXT NOT NULL DEFAULT 'standard',
                environment_variables JSONB,
                config_hash TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                registration_report JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE (organization_id, name)
            )
            "#,
            &[],
        )
        .await
        .context("failed to create agents table")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS agent_cluster_statuses (
                agent_id UUID NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                cluster_id UUID NOT NULL REFERENCES clusters(id) ON DELETE CASCADE,
                status TEXT NOT NULL,
                error TEXT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (agent_id, cluster_id)
            )
            "#,
            &[],
        )
        .await
        .context("failed to create agent_cluster_statuses table")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id UUID PRIMARY KEY,
                agent_id UUID NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                cluster_id UUID REFERENCES clusters(id),
                status TEXT NOT NULL DEFAULT 'PENDING',
                input JSONB NOT NULL,
                priority TEXT NOT NULL DEFAULT 'NORMAL',
                attempt INT NOT NULL DEFAULT 1,
                max_attempts INT NOT NULL DEFAULT 1,
                queued_at TIMESTAMPTZ,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                duration_ms BIGINT,
                result JSONB,
                resource_usage JSONB,
                error_code TEXT,
                error_message TEXT,
                next_retry_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            &[],
        )
        .await
        .context("failed to create executions table")?;

    client
        .execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_executions_agent ON executions (agent_id)
            "#,
            &[],
        )
        .await
        .context("failed to create execution agent index")?;

    client
        .execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_executions_status ON executions (status)
            "#,
            &[],
        )
        .await
        .context("failed to create execution status index")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                organization_id UUID NOT NULL,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                subject_id UUID,
                attributes JSONB,
                trace_id TEXT,
                span_id TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            &[],
        )
        .await
        .context("failed to create audit_log table")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_steps (
                workflow_id TEXT NOT NULL,
                step_name TEXT NOT NULL,
                result JSONB NOT NULL,
                completed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (workflow_id, step_name)
            )
            "#,
            &[],
        )
        .await
        .context("failed to create workflow_steps table")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_events (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                subject TEXT NOT NULL,
                payload JSONB NOT NULL,
                deliver_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            &[],
        )
        .await
        .context("failed to create scheduled_events table")?;

    client
        .execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_scheduled_events_deliver_at
            ON scheduled_events (deliver_at)
            "#,
            &[],
        )
        .await
        .context("failed to create scheduled event index")?;

    tracing::info!("database schema initialized");
    Ok(())
}

// =============================================================================
// Organizations and API keys
// =============================================================================

pub async fn create_organization(pool: &Pool, name: &str) -> Result<Uuid> {
    let client = pool.get().await.context("failed to get db connection")?;
    let row = client
        .query_one(
            r#"
            INSERT INTO organizations (name)
            VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET name = organizations.name
            RETURNING id
            "#,
            &[&name],
        )
        .await
        .context("failed to create organization")?;
    Ok(row.get("id"))
}

pub async fn create_api_key(
    pool: &Pool,
    organization_id: Uuid,
    key_hash: &str,
    key_prefix: &str,
    rate_limit: i64,
) -> Result<Uuid> {
    let client = pool.get().await.context("failed to get db connection")?;
    let row = client
        .query_one(
            r#"
            INSERT INTO api_keys (organization_id, key_hash, key_prefix, rate_limit)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
            &[&organization_id, &key_hash, &key_prefix, &rate_limit],
        )
        .await
        .context("failed to create api key")?;
    Ok(row.get("id"))
}

/// Live candidates sharing the key prefix. Revoked keys stay in the table for
/// audit but never come back from here.
pub async fn find_api_key_candidates(pool: &Pool, prefix: &str) -> Result<Vec<ApiKeyRecord>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let rows = client
        .query(
            r#"
            SELECT id, organization_id, key_hash, key_prefix, rate_limit
            FROM api_keys
            WHERE key_prefix = $1
              AND revoked_at IS NULL
              AND (expires_at IS NULL OR expires_at > now())
            "#,
            &[&prefix],
        )
        .await
        .context("failed to query api key candidates")?;

    Ok(rows
        .iter()
        .map(|r| ApiKeyRecord {
            id: r.get("id"),
            organization_id: r.get("organization_id"),
            key_hash: r.get("key_hash"),
            key_prefix: r.get("key_prefix"),
            rate_limit: r.get("rate_limit"),
        })
        .collect())
}

// =============================================================================
// Clusters
// =============================================================================

fn cluster_from_row(row: &Row) -> Result<Cluster> {
    let status: String = row.get("status");
    Ok(Cluster {
        id: row.get("id"),
        organization_id: row.get("organization_id"),
        name: row.get("name"),
        status: status.parse()?,
        last_heartbeat: row.get("last_heartbeat"),
        relayer_version: row.get("relayer_version"),
        capabilities: row.get("capabilities"),
    })
}

const CLUSTER_COLUMNS: &str =
    "id, organization_id, name, status, last_heartbeat, relayer_version, capabilities";

/// Register or refresh a cluster. `(organization_id, name)` is the natural
/// key; re-registration refreshes the relayer version, capabilities, and
/// secret hash but never resets the heartbeat.
pub async fn upsert_cluster(
    pool: &Pool,
    organization_id: Uuid,
    name: &str,
    relayer_version: &str,
    capabilities: &Value,
    secret_hash: &str,
) -> Result<Cluster> {
    let client = pool.get().await.context("failed to get db connection")?;
    let row = client
        .query_one(
            &format!(
                r#"
                INSERT INTO clusters (organization_id, name, relayer_version, capabilities, secret_hash)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (organization_id, name) DO UPDATE
                SET relayer_version = EXCLUDED.relayer_version,
                    capabilities = EXCLUDED.capabilities,
                    secret_hash = EXCLUDED.secret_hash,
                    updated_at = now()
                RETURNING {CLUSTER_COLUMNS}
                "#
            ),
            &[
                &organization_id,
                &name,
                &relayer_version,
                capabilities,
                &secret_hash,
            ],
        )
        .await
        .context("failed to upsert cluster")?;
    cluster_from_row(&row)
}

pub async fn get_cluster(pool: &Pool, id: Uuid) -> Result<Option<Cluster>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let row = client
        .query_opt(
            &format!("SELECT {CLUSTER_COLUMNS} FROM clusters WHERE id = $1"),
            &[&id],
        )
        .await
        .context("failed to query cluster")?;
    row.map(|r| cluster_from_row(&r)).transpose()
}

pub async fn touch_cluster_heartbeat(pool: &Pool, id: Uuid) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;
    client
        .execute(
            r#"
            UPDATE clusters
            SET last_heartbeat = now(), status = 'ACTIVE', updated_at = now()
            WHERE id = $1
            "#,
            &[&id],
        )
        .await
        .context("failed to touch cluster heartbeat")?;
    Ok(())
}

/// ACTIVE clusters of the organization with a fresh heartbeat. The caller
/// still checks fleet-wide stream liveness before placing work.
pub async fn list_eligible_clusters(pool: &Pool, organization_id: Uuid) -> Result<Vec<Cluster>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let rows = client
        .query(
            &format!(
                r#"
                SELECT {CLUSTER_COLUMNS}
                FROM clusters
                WHERE organization_id = $1
                  AND status = 'ACTIVE'
                  AND last_heartbeat IS NOT NULL
                  AND last_heartbeat > now() - ($2 || ' seconds')::interval
                "#
            ),
            &[&organization_id, &HEARTBEAT_FRESHNESS_SECS.to_string()],
        )
        .await
        .context("failed to list eligible clusters")?;
    rows.iter().map(cluster_from_row).collect()
}

// =============================================================================
// Agents
// =============================================================================

pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

impl UpsertOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpsertOutcome::Created => "created",
            UpsertOutcome::Updated => "updated",
            UpsertOutcome::Unchanged => "unchanged",
        }
    }
}

fn agent_from_row(row: &Row) -> Result<Agent> {
    let status: String = row.get("status");
    let network_policy: String = row.get("network_policy");
    Ok(Agent {
        id: row.get("id"),
        organization_id: row.get("organization_id"),
        name: row.get("name"),
        image: row.get("image"),
        resources: serde_json::from_value(row.get("resources"))
            .context("failed to decode agent resources")?,
        retry_policy: serde_json::from_value(row.get("retry_policy"))
            .context("failed to decode agent retry policy")?,
        use_agent_sandbox: row.get("use_agent_sandbox"),
        warm_pool_size: row.get("warm_pool_size"),
        network_policy: network_policy.parse()?,
        environment_variables: row.get("environment_variables"),
        config_hash: row.get("config_hash"),
        status: status.parse()?,
        registration_report: row.get("registration_report"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

const AGENT_COLUMNS: &str = "id, organization_id, name, image, resources, retry_policy, \
     use_agent_sandbox, warm_pool_size, network_policy, \
     environment_variables, config_hash, status, registration_report, created_at, updated_at";

/// Upsert an agent definition, deciding by config hash whether anything
/// behaviorally significant changed. On `Unchanged`, only the environment
/// variables (excluded from the hash) are refreshed and no downstream side
/// effects should be emitted.
pub async fn upsert_agent(
    pool: &Pool,
    organization_id: Uuid,
    config: &AgentConfig,
) -> Result<(Agent, UpsertOutcome)> {
    let client = pool.get().await.context("failed to get db connection")?;

    let config_hash = config.config_hash();
    let resources =
        serde_json::to_value(&config.resources).context("failed to encode resources")?;
    let retry_policy =
        serde_json::to_value(&config.retry_policy).context("failed to encode retry policy")?;
    let network_policy = config.network_policy.as_str();

    let existing = client
        .query_opt(
            r#"
            SELECT id, config_hash FROM agents
            WHERE organization_id = $1 AND name = $2
            "#,
            &[&organization_id, &config.name],
        )
        .await
        .context("failed to query existing agent")?;

    let (id, outcome) = match existing {
        None => {
            let row = client
                .query_one(
                    r#"
                    INSERT INTO agents (organization_id, name, image, resources, retry_policy,
                                        use_agent_sandbox, warm_pool_size, network_policy,
                                        environment_variables, config_hash, status)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'PENDING')
                    RETURNING id
                    "#,
                    &[
                        &organization_id,
                        &config.name,
                        &config.image,
                        &resources,
                        &retry_policy,
                        &config.use_agent_sandbox,
                        &config.warm_pool_size,
                        &network_policy,
                        &config.environment_variables,
                        &config_hash,
                    ],
                )
                .await
                .context("failed to insert agent")?;
            (row.get::<_, Uuid>("id"), UpsertOutcome::Created)
        }
        Some(row) => {
            let id: Uuid = row.get("id");
            let prior_hash: String = row.get("config_hash");
            if prior_hash == config_hash {
                client
                    .execute(
                        r#"
                        UPDATE agents
                        SET environment_variables = $2, updated_at = now()
                        WHERE id = $1
                        "#,
                        &[&id, &config.environment_variables],
                    )
                    .await
                    .context("failed to refresh agent environment")?;
                (id, UpsertOutcome::Unchanged)
            } else {
                client
                    .execute(
                        r#"
                        UPDATE agents
                        SET image = $2, resources = $3, retry_policy = $4,
                            use_agent_sandbox = $5, warm_pool_size = $6, network_policy = $7,
                            environment_variables = $8, config_hash = $9,
                            status = 'PENDING', updated_at = now()
                        WHERE id = $1
                        "#,
                        &[
                            &id,
                            &config.image,
                            &resources,
                            &retry_policy,
                            &config.use_agent_sandbox,
                            &config.warm_pool_size,
                            &network_policy,
                            &config.environment_variables,
                            &config_hash,
                        ],
                    )
                    .await
                    .context("failed to update agent")?;
                (id, UpsertOutcome::Updated)
            }
        }
    };

    let agent = get_agent(pool, id)
        .await?
        .context("agent vanished during upsert")?;
    Ok((agent, outcome))
}

pub async fn get_agent(pool: &Pool, id: Uuid) -> Result<Option<Agent>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let row = client
        .query_opt(
            &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = $1"),
            &[&id],
        )
        .await
        .context("failed to query agent")?;
    row.map(|r| agent_from_row(&r)).transpose()
}

/// Look an agent up by name or, when the string parses as a UUID, by id.
/// Ownership is part of the predicate: another organization's agent is
/// indistinguishable from a missing one.
pub async fn load_agent(
    pool: &Pool,
    organization_id: Uuid,
    name_or_id: &str,
) -> Result<Option<Agent>> {
    let client = pool.get().await.context("failed to get db connection")?;

    if let Ok(id) = name_or_id.parse::<Uuid>() {
        let row = client
            .query_opt(
                &format!(
                    "SELECT {AGENT_COLUMNS} FROM agents WHERE id = $1 AND organization_id = $2"
                ),
                &[&id, &organization_id],
            )
            .await
            .context("failed to query agent by id")?;
        return row.map(|r| agent_from_row(&r)).transpose();
    }

    let row = client
        .query_opt(
            &format!(
                "SELECT {AGENT_COLUMNS} FROM agents WHERE organization_id = $1 AND name = $2"
            ),
            &[&organization_id, &name_or_id],
        )
        .await
        .context("failed to query agent by name")?;
    row.map(|r| agent_from_row(&r)).transpose()
}

pub async fn list_agents(
    pool: &Pool,
    organization_id: Uuid,
    name: Option<&str>,
) -> Result<Vec<Agent>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let rows = match name {
        Some(name) => {
            client
                .query(
                    &format!(
                        "SELECT {AGENT_COLUMNS} FROM agents \
                         WHERE organization_id = $1 AND name = $2 ORDER BY name"
                    ),
                    &[&organization_id, &name],
                )
                .await
        }
        None => {
            client
                .query(
                    &format!(
                        "SELECT {AGENT_COLUMNS} FROM agents \
                         WHERE organization_id = $1 ORDER BY name"
                    ),
                    &[&organization_id],
                )
                .await
        }
    }
    .context("failed to list agents")?;
    rows.iter().map(agent_from_row).collect()
}

// =============================================================================
// Per-cluster agent status
// =============================================================================

pub async fn upsert_agent_cluster_status(
    pool: &Pool,
    agent_id: Uuid,
    cluster_id: Uuid,
    status: AgentStatus,
    error: Option<&str>,
) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;
    client
        .execute(
            r#"
            INSERT INTO agent_cluster_statuses (agent_id, cluster_id, status, error, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (agent_id, cluster_id) DO UPDATE
            SET status = EXCLUDED.status, error = EXCLUDED.error, updated_at = now()
            "#,
            &[&agent_id, &cluster_id, &status.as_str(), &error],
        )
        .await
        .context("failed to upsert agent cluster status")?;
    Ok(())
}

pub async fn list_agent_cluster_statuses(
    pool: &Pool,
    agent_id: Uuid,
) -> Result<Vec<AgentClusterStatus>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let rows = client
        .query(
            r#"
            SELECT agent_id, cluster_id, status, error, updated_at
            FROM agent_cluster_statuses
            WHERE agent_id = $1
            "#,
            &[&agent_id],
        )
        .await
        .context("failed to list agent cluster statuses")?;

    rows.iter()
        .map(|r| {
            let status: String = r.get("status");
            Ok(AgentClusterStatus {
                agent_id: r.get("agent_id"),
                cluster_id: r.get("cluster_id"),
                status: status.parse()?,
                error: r.get("error"),
                updated_at: r.get("updated_at"),
            })
        })
        .collect()
}

/// Re-derive the aggregate agent status from the per-cluster rows and
/// persist it together with a fresh registration report.
pub async fn recompute_agent_status(pool: &Pool, agent_id: Uuid) -> Result<AgentStatus> {
    let statuses = list_agent_cluster_statuses(pool, agent_id).await?;
    if statuses.is_empty() {
        // No cluster has been asked to provision this agent yet; the
        // aggregation rule only applies once per-cluster rows exist.
        return Ok(AgentStatus::Pending);
    }
    let aggregate = aggregate_agent_status(
        &statuses.iter().map(|s| s.status).collect::<Vec<_>>(),
    );

    let report: Value = statuses
        .iter()
        .map(|s| {
            serde_json::json!({
                "clusterId": s.cluster_id,
                "status": s.status,
                "error": s.error,
                "updatedAt": s.updated_at,
            })
        })
        .collect::<Vec<_>>()
        .into();

    let client = pool.get().await.context("failed to get db connection")?;
    client
        .execute(
            r#"
            UPDATE agents
            SET status = $2, registration_report = $3, updated_at = now()
            WHERE id = $1
            "#,
            &[&agent_id, &aggregate.as_str(), &report],
        )
        .await
        .context("failed to persist aggregate agent status")?;
    Ok(aggregate)
}

// =============================================================================
// Executions
// =============================================================================

fn execution_from_row(row: &Row) -> Result<Execution> {
    let status: String = row.get("status");
    let priority: String = row.get("priority");
    Ok(Execution {
        id: row.get("id"),
        agent_id: row.get("agent_id"),
        cluster_id: row.get("cluster_id"),
        status: status.parse()?,
        input: row.get("input"),
        priority: priority.parse()?,
        attempt: row.get("attempt"),
        max_attempts: row.get("max_attempts"),
        queued_at: row.get("queued_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        duration_ms: row.get("duration_ms"),
        result: row.get("result"),
        resource_usage: row.get("resource_usage"),
        error_code: row.get("error_code"),
        error_message: row.get("error_message"),
        next_retry_at: row.get("next_retry_at"),
        created_at: row.get("created_at"),
    })
}

const EXECUTION_COLUMNS: &str = "id, agent_id, cluster_id, status, input, priority, attempt, \
     max_attempts, queued_at, started_at, completed_at, duration_ms, result, resource_usage, \
     error_code, error_message, next_retry_at, created_at";

/// Idempotent: replaying a request with the same id never creates a second
/// row or disturbs an in-flight one.
pub async fn create_execution(
    pool: &Pool,
    id: Uuid,
    agent_id: Uuid,
    input: &Value,
    priority: ExecutionPriority,
    max_attempts: i32,
) -> Result<Execution> {
    let client = pool.get().await.context("failed to get db connection")?;
    client
        .execute(
            r#"
            INSERT INTO executions (id, agent_id, input, priority, max_attempts)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
            &[&id, &agent_id, input, &priority.as_str(), &max_attempts],
        )
        .await
        .context("failed to insert execution")?;

    get_execution(pool, id)
        .await?
        .context("execution vanished after insert")
}

pub async fn get_execution(pool: &Pool, id: Uuid) -> Result<Option<Execution>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let row = client
        .query_opt(
            &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = $1"),
            &[&id],
        )
        .await
        .context("failed to query execution")?;
    row.map(|r| execution_from_row(&r)).transpose()
}

/// Fetch an execution only when its agent belongs to the organization.
pub async fn get_execution_owned(
    pool: &Pool,
    organization_id: Uuid,
    id: Uuid,
) -> Result<Option<Execution>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let row = client
        .query_opt(
            &format!(
                r#"
                SELECT {}
                FROM executions e
                JOIN agents a ON a.id = e.agent_id
                WHERE e.id = $1 AND a.organization_id = $2
                "#,
                EXECUTION_COLUMNS
                    .split(", ")
                    .map(|c| format!("e.{}", c))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            &[&id, &organization_id],
        )
        .await
        .context("failed to query owned execution")?;
    row.map(|r| execution_from_row(&r)).transpose()
}

/// Executions that have not reached a terminal state; re-dispatched on
/// startup so crashed workflows converge.
pub async fn list_unfinished_executions(pool: &Pool) -> Result<Vec<Execution>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let rows = client
        .query(
            &format!(
                r#"
                SELECT {EXECUTION_COLUMNS} FROM executions
                WHERE status IN ('PENDING', 'QUEUED', 'RUNNING')
                ORDER BY created_at
                "#
            ),
            &[],
        )
        .await
        .context("failed to list unfinished executions")?;
    rows.iter().map(execution_from_row).collect()
}

/// Optional fields applied alongside a status transition.
#[derive(Debug, Default, Clone)]
pub struct ExecutionUpdate {
    pub cluster_id: Option<Uuid>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub result: Option<Value>,
    pub resource_usage: Option<Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub attempt: Option<i32>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Compare-and-set status advancement. The row moves to `to` only when its
/// current status is one of `from` (and, when given, its attempt counter
/// matches), so a stale workflow replica can never clobber newer state.
/// Returns whether a row actually transitioned.
pub async fn update_execution_status(
    pool: &Pool,
    id: Uuid,
    from: &[ExecutionStatus],
    attempt_guard: Option<i32>,
    to: ExecutionStatus,
    update: &ExecutionUpdate,
) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;

    let to_str = to.as_str();
    let from_strs: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();

    let mut set_clauses = vec!["status = $1".to_string(), "updated_at = now()".to_string()];
    let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = vec![&to_str];
    let mut param_idx = 2;

    macro_rules! push_field {
        ($field:expr, $column:literal) => {
            if let Some(ref v) = $field {
                set_clauses.push(format!(concat!($column, " = ${}"), param_idx));
                params.push(v);
                param_idx += 1;
            }
        };
    }

    push_field!(update.cluster_id, "cluster_id");
    push_field!(update.queued_at, "queued_at");
    push_field!(update.started_at, "started_at");
    push_field!(update.completed_at, "completed_at");
    push_field!(update.duration_ms, "duration_ms");
    push_field!(update.result, "result");
    push_field!(update.resource_usage, "resource_usage");
    push_field!(update.error_code, "error_code");
    push_field!(update.error_message, "error_message");
    push_field!(update.attempt, "attempt");
    push_field!(update.next_retry_at, "next_retry_at");

    let mut query = format!(
        "UPDATE executions SET {} WHERE id = ${} AND status = ANY(${})",
        set_clauses.join(", "),
        param_idx,
        param_idx + 1,
    );
    params.push(&id);
    params.push(&from_strs);
    if let Some(ref attempt) = attempt_guard {
        query.push_str(&format!(" AND attempt = ${}", param_idx + 2));
        params.push(attempt);
    }

    let rows = client
        .execute(&query, &params)
        .await
        .context("failed to advance execution status")?;
    Ok(rows > 0)
}

// =============================================================================
// Audit
// =============================================================================

#[allow(clippy::too_many_arguments)]
pub async fn record_audit(
    pool: &Pool,
    organization_id: Uuid,
    actor: &str,
    action: &str,
    subject_id: Option<Uuid>,
    attributes: Option<&Value>,
    trace_id: &str,
    span_id: &str,
) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;
    client
        .execute(
            r#"
            INSERT INTO audit_log (organization_id, actor, action, subject_id, attributes,
                                   trace_id, span_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
            &[
                &organization_id,
                &actor,
                &action,
                &subject_id,
                &attributes,
                &trace_id,
                &span_id,
            ],
        )
        .await
        .context("failed to record audit entry")?;
    Ok(())
}

// =============================================================================
// Workflow journal and scheduled events
// =============================================================================

pub async fn get_step_result(
    pool: &Pool,
    workflow_id: &str,
    step_name: &str,
) -> Result<Option<Value>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let row = client
        .query_opt(
            r#"
            SELECT result FROM workflow_steps
            WHERE workflow_id = $1 AND step_name = $2
            "#,
            &[&workflow_id, &step_name],
        )
        .await
        .context("failed to query step result")?;
    Ok(row.map(|r| r.get("result")))
}

/// Journal a step result. If another replica of the same workflow journaled
/// first, their result wins and is returned.
pub async fn put_step_result(
    pool: &Pool,
    workflow_id: &str,
    step_name: &str,
    result: &Value,
) -> Result<Value> {
    let client = pool.get().await.context("failed to get db connection")?;
    let row = client
        .query_one(
            r#"
            INSERT INTO workflow_steps (workflow_id, step_name, result)
            VALUES ($1, $2, $3)
            ON CONFLICT (workflow_id, step_name) DO UPDATE
            SET result = workflow_steps.result
            RETURNING result
            "#,
            &[&workflow_id, &step_name, result],
        )
        .await
        .context("failed to journal step result")?;
    Ok(row.get("result"))
}

pub async fn schedule_event(
    pool: &Pool,
    subject: &str,
    payload: &Value,
    deliver_at: DateTime<Utc>,
) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;
    client
        .execute(
            r#"
            INSERT INTO scheduled_events (subject, payload, deliver_at)
            VALUES ($1, $2, $3)
            "#,
            &[&subject, &payload, &deliver_at],
        )
        .await
        .context("failed to schedule event")?;
    Ok(())
}

/// Claim every due event. The DELETE .. RETURNING makes the claim atomic:
/// with several schedulers polling, each event is delivered by exactly one.
pub async fn take_due_events(pool: &Pool) -> Result<Vec<(String, Value)>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let rows = client
        .query(
            r#"
            DELETE FROM scheduled_events
            WHERE deliver_at <= now()
            RETURNING subject, payload
            "#,
            &[],
        )
        .await
        .context("failed to claim due events")?;
    Ok(rows
        .iter()
        .map(|r| (r.get("subject"), r.get("payload")))
        .collect())
}
