use anyhow::{Context, Result};
use serde_json::json;
use uuid::Uuid;

use tessera_common::secrets;

use crate::args::{
    AgentsArgs, BootstrapArgs, DrainClusterArgs, ExecuteArgs, GetExecutionArgs, HealthArgs,
    PeekArgs, QueuesArgs, RegisterAgentArgs,
};
use crate::client::ControlClient;
use crate::db;
use crate::models::{AgentConfig, ResourceSpec, RetryPolicy, validate_agent_config};
use crate::queue::WorkQueue;
use crate::server::ExecuteRequest;

fn default_endpoint() -> String {
    "http://localhost:8080".to_string()
}

/// Create an organization with one API key. The plaintext key is printed
/// here and nowhere else; only its hash is stored.
pub async fn run_bootstrap(args: BootstrapArgs) -> Result<()> {
    let pool = tessera_common::postgres::create_pool(args.postgres).await;
    db::init_schema(&pool).await?;

    let organization_id = db::create_organization(&pool, &args.organization).await?;
    let key = secrets::generate_api_key();
    let key_hash = secrets::hash_secret(&key)?;
    let key_id = db::create_api_key(
        &pool,
        organization_id,
        &key_hash,
        secrets::key_prefix(&key),
        args.rate_limit,
    )
    .await?;

    println!("Organization: {} ({})", args.organization, organization_id);
    println!("API key id:   {}", key_id);
    println!("API key:      {}", key);
    println!("Store the key now; it cannot be recovered.");
    Ok(())
}

pub async fn run_register_agent(args: RegisterAgentArgs) -> Result<()> {
    let endpoint = args.endpoint.unwrap_or_else(default_endpoint);
    let client = ControlClient::new(&endpoint, &args.api_key);

    let config = AgentConfig {
        name: args.name,
        image: args.image,
        resources: ResourceSpec {
            cpu: args.cpu,
            memory: args.memory,
            gpu: args.gpu,
            timeout: args.timeout,
        },
        retry_policy: RetryPolicy {
            max_attempts: args.max_attempts,
            backoff: args.backoff.parse()?,
            initial_delay: args.initial_delay,
        },
        use_agent_sandbox: args.sandbox,
        warm_pool_size: args.warm_pool_size,
        network_policy: args.network_policy.parse()?,
        environment_variables: args.environment,
    };
    validate_agent_config(&config)?;

    let receipt = client.register_agent(&config).await?;
    println!("Accepted: {}", receipt.accepted);
    println!("Request:  {}", receipt.request_id);
    Ok(())
}

pub async fn run_agents(args: AgentsArgs) -> Result<()> {
    let endpoint = args.endpoint.unwrap_or_else(default_endpoint);
    let client = ControlClient::new(&endpoint, &args.api_key);

    let response = client.list_agents(args.name.as_deref()).await?;
    if response.agents.is_empty() {
        println!("No agents found.");
        return Ok(());
    }
    for agent in response.agents {
        println!(
            "{}  {}  {}  {}",
            agent.id, agent.name, agent.status, agent.image
        );
    }
    Ok(())
}

pub async fn run_execute(args: ExecuteArgs) -> Result<()> {
    let endpoint = args.endpoint.unwrap_or_else(default_endpoint);
    let client = ControlClient::new(&endpoint, &args.api_key);

    let priority = args
        .priority
        .as_deref()
        .map(str::parse)
        .transpose()
        .context("invalid priority")?;
    let cluster = args
        .cluster
        .as_deref()
        .map(str::parse)
        .transpose()
        .context("invalid cluster id")?;

    let response = client
        .execute(&ExecuteRequest {
            agent: args.agent,
            input: args.input.unwrap_or_else(|| json!({})),
            priority,
            cluster,
        })
        .await?;

    println!("Execution: {}", response.execution_id);
    println!("Status:    {}", response.status);
    Ok(())
}

pub async fn run_get_execution(args: GetExecutionArgs) -> Result<()> {
    let endpoint = args.endpoint.unwrap_or_else(default_endpoint);
    let client = ControlClient::new(&endpoint, &args.api_key);

    let id: Uuid = args.id.parse().context("invalid execution id")?;
    let execution = client.get_execution(id).await?;

    println!("Execution: {}", execution.execution_id);
    println!("Status:    {}", execution.status);
    println!("Priority:  {}", execution.priority);
    println!("Attempt:   {}", execution.attempt);
    if let Some(cluster_id) = execution.cluster_id {
        println!("Cluster:   {}", cluster_id);
    }
    if let Some(duration_ms) = execution.duration_ms {
        println!("Duration:  {}ms", duration_ms);
    }
    if let Some(result) = execution.result {
        println!(
            "Result:    {}",
            serde_json::to_string_pretty(&result).unwrap_or_default()
        );
    }
    if let Some(error) = execution.error {
        println!("Error:     [{}] {}", error.code, error.message);
    }
    Ok(())
}

pub async fn run_queues(args: QueuesArgs) -> Result<()> {
    let redis = tessera_common::redis::init_redis(&args.redis).await;
    let queue = WorkQueue::new(redis);

    let stats = queue.global_stats().await?;
    if stats.is_empty() {
        println!("No work queues found.");
        return Ok(());
    }
    for stat in stats {
        println!("{:>6}  {}", stat.length, stat.key);
    }
    Ok(())
}

pub async fn run_peek(args: PeekArgs) -> Result<()> {
    let organization: Uuid = args.organization.parse().context("invalid organization id")?;
    let cluster: Uuid = args.cluster.parse().context("invalid cluster id")?;

    let redis = tessera_common::redis::init_redis(&args.redis).await;
    let queue = WorkQueue::new(redis);

    match queue.peek(organization, cluster).await? {
        None => println!("Queue is empty."),
        Some(message) => println!("{}", serde_json::to_string_pretty(&message)?),
    }
    Ok(())
}

pub async fn run_drain_cluster(args: DrainClusterArgs) -> Result<()> {
    let organization: Uuid = args.organization.parse().context("invalid organization id")?;
    let cluster: Uuid = args.cluster.parse().context("invalid cluster id")?;

    let redis = tessera_common::redis::init_redis(&args.redis).await;
    let queue = WorkQueue::new(redis);

    let drained = queue.drain_cluster(organization, cluster).await?;
    println!("Drained {} message(s).", drained.len());
    Ok(())
}

pub async fn run_health(args: HealthArgs) -> Result<()> {
    let endpoint = args.endpoint.unwrap_or_else(default_endpoint);
    let client = ControlClient::new(&endpoint, "");
    client.health().await?;
    println!("OK");
    Ok(())
}
