use clap::{Parser, Subcommand};
use tessera_common::args::{NatsArgs, PostgresArgs, RateLimiterArgs, RedisArgs};

#[derive(Parser, Debug)]
#[command(name = "tessera-control")]
#[command(about = "Control plane for the agent execution platform")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the control plane server
    Server(ServerArgs),

    /// Create an organization and API key (prints the key exactly once)
    Bootstrap(BootstrapArgs),

    /// Register an agent definition
    RegisterAgent(RegisterAgentArgs),

    /// List agents
    Agents(AgentsArgs),

    /// Submit an execution
    Execute(ExecuteArgs),

    /// Fetch an execution's status
    GetExecution(GetExecutionArgs),

    /// Show per-cluster work queue depths
    Queues(QueuesArgs),

    /// Show the next message a cluster's consumer would receive
    Peek(PeekArgs),

    /// Drain a cluster's work queue (used when removing a cluster)
    DrainCluster(DrainClusterArgs),

    /// Check service health
    Health(HealthArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ServerArgs {
    /// Public HTTP port
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// Relayer-facing gRPC port
    #[arg(long, env = "GRPC_PORT", default_value_t = 50051)]
    pub grpc_port: u16,

    /// Max concurrent execution workflows per organization
    #[arg(long, env = "MAX_CONCURRENT_PER_ORG", default_value_t = 100)]
    pub max_concurrent_per_org: usize,

    #[clap(flatten)]
    pub postgres: PostgresArgs,

    #[clap(flatten)]
    pub redis: RedisArgs,

    #[clap(flatten)]
    pub nats: NatsArgs,

    #[clap(flatten)]
    pub rate_limiter: RateLimiterArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct BootstrapArgs {
    /// Organization name
    #[arg(long)]
    pub organization: String,

    /// Long-window request quota for the new key
    #[arg(long, default_value_t = 250)]
    pub rate_limit: i64,

    #[clap(flatten)]
    pub postgres: PostgresArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct RegisterAgentArgs {
    /// Control plane endpoint
    #[arg(long, env = "TESSERA_ENDPOINT")]
    pub endpoint: Option<String>,

    /// API key (sk_...)
    #[arg(long, env = "TESSERA_API_KEY")]
    pub api_key: String,

    /// Agent name
    #[arg(long)]
    pub name: String,

    /// Container image (<host>/<name>:<tag>)
    #[arg(long)]
    pub image: String,

    /// CPU request (e.g. 2 or 500m)
    #[arg(long, default_value = "1")]
    pub cpu: String,

    /// Memory request (e.g. 512Mi or 4Gi)
    #[arg(long, default_value = "512Mi")]
    pub memory: String,

    /// GPU count
    #[arg(long)]
    pub gpu: Option<String>,

    /// Execution timeout (e.g. 300s, 5m, 1h)
    #[arg(long, default_value = "300s")]
    pub timeout: String,

    /// Max execution attempts (1-10)
    #[arg(long, default_value_t = 3)]
    pub max_attempts: i32,

    /// Retry backoff kind (exponential, linear, constant)
    #[arg(long, default_value = "exponential")]
    pub backoff: String,

    /// Initial retry delay (e.g. 1s)
    #[arg(long)]
    pub initial_delay: Option<String>,

    /// Run the agent inside the sandbox runtime
    #[arg(long, default_value_t = false)]
    pub sandbox: bool,

    /// Warm pool size (0-100)
    #[arg(long, default_value_t = 0)]
    pub warm_pool_size: i32,

    /// Network policy (restricted, standard, unrestricted)
    #[arg(long, default_value = "standard")]
    pub network_policy: String,

    /// Environment variables as a JSON object
    #[arg(long)]
    pub environment: Option<serde_json::Value>,
}

#[derive(Parser, Debug, Clone)]
pub struct AgentsArgs {
    /// Control plane endpoint
    #[arg(long, env = "TESSERA_ENDPOINT")]
    pub endpoint: Option<String>,

    /// API key (sk_...)
    #[arg(long, env = "TESSERA_API_KEY")]
    pub api_key: String,

    /// Filter by agent name
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct ExecuteArgs {
    /// Control plane endpoint
    #[arg(long, env = "TESSERA_ENDPOINT")]
    pub endpoint: Option<String>,

    /// API key (sk_...)
    #[arg(long, env = "TESSERA_API_KEY")]
    pub api_key: String,

    /// Agent name or id
    #[arg(long)]
    pub agent: String,

    /// Input as a JSON value
    #[arg(long)]
    pub input: Option<serde_json::Value>,

    /// Priority (HIGH, NORMAL, LOW)
    #[arg(long)]
    pub priority: Option<String>,

    /// Preferred cluster id
    #[arg(long)]
    pub cluster: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct GetExecutionArgs {
    /// Control plane endpoint
    #[arg(long, env = "TESSERA_ENDPOINT")]
    pub endpoint: Option<String>,

    /// API key (sk_...)
    #[arg(long, env = "TESSERA_API_KEY")]
    pub api_key: String,

    /// Execution id
    #[arg(long)]
    pub id: String,
}

#[derive(Parser, Debug, Clone)]
pub struct QueuesArgs {
    #[clap(flatten)]
    pub redis: RedisArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct PeekArgs {
    /// Organization id
    #[arg(long)]
    pub organization: String,

    /// Cluster id
    #[arg(long)]
    pub cluster: String,

    #[clap(flatten)]
    pub redis: RedisArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct DrainClusterArgs {
    /// Organization id
    #[arg(long)]
    pub organization: String,

    /// Cluster id
    #[arg(long)]
    pub cluster: String,

    #[clap(flatten)]
    pub redis: RedisArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct HealthArgs {
    /// Control plane endpoint
    #[arg(long, env = "TESSERA_ENDPOINT")]
    pub endpoint: Option<String>,
}
