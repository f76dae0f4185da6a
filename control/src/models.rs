//! Domain model for the control plane: tenants own clusters, agents, and
//! executions; the transient queue/stream payloads live here too.
//!
//! Status enums are stored as TEXT and serialized in their wire spelling, so
//! `as_str`/`parse` are the single source of truth for both.

use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use tessera_common::canonical;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Queued => "QUEUED",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

impl FromStr for ExecutionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(ExecutionStatus::Pending),
            "QUEUED" => Ok(ExecutionStatus::Queued),
            "RUNNING" => Ok(ExecutionStatus::Running),
            "COMPLETED" => Ok(ExecutionStatus::Completed),
            "FAILED" => Ok(ExecutionStatus::Failed),
            _ => bail!("unknown execution status: {}", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionPriority {
    High,
    Normal,
    Low,
}

impl ExecutionPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionPriority::High => "HIGH",
            ExecutionPriority::Normal => "NORMAL",
            ExecutionPriority::Low => "LOW",
        }
    }
}

impl FromStr for ExecutionPriority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "HIGH" => Ok(ExecutionPriority::High),
            "NORMAL" => Ok(ExecutionPriority::Normal),
            "LOW" => Ok(ExecutionPriority::Low),
            _ => bail!("unknown priority: {}", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    Pending,
    Active,
    Failed,
}

impl FromStr for ClusterStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(ClusterStatus::Pending),
            "ACTIVE" => Ok(ClusterStatus::Active),
            "FAILED" => Ok(ClusterStatus::Failed),
            _ => bail!("unknown cluster status: {}", s),
        }
    }
}

/// Agent provisioning state, both the per-cluster rows and the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Pending,
    Active,
    Failed,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Pending => "PENDING",
            AgentStatus::Active => "ACTIVE",
            AgentStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for AgentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(AgentStatus::Pending),
            "ACTIVE" => Ok(AgentStatus::Active),
            "FAILED" => Ok(AgentStatus::Failed),
            _ => bail!("unknown agent status: {}", s),
        }
    }
}

/// FAILED anywhere beats PENDING anywhere beats ACTIVE everywhere.
pub fn aggregate_agent_status(per_cluster: &[AgentStatus]) -> AgentStatus {
    if per_cluster.iter().any(|s| *s == AgentStatus::Failed) {
        AgentStatus::Failed
    } else if per_cluster.iter().any(|s| *s == AgentStatus::Pending) {
        AgentStatus::Pending
    } else {
        AgentStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Exponential,
    Linear,
    Constant,
}

impl FromStr for BackoffKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "exponential" => Ok(BackoffKind::Exponential),
            "linear" => Ok(BackoffKind::Linear),
            "constant" => Ok(BackoffKind::Constant),
            _ => bail!("unknown backoff kind: {}", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPolicy {
    Restricted,
    Standard,
    Unrestricted,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        NetworkPolicy::Standard
    }
}

impl NetworkPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkPolicy::Restricted => "restricted",
            NetworkPolicy::Standard => "standard",
            NetworkPolicy::Unrestricted => "unrestricted",
        }
    }
}

impl FromStr for NetworkPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "restricted" => Ok(NetworkPolicy::Restricted),
            "standard" => Ok(NetworkPolicy::Standard),
            "unrestricted" => Ok(NetworkPolicy::Unrestricted),
            _ => bail!("unknown network policy: {}", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    pub cpu: String,
    pub memory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
    pub timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub backoff: BackoffKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay: Option<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Exponential,
            initial_delay: None,
        }
    }
}

/// A declarative agent definition as submitted by callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub name: String,
    pub image: String,
    pub resources: ResourceSpec,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub use_agent_sandbox: bool,
    #[serde(default)]
    pub warm_pool_size: i32,
    #[serde(default)]
    pub network_policy: NetworkPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_variables: Option<Value>,
}

impl AgentConfig {
    /// Content hash over the behaviorally-significant fields only.
    /// Environment variables are deliberately excluded: changing them does
    /// not require re-provisioning the workload on the edge.
    pub fn config_hash(&self) -> String {
        let significant = serde_json::json!({
            "name": self.name,
            "image": self.image,
            "resources": self.resources,
            "retryPolicy": self.retry_policy,
            "useAgentSandbox": self.use_agent_sandbox,
            "warmPoolSize": self.warm_pool_size,
            "networkPolicy": self.network_policy,
        });
        canonical::hash_canonical(&significant)
    }
}

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z0-9-]+$").unwrap());
static IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9.\-]+(:[0-9]+)?(/[a-zA-Z0-9._\-]+)+:[a-zA-Z0-9._\-]+$").unwrap());
static CPU_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+m?$").unwrap());
static MEMORY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+(Mi|Gi)$").unwrap());
static GPU_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+$").unwrap());
static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+(s|m|h)$").unwrap());

/// Validate an agent configuration against the shared API constraints.
/// The same checks guard the public register endpoint and the registration
/// orchestrator, so a bad config can never reach a cluster.
pub fn validate_agent_config(config: &AgentConfig) -> Result<()> {
    if config.name.is_empty() || config.name.len() > 100 || !NAME_RE.is_match(&config.name) {
        bail!(
            "invalid agent name {:?}: must match ^[a-z0-9-]+$ and be at most 100 characters",
            config.name
        );
    }
    if !IMAGE_RE.is_match(&config.image) {
        bail!(
            "invalid image {:?}: expected <host>/<name>:<tag>",
            config.image
        );
    }
    if !CPU_RE.is_match(&config.resources.cpu) {
        bail!("invalid cpu request {:?}", config.resources.cpu);
    }
    if !MEMORY_RE.is_match(&config.resources.memory) {
        bail!("invalid memory request {:?}", config.resources.memory);
    }
    if let Some(ref gpu) = config.resources.gpu
        && !GPU_RE.is_match(gpu)
    {
        bail!("invalid gpu request {:?}", gpu);
    }
    if !DURATION_RE.is_match(&config.resources.timeout) {
        bail!(
            "invalid timeout {:?}: expected <n>(s|m|h)",
            config.resources.timeout
        );
    }
    if !(1..=10).contains(&config.retry_policy.max_attempts) {
        bail!(
            "maxAttempts must be between 1 and 10, got {}",
            config.retry_policy.max_attempts
        );
    }
    if let Some(ref delay) = config.retry_policy.initial_delay
        && !DURATION_RE.is_match(delay)
    {
        bail!("invalid initialDelay {:?}: expected <n>(s|m|h)", delay);
    }
    if !(0..=100).contains(&config.warm_pool_size) {
        bail!(
            "warmPoolSize must be between 0 and 100, got {}",
            config.warm_pool_size
        );
    }
    Ok(())
}

/// Parse a `<n>(s|m|h)` duration string.
pub fn parse_duration(s: &str) -> Result<Duration> {
    if !DURATION_RE.is_match(s) {
        bail!("invalid duration {:?}: expected <n>(s|m|h)", s);
    }
    let (digits, unit) = s.split_at(s.len() - 1);
    let n: u64 = digits.parse()?;
    let secs = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        _ => unreachable!("regex admits only s/m/h"),
    };
    Ok(Duration::from_secs(secs))
}

#[derive(Debug, Clone)]
pub struct Agent {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub image: String,
    pub resources: ResourceSpec,
    pub retry_policy: RetryPolicy,
    pub use_agent_sandbox: bool,
    pub warm_pool_size: i32,
    pub network_policy: NetworkPolicy,
    pub environment_variables: Option<Value>,
    pub config_hash: String,
    pub status: AgentStatus,
    pub registration_report: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Cluster {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub status: ClusterStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub relayer_version: Option<String>,
    pub capabilities: Value,
}

/// Capabilities reported by the relayer at registration, as far as the
/// control plane cares about them. Unknown keys pass through untouched in
/// the stored JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCapabilities {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub gpu_nodes: i64,
    #[serde(default)]
    pub sandbox: bool,
}

impl ClusterCapabilities {
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentClusterStatus {
    pub agent_id: Uuid,
    pub cluster_id: Uuid,
    pub status: AgentStatus,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Execution {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub cluster_id: Option<Uuid>,
    pub status: ExecutionStatus,
    pub input: Value,
    pub priority: ExecutionPriority,
    pub attempt: i32,
    pub max_attempts: i32,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub result: Option<Value>,
    pub resource_usage: Option<Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Candidate row for API-key authentication; selected by prefix, confirmed
/// by hash verification.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub key_hash: String,
    pub key_prefix: String,
    pub rate_limit: i64,
}

/// One enqueued unit describing an execution. Created on enqueue, destroyed
/// on a successful stream write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub execution_id: Uuid,
    pub agent_id: Uuid,
    pub agent_name: String,
    pub agent_image: String,
    pub input: Value,
    pub resources: ResourceSpec,
    pub retry_policy: RetryPolicy,
    pub use_agent_sandbox: bool,
    pub network_policy: NetworkPolicy,
    pub warm_pool_size: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_variables: Option<Value>,
}

/// Enough to materialize the workload on the edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationItem {
    pub agent_id: Uuid,
    pub agent_name: String,
    pub agent_image: String,
    pub resources: ResourceSpec,
    pub retry_policy: RetryPolicy,
    pub use_agent_sandbox: bool,
    pub network_policy: NetworkPolicy,
    pub warm_pool_size: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_variables: Option<Value>,
    pub config_hash: String,
}

impl RegistrationItem {
    pub fn from_agent(agent: &Agent) -> Self {
        Self {
            agent_id: agent.id,
            agent_name: agent.name.clone(),
            agent_image: agent.image.clone(),
            resources: agent.resources.clone(),
            retry_policy: agent.retry_policy.clone(),
            use_agent_sandbox: agent.use_agent_sandbox,
            network_policy: agent.network_policy,
            warm_pool_size: agent.warm_pool_size,
            environment_variables: agent.environment_variables.clone(),
            config_hash: agent.config_hash.clone(),
        }
    }
}

/// Tagged union carried by the work queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum QueueMessage {
    #[serde(rename = "WORK")]
    Work(WorkItem),
    #[serde(rename = "REGISTRATION")]
    Registration(RegistrationItem),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_config() -> AgentConfig {
        AgentConfig {
            name: "analyzer".into(),
            image: "docker.io/acme/x:v1".into(),
            resources: ResourceSpec {
                cpu: "2".into(),
                memory: "4Gi".into(),
                gpu: None,
                timeout: "300s".into(),
            },
            retry_policy: RetryPolicy {
                max_attempts: 3,
                backoff: BackoffKind::Exponential,
                initial_delay: Some("1s".into()),
            },
            use_agent_sandbox: false,
            warm_pool_size: 0,
            network_policy: NetworkPolicy::Standard,
            environment_variables: None,
        }
    }

    #[test]
    fn valid_config_passes() {
        validate_agent_config(&sample_config()).unwrap();
    }

    #[test]
    fn rejects_bad_names() {
        for name in ["", "Has-Caps", "spa ce", "under_score", &"x".repeat(101)] {
            let mut config = sample_config();
            config.name = name.to_string();
            assert!(
                validate_agent_config(&config).is_err(),
                "name {:?} should be rejected",
                name
            );
        }
    }

    #[test]
    fn rejects_bad_images() {
        for image in ["justaname", "no-tag/repo", "host/:v1", ""] {
            let mut config = sample_config();
            config.image = image.to_string();
            assert!(
                validate_agent_config(&config).is_err(),
                "image {:?} should be rejected",
                image
            );
        }
        let mut config = sample_config();
        config.image = "registry.example.com:5000/team/agent:2.0".into();
        validate_agent_config(&config).unwrap();
    }

    #[test]
    fn rejects_bad_resources() {
        let mut config = sample_config();
        config.resources.cpu = "two".into();
        assert!(validate_agent_config(&config).is_err());

        let mut config = sample_config();
        config.resources.memory = "4GB".into();
        assert!(validate_agent_config(&config).is_err());

        let mut config = sample_config();
        config.resources.gpu = Some("one".into());
        assert!(validate_agent_config(&config).is_err());

        let mut config = sample_config();
        config.resources.timeout = "300".into();
        assert!(validate_agent_config(&config).is_err());

        let mut config = sample_config();
        config.resources.cpu = "500m".into();
        config.resources.gpu = Some("1".into());
        validate_agent_config(&config).unwrap();
    }

    #[test]
    fn rejects_retry_and_pool_bounds() {
        let mut config = sample_config();
        config.retry_policy.max_attempts = 0;
        assert!(validate_agent_config(&config).is_err());

        let mut config = sample_config();
        config.retry_policy.max_attempts = 11;
        assert!(validate_agent_config(&config).is_err());

        let mut config = sample_config();
        config.warm_pool_size = 101;
        assert!(validate_agent_config(&config).is_err());

        let mut config = sample_config();
        config.warm_pool_size = -1;
        assert!(validate_agent_config(&config).is_err());
    }

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("300s").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("300").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn config_hash_ignores_environment_variables() {
        let mut a = sample_config();
        let mut b = sample_config();
        a.environment_variables = Some(json!({"A": "1"}));
        b.environment_variables = Some(json!({"A": "2"}));
        assert_eq!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn config_hash_tracks_significant_fields() {
        let a = sample_config();
        let mut b = sample_config();
        b.image = "docker.io/acme/x:v2".into();
        assert_ne!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn queue_message_round_trips_with_tag() {
        let msg = QueueMessage::Work(WorkItem {
            execution_id: Uuid::nil(),
            agent_id: Uuid::nil(),
            agent_name: "analyzer".into(),
            agent_image: "docker.io/acme/x:v1".into(),
            input: json!({"q": "hi"}),
            resources: sample_config().resources,
            retry_policy: RetryPolicy::default(),
            use_agent_sandbox: false,
            network_policy: NetworkPolicy::Standard,
            warm_pool_size: 0,
            environment_variables: None,
        });
        let raw = serde_json::to_string(&msg).unwrap();
        assert!(raw.contains(r#""type":"WORK""#));
        match serde_json::from_str::<QueueMessage>(&raw).unwrap() {
            QueueMessage::Work(item) => assert_eq!(item.agent_name, "analyzer"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn aggregation_rule() {
        use AgentStatus::*;
        assert_eq!(aggregate_agent_status(&[Active, Active]), Active);
        assert_eq!(aggregate_agent_status(&[Active, Pending]), Pending);
        assert_eq!(aggregate_agent_status(&[Pending, Failed]), Failed);
        assert_eq!(aggregate_agent_status(&[Active, Failed, Pending]), Failed);
    }

    #[test]
    fn status_spellings_round_trip() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Queued,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ExecutionStatus>().unwrap(), status);
        }
        assert!("BOGUS".parse::<ExecutionStatus>().is_err());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }
}
