//! Agent registration orchestration: validate a batch of configs, upsert
//! them content-addressed by config hash, fan a registration message out to
//! every eligible cluster, and fold the per-cluster provisioning reports
//! back into one aggregate agent status.

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use tessera_common::secrets;

use crate::app::App;
use crate::db::{self, UpsertOutcome};
use crate::models::{
    AgentConfig, AgentStatus, ExecutionPriority, QueueMessage, RegistrationItem,
    validate_agent_config,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationReceipt {
    pub request_id: Uuid,
    pub results: Vec<AgentRegistrationResult>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRegistrationResult {
    pub agent: String,
    pub outcome: &'static str,
    pub clusters_targeted: usize,
}

/// Process a batch of agent configurations for one organization.
///
/// An `unchanged` upsert (same config hash) emits nothing downstream: the
/// clusters already run exactly this config. Registration messages ride the
/// high-priority lane so a deep work backlog cannot starve provisioning.
pub async fn register_agents(
    app: &App,
    organization_id: Uuid,
    request_id: Uuid,
    configs: &[AgentConfig],
) -> Result<RegistrationReceipt> {
    let mut results = Vec::with_capacity(configs.len());

    for config in configs {
        validate_agent_config(config)?;

        let (agent, outcome) = db::upsert_agent(&app.pg, organization_id, config).await?;
        if matches!(outcome, UpsertOutcome::Unchanged) {
            tracing::debug!(agent = %agent.name, "config unchanged, skipping propagation");
            results.push(AgentRegistrationResult {
                agent: config.name.clone(),
                outcome: outcome.as_str(),
                clusters_targeted: 0,
            });
            continue;
        }

        let clusters = db::list_eligible_clusters(&app.pg, organization_id).await?;
        let item = RegistrationItem::from_agent(&agent);
        let mut targeted = 0usize;
        for cluster in &clusters {
            app.queue
                .enqueue(
                    organization_id,
                    cluster.id,
                    &QueueMessage::Registration(item.clone()),
                    ExecutionPriority::High,
                )
                .await?;
            db::upsert_agent_cluster_status(
                &app.pg,
                agent.id,
                cluster.id,
                AgentStatus::Pending,
                None,
            )
            .await?;
            targeted += 1;
        }
        db::recompute_agent_status(&app.pg, agent.id).await?;

        db::record_audit(
            &app.pg,
            organization_id,
            "registration-orchestrator",
            "agent.registered",
            Some(agent.id),
            Some(&json!({
                "requestId": request_id,
                "outcome": outcome.as_str(),
                "clustersTargeted": targeted,
            })),
            &secrets::generate_trace_id(),
            &secrets::generate_span_id(),
        )
        .await?;

        metrics::counter!("agents_registered_total", "outcome" => outcome.as_str()).increment(1);
        results.push(AgentRegistrationResult {
            agent: config.name.clone(),
            outcome: outcome.as_str(),
            clusters_targeted: targeted,
        });
    }

    Ok(RegistrationReceipt {
        request_id,
        results,
    })
}

/// Fold a relayer-reported provisioning status into the per-cluster row and
/// re-derive the aggregate agent status.
pub async fn handle_registration_status(
    app: &App,
    cluster_id: Uuid,
    agent_id: Uuid,
    status: AgentStatus,
    error: Option<&str>,
) -> Result<()> {
    db::upsert_agent_cluster_status(&app.pg, agent_id, cluster_id, status, error).await?;
    let aggregate = db::recompute_agent_status(&app.pg, agent_id).await?;
    tracing::info!(
        %agent_id,
        %cluster_id,
        cluster_status = status.as_str(),
        aggregate = aggregate.as_str(),
        "agent registration status updated"
    );
    metrics::counter!(
        "agent_registration_statuses_total",
        "status" => status.as_str()
    )
    .increment(1);
    Ok(())
}
