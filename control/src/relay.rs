//! Relayer-facing RPC service: unary cluster onboarding plus the long-lived
//! bidirectional stream that carries work out and status/telemetry back.
//!
//! Per accepted stream: register with the stream registry (which evicts any
//! stale owner fleet-wide), mark the cluster ACTIVE, spawn a producer that
//! drains the cluster's work queue into the outbound half, and process
//! inbound frames in arrival order on a single reader task. Heartbeat DB
//! touches are offloaded so a slow database cannot stall frame processing.

use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::Stream;
use serde_json::{Value, json};
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tonic::{Request, Response, Status, Streaming, metadata::MetadataMap};
use uuid::Uuid;

use tessera_common::secrets;

use crate::app::App;
use crate::auth;
use crate::db::{self, ExecutionUpdate};
use crate::models::{ApiKeyRecord, ExecutionStatus, QueueMessage};
use crate::orchestrator::{ExecutionCompleted, ExecutionFailed, codes};
use crate::proto::relay::{
    ControlFrame, ExecutionStatusUpdate, RegisterClusterRequest, RegisterClusterResponse,
    RelayerFrame, control_frame, relay_server::Relay, relayer_frame,
};
use crate::registration;
use crate::telemetry;
use crate::workflow::subjects;

/// How long the producer blocks on the queue before re-checking the
/// connection's cancellation token.
const DEQUEUE_POLL: Duration = Duration::from_secs(5);

/// Pushed to relayers in the RegisterCluster response.
const HEARTBEAT_INTERVAL_SECS: u64 = 30;

pub struct RelayService {
    app: App,
}

impl RelayService {
    pub fn new(app: App) -> Self {
        Self { app }
    }
}

fn metadata_value(metadata: &MetadataMap, key: &str) -> Option<String> {
    metadata
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
}

async fn authenticate(app: &App, metadata: &MetadataMap) -> Result<ApiKeyRecord, Status> {
    let key = metadata_value(metadata, "x-api-key")
        .ok_or_else(|| Status::unauthenticated("missing x-api-key metadata"))?;
    match auth::authenticate_api_key(&app.pg, &key).await {
        Ok(Some(record)) => Ok(record),
        Ok(None) => Err(Status::unauthenticated("unknown or revoked API key")),
        Err(e) => {
            tracing::error!(error = ?e, "auth backend unavailable");
            Err(Status::internal("authentication backend unavailable"))
        }
    }
}

fn internal(e: anyhow::Error) -> Status {
    tracing::error!(error = ?e, "relay RPC failed");
    Status::internal(e.to_string())
}

#[tonic::async_trait]
impl Relay for RelayService {
    async fn register_cluster(
        &self,
        request: Request<RegisterClusterRequest>,
    ) -> Result<Response<RegisterClusterResponse>, Status> {
        let caller = authenticate(&self.app, request.metadata()).await?;
        let req = request.into_inner();
        if req.cluster_name.is_empty() {
            return Err(Status::invalid_argument("cluster_name is required"));
        }

        let capabilities: Value =
            serde_json::from_str(&req.capabilities_json).unwrap_or_else(|_| json!({}));

        // The token is returned in plaintext exactly once; only its hash
        // survives.
        let token = secrets::generate_cluster_token();
        let secret_hash = secrets::hash_secret(&token).map_err(internal)?;

        let cluster = db::upsert_cluster(
            &self.app.pg,
            caller.organization_id,
            &req.cluster_name,
            &req.relayer_version,
            &capabilities,
            &secret_hash,
        )
        .await
        .map_err(internal)?;

        db::record_audit(
            &self.app.pg,
            caller.organization_id,
            "relay-service",
            "cluster.registered",
            Some(cluster.id),
            Some(&json!({"name": cluster.name, "relayerVersion": req.relayer_version})),
            &secrets::generate_trace_id(),
            &secrets::generate_span_id(),
        )
        .await
        .map_err(internal)?;

        tracing::info!(
            cluster_id = %cluster.id,
            name = %cluster.name,
            relayer_version = cluster.relayer_version.as_deref().unwrap_or("unknown"),
            "cluster registered"
        );
        metrics::counter!("clusters_registered_total").increment(1);

        let config = json!({
            "clusterId": cluster.id,
            "heartbeatIntervalSecs": HEARTBEAT_INTERVAL_SECS,
        });
        Ok(Response::new(RegisterClusterResponse {
            cluster_id: cluster.id.to_string(),
            config_json: config.to_string(),
            cluster_token: token,
        }))
    }

    type StreamStream = Pin<Box<dyn Stream<Item = Result<ControlFrame, Status>> + Send>>;

    async fn stream(
        &self,
        request: Request<Streaming<RelayerFrame>>,
    ) -> Result<Response<Self::StreamStream>, Status> {
        let caller = authenticate(&self.app, request.metadata()).await?;
        let cluster_id: Uuid = metadata_value(request.metadata(), "cluster-id")
            .ok_or_else(|| Status::unauthenticated("missing cluster-id metadata"))?
            .parse()
            .map_err(|_| Status::unauthenticated("malformed cluster-id metadata"))?;

        let cluster = db::get_cluster(&self.app.pg, cluster_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| Status::unauthenticated("unknown cluster"))?;
        if cluster.organization_id != caller.organization_id {
            return Err(Status::permission_denied(
                "cluster belongs to another organization",
            ));
        }

        let mut inbound = request.into_inner();
        let (outbound_rx, conn_cancel) = self
            .app
            .registry
            .register_stream(cluster_id)
            .await
            .map_err(internal)?;
        db::touch_cluster_heartbeat(&self.app.pg, cluster_id)
            .await
            .map_err(internal)?;
        tracing::info!(
            %cluster_id,
            organization_id = %caller.organization_id,
            "relayer stream established"
        );

        // Producer: queue -> stream. Exits when the registration is torn
        // down or an outbound write fails.
        let producer_app = self.app.clone();
        let producer_cancel = conn_cancel.clone();
        let organization_id = caller.organization_id;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = producer_cancel.cancelled() => return,
                    dequeued = producer_app.queue.dequeue(organization_id, cluster_id, DEQUEUE_POLL) => {
                        match dequeued {
                            Ok(None) => continue,
                            Ok(Some(message)) => {
                                let frame = control_frame_from_message(&message);
                                if let Err(e) = producer_app
                                    .registry
                                    .send_frame(cluster_id, frame)
                                    .await
                                {
                                    tracing::warn!(
                                        %cluster_id,
                                        error = ?e,
                                        "outbound write failed, stopping producer"
                                    );
                                    return;
                                }
                                metrics::counter!("stream_frames_sent_total").increment(1);
                            }
                            Err(e) => {
                                tracing::error!(%cluster_id, error = ?e, "dequeue failed");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                }
            }
        });

        // Reader: single task, frames processed in arrival order.
        let reader_app = self.app.clone();
        let reader_cancel = conn_cancel.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_cancel.cancelled() => return,
                    frame = inbound.message() => frame,
                };
                match frame {
                    Ok(Some(frame)) => {
                        if let Err(e) = handle_inbound(&reader_app, cluster_id, frame).await {
                            tracing::error!(%cluster_id, error = ?e, "failed to handle inbound frame");
                        }
                    }
                    Ok(None) => {
                        reader_app.registry.unregister(cluster_id, "end of stream").await;
                        return;
                    }
                    Err(status) => {
                        tracing::warn!(%cluster_id, %status, "inbound stream error");
                        reader_app.registry.unregister(cluster_id, "stream error").await;
                        return;
                    }
                }
            }
        });

        let output = ReceiverStream::new(outbound_rx).map(Ok);
        Ok(Response::new(Box::pin(output)))
    }
}

async fn handle_inbound(app: &App, cluster_id: Uuid, frame: RelayerFrame) -> Result<()> {
    // Any inbound frame proves the relayer is alive.
    app.registry.touch(cluster_id).await?;
    metrics::counter!("stream_frames_received_total").increment(1);

    let Some(frame) = frame.frame else {
        return Ok(());
    };
    match frame {
        relayer_frame::Frame::Heartbeat(_) => {
            // The DB touch is best-effort and must not block the reader.
            let pool = app.pg.clone();
            tokio::spawn(async move {
                if let Err(e) = db::touch_cluster_heartbeat(&pool, cluster_id).await {
                    tracing::warn!(%cluster_id, error = ?e, "heartbeat db touch failed");
                }
            });
        }
        relayer_frame::Frame::ExecutionStatus(update) => {
            handle_execution_status(app, update).await?;
        }
        relayer_frame::Frame::RegistrationStatus(update) => {
            let agent_id: Uuid = update
                .agent_id
                .parse()
                .context("malformed agent id in registration status")?;
            let status = update
                .status
                .parse()
                .context("malformed registration status")?;
            let error = (!update.error.is_empty()).then_some(update.error.as_str());
            registration::handle_registration_status(app, cluster_id, agent_id, status, error)
                .await?;
        }
        relayer_frame::Frame::LogBatch(batch) => telemetry::forward_logs(cluster_id, &batch),
        relayer_frame::Frame::MetricBatch(batch) => telemetry::forward_metrics(cluster_id, &batch),
        relayer_frame::Frame::TraceBatch(batch) => telemetry::forward_traces(cluster_id, &batch),
    }
    Ok(())
}

/// Route an execution status frame. Inbound updates are idempotent, keyed by
/// execution id: the orchestrator's CAS writes discard anything stale, so a
/// duplicate frame after a reconnect is harmless.
async fn handle_execution_status(app: &App, update: ExecutionStatusUpdate) -> Result<()> {
    let execution_id: Uuid = update
        .execution_id
        .parse()
        .context("malformed execution id in status frame")?;
    let status: ExecutionStatus = update
        .status
        .parse()
        .context("malformed execution status")?;

    match status {
        ExecutionStatus::Running => {
            db::update_execution_status(
                &app.pg,
                execution_id,
                &[ExecutionStatus::Queued],
                None,
                ExecutionStatus::Running,
                &ExecutionUpdate {
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        }
        ExecutionStatus::Completed => {
            let payload = ExecutionCompleted {
                execution_id,
                result: parse_json_field(&update.result_json),
                duration_ms: (update.duration_ms > 0).then_some(update.duration_ms),
                resource_usage: parse_json_field(&update.resource_usage_json),
            };
            app.engine
                .publish(
                    &subjects::execution_completed(execution_id),
                    &serde_json::to_value(&payload).context("failed to encode completion event")?,
                )
                .await?;
        }
        ExecutionStatus::Failed => {
            let payload = ExecutionFailed {
                execution_id,
                error_code: if update.error_code.is_empty() {
                    codes::EXECUTION_FAILED.to_string()
                } else {
                    update.error_code
                },
                error_message: if update.error_message.is_empty() {
                    "execution failed on cluster".to_string()
                } else {
                    update.error_message
                },
            };
            app.engine
                .publish(
                    &subjects::execution_failed(execution_id),
                    &serde_json::to_value(&payload).context("failed to encode failure event")?,
                )
                .await?;
        }
        other => {
            tracing::warn!(
                %execution_id,
                status = other.as_str(),
                "unexpected execution status from relayer"
            );
        }
    }
    Ok(())
}

fn parse_json_field(raw: &str) -> Option<Value> {
    if raw.is_empty() {
        return None;
    }
    serde_json::from_str(raw).ok()
}

/// Lower a queue message onto the wire.
fn control_frame_from_message(message: &QueueMessage) -> ControlFrame {
    use crate::proto::relay as pb;

    let frame = match message {
        QueueMessage::Work(item) => control_frame::Frame::WorkItem(pb::WorkItem {
            execution_id: item.execution_id.to_string(),
            agent_id: item.agent_id.to_string(),
            agent_name: item.agent_name.clone(),
            agent_image: item.agent_image.clone(),
            input_json: item.input.to_string(),
            resources_json: serde_json::to_string(&item.resources).unwrap_or_default(),
            retry_policy_json: serde_json::to_string(&item.retry_policy).unwrap_or_default(),
            use_agent_sandbox: item.use_agent_sandbox,
            network_policy: item.network_policy.as_str().to_string(),
            warm_pool_size: item.warm_pool_size,
            environment_variables_json: item
                .environment_variables
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default(),
        }),
        QueueMessage::Registration(item) => {
            control_frame::Frame::RegistrationItem(pb::RegistrationItem {
                agent_id: item.agent_id.to_string(),
                agent_name: item.agent_name.clone(),
                agent_image: item.agent_image.clone(),
                resources_json: serde_json::to_string(&item.resources).unwrap_or_default(),
                retry_policy_json: serde_json::to_string(&item.retry_policy).unwrap_or_default(),
                use_agent_sandbox: item.use_agent_sandbox,
                network_policy: item.network_policy.as_str().to_string(),
                warm_pool_size: item.warm_pool_size,
                environment_variables_json: item
                    .environment_variables
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
                config_hash: item.config_hash.clone(),
            })
        }
    };
    ControlFrame { frame: Some(frame) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NetworkPolicy, ResourceSpec, RetryPolicy, WorkItem};
    use serde_json::json;

    fn work_item() -> WorkItem {
        WorkItem {
            execution_id: Uuid::nil(),
            agent_id: Uuid::nil(),
            agent_name: "analyzer".into(),
            agent_image: "docker.io/acme/x:v1".into(),
            input: json!({"q": "hi"}),
            resources: ResourceSpec {
                cpu: "2".into(),
                memory: "4Gi".into(),
                gpu: None,
                timeout: "300s".into(),
            },
            retry_policy: RetryPolicy::default(),
            use_agent_sandbox: true,
            network_policy: NetworkPolicy::Restricted,
            warm_pool_size: 3,
            environment_variables: None,
        }
    }

    #[test]
    fn work_message_lowers_to_work_frame() {
        let frame = control_frame_from_message(&QueueMessage::Work(work_item()));
        match frame.frame {
            Some(control_frame::Frame::WorkItem(item)) => {
                assert_eq!(item.agent_name, "analyzer");
                assert_eq!(item.network_policy, "restricted");
                assert_eq!(item.warm_pool_size, 3);
                assert!(item.use_agent_sandbox);
                let input: Value = serde_json::from_str(&item.input_json).unwrap();
                assert_eq!(input["q"], "hi");
                assert!(item.environment_variables_json.is_empty());
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn json_fields_tolerate_absence_and_garbage() {
        assert_eq!(parse_json_field(""), None);
        assert_eq!(parse_json_field("not json"), None);
        assert_eq!(
            parse_json_field(r#"{"answer":"ok"}"#).unwrap()["answer"],
            "ok"
        );
    }
}
