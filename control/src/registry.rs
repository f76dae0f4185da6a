//! Per-cluster stream ownership, local and fleet-wide.
//!
//! Each pod owns the streams it accepted, behind a mutex-guarded map. Two
//! facts have to stay true across the whole fleet: at most one pod believes
//! it owns a cluster's stream, and anyone can learn whether *some* pod owns
//! it. The first is enforced by broadcasting UNREGISTER_STREAM on the shared
//! signal topic before taking ownership, so a stale owner releases within
//! one pub/sub hop. The second is a Redis liveness key with a 60 second TTL,
//! refreshed by heartbeats.
//!
//! A 120 second reaper runs per stream; every inbound frame re-arms it.
//! Reaper expiry, end-of-stream, a write error, or a received
//! UNREGISTER_STREAM all tear the stream down. Queue contents are untouched
//! by any of this.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tessera_common::{SIGNAL_TOPIC, args::RedisArgs, response::print_warning};

use crate::proto::relay::{ConfigUpdate, ControlFrame, control_frame};

pub const LIVENESS_TTL_SECS: u64 = 60;
pub const REAPER_WINDOW: Duration = Duration::from_secs(120);

/// Outbound capacity per stream; beyond this the producer blocks, which in
/// turn leaves work parked in the queue.
const OUTBOUND_BUFFER: usize = 128;

pub fn liveness_key(cluster_id: Uuid) -> String {
    format!("cluster:{}:alive", cluster_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    UnregisterStream,
    ConfigUpdate,
}

/// Envelope on the `control-plane:signals` topic. `sender` lets a pod skip
/// its own broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub cluster_id: Uuid,
    pub sender: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

struct ClusterConn {
    outbound: mpsc::Sender<ControlFrame>,
    deadline: watch::Sender<Instant>,
    cancel: CancellationToken,
}

pub struct StreamRegistryInner {
    node_id: Uuid,
    redis: deadpool_redis::Pool,
    redis_args: RedisArgs,
    conns: Mutex<HashMap<Uuid, ClusterConn>>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct StreamRegistry {
    inner: Arc<StreamRegistryInner>,
}

impl Deref for StreamRegistry {
    type Target = StreamRegistryInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl StreamRegistry {
    pub fn new(
        node_id: Uuid,
        redis: deadpool_redis::Pool,
        redis_args: RedisArgs,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(StreamRegistryInner {
                node_id,
                redis,
                redis_args,
                conns: Mutex::new(HashMap::new()),
                cancel,
            }),
        }
    }

    /// Take ownership of a cluster's stream. Returns the sender the stream
    /// loop writes outbound frames into, plus a token that fires when this
    /// registration is torn down (by the reaper, a takeover, or shutdown).
    pub async fn register_stream(
        &self,
        cluster_id: Uuid,
    ) -> Result<(mpsc::Receiver<ControlFrame>, CancellationToken)> {
        // Evict any stale owner fleet-wide before claiming the stream.
        self.broadcast(SignalKind::UnregisterStream, cluster_id, None)
            .await?;

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let conn_cancel = self.cancel.child_token();
        let (deadline_tx, deadline_rx) = watch::channel(Instant::now() + REAPER_WINDOW);

        let replaced = {
            let mut conns = self.conns.lock().await;
            let old = conns.insert(
                cluster_id,
                ClusterConn {
                    outbound: outbound_tx,
                    deadline: deadline_tx,
                    cancel: conn_cancel.clone(),
                },
            );
            if let Some(ref old) = old {
                old.cancel.cancel();
            }
            old.is_some()
        };

        self.refresh_liveness(cluster_id).await?;
        if !replaced {
            metrics::gauge!("stream_registry_connected").increment(1.0);
        }

        let registry = self.clone();
        let reaper_cancel = conn_cancel.clone();
        tokio::spawn(async move {
            registry
                .run_reaper(cluster_id, deadline_rx, reaper_cancel)
                .await;
        });

        Ok((outbound_rx, conn_cancel))
    }

    /// Re-arm the reaper and refresh the fleet-wide liveness TTL. Called for
    /// every inbound frame.
    pub async fn touch(&self, cluster_id: Uuid) -> Result<()> {
        {
            let conns = self.conns.lock().await;
            if let Some(conn) = conns.get(&cluster_id) {
                conn.deadline.send_replace(Instant::now() + REAPER_WINDOW);
            }
        }
        self.refresh_liveness(cluster_id).await
    }

    async fn refresh_liveness(&self, cluster_id: Uuid) -> Result<()> {
        let mut conn = self
            .redis
            .get()
            .await
            .context("Failed to get Redis connection")?;
        let _: () = redis::cmd("SET")
            .arg(liveness_key(cluster_id))
            .arg("true")
            .arg("EX")
            .arg(LIVENESS_TTL_SECS)
            .query_async(&mut conn)
            .await
            .context("Failed to refresh liveness key")?;
        Ok(())
    }

    /// Tear down our registration and delete the fleet-wide liveness key.
    pub async fn unregister(&self, cluster_id: Uuid, reason: &str) {
        let removed = self.drop_local(cluster_id).await;
        if removed {
            tracing::info!(%cluster_id, reason, "stream unregistered");
        }
        match self.redis.get().await {
            Ok(mut conn) => {
                let deleted: Result<i64, _> = conn.del(liveness_key(cluster_id)).await;
                if let Err(e) = deleted {
                    print_warning(anyhow::anyhow!("failed to delete liveness key: {}", e));
                }
            }
            Err(e) => print_warning(anyhow::anyhow!("failed to get Redis connection: {}", e)),
        }
    }

    /// Remove the local entry only. Used when *another* pod took the stream
    /// over: the new owner already holds the liveness key, so deleting it
    /// here would erase their claim.
    async fn drop_local(&self, cluster_id: Uuid) -> bool {
        let mut conns = self.conns.lock().await;
        if let Some(conn) = conns.remove(&cluster_id) {
            conn.cancel.cancel();
            metrics::gauge!("stream_registry_connected").decrement(1.0);
            true
        } else {
            false
        }
    }

    pub async fn is_locally_connected(&self, cluster_id: Uuid) -> bool {
        self.conns.lock().await.contains_key(&cluster_id)
    }

    /// Whether any pod in the fleet currently owns a stream for the cluster.
    pub async fn is_alive_anywhere(&self, cluster_id: Uuid) -> Result<bool> {
        let mut conn = self
            .redis
            .get()
            .await
            .context("Failed to get Redis connection")?;
        conn.exists(liveness_key(cluster_id))
            .await
            .context("Failed to check liveness key")
    }

    /// Write a frame to a locally-owned stream. Errors when we do not own
    /// the stream, or tears the registration down when the channel is dead.
    pub async fn send_frame(&self, cluster_id: Uuid, frame: ControlFrame) -> Result<()> {
        let outbound = {
            let conns = self.conns.lock().await;
            conns.get(&cluster_id).map(|c| c.outbound.clone())
        };
        let Some(outbound) = outbound else {
            anyhow::bail!("no local stream for cluster {}", cluster_id);
        };
        if outbound.send(frame).await.is_err() {
            self.unregister(cluster_id, "outbound channel closed").await;
            anyhow::bail!("stream for cluster {} went away during write", cluster_id);
        }
        Ok(())
    }

    /// Push a config payload to a cluster. Writes directly when we own the
    /// stream; otherwise publishes CONFIG_UPDATE for the owning pod to
    /// forward. Best-effort either way; acks live inside the stream
    /// protocol, not here.
    pub async fn send_config(&self, cluster_id: Uuid, payload: &Value) -> Result<()> {
        if self.is_locally_connected(cluster_id).await {
            self.send_frame(cluster_id, config_frame(payload)).await
        } else {
            self.broadcast(SignalKind::ConfigUpdate, cluster_id, Some(payload.clone()))
                .await
        }
    }

    async fn broadcast(
        &self,
        kind: SignalKind,
        cluster_id: Uuid,
        payload: Option<Value>,
    ) -> Result<()> {
        let envelope = SignalEnvelope {
            kind,
            cluster_id,
            sender: self.node_id,
            payload,
        };
        let raw = serde_json::to_vec(&envelope).context("failed to encode signal envelope")?;
        tessera_common::redis::publish(&self.redis, SIGNAL_TOPIC, &raw).await
    }

    /// Consume the shared signal topic until shutdown. One instance per pod.
    pub async fn run_signal_listener(&self) -> Result<()> {
        let (tx, mut rx) = broadcast::channel(64);
        let listener_cancel = self.cancel.child_token();
        let redis_args = self.redis_args.clone();
        tokio::spawn(async move {
            let _ = tessera_common::redis::listen_for_signals(
                listener_cancel,
                redis_args,
                tx,
                SIGNAL_TOPIC,
            )
            .await;
        });

        loop {
            let raw = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                raw = rx.recv() => match raw {
                    Ok(raw) => raw,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "signal listener lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
            };
            let envelope: SignalEnvelope = match serde_json::from_slice(&raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    print_warning(anyhow::anyhow!("undecodable signal envelope: {}", e));
                    continue;
                }
            };
            if envelope.sender == self.node_id {
                continue;
            }
            match envelope.kind {
                SignalKind::UnregisterStream => {
                    if self.drop_local(envelope.cluster_id).await {
                        tracing::info!(
                            cluster_id = %envelope.cluster_id,
                            "released stream after takeover on another pod"
                        );
                    }
                }
                SignalKind::ConfigUpdate => {
                    let Some(payload) = envelope.payload else {
                        continue;
                    };
                    let outbound = {
                        let conns = self.conns.lock().await;
                        conns.get(&envelope.cluster_id).map(|c| c.outbound.clone())
                    };
                    if let Some(outbound) = outbound
                        && outbound.send(config_frame(&payload)).await.is_err()
                    {
                        self.unregister(envelope.cluster_id, "outbound channel closed")
                            .await;
                    }
                }
            }
        }
    }

    async fn run_reaper(
        &self,
        cluster_id: Uuid,
        mut deadline_rx: watch::Receiver<Instant>,
        cancel: CancellationToken,
    ) {
        loop {
            let deadline = *deadline_rx.borrow_and_update();
            if deadline <= Instant::now() {
                metrics::counter!("stream_registry_reaped_total").increment(1);
                self.unregister(cluster_id, "no heartbeat within reaper window")
                    .await;
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                // Re-armed; loop around and read the new deadline.
                changed = deadline_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }
}

fn config_frame(payload: &Value) -> ControlFrame {
    ControlFrame {
        frame: Some(control_frame::Frame::ConfigUpdate(ConfigUpdate {
            payload_json: payload.to_string(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn liveness_key_layout() {
        let id: Uuid = "6dd24deb-4f51-4a1e-8767-799b69b9eedc".parse().unwrap();
        assert_eq!(
            liveness_key(id),
            "cluster:6dd24deb-4f51-4a1e-8767-799b69b9eedc:alive"
        );
    }

    #[test]
    fn envelope_wire_shape() {
        let envelope = SignalEnvelope {
            kind: SignalKind::UnregisterStream,
            cluster_id: Uuid::nil(),
            sender: Uuid::nil(),
            payload: None,
        };
        let raw = serde_json::to_value(&envelope).unwrap();
        assert_eq!(raw["type"], "UNREGISTER_STREAM");
        assert!(raw.get("payload").is_none());
        assert!(raw.get("clusterId").is_some());

        let round: SignalEnvelope = serde_json::from_value(raw).unwrap();
        assert_eq!(round.kind, SignalKind::UnregisterStream);
    }

    #[test]
    fn config_envelope_carries_payload() {
        let envelope = SignalEnvelope {
            kind: SignalKind::ConfigUpdate,
            cluster_id: Uuid::nil(),
            sender: Uuid::nil(),
            payload: Some(json!({"heartbeatIntervalSecs": 30})),
        };
        let raw = serde_json::to_string(&envelope).unwrap();
        let round: SignalEnvelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(round.payload.unwrap()["heartbeatIntervalSecs"], 30);
    }
}
