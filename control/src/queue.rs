//! Per-(organization, cluster, priority) work queue over Redis lists.
//!
//! Three lists back each (org, cluster) pair: `...:work:high`, `...:work`,
//! and `...:work:low`. Dequeue is a single BLPOP across the three keys in
//! that order, which is exactly the required semantics: strict FIFO within a
//! priority, strict priority across priorities. Queue contents are owned by
//! Redis, not the process, so the tail survives a dead consumer and drains
//! through the next live stream for the same cluster.

use std::time::Duration;

use anyhow::{Context, Result};
use deadpool_redis::Pool;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::models::{ExecutionPriority, QueueMessage};

pub fn queue_key(organization_id: Uuid, cluster_id: Uuid, priority: ExecutionPriority) -> String {
    let base = format!("org:{}:cluster:{}:work", organization_id, cluster_id);
    match priority {
        ExecutionPriority::High => format!("{}:high", base),
        ExecutionPriority::Normal => base,
        ExecutionPriority::Low => format!("{}:low", base),
    }
}

/// Keys in strict dequeue order.
fn priority_keys(organization_id: Uuid, cluster_id: Uuid) -> [String; 3] {
    [
        queue_key(organization_id, cluster_id, ExecutionPriority::High),
        queue_key(organization_id, cluster_id, ExecutionPriority::Normal),
        queue_key(organization_id, cluster_id, ExecutionPriority::Low),
    ]
}

#[derive(Debug, Clone)]
pub struct QueueStats {
    pub key: String,
    pub length: i64,
}

#[derive(Clone)]
pub struct WorkQueue {
    pool: Pool,
}

impl WorkQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// FIFO append. Errors propagate to the caller; a lost enqueue must not
    /// be silently swallowed because the execution row already says QUEUED.
    pub async fn enqueue(
        &self,
        organization_id: Uuid,
        cluster_id: Uuid,
        message: &QueueMessage,
        priority: ExecutionPriority,
    ) -> Result<()> {
        let payload = serde_json::to_string(message).context("failed to encode queue message")?;
        let mut conn = self
            .pool
            .get()
            .await
            .context("failed to get Redis connection")?;
        let _: i64 = conn
            .rpush(queue_key(organization_id, cluster_id, priority), payload)
            .await
            .context("failed to enqueue message")?;
        metrics::counter!("queue_enqueued_total", "priority" => priority.as_str()).increment(1);
        Ok(())
    }

    /// Pop the first message among [high, normal, low], blocking up to
    /// `timeout`. Returns `None` on timeout. Each call takes a fresh pooled
    /// connection, so a dropped connection heals on the next call.
    pub async fn dequeue(
        &self,
        organization_id: Uuid,
        cluster_id: Uuid,
        timeout: Duration,
    ) -> Result<Option<QueueMessage>> {
        let keys = priority_keys(organization_id, cluster_id).to_vec();
        let mut conn = self
            .pool
            .get()
            .await
            .context("failed to get Redis connection")?;
        let popped: Option<(String, String)> = conn
            .blpop(keys, timeout.as_secs_f64())
            .await
            .context("failed to block-pop work queue")?;
        match popped {
            None => Ok(None),
            Some((_key, payload)) => {
                metrics::counter!("queue_dequeued_total").increment(1);
                Ok(Some(
                    serde_json::from_str(&payload).context("failed to decode queue message")?,
                ))
            }
        }
    }

    /// First message that a dequeue would return, without removing it.
    pub async fn peek(
        &self,
        organization_id: Uuid,
        cluster_id: Uuid,
    ) -> Result<Option<QueueMessage>> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("failed to get Redis connection")?;
        for key in priority_keys(organization_id, cluster_id) {
            let head: Vec<String> = conn
                .lrange(&key, 0, 0)
                .await
                .context("failed to peek queue")?;
            if let Some(payload) = head.first() {
                return Ok(Some(
                    serde_json::from_str(payload).context("failed to decode queue message")?,
                ));
            }
        }
        Ok(None)
    }

    /// Number of pending messages, for one priority or all three.
    pub async fn length(
        &self,
        organization_id: Uuid,
        cluster_id: Uuid,
        priority: Option<ExecutionPriority>,
    ) -> Result<i64> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("failed to get Redis connection")?;
        let keys: Vec<String> = match priority {
            Some(p) => vec![queue_key(organization_id, cluster_id, p)],
            None => priority_keys(organization_id, cluster_id).to_vec(),
        };
        let mut total = 0i64;
        for key in keys {
            let len: i64 = conn.llen(&key).await.context("failed to read queue length")?;
            total += len;
        }
        Ok(total)
    }

    /// Return every pending message (priority order, FIFO within) and delete
    /// the keys. Only used when a cluster is deliberately removed; stream
    /// loss never drains a queue.
    pub async fn drain_cluster(
        &self,
        organization_id: Uuid,
        cluster_id: Uuid,
    ) -> Result<Vec<QueueMessage>> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("failed to get Redis connection")?;
        let mut drained = Vec::new();
        for key in priority_keys(organization_id, cluster_id) {
            let payloads: Vec<String> = conn
                .lrange(&key, 0, -1)
                .await
                .context("failed to read queue for drain")?;
            for payload in &payloads {
                drained
                    .push(serde_json::from_str(payload).context("failed to decode queue message")?);
            }
            let _: i64 = conn.del(&key).await.context("failed to delete queue key")?;
        }
        Ok(drained)
    }

    /// Enumerate every work queue in the instance with a non-blocking cursor
    /// scan. Operator-facing; never used on the hot path.
    pub async fn global_stats(&self) -> Result<Vec<QueueStats>> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("failed to get Redis connection")?;
        let mut stats = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("org:*:cluster:*:work*")
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .context("failed to scan queue keys")?;
            for key in keys {
                let length: i64 = conn.llen(&key).await.context("failed to read queue length")?;
                stats.push(QueueStats { key, length });
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NetworkPolicy, ResourceSpec, RetryPolicy, WorkItem};
    use serde_json::json;

    #[test]
    fn key_layout() {
        let org = Uuid::nil();
        let cluster = Uuid::max();
        assert_eq!(
            queue_key(org, cluster, ExecutionPriority::Normal),
            format!("org:{}:cluster:{}:work", org, cluster)
        );
        assert_eq!(
            queue_key(org, cluster, ExecutionPriority::High),
            format!("org:{}:cluster:{}:work:high", org, cluster)
        );
        assert_eq!(
            queue_key(org, cluster, ExecutionPriority::Low),
            format!("org:{}:cluster:{}:work:low", org, cluster)
        );
    }

    #[test]
    fn dequeue_order_is_high_normal_low() {
        let org = Uuid::nil();
        let cluster = Uuid::nil();
        let [first, second, third] = priority_keys(org, cluster);
        assert!(first.ends_with(":high"));
        assert!(second.ends_with(":work"));
        assert!(third.ends_with(":low"));
    }

    fn work_message(name: &str) -> QueueMessage {
        QueueMessage::Work(WorkItem {
            execution_id: Uuid::new_v4(),
            agent_id: Uuid::nil(),
            agent_name: name.into(),
            agent_image: "docker.io/acme/x:v1".into(),
            input: json!({}),
            resources: ResourceSpec {
                cpu: "1".into(),
                memory: "512Mi".into(),
                gpu: None,
                timeout: "60s".into(),
            },
            retry_policy: RetryPolicy::default(),
            use_agent_sandbox: false,
            network_policy: NetworkPolicy::Standard,
            warm_pool_size: 0,
            environment_variables: None,
        })
    }

    fn message_name(message: &QueueMessage) -> &str {
        match message {
            QueueMessage::Work(item) => &item.agent_name,
            QueueMessage::Registration(item) => &item.agent_name,
        }
    }

    /// Runs against a live Redis when `TEST_REDIS_URL` is set (e.g.
    /// `redis://127.0.0.1:6379/`); a bare environment skips.
    #[tokio::test]
    async fn peek_observes_the_head_without_removing_it() {
        let Ok(url) = std::env::var("TEST_REDIS_URL") else {
            return;
        };
        let pool = deadpool_redis::Config::from_url(url)
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .expect("create test Redis pool");
        let queue = WorkQueue::new(pool);
        // Fresh ids per run keep the keys disjoint from any other state.
        let org = Uuid::new_v4();
        let cluster = Uuid::new_v4();

        queue
            .enqueue(org, cluster, &work_message("first-normal"), ExecutionPriority::Normal)
            .await
            .unwrap();
        queue
            .enqueue(org, cluster, &work_message("late-high"), ExecutionPriority::High)
            .await
            .unwrap();

        // The late high-priority message is the head, and peeking twice
        // proves nothing was consumed.
        let head = queue.peek(org, cluster).await.unwrap().expect("head exists");
        assert_eq!(message_name(&head), "late-high");
        let again = queue.peek(org, cluster).await.unwrap().expect("head still there");
        assert_eq!(message_name(&again), "late-high");
        assert_eq!(queue.length(org, cluster, None).await.unwrap(), 2);

        // Dequeue drains in priority order, then reports an empty queue.
        let first = queue
            .dequeue(org, cluster, Duration::from_secs(1))
            .await
            .unwrap()
            .expect("high message");
        assert_eq!(message_name(&first), "late-high");
        let second = queue
            .dequeue(org, cluster, Duration::from_secs(1))
            .await
            .unwrap()
            .expect("normal message");
        assert_eq!(message_name(&second), "first-normal");
        assert!(queue.peek(org, cluster).await.unwrap().is_none());
        assert!(
            queue
                .dequeue(org, cluster, Duration::from_secs(1))
                .await
                .unwrap()
                .is_none()
        );
    }
}
