//! Durable workflow primitives: journaled steps, event waits, and scheduled
//! sends.
//!
//! A workflow is ordinary async code whose side-effecting stretches are
//! wrapped in [`WorkflowEngine::step`]. Step results are journaled in
//! Postgres keyed by `(workflow_id, step_name)`, so a replay after a crash
//! skips completed steps and lands back where it left off. Step bodies must
//! be idempotent at the store layer (CAS guards), because transient failures
//! are retried here.
//!
//! Event waits ride NATS core pub/sub: the subject embeds the match value,
//! so "wait for event E where field = X" is plain subject routing. Waiting
//! consumes a subscription, not a thread. Delayed sends are parked in the
//! `scheduled_events` table and delivered by the scheduler poll loop, which
//! claims each due row atomically so exactly one pod publishes it.

use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tessera_common::wait;

use crate::db;

/// Transient-failure retries per step, with jittered backoff between tries.
const STEP_ATTEMPTS: usize = 3;

pub mod subjects {
    use uuid::Uuid;

    pub const EXECUTION_REQUESTED: &str = "tessera.events.execution_requested";

    const EXECUTION_COMPLETED_PREFIX: &str = "tessera.events.execution_completed";
    const EXECUTION_FAILED_PREFIX: &str = "tessera.events.execution_failed";
    const EXECUTION_QUEUED_PREFIX: &str = "tessera.events.execution_queued";

    pub fn execution_completed(execution_id: Uuid) -> String {
        format!("{}.{}", EXECUTION_COMPLETED_PREFIX, execution_id)
    }

    pub fn execution_failed(execution_id: Uuid) -> String {
        format!("{}.{}", EXECUTION_FAILED_PREFIX, execution_id)
    }

    /// Wildcard the failure companion subscribes with.
    pub fn execution_failed_wildcard() -> String {
        format!("{}.*", EXECUTION_FAILED_PREFIX)
    }

    /// Observer-facing; nothing in the control plane waits on it.
    pub fn execution_queued(execution_id: Uuid) -> String {
        format!("{}.{}", EXECUTION_QUEUED_PREFIX, execution_id)
    }
}

pub struct WorkflowEngineInner {
    pool: Pool,
    nats: async_nats::Client,
    cancel: CancellationToken,
    org_slots: Mutex<HashMap<Uuid, Arc<Semaphore>>>,
    max_concurrent_per_org: usize,
}

#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<WorkflowEngineInner>,
}

impl Deref for WorkflowEngine {
    type Target = WorkflowEngineInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl WorkflowEngine {
    pub fn new(
        pool: Pool,
        nats: async_nats::Client,
        cancel: CancellationToken,
        max_concurrent_per_org: usize,
    ) -> Self {
        Self {
            inner: Arc::new(WorkflowEngineInner {
                pool,
                nats,
                cancel,
                org_slots: Mutex::new(HashMap::new()),
                max_concurrent_per_org,
            }),
        }
    }

    /// Run `f` exactly once per `(workflow_id, name)`, memoizing its result.
    /// A replay returns the journaled value without re-running `f`; when two
    /// replicas race, the first journal write wins and both observe it.
    pub async fn step<T, F, Fut>(&self, workflow_id: &str, name: &str, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(cached) = db::get_step_result(&self.pool, workflow_id, name).await? {
            return serde_json::from_value(cached).context("failed to decode journaled step result");
        }

        let mut last_err = None;
        for attempt in 0..STEP_ATTEMPTS {
            if attempt > 0 {
                wait::wait(&self.cancel, attempt).await?;
            }
            match f().await {
                Ok(value) => {
                    let raw =
                        serde_json::to_value(&value).context("failed to encode step result")?;
                    let winner = db::put_step_result(&self.pool, workflow_id, name, &raw).await?;
                    return serde_json::from_value(winner)
                        .context("failed to decode journaled step result");
                }
                Err(e) => {
                    tracing::warn!(
                        workflow_id,
                        step = name,
                        attempt,
                        error = ?e,
                        "step attempt failed"
                    );
                    metrics::counter!("workflow_step_retries_total").increment(1);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("at least one attempt ran")).with_context(|| {
            format!("step {} of workflow {} exhausted its retries", name, workflow_id)
        })
    }

    /// Open a waiter for `subject`. The subscription is live from the moment
    /// this returns, so a caller can arm the waiter *before* triggering the
    /// work that will eventually produce the event and never miss a fast
    /// reply.
    pub async fn wait_for_event(&self, subject: &str) -> Result<EventWaiter> {
        let subscriber = self
            .nats
            .subscribe(subject.to_string())
            .await
            .context("failed to subscribe for event wait")?;
        Ok(EventWaiter {
            subscriber,
            cancel: self.cancel.clone(),
        })
    }

    pub async fn publish(&self, subject: &str, payload: &Value) -> Result<()> {
        let raw = serde_json::to_vec(payload).context("failed to encode event payload")?;
        self.nats
            .publish(subject.to_string(), raw.into())
            .await
            .context("failed to publish event")
    }

    /// Emit an event now, or park it for delivery at `deliver_at`.
    pub async fn send(
        &self,
        subject: &str,
        payload: &Value,
        deliver_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        match deliver_at {
            Some(ts) if ts > Utc::now() => {
                db::schedule_event(&self.pool, subject, payload, ts).await
            }
            _ => self.publish(subject, payload).await,
        }
    }

    pub async fn subscribe(&self, subject: String) -> Result<async_nats::Subscriber> {
        self.nats
            .subscribe(subject)
            .await
            .context("failed to subscribe")
    }

    /// Per-organization workflow slot; at most `max_concurrent_per_org`
    /// execution workflows run at once for one tenant.
    pub async fn acquire_org_slot(&self, organization_id: Uuid) -> Result<OwnedSemaphorePermit> {
        let semaphore = {
            let mut slots = self.org_slots.lock().await;
            slots
                .entry(organization_id)
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_concurrent_per_org)))
                .clone()
        };
        semaphore
            .acquire_owned()
            .await
            .context("organization slot semaphore closed")
    }

    /// Deliver due scheduled events, once a second, until shutdown.
    pub async fn run_scheduler(&self) -> Result<()> {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            let events = match db::take_due_events(&self.pool).await {
                Ok(events) => events,
                Err(e) => {
                    tracing::error!(error = ?e, "failed to poll scheduled events");
                    continue;
                }
            };
            for (subject, payload) in events {
                if let Err(e) = self.publish(&subject, &payload).await {
                    tracing::error!(subject, error = ?e, "failed to deliver scheduled event");
                    // Put the claim back so the event is not lost.
                    let _ = db::schedule_event(&self.pool, &subject, &payload, Utc::now()).await;
                } else {
                    metrics::counter!("workflow_scheduled_events_delivered_total").increment(1);
                }
            }
        }
    }
}

/// A pending event wait. Suspension holds only this subscription; the
/// workflow's durable identity lives in the journal.
pub struct EventWaiter {
    subscriber: async_nats::Subscriber,
    cancel: CancellationToken,
}

impl EventWaiter {
    /// Resume with the matching event's payload, or `None` after `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<Option<Value>> {
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => bail!("Context cancelled"),
            outcome = tokio::time::timeout(timeout, self.subscriber.next()) => outcome,
        };
        match outcome {
            Err(_elapsed) => Ok(None),
            Ok(None) => bail!("event subscription closed"),
            Ok(Some(msg)) => Ok(Some(
                serde_json::from_slice(&msg.payload).context("failed to decode event payload")?,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_layout() {
        let id: Uuid = "4be0643f-1d98-573b-97cd-ca98a65347dd".parse().unwrap();
        assert_eq!(
            subjects::execution_completed(id),
            "tessera.events.execution_completed.4be0643f-1d98-573b-97cd-ca98a65347dd"
        );
        assert_eq!(
            subjects::execution_failed_wildcard(),
            "tessera.events.execution_failed.*"
        );
        assert!(subjects::execution_failed(id).starts_with("tessera.events.execution_failed."));
    }
}
