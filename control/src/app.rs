//! Per-process application context. Services are constructed once in
//! dependency order (store, queue, signaling, registry, engine) and handed
//! around behind one cheap clone.

use std::ops::Deref;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use tessera_common::rate_limit::RateLimiter;

use crate::queue::WorkQueue;
use crate::registry::StreamRegistry;
use crate::workflow::WorkflowEngine;

pub struct AppInner {
    pub pg: deadpool_postgres::Pool,
    pub queue: WorkQueue,
    pub registry: StreamRegistry,
    pub engine: WorkflowEngine,
    pub limiter: RateLimiter,
    pub cancel: CancellationToken,
}

#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

impl Deref for App {
    type Target = AppInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl App {
    pub fn new(inner: AppInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }
}
