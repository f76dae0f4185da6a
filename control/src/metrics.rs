//! Prometheus counters for the public API surface. Component-level metrics
//! (queue depth, stream registry, workflow engine) are recorded where the
//! events happen; these cover the caller-facing endpoints.

use metrics::{counter, histogram};

pub fn execution_submitted() {
    counter!("api_executions_submitted_total").increment(1);
}

pub fn execution_fetched() {
    counter!("api_executions_fetched_total").increment(1);
}

pub fn agent_registration_accepted() {
    counter!("api_agent_registrations_accepted_total").increment(1);
}

pub fn agents_listed(count: usize) {
    counter!("api_agents_listed_total").increment(1);
    histogram!("api_agents_list_size").record(count as f64);
}
