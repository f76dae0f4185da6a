//! Hand-off point for relayer telemetry. The timeseries sinks live outside
//! the control plane; this module counts what flows through and forwards at
//! debug level so an operator can watch a cluster's chatter without any
//! sink attached.

use uuid::Uuid;

use crate::proto::relay::{LogBatch, MetricBatch, TraceBatch};

pub fn forward_logs(cluster_id: Uuid, batch: &LogBatch) {
    metrics::counter!("telemetry_log_records_total")
        .increment(batch.records.len() as u64);
    for record in &batch.records {
        tracing::debug!(
            %cluster_id,
            execution_id = %record.execution_id,
            level = %record.level,
            "{}",
            record.message
        );
    }
}

pub fn forward_metrics(cluster_id: Uuid, batch: &MetricBatch) {
    metrics::counter!("telemetry_metric_points_total")
        .increment(batch.points.len() as u64);
    tracing::debug!(%cluster_id, points = batch.points.len(), "metric batch received");
}

pub fn forward_traces(cluster_id: Uuid, batch: &TraceBatch) {
    metrics::counter!("telemetry_spans_total").increment(batch.spans.len() as u64);
    tracing::debug!(%cluster_id, spans = batch.spans.len(), "trace batch received");
}
