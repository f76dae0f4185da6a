//! Cluster selection: filter the organization's live clusters by hard
//! requirements, then score the survivors by load, heartbeat freshness, and
//! region affinity. A small uniform jitter breaks ties and spreads load; the
//! rng is injected so tests can seed it.

use std::cmp::Ordering;

use anyhow::Result;
use chrono::Utc;
use deadpool_postgres::Pool;
use rand::Rng;
use uuid::Uuid;

use crate::db;
use crate::models::{Cluster, ClusterCapabilities};
use crate::queue::WorkQueue;
use crate::registry::StreamRegistry;

#[derive(Debug, Clone, Default)]
pub struct PlacementPrefs {
    pub preferred_region: Option<String>,
    pub require_gpu: bool,
    pub require_sandbox: bool,
}

/// Hard requirements: a cluster that cannot run the workload at all is out,
/// regardless of score.
pub fn meets_requirements(caps: &ClusterCapabilities, prefs: &PlacementPrefs) -> bool {
    if prefs.require_gpu && caps.gpu_nodes == 0 {
        return false;
    }
    if prefs.require_sandbox && !caps.sandbox {
        return false;
    }
    true
}

/// Score from a base of 100. Queue depth costs 5 per pending item, capped at
/// 50. Heartbeats older than five minutes cost 2 per minute of age, capped
/// at 20; a cluster that never heartbeat costs a flat 10. A matching region
/// earns 20. `jitter` is uniform in [0, 10).
pub fn score_cluster(
    caps: &ClusterCapabilities,
    queue_length: i64,
    heartbeat_age_minutes: Option<f64>,
    preferred_region: Option<&str>,
    jitter: f64,
) -> f64 {
    let mut score = 100.0;

    score -= (queue_length as f64 * 5.0).min(50.0);

    match heartbeat_age_minutes {
        None => score -= 10.0,
        Some(age) if age > 5.0 => score -= (age * 2.0).min(20.0),
        Some(_) => {}
    }

    if let (Some(preferred), Some(region)) = (preferred_region, caps.region.as_deref())
        && preferred == region
    {
        score += 20.0;
    }

    score + jitter
}

/// Pick the best-scoring cluster for the organization, or `None` when the
/// filtered set is empty (the caller maps that to a failed execution).
pub async fn select_cluster(
    pool: &Pool,
    queue: &WorkQueue,
    registry: &StreamRegistry,
    organization_id: Uuid,
    prefs: &PlacementPrefs,
    rng: &mut impl Rng,
) -> Result<Option<Cluster>> {
    let clusters = db::list_eligible_clusters(pool, organization_id).await?;

    let mut scored: Vec<(Cluster, f64)> = Vec::new();
    for cluster in clusters {
        let caps = ClusterCapabilities::from_value(&cluster.capabilities);
        if !meets_requirements(&caps, prefs) {
            continue;
        }
        // A fresh heartbeat in the DB is not enough: a stream must be
        // registered somewhere in the fleet right now.
        if !registry.is_alive_anywhere(cluster.id).await? {
            continue;
        }
        let queue_length = queue.length(organization_id, cluster.id, None).await?;
        let heartbeat_age_minutes = cluster
            .last_heartbeat
            .map(|hb| (Utc::now() - hb).num_seconds() as f64 / 60.0);
        let jitter = rng.random_range(0.0..10.0);
        let score = score_cluster(
            &caps,
            queue_length,
            heartbeat_age_minutes,
            prefs.preferred_region.as_deref(),
            jitter,
        );
        tracing::debug!(cluster = %cluster.name, score, queue_length, "scored cluster");
        scored.push((cluster, score));
    }

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    Ok(scored.into_iter().next().map(|(cluster, _)| cluster))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn caps(region: Option<&str>, gpu_nodes: i64, sandbox: bool) -> ClusterCapabilities {
        ClusterCapabilities {
            region: region.map(String::from),
            gpu_nodes,
            sandbox,
        }
    }

    #[test]
    fn gpu_and_sandbox_requirements_filter() {
        let no_gpu = caps(None, 0, true);
        let gpu = caps(None, 2, false);

        let need_gpu = PlacementPrefs {
            require_gpu: true,
            ..Default::default()
        };
        assert!(!meets_requirements(&no_gpu, &need_gpu));
        assert!(meets_requirements(&gpu, &need_gpu));

        let need_sandbox = PlacementPrefs {
            require_sandbox: true,
            ..Default::default()
        };
        assert!(meets_requirements(&no_gpu, &need_sandbox));
        assert!(!meets_requirements(&gpu, &need_sandbox));
    }

    #[test]
    fn load_penalty_is_capped() {
        let c = caps(None, 0, false);
        let idle = score_cluster(&c, 0, Some(0.5), None, 0.0);
        let busy = score_cluster(&c, 4, Some(0.5), None, 0.0);
        let slammed = score_cluster(&c, 1000, Some(0.5), None, 0.0);
        assert_eq!(idle, 100.0);
        assert_eq!(busy, 80.0);
        assert_eq!(slammed, 50.0);
    }

    #[test]
    fn staleness_penalties() {
        let c = caps(None, 0, false);
        // Fresh heartbeat: no penalty.
        assert_eq!(score_cluster(&c, 0, Some(2.0), None, 0.0), 100.0);
        // Stale heartbeat: 2 per minute of age.
        assert_eq!(score_cluster(&c, 0, Some(6.0), None, 0.0), 88.0);
        // Very stale: capped at 20.
        assert_eq!(score_cluster(&c, 0, Some(120.0), None, 0.0), 80.0);
        // Never heartbeat: flat 10.
        assert_eq!(score_cluster(&c, 0, None, None, 0.0), 90.0);
    }

    #[test]
    fn region_match_earns_bonus() {
        let east = caps(Some("us-east"), 0, false);
        let west = caps(Some("us-west"), 0, false);
        let matched = score_cluster(&east, 0, Some(1.0), Some("us-east"), 0.0);
        let unmatched = score_cluster(&west, 0, Some(1.0), Some("us-east"), 0.0);
        assert_eq!(matched - unmatched, 20.0);
    }

    #[test]
    fn jitter_is_deterministic_when_seeded() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        let ja: f64 = a.random_range(0.0..10.0);
        let jb: f64 = b.random_range(0.0..10.0);
        assert_eq!(ja, jb);
        assert!((0.0..10.0).contains(&ja));
    }
}
