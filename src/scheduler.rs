//! # Scheduler: Cluster Selection for New Endpoints
//!
//! Picks the execution cluster that should host a new endpoint of a given
//! spec. Selection is a pure function of a point-in-time snapshot of the
//! cluster registry: nothing is reserved, and capacity accounting happens
//! outside this crate.
//!
//! ## Scoring
//!
//! ```text
//! score = 0.5 · available / (total + 1)
//!       + 0.3 · region_match            (1 iff preferred region is set and equal)
//!       + 0.2 · priority / 100
//! ```
//!
//! The `+ 1` keeps the availability ratio below 1 and defined for rows with
//! zero total capacity.
//!
//! ## Ordering
//!
//! Score descending, then cluster id ascending, then capacity row id
//! ascending. Equal inputs always produce the same winner.

use std::cmp::Ordering;

use serde::Serialize;

use crate::db::{ClusterRow, ClusterSpecRow, ClusterStatus, SpecPricingRow};
use crate::error::FleetError;
use crate::store::FleetStore;

const WEIGHT_AVAILABILITY: f64 = 0.5;
const WEIGHT_REGION: f64 = 0.3;
const WEIGHT_PRIORITY: f64 = 0.2;

/// A scored (cluster, capacity row) pair.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterCandidate {
    pub cluster: ClusterRow,
    pub cluster_spec: ClusterSpecRow,
    pub score: f64,
}

/// Winning candidate plus the resolved spec definition.
#[derive(Debug, Clone, Serialize)]
pub struct Selection {
    pub candidate: ClusterCandidate,
    pub pricing: SpecPricingRow,
}

pub fn score(cluster: &ClusterRow, spec: &ClusterSpecRow, preferred_region: &str) -> f64 {
    let availability = f64::from(spec.available_capacity) / (f64::from(spec.total_capacity) + 1.0);
    let region_match = if !preferred_region.is_empty() && preferred_region == cluster.region {
        1.0
    } else {
        0.0
    };
    let priority = f64::from(cluster.priority) / 100.0;
    WEIGHT_AVAILABILITY * availability + WEIGHT_REGION * region_match + WEIGHT_PRIORITY * priority
}

fn compare(a: &ClusterCandidate, b: &ClusterCandidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.cluster.cluster_id.cmp(&b.cluster.cluster_id))
        .then_with(|| a.cluster_spec.id.cmp(&b.cluster_spec.id))
}

/// Score every eligible pair and sort best first. Pairs whose capacity row
/// is unavailable or empty, or whose cluster is not active, are dropped.
pub fn rank_candidates(
    pairs: Vec<(ClusterRow, ClusterSpecRow)>,
    preferred_region: &str,
) -> Vec<ClusterCandidate> {
    let mut candidates: Vec<ClusterCandidate> = pairs
        .into_iter()
        .filter(|(cluster, spec)| {
            spec.is_available
                && spec.available_capacity > 0
                && cluster.status == ClusterStatus::Active
        })
        .map(|(cluster, spec)| {
            let score = score(&cluster, &spec, preferred_region);
            ClusterCandidate {
                cluster,
                cluster_spec: spec,
                score,
            }
        })
        .collect();
    candidates.sort_by(compare);
    candidates
}

/// Choose the best cluster for `spec_name`.
///
/// Fails with [`FleetError::SpecNotFound`] when the spec has no (available)
/// pricing row and [`FleetError::NoCapacity`] when no active cluster has room.
pub async fn select_cluster(
    store: &dyn FleetStore,
    spec_name: &str,
    preferred_region: &str,
) -> Result<Selection, FleetError> {
    let pricing = store
        .get_spec_pricing(spec_name)
        .await?
        .filter(|p| p.is_available)
        .ok_or_else(|| FleetError::SpecNotFound(spec_name.to_string()))?;

    let specs = store.list_available_cluster_specs(spec_name).await?;
    let mut pairs = Vec::with_capacity(specs.len());
    for spec in specs {
        if let Some(cluster) = store.get_cluster(&spec.cluster_id).await? {
            pairs.push((cluster, spec));
        }
    }

    let candidate = rank_candidates(pairs, preferred_region)
        .into_iter()
        .next()
        .ok_or_else(|| FleetError::NoCapacity(spec_name.to_string()))?;

    Ok(Selection { candidate, pricing })
}
