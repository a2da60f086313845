//! Reconciles trial completion records against the expected distances.
//!
//! Trials carry their distance index as a typed metadata field; matching is
//! exact on that field. Distances with no matching record are left out of
//! the map.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::model::{DistanceSet, SiteKey, TrialStatus};
use crate::coord::JobInfo;

/// Metadata field carrying a trial's position in the distance set
pub const DISTANCE_INDEX: &str = "distance_index";
/// Metadata field carrying the trial's site identity
pub const SITE_KEY: &str = "site_key";
/// Namespace key the join publishes under
pub const DISTANCE_TO_STATE: &str = "distance_to_state";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistanceState {
    pub distance: f64,
    pub status: TrialStatus,
}

/// distance index → state
pub type StatusMap = BTreeMap<usize, DistanceState>;

/// Build the status map for one site. Records of other sites, untagged
/// records and indices outside the distance set are ignored; for repeated
/// indices the last record wins.
pub fn join_statuses(key: &SiteKey, distances: &DistanceSet, records: &[JobInfo]) -> StatusMap {
    let key = key.to_string();
    let mut states = StatusMap::new();

    for record in records {
        let same_site = record
            .metadata
            .get(SITE_KEY)
            .and_then(|v| v.as_str())
            .map_or(false, |k| k == key);
        if !same_site {
            continue;
        }
        let distance_idx = match record.metadata.get(DISTANCE_INDEX).and_then(|v| v.as_u64()) {
            Some(i) => i as usize,
            None => continue,
        };
        if let Some(distance) = distances.get(distance_idx) {
            states.insert(
                distance_idx,
                DistanceState {
                    distance,
                    status: record.status.into(),
                },
            );
        }
    }

    states
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag_flow::NodeStatus;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(site: &str, distance_idx: usize, status: NodeStatus) -> JobInfo {
        JobInfo {
            node_id: format!("trial_{}_{}", site, distance_idx),
            name: format!("distance optimization: {}", distance_idx),
            status,
            metadata: json!({ SITE_KEY: site, DISTANCE_INDEX: distance_idx }),
        }
    }

    #[test]
    fn test_join_maps_statuses_by_index() {
        let key = SiteKey::new(0, 0, 0);
        let distances = DistanceSet::default();
        let records = vec![
            record("0_0_0", 0, NodeStatus::Completed),
            record("0_0_0", 2, NodeStatus::Failed),
            record("0_0_0", 4, NodeStatus::Completed),
        ];

        let states = join_statuses(&key, &distances, &records);
        assert_eq!(states.len(), 3);
        assert_eq!(states[&0].status, TrialStatus::Succeeded);
        assert_eq!(states[&2].status, TrialStatus::Failed);
        assert_eq!(states[&2].distance, 1.25);
        assert!(!states.contains_key(&1));
    }

    #[test]
    fn test_join_is_idempotent() {
        let key = SiteKey::new(0, 0, 0);
        let distances = DistanceSet::default();
        let records = vec![
            record("0_0_0", 1, NodeStatus::Completed),
            record("0_0_0", 3, NodeStatus::Skipped),
        ];
        assert_eq!(
            join_statuses(&key, &distances, &records),
            join_statuses(&key, &distances, &records)
        );
    }

    #[test]
    fn test_join_ignores_foreign_and_untagged_records() {
        let key = SiteKey::new(0, 0, 0);
        let distances = DistanceSet::default();
        let mut untagged = record("0_0_0", 0, NodeStatus::Completed);
        untagged.metadata = json!({});
        let records = vec![
            record("0_0_1", 0, NodeStatus::Completed),
            record("0_0_0", 9, NodeStatus::Completed),
            untagged,
        ];
        assert!(join_statuses(&key, &distances, &records).is_empty());
    }

    #[test]
    fn test_join_requires_site_tag() {
        // The slab static carries no site key; it must not claim a distance.
        let key = SiteKey::new(0, 0, 0);
        let distances = DistanceSet::default();
        let mut distance_only = record("0_0_0", 2, NodeStatus::Completed);
        distance_only.metadata = json!({ DISTANCE_INDEX: 2 });

        assert!(join_statuses(&key, &distances, &[distance_only]).is_empty());
    }

    #[test]
    fn test_similar_distances_do_not_collide() {
        // 1.2 would match "1.25" under a substring rule.
        let key = SiteKey::new(0, 0, 0);
        let distances = DistanceSet::new(vec![1.2, 1.25]).unwrap();
        let records = vec![record("0_0_0", 1, NodeStatus::Completed)];

        let states = join_statuses(&key, &distances, &records);
        assert_eq!(states.keys().copied().collect::<Vec<_>>(), vec![1]);
    }
}
