//! Typed view of the shared namespace for trial, slab and selection results.

use tracing::warn;

use super::engine::EngineOutput;
use super::model::{
    optimized_energy_key, optimized_structure_key, slab_energy_key, DistanceSet,
    SelectionResult, SiteKey, Structure, TrialRecord, TrialStatus,
};
use super::status_join::StatusMap;
use crate::core::errors::{FlowError, Result};
use crate::dag_flow::Cache;

/// Accumulates trial results; every trial owns its own pair of keys.
#[derive(Clone)]
pub struct TrialEnergyStore {
    cache: Cache,
}

impl TrialEnergyStore {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }

    /// Publish one trial's raw energy and final structure
    pub fn record_trial(
        &self,
        producer: &str,
        key: &SiteKey,
        distance_idx: usize,
        output: &EngineOutput,
    ) -> Result<()> {
        self.cache
            .publish(producer, &key.trial_energy_key(distance_idx), &output.energy)?;
        self.cache.publish(
            producer,
            &key.trial_structure_key(distance_idx),
            &output.structure,
        )
    }

    /// Every trial of `key` with its joined status. Energies are per atom.
    pub fn trials_for(
        &self,
        key: &SiteKey,
        distances: &DistanceSet,
        states: &StatusMap,
    ) -> Result<Vec<TrialRecord>> {
        distances
            .iter()
            .map(|(distance_idx, distance)| {
                let status = states
                    .get(&distance_idx)
                    .map(|s| s.status)
                    .unwrap_or(TrialStatus::Pending);
                if status != TrialStatus::Succeeded {
                    return Ok(TrialRecord {
                        distance,
                        energy_per_atom: None,
                        structure: None,
                        status,
                    });
                }

                let energy_key = key.trial_energy_key(distance_idx);
                let structure_key = key.trial_structure_key(distance_idx);
                // non-finite energies serialize as null
                let energy: Option<f64> = self.cache.get(&energy_key)?.ok_or_else(|| {
                    FlowError::MissingKey {
                        key: energy_key.clone(),
                        node_id: key.to_string(),
                    }
                })?;
                let structure: Structure = self.cache.get(&structure_key)?.ok_or_else(|| {
                    FlowError::MissingKey {
                        key: structure_key.clone(),
                        node_id: key.to_string(),
                    }
                })?;
                let energy_per_atom = energy
                    .filter(|_| !structure.is_empty())
                    .map(|e| e / structure.len() as f64)
                    .filter(|e| e.is_finite());
                if energy_per_atom.is_none() {
                    warn!(idx = %key, distance_idx, ?energy, "Trial has no usable energy");
                }

                Ok(TrialRecord {
                    distance,
                    energy_per_atom,
                    structure: Some(structure),
                    status,
                })
            })
            .collect()
    }

    pub fn record_slab_energy(&self, producer: &str, slab_idx: usize, energy: f64) -> Result<()> {
        self.cache.publish(producer, &slab_energy_key(slab_idx), &energy)
    }

    pub fn slab_energy(&self, slab_idx: usize) -> Result<Option<f64>> {
        self.cache.get(&slab_energy_key(slab_idx))
    }

    /// Write-once: a site's selection is never revised
    pub fn publish_selection(
        &self,
        producer: &str,
        key: &SiteKey,
        result: &SelectionResult,
    ) -> Result<()> {
        self.cache.publish(producer, &key.to_string(), result)
    }

    /// Selection published by one of `parents`
    pub fn selection_from(
        &self,
        key: &SiteKey,
        parents: &[String],
    ) -> Result<Option<SelectionResult>> {
        Ok(self
            .cache
            .fetch_from::<SelectionResult>(&key.to_string(), parents)?
            .into_iter()
            .next())
    }

    /// Publish a relaxation result under `{prefix}_optimized_*`
    pub fn record_optimized(&self, producer: &str, prefix: &str, output: &EngineOutput) -> Result<()> {
        self.cache
            .publish(producer, &optimized_energy_key(prefix), &output.energy)?;
        self.cache
            .publish(producer, &optimized_structure_key(prefix), &output.structure)
    }

    pub fn optimized_energy(&self, prefix: &str) -> Result<Option<f64>> {
        self.cache.get(&optimized_energy_key(prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adsorption::model::Site;
    use crate::adsorption::status_join::DistanceState;

    fn output(energy: f64, n: usize) -> EngineOutput {
        EngineOutput {
            energy,
            structure: Structure::new(
                [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
                (0..n).map(|_| Site::new("Pt", [0.0; 3])).collect(),
            ),
        }
    }

    #[test]
    fn test_trials_for_uses_joined_status() {
        let store = TrialEnergyStore::new(Cache::new());
        let key = SiteKey::new(0, 0, 1);
        let distances = DistanceSet::new(vec![1.0, 2.0, 3.0]).unwrap();

        store.record_trial("t0", &key, 0, &output(-10.0, 5)).unwrap();
        store.record_trial("t2", &key, 2, &output(4.0, 4)).unwrap();

        let mut states = StatusMap::new();
        states.insert(0, DistanceState { distance: 1.0, status: TrialStatus::Succeeded });
        states.insert(1, DistanceState { distance: 2.0, status: TrialStatus::Failed });
        states.insert(2, DistanceState { distance: 3.0, status: TrialStatus::Succeeded });

        let trials = store.trials_for(&key, &distances, &states).unwrap();
        assert_eq!(trials.len(), 3);
        assert_eq!(trials[0].energy_per_atom, Some(-2.0));
        assert!(!trials[1].is_available());
        assert_eq!(trials[2].energy_per_atom, Some(1.0));
    }

    #[test]
    fn test_succeeded_trial_without_outputs_is_missing_key() {
        let store = TrialEnergyStore::new(Cache::new());
        let key = SiteKey::new(0, 0, 0);
        let distances = DistanceSet::new(vec![1.0]).unwrap();
        let mut states = StatusMap::new();
        states.insert(0, DistanceState { distance: 1.0, status: TrialStatus::Succeeded });

        let err = store.trials_for(&key, &distances, &states).unwrap_err();
        assert!(matches!(err, FlowError::MissingKey { .. }));
    }

    #[test]
    fn test_non_finite_energy_is_unavailable() {
        let store = TrialEnergyStore::new(Cache::new());
        let key = SiteKey::new(0, 0, 2);
        let distances = DistanceSet::new(vec![1.0, 2.0]).unwrap();
        store.record_trial("t0", &key, 0, &output(f64::NAN, 4)).unwrap();
        store.record_trial("t1", &key, 1, &output(-8.0, 4)).unwrap();

        let mut states = StatusMap::new();
        states.insert(0, DistanceState { distance: 1.0, status: TrialStatus::Succeeded });
        states.insert(1, DistanceState { distance: 2.0, status: TrialStatus::Succeeded });

        let trials = store.trials_for(&key, &distances, &states).unwrap();
        assert_eq!(trials[0].energy_per_atom, None);
        assert!(!trials[0].is_available());
        assert_eq!(trials[1].energy_per_atom, Some(-2.0));
    }

    #[test]
    fn test_trial_keys_are_write_once() {
        let store = TrialEnergyStore::new(Cache::new());
        let key = SiteKey::new(1, 0, 0);
        store.record_trial("a", &key, 0, &output(1.0, 1)).unwrap();
        assert!(matches!(
            store.record_trial("b", &key, 0, &output(2.0, 1)),
            Err(FlowError::KeyConflict { .. })
        ));
    }

    #[test]
    fn test_selection_is_read_from_parent() {
        let store = TrialEnergyStore::new(Cache::new());
        let key = SiteKey::new(0, 0, 0);
        let result = SelectionResult {
            optimal_distance: 1.25,
            lowest_energy: -0.2,
            adsorption_energy: -0.5,
        };
        store.publish_selection("select", &key, &result).unwrap();

        assert_eq!(
            store.selection_from(&key, &["select".to_string()]).unwrap(),
            Some(result)
        );
        assert_eq!(store.selection_from(&key, &["other".to_string()]).unwrap(), None);
    }
}
