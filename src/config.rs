//! Workflow configuration, loadable from YAML.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::adsorption::engine::PlacementParams;
use crate::adsorption::model::{DistanceSet, ReferenceEnergies};
use crate::core::errors::{FlowError, Result};
use crate::dag_flow::DagConfig;

/// Slab generation parameters, passed through to the slab generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlabParams {
    pub min_slab_size: f64,
    pub min_vacuum_size: f64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for SlabParams {
    fn default() -> Self {
        Self {
            min_slab_size: 10.0,
            min_vacuum_size: 5.0,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionAlgorithm {
    /// Zero-crossing scan
    #[default]
    Standard,
    /// Quadratic least-squares fit
    PolyFit,
}

/// Parameters of the optimal-distance decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub algorithm: SelectionAlgorithm,
    pub reference_energies: ReferenceEnergies,
    /// Non-adsorbate reference atoms subtracted per structure
    pub reference_site_offset: usize,
    /// Adsorption energies above this exit the branch
    pub unfavorable_threshold: f64,
    pub default_distance: f64,
    /// Used when no slab reference energy was published
    pub fallback_slab_energy: Option<f64>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            algorithm: SelectionAlgorithm::Standard,
            reference_energies: ReferenceEnergies::default(),
            reference_site_offset: 2,
            unfavorable_threshold: 1.0,
            default_distance: 2.0,
            fallback_slab_energy: None,
        }
    }
}

impl SelectionConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.unfavorable_threshold.is_finite() {
            return Err(FlowError::configuration(
                "selection.unfavorable_threshold",
                "must be finite",
            ));
        }
        if !self.default_distance.is_finite() || self.default_distance <= 0.0 {
            return Err(FlowError::configuration(
                "selection.default_distance",
                "must be finite and positive",
            ));
        }
        if let Some((el, _)) = self
            .reference_energies
            .0
            .iter()
            .find(|(_, e)| !e.is_finite())
        {
            return Err(FlowError::configuration(
                "selection.reference_energies",
                format!("reference energy for {} is not finite", el),
            ));
        }
        if matches!(self.fallback_slab_energy, Some(e) if !e.is_finite()) {
            return Err(FlowError::configuration(
                "selection.fallback_slab_energy",
                "must be finite",
            ));
        }
        Ok(())
    }
}

/// Everything the workflow builder consumes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub distances: DistanceSet,
    pub max_index: u32,
    pub slab_params: SlabParams,
    /// Opaque parameters for the site finder
    pub site_finder_params: Value,
    /// Opaque parameters for adsorption structure generation
    pub ads_structures_params: Value,
    pub vasp_cmd: String,
    pub db_file: Option<String>,
    /// Worker affinity inherited by every node
    pub worker: Option<String>,
    pub dos_slab: bool,
    pub dos_molecule: bool,
    pub optimize_distance: bool,
    pub add_molecules_in_box: bool,
    pub box_size: f64,
    pub static_overrides: BTreeMap<String, Value>,
    pub optimize_overrides: BTreeMap<String, Value>,
    pub selection: SelectionConfig,
    pub executor: DagConfig,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            distances: DistanceSet::default(),
            max_index: 1,
            slab_params: SlabParams::default(),
            site_finder_params: Value::Object(Default::default()),
            ads_structures_params: Value::Object(Default::default()),
            vasp_cmd: "vasp".to_string(),
            db_file: None,
            worker: None,
            dos_slab: true,
            dos_molecule: true,
            optimize_distance: true,
            add_molecules_in_box: false,
            box_size: 10.0,
            static_overrides: BTreeMap::new(),
            optimize_overrides: BTreeMap::new(),
            selection: SelectionConfig::default(),
            executor: DagConfig::default(),
        }
    }
}

impl WorkflowConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| FlowError::io(format!("read {}", path.display()), e))?;
        Self::from_yaml_str(&yaml)
    }

    /// Site-finding settings shared by trial generation and regeneration
    pub fn placement_params(&self) -> PlacementParams {
        PlacementParams {
            finder: self.site_finder_params.clone(),
            structures: self.ads_structures_params.clone(),
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_index == 0 {
            return Err(FlowError::configuration("max_index", "must be at least 1"));
        }
        if self.slab_params.min_slab_size <= 0.0 || self.slab_params.min_vacuum_size < 0.0 {
            return Err(FlowError::configuration(
                "slab_params",
                "slab size must be positive and vacuum size non-negative",
            ));
        }
        if !self.box_size.is_finite() || self.box_size <= 0.0 {
            return Err(FlowError::configuration("box_size", "must be positive"));
        }
        if self.vasp_cmd.trim().is_empty() {
            return Err(FlowError::configuration("vasp_cmd", "must not be empty"));
        }
        self.selection.validate()?;
        self.executor.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = WorkflowConfig::default();
        assert_eq!(config.distances.as_slice(), &[0.5, 0.87, 1.25, 1.63, 2.0]);
        assert_eq!(config.slab_params.min_slab_size, 10.0);
        assert_eq!(config.selection.reference_site_offset, 2);
        assert_eq!(config.selection.reference_energies.get("C"), Some(-7.329));
        assert!(config.dos_slab && config.dos_molecule && config.optimize_distance);
        assert!(!config.add_molecules_in_box);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
distances: [1.0, 1.5, 2.5]
worker: cluster-a
selection:
  algorithm: poly_fit
  reference_site_offset: 4
  fallback_slab_energy: -5.0
executor:
  max_parallel_nodes: 8
"#;
        let config = WorkflowConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.distances.as_slice(), &[1.0, 1.5, 2.5]);
        assert_eq!(config.worker.as_deref(), Some("cluster-a"));
        assert_eq!(config.selection.algorithm, SelectionAlgorithm::PolyFit);
        assert_eq!(config.selection.reference_site_offset, 4);
        assert_eq!(config.selection.unfavorable_threshold, 1.0);
        assert_eq!(config.executor.max_parallel_nodes, 8);
        assert_eq!(config.vasp_cmd, "vasp");
    }

    #[test]
    fn test_placement_params_carry_both_settings() {
        let yaml = r#"
site_finder_params:
  distance: 2.0
ads_structures_params:
  find_args:
    positions: [ontop]
"#;
        let placement = WorkflowConfig::from_yaml_str(yaml).unwrap().placement_params();
        assert_eq!(placement.finder, serde_json::json!({"distance": 2.0}));
        assert_eq!(
            placement.structures,
            serde_json::json!({"find_args": {"positions": ["ontop"]}})
        );
    }

    #[test]
    fn test_invalid_yaml_is_rejected() {
        assert!(WorkflowConfig::from_yaml_str("distances: [2.0, 1.0]").is_err());
        assert!(WorkflowConfig::from_yaml_str("max_index: 0").is_err());
        assert!(WorkflowConfig::from_yaml_str("executor:\n  max_parallel_nodes: 0").is_err());
        assert!(WorkflowConfig::from_yaml_str("selection:\n  default_distance: -1.0").is_err());
    }

    #[test]
    fn test_yaml_file_round_trip() {
        let config = WorkflowConfig {
            db_file: Some("db.json".to_string()),
            ..Default::default()
        };
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_yaml().unwrap().as_bytes()).unwrap();

        let loaded = WorkflowConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(loaded, config);

        let missing = WorkflowConfig::from_yaml_file("/nonexistent/adsorbflow.yaml");
        assert!(matches!(missing, Err(FlowError::Io { .. })));
    }
}
