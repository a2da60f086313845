//! Domain types: site identity, structures, distance sets, trial records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::core::errors::{FlowError, Result};
use crate::dag_flow::NodeStatus;

/// Composite identity of one (adsorbate, slab, site) configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SiteKey {
    pub ads_idx: usize,
    pub slab_idx: usize,
    pub site_idx: usize,
}

impl SiteKey {
    pub fn new(ads_idx: usize, slab_idx: usize, site_idx: usize) -> Self {
        Self {
            ads_idx,
            slab_idx,
            site_idx,
        }
    }

    pub fn trial_energy_key(&self, distance_idx: usize) -> String {
        format!("{}_{}_energy", self, distance_idx)
    }

    pub fn trial_structure_key(&self, distance_idx: usize) -> String {
        format!("{}_{}_structure", self, distance_idx)
    }

    pub fn optimized_energy_key(&self) -> String {
        optimized_energy_key(&self.to_string())
    }

    pub fn optimized_structure_key(&self) -> String {
        optimized_structure_key(&self.to_string())
    }
}

impl fmt::Display for SiteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.ads_idx, self.slab_idx, self.site_idx)
    }
}

pub fn slab_energy_key(slab_idx: usize) -> String {
    format!("{}_slab_energy", slab_idx)
}

pub fn optimized_energy_key(prefix: &str) -> String {
    format!("{}_optimized_energy", prefix)
}

pub fn optimized_structure_key(prefix: &str) -> String {
    format!("{}_optimized_structure", prefix)
}

/// Element counts keyed by symbol
pub type Composition = BTreeMap<String, usize>;

fn composition_of<'a>(species: impl Iterator<Item = &'a str>) -> Composition {
    let mut composition = Composition::new();
    for s in species {
        *composition.entry(s.to_string()).or_insert(0) += 1;
    }
    composition
}

/// Formula in alphabetical element order, e.g. `H2O`
pub fn formula_of(composition: &Composition) -> String {
    composition
        .iter()
        .map(|(el, n)| if *n == 1 { el.clone() } else { format!("{}{}", el, n) })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub species: String,
    /// Cartesian coordinates
    pub coords: [f64; 3],
    /// Marks sites placed by adsorption
    #[serde(default)]
    pub is_adsorbate: bool,
}

impl Site {
    pub fn new(species: impl Into<String>, coords: [f64; 3]) -> Self {
        Self {
            species: species.into(),
            coords,
            is_adsorbate: false,
        }
    }

    pub fn adsorbate(species: impl Into<String>, coords: [f64; 3]) -> Self {
        Self {
            is_adsorbate: true,
            ..Self::new(species, coords)
        }
    }
}

/// Periodic structure snapshot: a bulk, a slab or a slab with adsorbate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    pub lattice: [[f64; 3]; 3],
    pub sites: Vec<Site>,
    #[serde(default)]
    pub miller_index: Option<[i32; 3]>,
}

impl Structure {
    pub fn new(lattice: [[f64; 3]; 3], sites: Vec<Site>) -> Self {
        Self {
            lattice,
            sites,
            miller_index: None,
        }
    }

    pub fn with_miller_index(mut self, miller_index: [i32; 3]) -> Self {
        self.miller_index = Some(miller_index);
        self
    }

    /// Site count
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn composition(&self) -> Composition {
        composition_of(self.sites.iter().map(|s| s.species.as_str()))
    }

    pub fn formula(&self) -> String {
        formula_of(&self.composition())
    }

    /// `(1, 1, 1)` style label, empty for non-slabs
    pub fn miller_label(&self) -> String {
        match self.miller_index {
            Some([h, k, l]) => format!("({}, {}, {})", h, k, l),
            None => String::new(),
        }
    }

    /// Copy keeping only the adsorbate sites
    pub fn adsorbate_only(&self) -> Structure {
        Structure {
            sites: self.sites.iter().filter(|s| s.is_adsorbate).cloned().collect(),
            ..self.clone()
        }
    }

    /// Copy with every adsorbate site removed
    pub fn slab_only(&self) -> Structure {
        Structure {
            sites: self.sites.iter().filter(|s| !s.is_adsorbate).cloned().collect(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Molecule {
    pub sites: Vec<Site>,
}

impl Molecule {
    pub fn new(sites: Vec<Site>) -> Self {
        Self { sites }
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn composition(&self) -> Composition {
        composition_of(self.sites.iter().map(|s| s.species.as_str()))
    }

    pub fn formula(&self) -> String {
        formula_of(&self.composition())
    }

    /// Place the molecule in a cubic box of the given edge length
    pub fn in_box(&self, edge: f64) -> Structure {
        let sites = self
            .sites
            .iter()
            .map(|s| Site {
                species: s.species.clone(),
                coords: [
                    s.coords[0] + edge / 2.0,
                    s.coords[1] + edge / 2.0,
                    s.coords[2] + edge / 2.0,
                ],
                is_adsorbate: true,
            })
            .collect();
        Structure::new([[edge, 0.0, 0.0], [0.0, edge, 0.0], [0.0, 0.0, edge]], sites)
    }
}

/// Candidate separation distances, strictly ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct DistanceSet(Vec<f64>);

impl DistanceSet {
    pub fn new(distances: Vec<f64>) -> Result<Self> {
        if distances.is_empty() {
            return Err(FlowError::configuration("distances", "must not be empty"));
        }
        if distances.iter().any(|d| !d.is_finite() || *d <= 0.0) {
            return Err(FlowError::configuration(
                "distances",
                "every distance must be finite and positive",
            ));
        }
        if distances.windows(2).any(|w| w[0] >= w[1]) {
            return Err(FlowError::configuration(
                "distances",
                "must be strictly ascending",
            ));
        }
        Ok(Self(distances))
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn get(&self, distance_idx: usize) -> Option<f64> {
        self.0.get(distance_idx).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `(distance_idx, distance)` pairs in ascending order
    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.0.iter().copied().enumerate()
    }
}

impl Default for DistanceSet {
    fn default() -> Self {
        Self(vec![0.5, 0.87, 1.25, 1.63, 2.0])
    }
}

impl TryFrom<Vec<f64>> for DistanceSet {
    type Error = FlowError;

    fn try_from(value: Vec<f64>) -> Result<Self> {
        Self::new(value)
    }
}

impl From<DistanceSet> for Vec<f64> {
    fn from(value: DistanceSet) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Pending,
    Succeeded,
    Failed,
}

impl From<NodeStatus> for TrialStatus {
    fn from(status: NodeStatus) -> Self {
        match status {
            NodeStatus::Completed => TrialStatus::Succeeded,
            NodeStatus::Failed | NodeStatus::Skipped | NodeStatus::Exited => TrialStatus::Failed,
            NodeStatus::Pending | NodeStatus::Running => TrialStatus::Pending,
        }
    }
}

/// One distance trial as seen by the selector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub distance: f64,
    pub energy_per_atom: Option<f64>,
    pub structure: Option<Structure>,
    pub status: TrialStatus,
}

impl TrialRecord {
    /// Succeeded with a finite energy and a structure
    pub fn is_available(&self) -> bool {
        self.status == TrialStatus::Succeeded
            && self.energy_per_atom.map_or(false, f64::is_finite)
            && self.structure.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectionResult {
    pub optimal_distance: f64,
    pub lowest_energy: f64,
    pub adsorption_energy: f64,
}

/// Per-atom reference energies by element symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceEnergies(pub BTreeMap<String, f64>);

impl ReferenceEnergies {
    pub fn get(&self, element: &str) -> Option<f64> {
        self.0.get(element).copied()
    }

    /// Σ count × reference over the elements in the table
    pub fn contribution(&self, composition: &Composition) -> f64 {
        self.0
            .iter()
            .map(|(el, e)| composition.get(el).copied().unwrap_or(0) as f64 * e)
            .sum()
    }
}

impl Default for ReferenceEnergies {
    fn default() -> Self {
        Self(BTreeMap::from([
            ("H".to_string(), -3.379),
            ("O".to_string(), -7.459),
            ("C".to_string(), -7.329),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn water() -> Molecule {
        Molecule::new(vec![
            Site::new("O", [0.0, 0.0, 0.0]),
            Site::new("H", [0.76, 0.59, 0.0]),
            Site::new("H", [-0.76, 0.59, 0.0]),
        ])
    }

    #[test]
    fn test_keys() {
        let key = SiteKey::new(0, 1, 2);
        assert_eq!(key.to_string(), "0_1_2");
        assert_eq!(key.trial_energy_key(3), "0_1_2_3_energy");
        assert_eq!(key.trial_structure_key(0), "0_1_2_0_structure");
        assert_eq!(key.optimized_energy_key(), "0_1_2_optimized_energy");
        assert_eq!(slab_energy_key(4), "4_slab_energy");
    }

    #[test]
    fn test_composition_and_formula() {
        let mol = water();
        assert_eq!(mol.formula(), "H2O");
        assert_eq!(mol.composition().get("H"), Some(&2));

        let mut slab = Structure::new(
            [[3.0, 0.0, 0.0], [0.0, 3.0, 0.0], [0.0, 0.0, 20.0]],
            vec![Site::new("Pt", [0.0, 0.0, 0.0]), Site::new("Pt", [1.5, 1.5, 0.0])],
        )
        .with_miller_index([1, 1, 1]);
        slab.sites.push(Site::adsorbate("O", [0.0, 0.0, 2.0]));

        assert_eq!(slab.len(), 3);
        assert_eq!(slab.miller_label(), "(1, 1, 1)");
        assert_eq!(slab.adsorbate_only().formula(), "O");
        assert_eq!(slab.slab_only().formula(), "Pt2");
    }

    #[test]
    fn test_distance_set_validation() {
        assert!(DistanceSet::new(vec![]).is_err());
        assert!(DistanceSet::new(vec![1.0, 0.5]).is_err());
        assert!(DistanceSet::new(vec![1.0, 1.0]).is_err());
        assert!(DistanceSet::new(vec![-1.0, 0.5]).is_err());
        assert_eq!(DistanceSet::default().len(), 5);

        let parsed: std::result::Result<DistanceSet, _> = serde_json::from_str("[2.0, 1.0]");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_reference_contribution() {
        let refs = ReferenceEnergies::default();
        let c = refs.contribution(&water().composition());
        assert!((c - (-14.217)).abs() < 1e-9);
    }

    #[test]
    fn test_trial_status_from_node_status() {
        assert_eq!(TrialStatus::from(NodeStatus::Completed), TrialStatus::Succeeded);
        assert_eq!(TrialStatus::from(NodeStatus::Skipped), TrialStatus::Failed);
        assert_eq!(TrialStatus::from(NodeStatus::Running), TrialStatus::Pending);
    }
}
