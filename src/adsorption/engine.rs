//! Narrow interfaces to the collaborators the workflow drives: the
//! simulation engine and the structure generators.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::model::{Molecule, Structure};
use crate::config::SlabParams;
use crate::core::errors::Result;

/// Named set of simulation control overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputProfile {
    pub name: String,
    pub overrides: BTreeMap<String, Value>,
    /// Command line the engine launches
    #[serde(default)]
    pub command: String,
    /// Results database the engine reports into
    #[serde(default)]
    pub db_file: Option<String>,
}

impl InputProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            overrides: BTreeMap::new(),
            command: String::new(),
            db_file: None,
        }
    }

    /// Single-point profile used for the distance landscape
    pub fn static_landscape() -> Self {
        Self::new("static_landscape").with_overrides([
            ("LELF", json!(true)),
            ("LORBIT", json!(11)),
            ("ALGO", json!("Fast")),
            ("ISMEAR", json!(1)),
            ("ADDGRID", json!(true)),
            ("LREAL", json!(false)),
            ("LASPH", json!(true)),
            ("IDIPOL", json!(3)),
            ("LDIPOL", json!(true)),
        ])
    }

    /// Relaxation profile for slabs and adsorbed configurations
    pub fn surface_optimize() -> Self {
        Self::new("surface_optimize").with_overrides([
            ("EDIFFG", json!(-0.05)),
            ("ENAUG", json!(4000)),
            ("IBRION", json!(1)),
            ("POTIM", json!(1.0)),
            ("EDIFF", json!(1e-5)),
            ("ISYM", json!(0)),
            ("IDIPOL", json!(3)),
            ("LDIPOL", json!(true)),
        ])
    }

    /// Later entries win
    pub fn with_overrides<K, I>(mut self, overrides: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        for (k, v) in overrides {
            self.overrides.insert(k.into(), v);
        }
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn with_db_file(mut self, db_file: Option<String>) -> Self {
        self.db_file = db_file;
        self
    }
}

/// Result of a successful simulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineOutput {
    /// Total energy of the final structure
    pub energy: f64,
    pub structure: Structure,
}

/// Runs one simulation. Errors are terminal failures with no numeric output.
#[async_trait]
pub trait SimulationEngine: Send + Sync {
    async fn run(
        &self,
        task: &str,
        structure: &Structure,
        profile: &InputProfile,
    ) -> Result<EngineOutput>;
}

/// Cuts slabs from a bulk structure
pub trait SlabGenerator: Send + Sync {
    fn generate_slabs(
        &self,
        bulk: &Structure,
        max_index: u32,
        params: &SlabParams,
    ) -> Result<Vec<Structure>>;
}

/// Opaque site-finding settings, handed unchanged to the [`SiteFinder`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlacementParams {
    /// Site search itself (tolerances, symmetry reduction)
    pub finder: Value,
    /// Structure generation at each site
    pub structures: Value,
}

/// Places an adsorbate on every candidate site of a slab.
///
/// Must be deterministic: the same slab, adsorbate and parameters yield the
/// same site order at every distance.
pub trait SiteFinder: Send + Sync {
    fn adsorption_structures(
        &self,
        slab: &Structure,
        adsorbate: &Molecule,
        distance: f64,
        params: &PlacementParams,
    ) -> Result<Vec<Structure>>;
}
