//! Turns a published selection into one appended high-fidelity node.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;

use super::engine::{PlacementParams, SiteFinder};
use super::model::{Molecule, SelectionResult, SiteKey, Structure};
use crate::coord::{ExecutorCommand, NodeSpec};
use crate::core::errors::{FlowError, Result};

pub const OPTIMIZE_ACTION: &str = "adsorption_optimize";

/// Metadata fields propagated from the invoking node to the appended one
const INHERITED_METADATA: &[&str] = &["worker", "site_key"];

/// Everything the mutator needs about one site
#[derive(Debug, Clone)]
pub struct MutationRequest<'a> {
    pub key: SiteKey,
    pub dag_name: &'a str,
    pub original_slab: &'a Structure,
    pub adsorbate: &'a Molecule,
    /// Formula of the bulk the slab was cut from, for display
    pub bulk_formula: &'a str,
    /// Metadata of the invoking node
    pub parent_metadata: &'a Value,
}

pub struct WorkflowMutator {
    site_finder: Arc<dyn SiteFinder>,
    placement: PlacementParams,
}

impl WorkflowMutator {
    /// `placement` must be the parameters the trials were generated with,
    /// or `site_idx` may address a different site.
    pub fn new(site_finder: Arc<dyn SiteFinder>, placement: PlacementParams) -> Self {
        Self {
            site_finder,
            placement,
        }
    }

    /// Regenerate the site's structure at the selected distance
    pub fn structure_at(
        &self,
        key: &SiteKey,
        slab: &Structure,
        adsorbate: &Molecule,
        distance: f64,
    ) -> Result<Structure> {
        let structures = self.site_finder.adsorption_structures(
            slab,
            adsorbate,
            distance,
            &self.placement,
        )?;
        let available = structures.len();
        structures
            .into_iter()
            .nth(key.site_idx)
            .ok_or_else(|| FlowError::SiteIndexOutOfRange {
                idx: key.to_string(),
                site_idx: key.site_idx,
                available,
            })
    }

    /// Build the command appending the optimize node. Fails fast without a
    /// selection.
    pub fn mutate(
        &self,
        request: &MutationRequest<'_>,
        selection: Option<&SelectionResult>,
    ) -> Result<ExecutorCommand> {
        let key = request.key;
        let selection = selection.ok_or_else(|| FlowError::UpstreamMissing {
            idx: key.to_string(),
            site_idx: key.site_idx,
        })?;
        let distance = selection.optimal_distance;
        let structure =
            self.structure_at(&key, request.original_slab, request.adsorbate, distance)?;

        let mut metadata = Map::new();
        for field in INHERITED_METADATA {
            if let Some(v) = request.parent_metadata.get(*field) {
                metadata.insert(field.to_string(), v.clone());
            }
        }
        metadata.insert("optimal_distance".to_string(), json!(distance));

        let name = format!(
            "{}-{}{} adsorbate optimization: {}. Site: {}",
            request.adsorbate.formula(),
            request.bulk_formula,
            request.original_slab.miller_label(),
            distance,
            key.site_idx
        );
        let spec = NodeSpec::new(OPTIMIZE_ACTION)
            .with_id(format!("{}_optimize", key))
            .with_name(name)
            .with_branch(key.to_string())
            .with_inputs(json!({ "publish_prefix": key.to_string(), "structure": structure }))
            .with_metadata(Value::Object(metadata));

        info!(idx = %key, distance, "Appending optimization at optimal distance");
        Ok(ExecutorCommand::AddNodes {
            dag_name: request.dag_name.to_string(),
            specs: vec![spec],
        })
    }
}
