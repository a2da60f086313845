//! Optimal adsorption distance search on top of the DAG runtime.
//!
//! Each site gets a branch: trials at every distance, a status join, the
//! selection, and a launch step that appends the high-fidelity relaxation.

pub mod actions;
pub mod builder;
pub mod engine;
pub mod model;
pub mod mutator;
pub mod selector;
pub mod status_join;
pub mod store;

pub use actions::{register_adsorption_actions, AdsorptionContext};
pub use builder::{AdsorptionWorkflow, AdsorptionWorkflowBuilder, SiteOutcome};
pub use engine::{
    EngineOutput, InputProfile, PlacementParams, SimulationEngine, SiteFinder, SlabGenerator,
};
pub use model::{
    DistanceSet, Molecule, ReferenceEnergies, SelectionResult, Site, SiteKey, Structure,
    TrialRecord, TrialStatus,
};
pub use mutator::{MutationRequest, WorkflowMutator};
pub use selector::{DistanceSelector, Sample, Selection};
pub use status_join::{join_statuses, DistanceState, StatusMap};
pub use store::TrialEnergyStore;
