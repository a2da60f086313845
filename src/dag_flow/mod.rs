pub mod branch;
#[allow(clippy::module_inception)]
pub mod dag_flow;
pub mod events;

pub use branch::{BranchRegistry, BranchState, BranchStatus};
pub use dag_flow::*;
pub use events::{BufferingEventSink, EventSink, LoggingEventSink, RuntimeEvent};
