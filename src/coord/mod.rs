//! Coordinator-based parallel execution
//!
//! Actions compute, the coordinator mutates. Dynamic graph growth happens
//! through commands returned by actions and hooks.

pub mod action;
pub mod coordinator;
pub mod hooks;
pub mod registry;
pub mod types;

pub use action::*;
pub use coordinator::*;
pub use hooks::*;
pub use registry::*;
pub use types::*;
