//! Reconciliation engine: state machine, pending-operations manager,
//! cascade coordinator and the orchestrator tying them together

pub mod cascade;
pub mod core;
pub mod pending;
pub mod state;

pub use cascade::CascadeCoordinator;
pub use core::{PassContext, ReconciliationEngine};
pub use pending::PendingManager;
pub use state::StateMachine;
