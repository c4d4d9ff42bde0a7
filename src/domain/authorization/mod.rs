//! Supervisor authorization gate - domain model and state transitions.
//!
//! This module contains the second-factor flow that guards external-express scans:
//! - Gate types and states (typestate pattern)
//! - State transition methods
//! - The single-use `SupervisorAuthorization` grant

pub mod state;
pub mod transitions;

pub use state::*;
